use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};
use crate::types::PaymentStatus;

/// ledger-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub currency: String,
    pub billing: BillingConfig,
    pub payments: PaymentConfig,
    pub reminders: ReminderConfig,
}

/// invoice generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingConfig {
    /// upper bound on billing periods generated for one student in one run
    pub max_catch_up_periods: u32,
    /// bill fee structures that were soft-deactivated after assignment
    pub bill_inactive_fees: bool,
}

/// payment recording settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// status given to staff-recorded non-cash payments
    pub non_cash_initial_status: PaymentStatus,
    pub default_receipt_mode: ReceiptMode,
}

/// fee reminder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// invoices due within this many days are reminded
    pub window_days: u32,
}

/// receipts requested after a successful allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptMode {
    None,
    /// one bundled receipt for all allocations
    Single,
    /// one receipt per invoice paid
    PerInvoice,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl LedgerConfig {
    /// defaults used by most schools
    pub fn standard() -> Self {
        Self {
            currency: "ETB".to_string(),
            billing: BillingConfig {
                max_catch_up_periods: 240,
                bill_inactive_fees: false,
            },
            payments: PaymentConfig {
                non_cash_initial_status: PaymentStatus::Unconfirmed,
                default_receipt_mode: ReceiptMode::Single,
            },
            reminders: ReminderConfig { window_days: 3 },
        }
    }

    /// refuses to catch up more than two years of periods in one run
    pub fn strict_catch_up() -> Self {
        let mut config = Self::standard();
        config.billing.max_catch_up_periods = 24;
        config
    }

    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_string();
        self
    }

    pub fn with_receipt_mode(mut self, mode: ReceiptMode) -> Self {
        self.payments.default_receipt_mode = mode;
        self
    }

    pub fn with_reminder_window(mut self, days: u32) -> Self {
        self.reminders.window_days = days;
        self
    }

    /// parse and validate a json document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: LedgerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.currency.trim().is_empty() {
            return Err(LedgerError::configuration("currency must not be empty"));
        }
        if self.billing.max_catch_up_periods == 0 {
            return Err(LedgerError::configuration(
                "max_catch_up_periods must be greater than zero",
            ));
        }
        if !self.payments.non_cash_initial_status.is_awaiting_confirmation() {
            return Err(LedgerError::configuration(format!(
                "non-cash payments must start pending or unconfirmed, got {}",
                self.payments.non_cash_initial_status
            )));
        }
        Ok(())
    }
}
