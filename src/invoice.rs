use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::billing_month_of;
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::events::{Event, EventStore};
use crate::fees::FeeStructure;
use crate::types::{FeeStructureId, InvoiceId, InvoiceStatus, SchoolId, StudentId};

pub const OPENING_BALANCE_DESCRIPTION: &str = "Opening Balance";

/// one financial obligation of a student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub school_id: SchoolId,
    pub student_id: StudentId,
    /// `None` marks the opening balance invoice
    pub fee_id: Option<FeeStructureId>,
    pub description: String,
    pub amount_due: Money,
    pub amount_paid: Money,
    pub status: InvoiceStatus,
    pub due_date: NaiveDate,
    /// first of month, dedupe key for recurring fees
    pub billing_month: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    /// invoice for one billing period of a fee
    pub fn for_fee(
        student_id: StudentId,
        fee: &FeeStructure,
        due_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            school_id: fee.school_id,
            student_id,
            fee_id: Some(fee.id),
            description: fee.description.clone(),
            amount_due: fee.amount,
            amount_paid: Money::ZERO,
            status: InvoiceStatus::Unpaid,
            due_date,
            billing_month: billing_month_of(due_date),
            created_at: now,
        }
    }

    /// one-time invoice carrying imported debt
    pub fn opening_balance(
        school_id: SchoolId,
        student_id: StudentId,
        amount: Money,
        due_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            school_id,
            student_id,
            fee_id: None,
            description: OPENING_BALANCE_DESCRIPTION.to_string(),
            amount_due: amount,
            amount_paid: Money::ZERO,
            status: InvoiceStatus::OpeningBalance,
            due_date,
            billing_month: billing_month_of(due_date),
            created_at: now,
        }
    }

    /// override the billed amount (manual invoices)
    pub fn with_amount(mut self, amount: Money) -> Self {
        self.amount_due = amount;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn balance(&self) -> Money {
        self.amount_due - self.amount_paid
    }

    pub fn is_opening_balance(&self) -> bool {
        self.fee_id.is_none()
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status != InvoiceStatus::Paid && today > self.due_date
    }

    /// status implied by the current paid amount
    pub fn derive_status(&self) -> InvoiceStatus {
        if self.amount_paid >= self.amount_due {
            InvoiceStatus::Paid
        } else if self.amount_paid.is_positive() {
            InvoiceStatus::Partial
        } else if self.is_opening_balance() {
            InvoiceStatus::OpeningBalance
        } else {
            InvoiceStatus::Unpaid
        }
    }

    /// apply a confirmed amount; the only incremental write to `amount_paid`
    pub fn pay(&mut self, amount: Money, events: &mut EventStore) -> Result<InvoiceStatus> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount { amount });
        }
        self.amount_paid += amount;
        self.refresh_status(events);
        Ok(self.status)
    }

    /// set `amount_paid` from the sum of contributing payments
    pub fn recompute_paid(&mut self, confirmed_total: Money, events: &mut EventStore) -> InvoiceStatus {
        self.amount_paid = confirmed_total;
        self.refresh_status(events);
        self.status
    }

    /// take back a reversed payment's amount
    pub fn revert(&mut self, amount: Money, events: &mut EventStore) -> Result<InvoiceStatus> {
        if amount > self.amount_paid {
            return Err(LedgerError::validation(format!(
                "cannot revert {} from invoice {} with {} paid",
                amount, self.id, self.amount_paid
            )));
        }
        self.amount_paid -= amount;
        self.refresh_status(events);
        Ok(self.status)
    }

    fn refresh_status(&mut self, events: &mut EventStore) {
        let new_status = self.derive_status();
        if new_status == self.status {
            return;
        }
        events.emit(Event::InvoiceStatusChanged {
            student_id: self.student_id,
            invoice_id: self.id,
            old_status: self.status,
            new_status,
            amount_due: self.amount_due,
            amount_paid: self.amount_paid,
            due_date: self.due_date,
        });
        self.status = new_status;
    }

    pub fn issued_event(&self) -> Event {
        Event::InvoiceIssued {
            school_id: self.school_id,
            student_id: self.student_id,
            invoice_id: self.id,
            fee_id: self.fee_id,
            amount_due: self.amount_due,
            due_date: self.due_date,
            billing_month: self.billing_month,
        }
    }
}
