pub mod allocation;
pub mod receipt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::events::Event;
use crate::invoice::Invoice;
use crate::types::{
    ActorId, InvoiceId, PaymentId, PaymentMethod, PaymentStatus, ReversalId, SchoolId, StudentId,
};

pub use allocation::{Allocatable, Allocation, AllocationPlan, AllocationRequest, PaymentAllocator};
pub use receipt::{Receipt, ReceiptLine, ReceiptRequest};

/// money movement against exactly one invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub school_id: SchoolId,
    pub invoice_id: InvoiceId,
    pub student_id: StudentId,
    pub amount: Money,
    pub method: PaymentMethod,
    /// e.g. the mobile-money operator
    pub provider: Option<String>,
    pub external_transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub is_reversed: bool,
    pub paid_on: DateTime<Utc>,
    pub received_by: Option<ActorId>,
    pub confirmed_by: Option<ActorId>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

/// how a payment was received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub method: PaymentMethod,
    pub reference: String,
    pub paid_on: Option<DateTime<Utc>>,
    pub provider: Option<String>,
    pub external_transaction_id: Option<String>,
}

impl PaymentDetails {
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            reference: String::new(),
            paid_on: None,
            provider: None,
            external_transaction_id: None,
        }
    }

    pub fn cash() -> Self {
        Self::new(PaymentMethod::Cash)
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference = reference.to_string();
        self
    }

    pub fn paid_on(mut self, paid_on: DateTime<Utc>) -> Self {
        self.paid_on = Some(paid_on);
        self
    }

    pub fn via_provider(mut self, provider: &str, external_transaction_id: &str) -> Self {
        self.provider = Some(provider.to_string());
        self.external_transaction_id = Some(external_transaction_id.to_string());
        self
    }
}

impl Payment {
    /// record an allocation; cash is confirmed on the spot, everything else waits
    pub fn record(
        invoice: &Invoice,
        amount: Money,
        details: &PaymentDetails,
        received_by: Option<ActorId>,
        awaiting_status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let confirmed = details.method.is_auto_confirmed();
        Self {
            id: Uuid::new_v4(),
            school_id: invoice.school_id,
            invoice_id: invoice.id,
            student_id: invoice.student_id,
            amount,
            method: details.method,
            provider: details.provider.clone(),
            external_transaction_id: details.external_transaction_id.clone(),
            status: if confirmed {
                PaymentStatus::Confirmed
            } else {
                awaiting_status
            },
            is_reversed: false,
            paid_on: details.paid_on.unwrap_or(now),
            received_by,
            confirmed_by: if confirmed { received_by } else { None },
            confirmed_at: if confirmed { Some(now) } else { None },
            reference: details.reference.clone(),
            created_at: now,
        }
    }

    /// counts toward the invoice's paid amount
    pub fn contributes(&self) -> bool {
        self.status == PaymentStatus::Confirmed && !self.is_reversed
    }

    /// reserved against the invoice until confirmed or rejected
    pub fn is_held(&self) -> bool {
        self.status.is_awaiting_confirmation() && !self.is_reversed
    }

    /// returns false when the payment was already confirmed
    pub fn confirm(&mut self, actor: ActorId, now: DateTime<Utc>) -> Result<bool> {
        match self.status {
            PaymentStatus::Confirmed => Ok(false),
            PaymentStatus::Pending | PaymentStatus::Unconfirmed => {
                self.status = PaymentStatus::Confirmed;
                self.confirmed_by = Some(actor);
                self.confirmed_at = Some(now);
                Ok(true)
            }
            from => Err(LedgerError::InvalidTransition {
                payment_id: self.id,
                from,
                action: "confirmed",
            }),
        }
    }

    /// returns false when the payment was already rejected
    pub fn reject(&mut self) -> Result<bool> {
        match self.status {
            PaymentStatus::Rejected => Ok(false),
            PaymentStatus::Pending | PaymentStatus::Unconfirmed => {
                self.status = PaymentStatus::Rejected;
                Ok(true)
            }
            from => Err(LedgerError::InvalidTransition {
                payment_id: self.id,
                from,
                action: "rejected",
            }),
        }
    }

    /// soft-reverse a confirmed payment, producing its audit record
    pub fn reverse(
        &mut self,
        reason: &str,
        actor: ActorId,
        now: DateTime<Utc>,
    ) -> Result<PaymentReversal> {
        if self.is_reversed {
            return Err(LedgerError::AlreadyReversed {
                payment_id: self.id,
            });
        }
        if self.status != PaymentStatus::Confirmed {
            return Err(LedgerError::InvalidTransition {
                payment_id: self.id,
                from: self.status,
                action: "reversed",
            });
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::validation("a reversal reason is required"));
        }

        self.is_reversed = true;
        self.status = PaymentStatus::Reversed;

        Ok(PaymentReversal {
            id: Uuid::new_v4(),
            school_id: self.school_id,
            payment_id: self.id,
            reversed_by: actor,
            reason: reason.to_string(),
            reversed_on: now,
        })
    }

    pub fn recorded_event(&self) -> Event {
        Event::PaymentRecorded {
            student_id: self.student_id,
            invoice_id: self.invoice_id,
            payment_id: self.id,
            amount: self.amount,
            method: self.method,
            confirmed: self.contributes(),
            timestamp: self.created_at,
        }
    }
}

/// audit record of a reversal; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReversal {
    pub id: ReversalId,
    pub school_id: SchoolId,
    pub payment_id: PaymentId,
    pub reversed_by: ActorId,
    pub reason: String,
    pub reversed_on: DateTime<Utc>,
}

/// sum of payments that count toward an invoice
pub fn confirmed_total<'a>(payments: impl IntoIterator<Item = &'a Payment>) -> Money {
    payments
        .into_iter()
        .filter(|p| p.contributes())
        .map(|p| p.amount)
        .sum()
}

/// sum of payments still awaiting confirmation
pub fn held_total<'a>(payments: impl IntoIterator<Item = &'a Payment>) -> Money {
    payments
        .into_iter()
        .filter(|p| p.is_held())
        .map(|p| p.amount)
        .sum()
}
