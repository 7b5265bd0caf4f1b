use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ReceiptMode;
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::types::{InvoiceId, PaymentMethod, StudentId};

use super::PaymentDetails;

/// a submitted payment against selected invoices of one student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub student_id: StudentId,
    pub invoice_ids: Vec<InvoiceId>,
    pub total_amount: Money,
    pub details: PaymentDetails,
    /// outstanding total the submitter saw; a mismatch is a concurrency conflict
    pub expected_outstanding: Option<Money>,
    pub receipt_mode: Option<ReceiptMode>,
}

impl AllocationRequest {
    pub fn new(
        student_id: StudentId,
        invoice_ids: Vec<InvoiceId>,
        total_amount: Money,
        method: PaymentMethod,
    ) -> Self {
        Self {
            student_id,
            invoice_ids,
            total_amount,
            details: PaymentDetails::new(method),
            expected_outstanding: None,
            receipt_mode: None,
        }
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.details.reference = reference.to_string();
        self
    }

    pub fn paid_on(mut self, paid_on: DateTime<Utc>) -> Self {
        self.details.paid_on = Some(paid_on);
        self
    }

    pub fn expecting(mut self, outstanding: Money) -> Self {
        self.expected_outstanding = Some(outstanding);
        self
    }

    pub fn with_receipt(mut self, mode: ReceiptMode) -> Self {
        self.receipt_mode = Some(mode);
        self
    }
}

/// a locked invoice as seen by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocatable {
    pub invoice_id: InvoiceId,
    pub due_date: NaiveDate,
    /// balance less amounts held by unconfirmed payments
    pub available: Money,
}

/// sub-amount assigned to one invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub invoice_id: InvoiceId,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub allocations: Vec<Allocation>,
    pub total: Money,
}

impl AllocationPlan {
    pub fn allocated(&self) -> Money {
        self.allocations.iter().map(|a| a.amount).sum()
    }
}

/// splits a payment across invoices, earliest due date first
#[derive(Debug, Default)]
pub struct PaymentAllocator;

impl PaymentAllocator {
    pub fn new() -> Self {
        Self
    }

    /// outstanding total across the candidates
    pub fn outstanding(candidates: &[Allocatable]) -> Money {
        candidates.iter().map(|c| c.available.non_negative()).sum()
    }

    /// plan an exact allocation of `total`; no mutation happens here
    pub fn plan(&self, candidates: &[Allocatable], total: Money) -> Result<AllocationPlan> {
        if !total.is_positive() {
            return Err(LedgerError::InvalidAmount { amount: total });
        }

        let mut ordered: Vec<Allocatable> = candidates
            .iter()
            .copied()
            .filter(|c| c.available.is_positive())
            .collect();
        if ordered.is_empty() {
            return Err(LedgerError::NoEligibleInvoices);
        }
        ordered.sort_by_key(|c| (c.due_date, c.invoice_id));

        let outstanding = Self::outstanding(&ordered);
        if total != outstanding {
            return Err(LedgerError::AmountMismatch {
                expected: outstanding,
                provided: total,
            });
        }

        let mut remaining = total;
        let mut allocations = Vec::with_capacity(ordered.len());
        for candidate in ordered {
            if !remaining.is_positive() {
                break;
            }
            let pay_now = candidate.available.min(remaining);
            if pay_now.is_positive() {
                allocations.push(Allocation {
                    invoice_id: candidate.invoice_id,
                    amount: pay_now,
                });
                remaining -= pay_now;
            }
        }

        if allocations.is_empty() || !remaining.is_zero() {
            return Err(LedgerError::validation(format!(
                "allocation left {} unapplied",
                remaining
            )));
        }

        Ok(AllocationPlan { allocations, total })
    }
}
