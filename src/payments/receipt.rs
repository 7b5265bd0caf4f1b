use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ReceiptMode;
use crate::decimal::Money;
use crate::types::{InvoiceId, PaymentId, PaymentMethod, SchoolId, StudentId};

use super::Payment;

/// one payment line on a receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub paid_on: DateTime<Utc>,
}

/// rendering request handed to the export collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRequest {
    pub school_id: SchoolId,
    pub student_id: StudentId,
    pub mode: ReceiptMode,
    pub lines: Vec<ReceiptLine>,
}

/// a single document to render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub student_id: StudentId,
    pub lines: Vec<ReceiptLine>,
    pub total: Money,
}

impl ReceiptRequest {
    /// `None` when no receipt was asked for or nothing was paid
    pub fn for_payments(mode: ReceiptMode, payments: &[Payment]) -> Option<Self> {
        let first = payments.first()?;
        if mode == ReceiptMode::None {
            return None;
        }

        let lines = payments
            .iter()
            .map(|p| ReceiptLine {
                payment_id: p.id,
                invoice_id: p.invoice_id,
                amount: p.amount,
                method: p.method,
                paid_on: p.paid_on,
            })
            .collect();

        Some(Self {
            school_id: first.school_id,
            student_id: first.student_id,
            mode,
            lines,
        })
    }

    pub fn total(&self) -> Money {
        self.lines.iter().map(|l| l.amount).sum()
    }

    /// documents to render: one bundle or one per invoice
    pub fn receipts(&self) -> Vec<Receipt> {
        match self.mode {
            ReceiptMode::None => Vec::new(),
            ReceiptMode::Single => vec![Receipt {
                student_id: self.student_id,
                lines: self.lines.clone(),
                total: self.total(),
            }],
            ReceiptMode::PerInvoice => self
                .lines
                .iter()
                .map(|line| Receipt {
                    student_id: self.student_id,
                    lines: vec![line.clone()],
                    total: line.amount,
                })
                .collect(),
        }
    }

    pub fn payment_ids(&self) -> Vec<PaymentId> {
        self.lines.iter().map(|l| l.payment_id).collect()
    }
}
