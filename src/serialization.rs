/// serializable views of a school's books
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::billing::Student;
use crate::decimal::Money;
use crate::errors::Result;
use crate::fees::FeeStructure;
use crate::invoice::Invoice;
use crate::ledger::store::SchoolBook;
use crate::payments::{held_total, Payment, PaymentReversal};
use crate::types::{
    ClassId, DivisionId, FeeStructureId, InvoiceId, InvoiceStatus, PaymentId, PaymentMethod,
    PaymentStatus, SchoolId, StudentId, StudentPaymentStatus,
};

/// invoice as shown to staff and parents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceView {
    pub id: InvoiceId,
    pub fee_id: Option<FeeStructureId>,
    pub description: String,
    pub amount_due: Money,
    pub amount_paid: Money,
    pub balance: Money,
    pub status: InvoiceStatus,
    pub due_date: NaiveDate,
    pub billing_month: NaiveDate,
    pub overdue: bool,
}

impl InvoiceView {
    pub fn from_invoice(invoice: &Invoice, today: NaiveDate) -> Self {
        InvoiceView {
            id: invoice.id,
            fee_id: invoice.fee_id,
            description: invoice.description.clone(),
            amount_due: invoice.amount_due,
            amount_paid: invoice.amount_paid,
            balance: invoice.balance(),
            status: invoice.status,
            due_date: invoice.due_date,
            billing_month: invoice.billing_month,
            overdue: invoice.is_overdue(today),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentView {
    pub id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub reversed: bool,
    pub paid_on: DateTime<Utc>,
    pub reference: String,
    pub provider: Option<String>,
    pub external_transaction_id: Option<String>,
}

impl PaymentView {
    pub fn from_payment(payment: &Payment) -> Self {
        PaymentView {
            id: payment.id,
            invoice_id: payment.invoice_id,
            amount: payment.amount,
            method: payment.method,
            status: payment.status,
            reversed: payment.is_reversed,
            paid_on: payment.paid_on,
            reference: payment.reference.clone(),
            provider: payment.provider.clone(),
            external_transaction_id: payment.external_transaction_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementTotals {
    pub total_due: Money,
    pub total_paid: Money,
    pub outstanding: Money,
    /// amounts recorded but not yet confirmed
    pub awaiting_confirmation: Money,
    pub invoice_count: usize,
    pub overdue_count: usize,
}

/// everything billed to and paid by one student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentStatement {
    pub student_id: StudentId,
    pub full_name: String,
    pub payment_status: StudentPaymentStatus,
    pub next_payment_date: Option<NaiveDate>,
    pub invoices: Vec<InvoiceView>,
    pub payments: Vec<PaymentView>,
    pub reversals: Vec<PaymentReversal>,
    pub totals: StatementTotals,
}

impl StudentStatement {
    pub fn from_book(book: &SchoolBook, student_id: StudentId, today: NaiveDate) -> Result<Self> {
        let student = book.student(student_id)?;
        let invoices = book.invoices_of(student_id);
        let payments: Vec<&Payment> = book
            .payments_of(student_id)
            .into_iter()
            .filter(|p| !p.is_reversed)
            .collect();

        let total_due: Money = invoices.iter().map(|i| i.amount_due).sum();
        let total_paid: Money = invoices.iter().map(|i| i.amount_paid).sum();
        let totals = StatementTotals {
            total_due,
            total_paid,
            outstanding: invoices.iter().map(|i| i.balance().non_negative()).sum(),
            awaiting_confirmation: held_total(payments.iter().copied()),
            invoice_count: invoices.len(),
            overdue_count: invoices.iter().filter(|i| i.is_overdue(today)).count(),
        };

        let mut reversals: Vec<PaymentReversal> = book
            .reversals
            .iter()
            .filter(|r| {
                book.payments
                    .get(&r.payment_id)
                    .map_or(false, |p| p.student_id == student_id)
            })
            .cloned()
            .collect();
        reversals.sort_by_key(|r| r.reversed_on);

        Ok(StudentStatement {
            student_id,
            full_name: student.full_name.clone(),
            payment_status: student.payment_status,
            next_payment_date: student.billing.next_payment_date,
            invoices: invoices
                .iter()
                .map(|i| InvoiceView::from_invoice(i, today))
                .collect(),
            payments: payments.iter().map(|p| PaymentView::from_payment(p)).collect(),
            reversals,
            totals,
        })
    }

    /// convert to pretty-printed json string
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceCounts {
    pub unpaid: usize,
    pub partial: usize,
    pub paid: usize,
    pub opening_balance: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub paid: usize,
    pub pending: usize,
    pub unpaid: usize,
    pub overdue: usize,
}

/// school-level collection figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolSummary {
    pub school_id: SchoolId,
    pub name: String,
    pub student_count: usize,
    pub active_fee_structures: usize,
    pub invoice_count: usize,
    pub invoices: InvoiceCounts,
    pub total_billed: Money,
    pub total_collected: Money,
    pub total_outstanding: Money,
    pub awaiting_confirmation: Money,
    pub students: StatusCounts,
}

impl SchoolSummary {
    pub fn from_book(book: &SchoolBook) -> Self {
        let mut students = StatusCounts::default();
        for student in book.students.values() {
            match student.payment_status {
                StudentPaymentStatus::Paid => students.paid += 1,
                StudentPaymentStatus::Pending => students.pending += 1,
                StudentPaymentStatus::Unpaid => students.unpaid += 1,
                StudentPaymentStatus::Overdue => students.overdue += 1,
            }
        }

        let mut invoices = InvoiceCounts::default();
        for invoice in book.invoices.values() {
            match invoice.status {
                InvoiceStatus::Unpaid => invoices.unpaid += 1,
                InvoiceStatus::Partial => invoices.partial += 1,
                InvoiceStatus::Paid => invoices.paid += 1,
                InvoiceStatus::OpeningBalance => invoices.opening_balance += 1,
            }
        }

        SchoolSummary {
            school_id: book.school_id,
            name: book.name.clone(),
            student_count: book.students.len(),
            active_fee_structures: book.fee_structures.values().filter(|f| f.active).count(),
            invoice_count: book.invoices.len(),
            invoices,
            total_billed: book.invoices.values().map(|i| i.amount_due).sum(),
            total_collected: book.invoices.values().map(|i| i.amount_paid).sum(),
            total_outstanding: book
                .invoices
                .values()
                .map(|i| i.balance().non_negative())
                .sum(),
            awaiting_confirmation: held_total(book.payments.values()),
            students,
        }
    }

    /// convert to pretty-printed json string
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub class_id: ClassId,
    pub division_id: DivisionId,
}

/// full persisted state of one school
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolSnapshot {
    pub school_id: SchoolId,
    pub name: String,
    pub classes: Vec<ClassEntry>,
    pub fee_structures: Vec<FeeStructure>,
    pub students: Vec<Student>,
    pub invoices: Vec<Invoice>,
    pub payments: Vec<Payment>,
    pub reversals: Vec<PaymentReversal>,
}

impl SchoolSnapshot {
    pub fn from_book(book: &SchoolBook) -> Self {
        let mut classes: Vec<ClassEntry> = book
            .classes
            .iter()
            .map(|(class_id, division_id)| ClassEntry {
                class_id: *class_id,
                division_id: *division_id,
            })
            .collect();
        classes.sort_by_key(|c| c.class_id);

        let mut fee_structures: Vec<FeeStructure> = book.fee_structures.values().cloned().collect();
        fee_structures.sort_by_key(|f| (f.created_at, f.id));
        let mut students: Vec<Student> = book.students.values().cloned().collect();
        students.sort_by_key(|s| (s.created_at, s.id));
        let mut invoices: Vec<Invoice> = book.invoices.values().cloned().collect();
        invoices.sort_by_key(|i| (i.due_date, i.created_at, i.id));
        let mut payments: Vec<Payment> = book.payments.values().cloned().collect();
        payments.sort_by_key(|p| (p.created_at, p.id));

        SchoolSnapshot {
            school_id: book.school_id,
            name: book.name.clone(),
            classes,
            fee_structures,
            students,
            invoices,
            payments,
            reversals: book.reversals.clone(),
        }
    }

    /// rebuild the tables; rows belonging to another school are dropped
    pub fn into_book(self) -> SchoolBook {
        let school_id = self.school_id;
        let mut book = SchoolBook::new(school_id, &self.name);
        book.classes = self
            .classes
            .into_iter()
            .map(|c| (c.class_id, c.division_id))
            .collect();
        book.fee_structures = self
            .fee_structures
            .into_iter()
            .filter(|f| f.school_id == school_id)
            .map(|f| (f.id, f))
            .collect();
        book.students = self
            .students
            .into_iter()
            .filter(|s| s.school_id == school_id)
            .map(|s| (s.id, s))
            .collect();
        book.invoices = self
            .invoices
            .into_iter()
            .filter(|i| i.school_id == school_id)
            .map(|i| (i.id, i))
            .collect();
        book.payments = self
            .payments
            .into_iter()
            .filter(|p| p.school_id == school_id)
            .map(|p| (p.id, p))
            .collect();
        book.reversals = self
            .reversals
            .into_iter()
            .filter(|r| r.school_id == school_id)
            .collect();
        book
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
