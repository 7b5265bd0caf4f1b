use std::collections::HashSet;

use hourglass_rs::SafeTimeProvider;

use crate::billing::Student;
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::fees::FeeStructure;
use crate::invoice::Invoice;
use crate::payments::{held_total, Payment, PaymentReversal};
use crate::serialization::{SchoolSnapshot, SchoolSummary, StudentStatement};
use crate::types::{Action, FeeStructureId, InvoiceId, PaymentId, Principal, StudentId};

use super::{FeeLedger, SchoolBook};

/// read-only queries, consistent at transaction boundaries
impl FeeLedger {
    fn read<T>(
        &self,
        principal: &Principal,
        action: Action,
        f: impl FnOnce(&SchoolBook) -> Result<T>,
    ) -> Result<T> {
        let school_id = principal.authorize(action)?;
        self.with_book(school_id, |book| f(book))
    }

    pub fn fee_structure(&self, principal: &Principal, fee_id: FeeStructureId) -> Result<FeeStructure> {
        self.read(principal, Action::Read, |book| Ok(book.fee(fee_id)?.clone()))
    }

    /// catalog listing, optionally active fees only
    pub fn fee_structures(&self, principal: &Principal, active_only: bool) -> Result<Vec<FeeStructure>> {
        self.read(principal, Action::Read, |book| {
            let mut fees: Vec<FeeStructure> = book
                .fee_structures
                .values()
                .filter(|f| f.active || !active_only)
                .cloned()
                .collect();
            fees.sort_by(|a, b| {
                a.description
                    .cmp(&b.description)
                    .then(a.created_at.cmp(&b.created_at))
            });
            Ok(fees)
        })
    }

    pub fn student(&self, principal: &Principal, student_id: StudentId) -> Result<Student> {
        self.read(principal, Action::Read, |book| Ok(book.student(student_id)?.clone()))
    }

    pub fn students(&self, principal: &Principal) -> Result<Vec<Student>> {
        self.read(principal, Action::Read, |book| {
            let mut students: Vec<Student> = book.students.values().cloned().collect();
            students.sort_by(|a, b| a.full_name.cmp(&b.full_name).then(a.id.cmp(&b.id)));
            Ok(students)
        })
    }

    pub fn invoice(&self, principal: &Principal, invoice_id: InvoiceId) -> Result<Invoice> {
        self.read(principal, Action::Read, |book| Ok(book.invoice(invoice_id)?.clone()))
    }

    /// all of a student's invoices, earliest due first
    pub fn invoices_for_student(&self, principal: &Principal, student_id: StudentId) -> Result<Vec<Invoice>> {
        self.read(principal, Action::Read, |book| {
            book.student(student_id)?;
            Ok(book.invoices_of(student_id).into_iter().cloned().collect())
        })
    }

    /// invoices still open for payment, earliest due first
    pub fn outstanding_invoices(&self, principal: &Principal, student_id: StudentId) -> Result<Vec<Invoice>> {
        self.read(principal, Action::Read, |book| {
            book.student(student_id)?;
            Ok(book
                .invoices_of(student_id)
                .into_iter()
                .filter(|i| i.status.is_payable())
                .cloned()
                .collect())
        })
    }

    /// amount an allocation over `invoice_ids` must carry right now
    ///
    /// Pass the result as the expected outstanding of the allocation request
    /// to detect concurrent changes.
    pub fn outstanding_total(
        &self,
        principal: &Principal,
        student_id: StudentId,
        invoice_ids: &[InvoiceId],
    ) -> Result<Money> {
        self.read(principal, Action::Read, |book| {
            let mut total = Money::ZERO;
            let mut seen = HashSet::new();
            for invoice_id in invoice_ids {
                if !seen.insert(*invoice_id) {
                    continue;
                }
                let invoice = book.invoice(*invoice_id)?;
                if invoice.student_id != student_id {
                    return Err(LedgerError::not_found("invoice", *invoice_id));
                }
                if !invoice.status.is_payable() {
                    continue;
                }
                let held = held_total(book.payments.values().filter(|p| p.invoice_id == invoice.id));
                total += (invoice.balance() - held).non_negative();
            }
            Ok(total)
        })
    }

    pub fn payment(&self, principal: &Principal, payment_id: PaymentId) -> Result<Payment> {
        self.read(principal, Action::Read, |book| Ok(book.payment(payment_id)?.clone()))
    }

    /// a student's payments, oldest first
    pub fn payments_for_student(
        &self,
        principal: &Principal,
        student_id: StudentId,
        include_reversed: bool,
    ) -> Result<Vec<Payment>> {
        self.read(principal, Action::Read, |book| {
            book.student(student_id)?;
            Ok(book
                .payments_of(student_id)
                .into_iter()
                .filter(|p| include_reversed || !p.is_reversed)
                .cloned()
                .collect())
        })
    }

    /// payments waiting for staff or provider confirmation
    pub fn payments_awaiting_confirmation(&self, principal: &Principal) -> Result<Vec<Payment>> {
        self.read(principal, Action::Read, |book| {
            let mut payments: Vec<Payment> = book
                .payments
                .values()
                .filter(|p| p.is_held())
                .cloned()
                .collect();
            payments.sort_by_key(|p| (p.created_at, p.id));
            Ok(payments)
        })
    }

    pub fn reversals(&self, principal: &Principal) -> Result<Vec<PaymentReversal>> {
        self.read(principal, Action::Read, |book| Ok(book.reversals.clone()))
    }

    pub fn student_statement(
        &self,
        principal: &Principal,
        student_id: StudentId,
        time: &SafeTimeProvider,
    ) -> Result<StudentStatement> {
        let today = time.now().date_naive();
        self.read(principal, Action::Read, |book| {
            StudentStatement::from_book(book, student_id, today)
        })
    }

    pub fn school_summary(&self, principal: &Principal) -> Result<SchoolSummary> {
        self.read(principal, Action::Read, |book| Ok(SchoolSummary::from_book(book)))
    }

    /// full school state for backup or migration; admins only
    pub fn export_snapshot(&self, principal: &Principal) -> Result<SchoolSnapshot> {
        self.read(principal, Action::ManageCatalog, |book| {
            Ok(SchoolSnapshot::from_book(book))
        })
    }
}
