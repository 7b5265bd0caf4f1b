use std::collections::HashMap;

use tracing::debug;

use crate::errors::{LedgerError, Result};
use crate::events::{Event, EventStore};
use crate::fees::{FeeScope, FeeStructure};
use crate::invoice::Invoice;
use crate::payments::{Payment, PaymentReversal};
use crate::types::{
    ClassId, DivisionId, FeeStructureId, InvoiceId, PaymentId, SchoolId, StudentId,
    StudentPaymentStatus,
};
use crate::billing::Student;

/// every table owned by one school
#[derive(Debug, Clone)]
pub struct SchoolBook {
    pub school_id: SchoolId,
    pub name: String,
    pub(crate) classes: HashMap<ClassId, DivisionId>,
    pub(crate) fee_structures: HashMap<FeeStructureId, FeeStructure>,
    pub(crate) students: HashMap<StudentId, Student>,
    pub(crate) invoices: HashMap<InvoiceId, Invoice>,
    pub(crate) payments: HashMap<PaymentId, Payment>,
    pub(crate) reversals: Vec<PaymentReversal>,
}

impl SchoolBook {
    pub fn new(school_id: SchoolId, name: &str) -> Self {
        Self {
            school_id,
            name: name.to_string(),
            classes: HashMap::new(),
            fee_structures: HashMap::new(),
            students: HashMap::new(),
            invoices: HashMap::new(),
            payments: HashMap::new(),
            reversals: Vec::new(),
        }
    }

    pub fn fee(&self, id: FeeStructureId) -> Result<&FeeStructure> {
        self.fee_structures
            .get(&id)
            .ok_or(LedgerError::not_found("fee structure", id))
    }

    pub fn student(&self, id: StudentId) -> Result<&Student> {
        self.students
            .get(&id)
            .ok_or(LedgerError::not_found("student", id))
    }

    pub fn invoice(&self, id: InvoiceId) -> Result<&Invoice> {
        self.invoices
            .get(&id)
            .ok_or(LedgerError::not_found("invoice", id))
    }

    pub fn payment(&self, id: PaymentId) -> Result<&Payment> {
        self.payments
            .get(&id)
            .ok_or(LedgerError::not_found("payment", id))
    }

    /// a student's invoices, earliest due first
    pub fn invoices_of(&self, student_id: StudentId) -> Vec<&Invoice> {
        let mut invoices: Vec<&Invoice> = self
            .invoices
            .values()
            .filter(|i| i.student_id == student_id)
            .collect();
        invoices.sort_by_key(|i| (i.due_date, i.created_at, i.id));
        invoices
    }

    /// a student's payments, oldest first
    pub fn payments_of(&self, student_id: StudentId) -> Vec<&Payment> {
        let mut payments: Vec<&Payment> = self
            .payments
            .values()
            .filter(|p| p.student_id == student_id)
            .collect();
        payments.sort_by_key(|p| (p.paid_on, p.created_at, p.id));
        payments
    }

    pub fn payment_by_external_id(&self, provider: &str, external_id: &str) -> Option<&Payment> {
        self.payments.values().find(|p| {
            p.provider.as_deref() == Some(provider)
                && p.external_transaction_id.as_deref() == Some(external_id)
        })
    }

    /// whether another fee structure already occupies `scope`
    pub fn scope_taken(&self, scope: FeeScope, except: Option<FeeStructureId>) -> bool {
        self.fee_structures
            .values()
            .any(|f| f.scope() == scope && Some(f.id) != except)
    }
}

/// staged writes against one locked school book
///
/// Rows are copied into the stage on first write and only land in the book on
/// `commit`. Dropping the transaction discards every staged change.
pub struct Transaction<'a> {
    book: &'a mut SchoolBook,
    invoices: HashMap<InvoiceId, Invoice>,
    payments: HashMap<PaymentId, Payment>,
    students: HashMap<StudentId, Student>,
    reversals: Vec<PaymentReversal>,
    events: EventStore,
}

impl<'a> Transaction<'a> {
    pub fn begin(book: &'a mut SchoolBook) -> Self {
        Self {
            book,
            invoices: HashMap::new(),
            payments: HashMap::new(),
            students: HashMap::new(),
            reversals: Vec::new(),
            events: EventStore::new(),
        }
    }

    pub fn school_id(&self) -> SchoolId {
        self.book.school_id
    }

    /// committed state, without staged changes
    pub fn book(&self) -> &SchoolBook {
        self.book
    }

    pub fn emit(&mut self, event: Event) {
        self.events.emit(event);
    }

    pub fn invoice(&self, id: InvoiceId) -> Result<&Invoice> {
        match self.invoices.get(&id) {
            Some(invoice) => Ok(invoice),
            None => self.book.invoice(id),
        }
    }

    pub fn payment(&self, id: PaymentId) -> Result<&Payment> {
        match self.payments.get(&id) {
            Some(payment) => Ok(payment),
            None => self.book.payment(id),
        }
    }

    pub fn student(&self, id: StudentId) -> Result<&Student> {
        match self.students.get(&id) {
            Some(student) => Ok(student),
            None => self.book.student(id),
        }
    }

    /// mutate one invoice row
    pub fn with_invoice<T>(
        &mut self,
        id: InvoiceId,
        f: impl FnOnce(&mut Invoice, &mut EventStore) -> Result<T>,
    ) -> Result<T> {
        if !self.invoices.contains_key(&id) {
            let row = self.book.invoice(id)?.clone();
            self.invoices.insert(id, row);
        }
        let invoice = self
            .invoices
            .get_mut(&id)
            .ok_or(LedgerError::not_found("invoice", id))?;
        f(invoice, &mut self.events)
    }

    /// mutate one payment row
    pub fn with_payment<T>(
        &mut self,
        id: PaymentId,
        f: impl FnOnce(&mut Payment, &mut EventStore) -> Result<T>,
    ) -> Result<T> {
        if !self.payments.contains_key(&id) {
            let row = self.book.payment(id)?.clone();
            self.payments.insert(id, row);
        }
        let payment = self
            .payments
            .get_mut(&id)
            .ok_or(LedgerError::not_found("payment", id))?;
        f(payment, &mut self.events)
    }

    /// mutate one student row
    pub fn with_student<T>(
        &mut self,
        id: StudentId,
        f: impl FnOnce(&mut Student, &mut EventStore) -> Result<T>,
    ) -> Result<T> {
        if !self.students.contains_key(&id) {
            let row = self.book.student(id)?.clone();
            self.students.insert(id, row);
        }
        let student = self
            .students
            .get_mut(&id)
            .ok_or(LedgerError::not_found("student", id))?;
        f(student, &mut self.events)
    }

    pub fn insert_invoice(&mut self, invoice: Invoice) {
        self.events.emit(invoice.issued_event());
        self.invoices.insert(invoice.id, invoice);
    }

    pub fn insert_payment(&mut self, payment: Payment) {
        self.events.emit(payment.recorded_event());
        self.payments.insert(payment.id, payment);
    }

    pub fn insert_reversal(&mut self, reversal: PaymentReversal) {
        self.reversals.push(reversal);
    }

    /// a student's invoices including staged rows
    pub fn student_invoices(&self, student_id: StudentId) -> Vec<&Invoice> {
        let staged = &self.invoices;
        let mut invoices: Vec<&Invoice> = self
            .book
            .invoices
            .values()
            .filter(|i| i.student_id == student_id && !staged.contains_key(&i.id))
            .chain(staged.values().filter(|i| i.student_id == student_id))
            .collect();
        invoices.sort_by_key(|i| (i.due_date, i.created_at, i.id));
        invoices
    }

    /// payments on one invoice including staged rows
    pub fn invoice_payments(&self, invoice_id: InvoiceId) -> Vec<&Payment> {
        let staged = &self.payments;
        self.book
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id && !staged.contains_key(&p.id))
            .chain(staged.values().filter(|p| p.invoice_id == invoice_id))
            .collect()
    }

    /// PAID when nothing is outstanding, UNPAID otherwise
    pub fn rollup_student_status(&mut self, student_id: StudentId) -> Result<StudentPaymentStatus> {
        let outstanding = self
            .student_invoices(student_id)
            .iter()
            .any(|i| i.status.is_outstanding());
        let status = if outstanding {
            StudentPaymentStatus::Unpaid
        } else {
            StudentPaymentStatus::Paid
        };
        self.with_student(student_id, |student, events| {
            student.set_payment_status(status, events);
            Ok(status)
        })
    }

    /// write every staged row into the book and hand back the events
    pub fn commit(self) -> Vec<Event> {
        let Transaction {
            book,
            invoices,
            payments,
            students,
            reversals,
            mut events,
        } = self;

        debug!(
            school_id = %book.school_id,
            invoices = invoices.len(),
            payments = payments.len(),
            students = students.len(),
            reversals = reversals.len(),
            "committing transaction"
        );

        book.invoices.extend(invoices);
        book.payments.extend(payments);
        book.students.extend(students);
        book.reversals.extend(reversals);
        events.take_events()
    }

    pub fn rollback(self) {
        debug!(school_id = %self.book.school_id, "rolling back transaction");
    }
}
