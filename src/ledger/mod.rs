pub mod queries;
pub mod store;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::billing::{BillingProfile, NewStudent, Student};
use crate::config::LedgerConfig;
use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::events::Event;
use crate::fees::{FeeStructure, NewFeeStructure};
use crate::generator::{
    BilledIndex, GenerationOutcome, GenerationReport, InvoiceGenerator, SchoolRun, SkippedStudent,
};
use crate::invoice::Invoice;
use crate::payments::{
    confirmed_total, held_total, Allocatable, AllocationPlan, AllocationRequest, Payment,
    PaymentAllocator, PaymentDetails, PaymentReversal, ReceiptRequest,
};
use crate::serialization::SchoolSnapshot;
use crate::types::{
    Action, ActorId, ClassId, DivisionId, FeeStructureId, InvoiceId, InvoiceStatus, PaymentId,
    PaymentMethod, PaymentStatus, Principal, SchoolId, StudentId, StudentPaymentStatus,
};

pub use store::{SchoolBook, Transaction};

/// result of a successful allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationOutcome {
    pub plan: AllocationPlan,
    pub payments: Vec<Payment>,
    pub student_status: StudentPaymentStatus,
    pub receipt: Option<ReceiptRequest>,
    pub events: Vec<Event>,
}

/// payment after a confirm, reject or ingest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub payment: Payment,
    pub invoice: Invoice,
    /// false when the call was a repeat and nothing moved
    pub changed: bool,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalOutcome {
    pub reversal: PaymentReversal,
    pub payment: Payment,
    pub invoice: Invoice,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceOutcome {
    pub invoice: Invoice,
    pub events: Vec<Event>,
}

/// staff-issued invoice for one fee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualInvoice {
    pub student_id: StudentId,
    pub fee_id: FeeStructureId,
    pub due_date: NaiveDate,
    /// defaults to the fee amount
    pub amount: Option<Money>,
    pub description: Option<String>,
}

impl ManualInvoice {
    pub fn new(student_id: StudentId, fee_id: FeeStructureId, due_date: NaiveDate) -> Self {
        Self {
            student_id,
            fee_id,
            due_date,
            amount: None,
            description: None,
        }
    }

    pub fn with_amount(mut self, amount: Money) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// payment notification pushed by a mobile-money or online provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPayment {
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub provider: String,
    pub external_transaction_id: String,
    pub paid_on: Option<DateTime<Utc>>,
}

impl ProviderPayment {
    pub fn new(
        invoice_id: InvoiceId,
        amount: Money,
        method: PaymentMethod,
        provider: &str,
        external_transaction_id: &str,
    ) -> Self {
        Self {
            invoice_id,
            amount,
            method,
            provider: provider.to_string(),
            external_transaction_id: external_transaction_id.to_string(),
            paid_on: None,
        }
    }

    pub fn paid_on(mut self, paid_on: DateTime<Utc>) -> Self {
        self.paid_on = Some(paid_on);
        self
    }
}

/// multi-tenant fee ledger
///
/// Every school owns one `SchoolBook` behind its own mutex. Operations that
/// move money hold that lock for their whole read-check-write cycle and stage
/// their writes in a `Transaction`, so a failure leaves the book as it was.
pub struct FeeLedger {
    config: LedgerConfig,
    schools: RwLock<HashMap<SchoolId, Arc<Mutex<SchoolBook>>>>,
}

impl FeeLedger {
    pub fn new(config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            schools: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// onboard a tenant
    #[instrument(skip(self))]
    pub fn register_school(&self, school_id: SchoolId, name: &str) -> Result<()> {
        let mut schools = self.schools.write().unwrap_or_else(PoisonError::into_inner);
        if schools.contains_key(&school_id) {
            return Err(LedgerError::validation(format!(
                "school {} is already registered",
                school_id
            )));
        }
        schools.insert(
            school_id,
            Arc::new(Mutex::new(SchoolBook::new(school_id, name))),
        );
        info!("school registered");
        Ok(())
    }

    /// load a previously exported school into this ledger
    #[instrument(skip(self, snapshot), fields(school_id = %snapshot.school_id))]
    pub fn import_snapshot(&self, snapshot: SchoolSnapshot) -> Result<()> {
        let mut schools = self.schools.write().unwrap_or_else(PoisonError::into_inner);
        if schools.contains_key(&snapshot.school_id) {
            return Err(LedgerError::validation(format!(
                "school {} is already registered",
                snapshot.school_id
            )));
        }
        let book = snapshot.into_book();
        info!(
            students = book.students.len(),
            invoices = book.invoices.len(),
            payments = book.payments.len(),
            "school snapshot imported"
        );
        schools.insert(book.school_id, Arc::new(Mutex::new(book)));
        Ok(())
    }

    pub fn school_ids(&self) -> Vec<SchoolId> {
        let schools = self.schools.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<SchoolId> = schools.keys().copied().collect();
        ids.sort();
        ids
    }

    fn book(&self, school_id: SchoolId) -> Result<Arc<Mutex<SchoolBook>>> {
        let schools = self.schools.read().unwrap_or_else(PoisonError::into_inner);
        schools
            .get(&school_id)
            .cloned()
            .ok_or(LedgerError::not_found("school", school_id))
    }

    /// run `f` while holding the school's exclusive lock
    fn with_book<T>(
        &self,
        school_id: SchoolId,
        f: impl FnOnce(&mut SchoolBook) -> Result<T>,
    ) -> Result<T> {
        let book = self.book(school_id)?;
        let mut guard = lock_book(&book);
        f(&mut *guard)
    }

    // catalog

    #[instrument(skip(self), fields(school_id = ?principal.school_id))]
    pub fn register_class(
        &self,
        principal: &Principal,
        class_id: ClassId,
        division_id: DivisionId,
    ) -> Result<()> {
        let school_id = principal.authorize(Action::ManageCatalog)?;
        self.with_book(school_id, |book| {
            if let Some(existing) = book.classes.get(&class_id).copied() {
                if existing != division_id {
                    return Err(LedgerError::ContradictoryScope {
                        message: format!(
                            "class {} already belongs to division {}",
                            class_id, existing
                        ),
                    });
                }
            }
            book.classes.insert(class_id, division_id);
            Ok(())
        })
    }

    #[instrument(skip(self, time), fields(school_id = ?principal.school_id))]
    pub fn create_fee_structure(
        &self,
        principal: &Principal,
        input: NewFeeStructure,
        time: &SafeTimeProvider,
    ) -> Result<FeeStructure> {
        let school_id = principal.authorize(Action::ManageCatalog)?;
        let now = time.now();
        self.with_book(school_id, |book| {
            let fee = FeeStructure::new(school_id, input, now)?;
            fee.validate_scope(&book.classes)?;
            if book.scope_taken(fee.scope(), None) {
                return Err(LedgerError::DuplicateFeeStructure {
                    message: format!(
                        "{:?} fee already exists for division {:?} class {:?}",
                        fee.kind, fee.division_id, fee.class_id
                    ),
                });
            }
            book.fee_structures.insert(fee.id, fee.clone());
            info!(fee_id = %fee.id, kind = ?fee.kind, amount = %fee.amount, "fee structure created");
            Ok(fee)
        })
    }

    /// change the amount and/or description; existing invoices keep their amounts
    #[instrument(skip(self), fields(school_id = ?principal.school_id))]
    pub fn update_fee_structure(
        &self,
        principal: &Principal,
        fee_id: FeeStructureId,
        amount: Option<Money>,
        description: Option<&str>,
    ) -> Result<FeeStructure> {
        let school_id = principal.authorize(Action::ManageCatalog)?;
        self.with_book(school_id, |book| {
            let mut fee = book.fee(fee_id)?.clone();
            if let Some(amount) = amount {
                fee.update_amount(amount)?;
            }
            if let Some(description) = description {
                if description.trim().is_empty() {
                    return Err(LedgerError::validation("fee description cannot be empty"));
                }
                fee.description = description.trim().to_string();
            }
            book.fee_structures.insert(fee_id, fee.clone());
            info!(fee_id = %fee_id, amount = %fee.amount, "fee structure updated");
            Ok(fee)
        })
    }

    /// soft-deactivate or reactivate a fee structure
    #[instrument(skip(self), fields(school_id = ?principal.school_id))]
    pub fn set_fee_active(
        &self,
        principal: &Principal,
        fee_id: FeeStructureId,
        active: bool,
    ) -> Result<FeeStructure> {
        let school_id = principal.authorize(Action::ManageCatalog)?;
        self.with_book(school_id, |book| {
            let fee = book
                .fee_structures
                .get_mut(&fee_id)
                .ok_or(LedgerError::not_found("fee structure", fee_id))?;
            if active {
                fee.reactivate();
            } else {
                fee.deactivate();
            }
            info!(fee_id = %fee_id, active, "fee structure status changed");
            Ok(fee.clone())
        })
    }

    // students

    #[instrument(skip(self, input, time), fields(school_id = ?principal.school_id))]
    pub fn enroll_student(
        &self,
        principal: &Principal,
        input: NewStudent,
        time: &SafeTimeProvider,
    ) -> Result<Student> {
        let school_id = principal.authorize(Action::ManageStudents)?;
        let now = time.now();
        self.with_book(school_id, |book| {
            let mut input = input;
            input.division_id = resolve_placement(book, input.division_id, input.class_id)?;
            for fee_id in &input.fee_structure_ids {
                check_assignable(book.fee(*fee_id)?, input.division_id, input.class_id)?;
            }

            let student = Student::enroll(school_id, input, now.date_naive(), now)?;
            book.students.insert(student.id, student.clone());
            info!(
                student_id = %student.id,
                cycle = ?student.billing.billing_cycle,
                fees = student.fee_structure_ids.len(),
                "student enrolled"
            );
            Ok(student)
        })
    }

    /// replace a student's billing profile; an unset cursor keeps the current one
    #[instrument(skip(self, profile, time), fields(school_id = ?principal.school_id))]
    pub fn update_billing_profile(
        &self,
        principal: &Principal,
        student_id: StudentId,
        profile: BillingProfile,
        time: &SafeTimeProvider,
    ) -> Result<Student> {
        let school_id = principal.authorize(Action::ManageStudents)?;
        let today = time.now().date_naive();
        self.with_book(school_id, |book| {
            let mut student = book.student(student_id)?.clone();
            let mut profile = profile;
            if profile.next_payment_date.is_none() {
                profile.next_payment_date = student.billing.next_payment_date;
            }
            student.billing = profile;
            student.validate_profile()?;
            student.initialize_cursor(today);

            book.students.insert(student_id, student.clone());
            info!(student_id = %student_id, next_payment_date = ?student.billing.next_payment_date, "billing profile updated");
            Ok(student)
        })
    }

    #[instrument(skip(self), fields(school_id = ?principal.school_id))]
    pub fn assign_fee(
        &self,
        principal: &Principal,
        student_id: StudentId,
        fee_id: FeeStructureId,
    ) -> Result<Student> {
        let school_id = principal.authorize(Action::ManageStudents)?;
        self.with_book(school_id, |book| {
            let mut student = book.student(student_id)?.clone();
            check_assignable(book.fee(fee_id)?, student.division_id, student.class_id)?;
            student.fee_structure_ids.insert(fee_id);
            book.students.insert(student_id, student.clone());
            Ok(student)
        })
    }

    #[instrument(skip(self), fields(school_id = ?principal.school_id))]
    pub fn unassign_fee(
        &self,
        principal: &Principal,
        student_id: StudentId,
        fee_id: FeeStructureId,
    ) -> Result<Student> {
        let school_id = principal.authorize(Action::ManageStudents)?;
        self.with_book(school_id, |book| {
            let mut student = book.student(student_id)?.clone();
            if !student.fee_structure_ids.remove(&fee_id) {
                return Err(LedgerError::not_found("fee assignment", fee_id));
            }
            book.students.insert(student_id, student.clone());
            Ok(student)
        })
    }

    // invoices

    #[instrument(skip(self, request, time), fields(school_id = ?principal.school_id, student_id = %request.student_id))]
    pub fn create_manual_invoice(
        &self,
        principal: &Principal,
        request: ManualInvoice,
        time: &SafeTimeProvider,
    ) -> Result<InvoiceOutcome> {
        let school_id = principal.authorize(Action::IssueInvoices)?;
        let now = time.now();
        self.with_book(school_id, |book| {
            let student = book.student(request.student_id)?;
            let fee = book.fee(request.fee_id)?;
            if !fee.active {
                return Err(LedgerError::validation(format!(
                    "fee structure {} is inactive",
                    fee.id
                )));
            }
            if !fee.applies_to(student.division_id, student.class_id) {
                return Err(LedgerError::ContradictoryScope {
                    message: format!("fee {} does not apply to student {}", fee.id, student.id),
                });
            }

            let mut invoice = Invoice::for_fee(student.id, fee, request.due_date, now);
            if let Some(amount) = request.amount {
                if !amount.is_positive() {
                    return Err(LedgerError::InvalidAmount { amount });
                }
                invoice = invoice.with_amount(amount);
            }
            if let Some(description) = &request.description {
                invoice = invoice.with_description(description);
            }

            let billed = BilledIndex::from_invoices(book.invoices_of(student.id));
            let duplicate = if fee.is_recurring() {
                billed.has_period(student.id, fee.id, invoice.billing_month)
            } else {
                billed.has_fee(student.id, fee.id)
            };
            if duplicate {
                return Err(LedgerError::DuplicateInvoice {
                    message: format!(
                        "student {} already billed for fee {} in {}",
                        student.id,
                        fee.id,
                        invoice.billing_month.format("%Y-%m")
                    ),
                });
            }

            let mut tx = Transaction::begin(book);
            tx.insert_invoice(invoice.clone());
            tx.with_student(invoice.student_id, |student, events| {
                student.set_payment_status(StudentPaymentStatus::Pending, events);
                Ok(())
            })?;
            let events = tx.commit();
            info!(invoice_id = %invoice.id, amount = %invoice.amount_due, "manual invoice created");
            Ok(InvoiceOutcome { invoice, events })
        })
    }

    /// bill every student of one school up to today, in one transaction
    #[instrument(skip(self, time), fields(school_id = ?principal.school_id))]
    pub fn generate_invoices_for_school(
        &self,
        principal: &Principal,
        time: &SafeTimeProvider,
    ) -> Result<GenerationOutcome> {
        let school_id = principal.authorize(Action::GenerateInvoices)?;
        let now = time.now();
        let today = now.date_naive();
        let generator = InvoiceGenerator::new(&self.config.billing);

        self.with_book(school_id, |book| {
            let fees = book.fee_structures.clone();
            let mut students: Vec<Student> = book
                .students
                .values()
                .filter(|s| s.is_billable())
                .cloned()
                .collect();
            students.sort_by_key(|s| (s.created_at, s.id));
            let mut billed = BilledIndex::from_invoices(book.invoices.values());

            let mut tx = Transaction::begin(book);
            let mut invoices_created = 0;
            let mut students_billed = 0;
            let mut skipped = Vec::new();

            for student in &students {
                let plan = match generator.bill_student(student, &fees, &billed, today, now) {
                    Ok(plan) => plan,
                    Err(err) if err.is_configuration() => {
                        warn!(student_id = %student.id, error = %err, "skipping student");
                        skipped.push(SkippedStudent {
                            student_id: student.id,
                            reason: err.to_string(),
                        });
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                let (invoices, cursor, keys) = plan.into_parts();
                let count = invoices.len();
                for invoice in invoices {
                    tx.insert_invoice(invoice);
                }
                tx.with_student(student.id, |s, events| {
                    if let Some(next) = cursor {
                        s.billing.next_payment_date = Some(next);
                    }
                    if count > 0 {
                        s.set_payment_status(StudentPaymentStatus::Pending, events);
                    }
                    Ok(())
                })?;
                billed.merge(keys);

                if count > 0 {
                    debug!(student_id = %student.id, invoices = count, next_payment_date = ?cursor, "student billed");
                    invoices_created += count;
                    students_billed += 1;
                }
            }

            tx.emit(Event::GenerationCompleted {
                school_id,
                invoices_created,
                students_billed,
                timestamp: now,
            });
            let events = tx.commit();
            info!(invoices_created, students_billed, skipped = skipped.len(), "invoice generation finished");

            Ok(GenerationOutcome {
                school_id,
                invoices_created,
                students_billed,
                skipped,
                events,
            })
        })
    }

    /// scheduled run over every school; one school's failure never stops the rest
    #[instrument(skip(self, time))]
    pub fn generate_invoices_for_all_schools(&self, time: &SafeTimeProvider) -> GenerationReport {
        self.generate_isolated(time, Self::generate_invoices_for_school)
    }

    fn generate_isolated<F>(&self, time: &SafeTimeProvider, run: F) -> GenerationReport
    where
        F: Fn(&Self, &Principal, &SafeTimeProvider) -> Result<GenerationOutcome>,
    {
        let mut report = GenerationReport::default();

        for school_id in self.school_ids() {
            let principal = Principal::system(school_id);
            let result = panic::catch_unwind(AssertUnwindSafe(|| run(self, &principal, time)))
                .unwrap_or(Err(LedgerError::GenerationAborted { school_id }));

            if let Err(err) = &result {
                error!(school_id = %school_id, error = %err, "invoice generation failed");
            }
            report.runs.push(SchoolRun { school_id, result });
        }

        info!(
            schools = report.runs.len(),
            invoices_created = report.total_created(),
            failures = report.failures().len(),
            "scheduled invoice generation finished"
        );
        report
    }

    // payments

    /// pay the selected invoices of one student, earliest due date first
    ///
    /// The total must equal the outstanding sum of the selected invoices
    /// exactly. Amounts held by payments awaiting confirmation are not
    /// outstanding. Cash settles the invoices at once; other methods record
    /// payments that count only once confirmed.
    #[instrument(
        skip(self, request, time),
        fields(school_id = ?principal.school_id, student_id = %request.student_id, total = %request.total_amount)
    )]
    pub fn allocate_payment(
        &self,
        principal: &Principal,
        request: AllocationRequest,
        time: &SafeTimeProvider,
    ) -> Result<AllocationOutcome> {
        let school_id = principal.authorize(Action::RecordPayment)?;
        if !request.total_amount.is_positive() {
            return Err(LedgerError::InvalidAmount {
                amount: request.total_amount,
            });
        }
        if request.invoice_ids.is_empty() {
            return Err(LedgerError::NoEligibleInvoices);
        }

        let now = time.now();
        let awaiting = self.config.payments.non_cash_initial_status;
        let receipt_mode = request
            .receipt_mode
            .unwrap_or(self.config.payments.default_receipt_mode);

        self.with_book(school_id, |book| {
            book.student(request.student_id)?;
            let mut tx = Transaction::begin(book);

            let mut seen = HashSet::new();
            let mut candidates = Vec::with_capacity(request.invoice_ids.len());
            for invoice_id in &request.invoice_ids {
                if !seen.insert(*invoice_id) {
                    continue;
                }
                let invoice = tx.invoice(*invoice_id)?;
                if invoice.student_id != request.student_id {
                    return Err(LedgerError::not_found("invoice", *invoice_id));
                }
                if !invoice.status.is_payable() {
                    continue;
                }
                let held = held_total(tx.invoice_payments(invoice.id));
                candidates.push(Allocatable {
                    invoice_id: invoice.id,
                    due_date: invoice.due_date,
                    available: invoice.balance() - held,
                });
            }

            let outstanding = PaymentAllocator::outstanding(&candidates);
            if let Some(expected) = request.expected_outstanding {
                if expected != outstanding {
                    warn!(expected = %expected, actual = %outstanding, "outstanding total moved since it was read");
                    return Err(LedgerError::ConcurrencyConflict {
                        expected,
                        actual: outstanding,
                    });
                }
            }

            let plan = PaymentAllocator::new().plan(&candidates, request.total_amount)?;

            let mut payments = Vec::with_capacity(plan.allocations.len());
            for allocation in &plan.allocations {
                let payment = Payment::record(
                    tx.invoice(allocation.invoice_id)?,
                    allocation.amount,
                    &request.details,
                    Some(principal.actor_id),
                    awaiting,
                    now,
                );
                if payment.contributes() {
                    tx.with_invoice(allocation.invoice_id, |invoice, events| {
                        invoice.pay(allocation.amount, events)
                    })?;
                }
                tx.insert_payment(payment.clone());
                payments.push(payment);
            }

            let student_status = tx.rollup_student_status(request.student_id)?;
            let receipt = ReceiptRequest::for_payments(receipt_mode, &payments);
            let events = tx.commit();
            info!(
                payments = payments.len(),
                method = %request.details.method,
                student_status = ?student_status,
                "payment allocated"
            );

            Ok(AllocationOutcome {
                plan,
                payments,
                student_status,
                receipt,
                events,
            })
        })
    }

    /// record a provider notification as a PENDING payment; repeats return the first record
    #[instrument(
        skip(self, notice, time),
        fields(school_id = ?principal.school_id, provider = %notice.provider, external_id = %notice.external_transaction_id)
    )]
    pub fn record_provider_payment(
        &self,
        principal: &Principal,
        notice: ProviderPayment,
        time: &SafeTimeProvider,
    ) -> Result<PaymentOutcome> {
        let school_id = principal.authorize(Action::IngestProviderPayment)?;
        if notice.method.is_auto_confirmed() {
            return Err(LedgerError::validation(format!(
                "{} payments are not accepted from providers",
                notice.method
            )));
        }
        if notice.provider.trim().is_empty() || notice.external_transaction_id.trim().is_empty() {
            return Err(LedgerError::validation(
                "provider and external transaction id are required",
            ));
        }
        if !notice.amount.is_positive() {
            return Err(LedgerError::InvalidAmount {
                amount: notice.amount,
            });
        }
        let now = time.now();

        self.with_book(school_id, |book| {
            if let Some(existing) =
                book.payment_by_external_id(&notice.provider, &notice.external_transaction_id)
            {
                if existing.invoice_id != notice.invoice_id || existing.amount != notice.amount {
                    warn!(
                        payment_id = %existing.id,
                        provider = %notice.provider,
                        external_transaction_id = %notice.external_transaction_id,
                        "provider notification conflicts with recorded payment"
                    );
                    return Err(LedgerError::validation(format!(
                        "transaction {} from {} was already recorded with a different invoice or amount",
                        notice.external_transaction_id, notice.provider
                    )));
                }
                debug!(payment_id = %existing.id, "duplicate provider notification");
                let payment = existing.clone();
                let invoice = book.invoice(payment.invoice_id)?.clone();
                return Ok(PaymentOutcome {
                    payment,
                    invoice,
                    changed: false,
                    events: Vec::new(),
                });
            }

            let mut tx = Transaction::begin(book);
            let invoice = tx.invoice(notice.invoice_id)?.clone();
            if !invoice.status.is_payable() {
                return Err(LedgerError::validation(format!(
                    "invoice {} is already paid",
                    invoice.id
                )));
            }
            let available = invoice.balance() - held_total(tx.invoice_payments(invoice.id));
            if notice.amount > available {
                return Err(LedgerError::AmountMismatch {
                    expected: available.non_negative(),
                    provided: notice.amount,
                });
            }

            let mut details = PaymentDetails::new(notice.method)
                .via_provider(&notice.provider, &notice.external_transaction_id);
            details.paid_on = notice.paid_on;
            let payment = Payment::record(
                &invoice,
                notice.amount,
                &details,
                None,
                PaymentStatus::Pending,
                now,
            );
            tx.insert_payment(payment.clone());
            let events = tx.commit();
            info!(payment_id = %payment.id, invoice_id = %invoice.id, amount = %payment.amount, "provider payment recorded");

            Ok(PaymentOutcome {
                payment,
                invoice,
                changed: true,
                events,
            })
        })
    }

    #[instrument(skip(self, time), fields(school_id = ?principal.school_id))]
    pub fn confirm_payment(
        &self,
        principal: &Principal,
        payment_id: PaymentId,
        time: &SafeTimeProvider,
    ) -> Result<PaymentOutcome> {
        let school_id = principal.authorize(Action::ConfirmPayment)?;
        let now = time.now();
        self.with_book(school_id, |book| {
            settle(book, payment_id, Settlement::Confirm(principal.actor_id), now)
        })
    }

    #[instrument(skip(self, time), fields(school_id = ?principal.school_id))]
    pub fn confirm_provider_payment(
        &self,
        principal: &Principal,
        provider: &str,
        external_id: &str,
        time: &SafeTimeProvider,
    ) -> Result<PaymentOutcome> {
        let school_id = principal.authorize(Action::ConfirmPayment)?;
        let now = time.now();
        self.with_book(school_id, |book| {
            let payment_id = external_payment_id(book, provider, external_id)?;
            settle(book, payment_id, Settlement::Confirm(principal.actor_id), now)
        })
    }

    #[instrument(skip(self, time), fields(school_id = ?principal.school_id))]
    pub fn reject_payment(
        &self,
        principal: &Principal,
        payment_id: PaymentId,
        time: &SafeTimeProvider,
    ) -> Result<PaymentOutcome> {
        let school_id = principal.authorize(Action::ConfirmPayment)?;
        let now = time.now();
        self.with_book(school_id, |book| settle(book, payment_id, Settlement::Reject, now))
    }

    #[instrument(skip(self, time), fields(school_id = ?principal.school_id))]
    pub fn reject_provider_payment(
        &self,
        principal: &Principal,
        provider: &str,
        external_id: &str,
        time: &SafeTimeProvider,
    ) -> Result<PaymentOutcome> {
        let school_id = principal.authorize(Action::ConfirmPayment)?;
        let now = time.now();
        self.with_book(school_id, |book| {
            let payment_id = external_payment_id(book, provider, external_id)?;
            settle(book, payment_id, Settlement::Reject, now)
        })
    }

    /// undo a confirmed payment, keeping an audit record
    #[instrument(skip(self, time), fields(school_id = ?principal.school_id))]
    pub fn reverse_payment(
        &self,
        principal: &Principal,
        payment_id: PaymentId,
        reason: &str,
        time: &SafeTimeProvider,
    ) -> Result<ReversalOutcome> {
        let school_id = principal.authorize(Action::ReversePayment)?;
        let now = time.now();
        self.with_book(school_id, |book| {
            let mut tx = Transaction::begin(book);
            let reversal = tx.with_payment(payment_id, |payment, _| {
                payment.reverse(reason, principal.actor_id, now)
            })?;
            let payment = tx.payment(payment_id)?.clone();
            // status is re-derived from the confirmed payments that remain,
            // so other settlements on the invoice keep it PARTIAL or PAID
            let invoice = tx.with_invoice(payment.invoice_id, |invoice, events| {
                invoice.revert(payment.amount, events)?;
                Ok(invoice.clone())
            })?;

            tx.emit(Event::PaymentReversed {
                student_id: payment.student_id,
                invoice_id: payment.invoice_id,
                payment_id,
                amount: payment.amount,
                reason: reversal.reason.clone(),
                reversed_by: principal.actor_id,
                timestamp: now,
            });
            tx.insert_reversal(reversal.clone());
            tx.rollup_student_status(payment.student_id)?;
            let events = tx.commit();
            info!(
                payment_id = %payment_id,
                invoice_id = %invoice.id,
                amount = %payment.amount,
                invoice_status = %invoice.status,
                "payment reversed"
            );

            Ok(ReversalOutcome {
                reversal,
                payment,
                invoice,
                events,
            })
        })
    }

    // maintenance

    /// UNPAID/PARTIAL invoices already overdue or falling due within the reminder window
    #[instrument(skip(self, time), fields(school_id = ?principal.school_id))]
    pub fn due_soon_reminders(
        &self,
        principal: &Principal,
        time: &SafeTimeProvider,
    ) -> Result<Vec<Event>> {
        let school_id = principal.authorize(Action::Read)?;
        let today = time.now().date_naive();
        let horizon = today + Duration::days(i64::from(self.config.reminders.window_days));

        self.with_book(school_id, |book| {
            let mut due: Vec<&Invoice> = book
                .invoices
                .values()
                .filter(|i| matches!(i.status, InvoiceStatus::Unpaid | InvoiceStatus::Partial))
                .filter(|i| i.due_date <= horizon)
                .collect();
            due.sort_by_key(|i| (i.due_date, i.id));

            debug!(reminders = due.len(), "fee reminders collected");
            Ok(due
                .into_iter()
                .map(|i| Event::FeeReminderDue {
                    student_id: i.student_id,
                    invoice_id: i.id,
                    balance: i.balance(),
                    due_date: i.due_date,
                    overdue: i.is_overdue(today),
                })
                .collect())
        })
    }

    /// move students with overdue invoices to OVERDUE and settled ones to PAID
    #[instrument(skip(self, time), fields(school_id = ?principal.school_id))]
    pub fn refresh_overdue_statuses(
        &self,
        principal: &Principal,
        time: &SafeTimeProvider,
    ) -> Result<Vec<Event>> {
        let school_id = principal.authorize(Action::GenerateInvoices)?;
        let today = time.now().date_naive();

        self.with_book(school_id, |book| {
            let mut student_ids: Vec<StudentId> = book.students.keys().copied().collect();
            student_ids.sort();

            let mut tx = Transaction::begin(book);
            for student_id in student_ids {
                let invoices = tx.student_invoices(student_id);
                let overdue = invoices.iter().any(|i| i.is_overdue(today));
                let outstanding = invoices.iter().any(|i| i.status.is_outstanding());
                let current = tx.student(student_id)?.payment_status;

                let status = match (overdue, outstanding, current) {
                    (true, _, _) => StudentPaymentStatus::Overdue,
                    (false, false, _) => StudentPaymentStatus::Paid,
                    (false, true, StudentPaymentStatus::Overdue) => StudentPaymentStatus::Unpaid,
                    (false, true, current) => current,
                };
                tx.with_student(student_id, |student, events| {
                    student.set_payment_status(status, events);
                    Ok(())
                })?;
            }
            Ok(tx.commit())
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Confirm(ActorId),
    Reject,
}

/// confirm or reject one payment and re-derive its invoice from confirmed payments
fn settle(
    book: &mut SchoolBook,
    payment_id: PaymentId,
    settlement: Settlement,
    now: DateTime<Utc>,
) -> Result<PaymentOutcome> {
    let mut tx = Transaction::begin(book);
    let changed = tx.with_payment(payment_id, |payment, _| match settlement {
        Settlement::Confirm(actor) => payment.confirm(actor, now),
        Settlement::Reject => payment.reject(),
    })?;
    let payment = tx.payment(payment_id)?.clone();

    if !changed {
        debug!(payment_id = %payment_id, status = %payment.status, "payment already settled");
        let invoice = tx.invoice(payment.invoice_id)?.clone();
        tx.rollback();
        return Ok(PaymentOutcome {
            payment,
            invoice,
            changed: false,
            events: Vec::new(),
        });
    }

    match settlement {
        Settlement::Confirm(actor) => tx.emit(Event::PaymentConfirmed {
            student_id: payment.student_id,
            invoice_id: payment.invoice_id,
            payment_id,
            amount: payment.amount,
            confirmed_by: actor,
            timestamp: now,
        }),
        Settlement::Reject => tx.emit(Event::PaymentRejected {
            student_id: payment.student_id,
            invoice_id: payment.invoice_id,
            payment_id,
            amount: payment.amount,
            timestamp: now,
        }),
    }

    let paid = confirmed_total(tx.invoice_payments(payment.invoice_id));
    let invoice = tx.with_invoice(payment.invoice_id, |invoice, events| {
        invoice.recompute_paid(paid, events);
        Ok(invoice.clone())
    })?;
    tx.rollup_student_status(payment.student_id)?;
    let events = tx.commit();
    info!(
        payment_id = %payment_id,
        status = %payment.status,
        invoice_status = %invoice.status,
        amount_paid = %invoice.amount_paid,
        "payment settled"
    );

    Ok(PaymentOutcome {
        payment,
        invoice,
        changed: true,
        events,
    })
}

fn external_payment_id(book: &SchoolBook, provider: &str, external_id: &str) -> Result<PaymentId> {
    book.payment_by_external_id(provider, external_id)
        .map(|p| p.id)
        .ok_or_else(|| LedgerError::UnknownTransaction {
            provider: provider.to_string(),
            external_id: external_id.to_string(),
        })
}

/// division implied by the class, rejecting contradictions
fn resolve_placement(
    book: &SchoolBook,
    division_id: Option<DivisionId>,
    class_id: Option<ClassId>,
) -> Result<Option<DivisionId>> {
    let Some(class_id) = class_id else {
        return Ok(division_id);
    };
    match (book.classes.get(&class_id), division_id) {
        (None, _) => Err(LedgerError::ContradictoryScope {
            message: format!("class {} is not registered for this school", class_id),
        }),
        (Some(registered), Some(division_id)) if *registered != division_id => {
            Err(LedgerError::ContradictoryScope {
                message: format!(
                    "class {} belongs to division {}, not {}",
                    class_id, registered, division_id
                ),
            })
        }
        (Some(registered), _) => Ok(Some(*registered)),
    }
}

fn check_assignable(
    fee: &FeeStructure,
    division_id: Option<DivisionId>,
    class_id: Option<ClassId>,
) -> Result<()> {
    if !fee.active {
        return Err(LedgerError::validation(format!(
            "fee structure {} is inactive",
            fee.id
        )));
    }
    if !fee.applies_to(division_id, class_id) {
        return Err(LedgerError::ContradictoryScope {
            message: format!("fee {} does not apply to this placement", fee.id),
        });
    }
    Ok(())
}

fn lock_book(book: &Mutex<SchoolBook>) -> MutexGuard<'_, SchoolBook> {
    book.lock().unwrap_or_else(|poisoned| {
        warn!("recovering poisoned school lock");
        poisoned.into_inner()
    })
}
