use super::*;
use crate::types::{BillingCycle, FeeKind, Role};
use chrono::TimeZone;
use hourglass_rs::TimeSource;
use std::thread;
use uuid::Uuid;

fn clock(y: i32, m: u32, d: u32) -> SafeTimeProvider {
    SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap(),
    ))
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

struct Fixture {
    ledger: FeeLedger,
    school_id: SchoolId,
    admin: Principal,
    accountant: Principal,
    system: Principal,
}

impl Fixture {
    fn new() -> Self {
        let ledger = FeeLedger::new(LedgerConfig::standard()).unwrap();
        let school_id = Uuid::new_v4();
        ledger.register_school(school_id, "Addis Academy").unwrap();
        Self {
            ledger,
            school_id,
            admin: Principal::new(Uuid::new_v4(), school_id, Role::SchoolAdmin),
            accountant: Principal::new(Uuid::new_v4(), school_id, Role::Accountant),
            system: Principal::system(school_id),
        }
    }

    fn fee(&self, kind: FeeKind, amount: i64, time: &SafeTimeProvider) -> FeeStructure {
        self.ledger
            .create_fee_structure(
                &self.admin,
                NewFeeStructure::school_wide(kind, Money::from_major(amount), &format!("{:?}", kind)),
                time,
            )
            .unwrap()
    }

    fn enroll(&self, billing: BillingProfile, fees: &[FeeStructureId], time: &SafeTimeProvider) -> Student {
        self.ledger
            .enroll_student(
                &self.admin,
                NewStudent::new("Dawit Alemu", billing).with_fees(fees.iter().copied()),
                time,
            )
            .unwrap()
    }

    fn invoices(&self, student_id: StudentId) -> Vec<Invoice> {
        self.ledger
            .invoices_for_student(&self.admin, student_id)
            .unwrap()
    }

    fn generate(&self, time: &SafeTimeProvider) -> GenerationOutcome {
        self.ledger
            .generate_invoices_for_school(&self.system, time)
            .unwrap()
    }
}

/// a student owing 300 due in February and 200 due in March
fn two_invoices(time: &SafeTimeProvider) -> (Fixture, StudentId, Invoice, Invoice) {
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 200, time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 3, 1)), &[tuition.id], time);
    assert_eq!(fx.generate(time).invoices_created, 1);

    let february = fx
        .ledger
        .create_manual_invoice(
            &fx.admin,
            ManualInvoice::new(student.id, tuition.id, date(2025, 2, 10))
                .with_amount(Money::from_major(300))
                .with_description("February tuition"),
            time,
        )
        .unwrap()
        .invoice;
    let march = fx
        .invoices(student.id)
        .into_iter()
        .find(|i| i.due_date == date(2025, 3, 1))
        .unwrap();
    (fx, student.id, february, march)
}

fn cash(student_id: StudentId, invoices: &[&Invoice], amount: i64) -> AllocationRequest {
    AllocationRequest::new(
        student_id,
        invoices.iter().map(|i| i.id).collect(),
        Money::from_major(amount),
        PaymentMethod::Cash,
    )
}

#[test]
fn test_monthly_catch_up_generation() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 1, 1)), &[tuition.id], &time);

    let outcome = fx.generate(&time);
    assert_eq!(outcome.invoices_created, 3);
    assert_eq!(outcome.students_billed, 1);

    let invoices = fx.invoices(student.id);
    let dues: Vec<NaiveDate> = invoices.iter().map(|i| i.due_date).collect();
    assert_eq!(dues, vec![date(2025, 1, 1), date(2025, 2, 1), date(2025, 3, 1)]);
    assert!(invoices.iter().all(|i| i.amount_due == Money::from_major(500)));
    assert!(invoices.iter().all(|i| i.status == InvoiceStatus::Unpaid));

    let student = fx.ledger.student(&fx.admin, student.id).unwrap();
    assert_eq!(student.billing.next_payment_date, Some(date(2025, 4, 1)));
    assert_eq!(student.payment_status, StudentPaymentStatus::Pending);

    let issued = outcome
        .events
        .iter()
        .filter(|e| matches!(e, Event::InvoiceIssued { .. }))
        .count();
    assert_eq!(issued, 3);
    assert!(matches!(
        outcome.events.last(),
        Some(Event::GenerationCompleted { invoices_created: 3, .. })
    ));
}

#[test]
fn test_second_run_same_day_creates_nothing() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 1, 1)), &[tuition.id], &time);

    fx.generate(&time);
    let rerun = fx.generate(&time);
    assert_eq!(rerun.invoices_created, 0);
    assert_eq!(fx.invoices(student.id).len(), 3);
}

#[test]
fn test_registration_billed_once_across_runs() {
    let time = clock(2025, 1, 15);
    let control = time.test_control().unwrap();
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);
    let registration = fx.fee(FeeKind::Registration, 1_000, &time);
    let student = fx.enroll(
        BillingProfile::monthly(date(2025, 1, 1)),
        &[tuition.id, registration.id],
        &time,
    );

    assert_eq!(fx.generate(&time).invoices_created, 2);
    control.advance(Duration::days(31));
    assert_eq!(fx.generate(&time).invoices_created, 1);
    control.advance(Duration::days(31));
    assert_eq!(fx.generate(&time).invoices_created, 1);

    let registrations = fx
        .invoices(student.id)
        .iter()
        .filter(|i| i.fee_id == Some(registration.id))
        .count();
    assert_eq!(registrations, 1);
}

#[test]
fn test_quarterly_student_billed_per_quarter() {
    let time = clock(2025, 8, 1);
    let fx = Fixture::new();
    let transport = fx.fee(FeeKind::Transport, 300, &time);
    let student = fx.enroll(
        BillingProfile::with_cycle(BillingCycle::Quarterly, date(2025, 1, 1)),
        &[transport.id],
        &time,
    );

    assert_eq!(fx.generate(&time).invoices_created, 3);
    let student = fx.ledger.student(&fx.admin, student.id).unwrap();
    assert_eq!(student.billing.next_payment_date, Some(date(2025, 10, 1)));
}

#[test]
fn test_cash_allocation_in_due_date_order() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, march) = two_invoices(&time);

    let outcome = fx
        .ledger
        .allocate_payment(&fx.accountant, cash(student_id, &[&march, &february], 500), &time)
        .unwrap();

    assert_eq!(outcome.payments.len(), 2);
    assert_eq!(outcome.payments[0].invoice_id, february.id);
    assert_eq!(outcome.payments[0].amount, Money::from_major(300));
    assert_eq!(outcome.payments[1].invoice_id, march.id);
    assert_eq!(outcome.payments[1].amount, Money::from_major(200));
    assert!(outcome
        .payments
        .iter()
        .all(|p| p.status == PaymentStatus::Confirmed));
    assert_eq!(outcome.student_status, StudentPaymentStatus::Paid);

    for invoice in fx.invoices(student_id) {
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert!(invoice.balance().is_zero());
    }

    let receipt = outcome.receipt.unwrap();
    assert_eq!(receipt.lines.len(), 2);
    assert_eq!(receipt.total(), Money::from_major(500));
}

#[test]
fn test_allocation_conserves_money() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, march) = two_invoices(&time);
    let before: Money = fx.invoices(student_id).iter().map(|i| i.balance()).sum();

    let outcome = fx
        .ledger
        .allocate_payment(&fx.accountant, cash(student_id, &[&february, &march], 500), &time)
        .unwrap();

    let after: Money = fx.invoices(student_id).iter().map(|i| i.balance()).sum();
    let paid: Money = outcome.payments.iter().map(|p| p.amount).sum();
    assert_eq!(paid, Money::from_major(500));
    assert_eq!(before - after, paid);
}

#[test]
fn test_short_payment_rejected_without_changes() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, march) = two_invoices(&time);

    let err = fx
        .ledger
        .allocate_payment(&fx.accountant, cash(student_id, &[&february, &march], 450), &time)
        .unwrap_err();
    assert!(err.is_validation());
    assert!(matches!(
        err,
        LedgerError::AmountMismatch { expected, provided }
            if expected == Money::from_major(500) && provided == Money::from_major(450)
    ));

    assert!(fx
        .invoices(student_id)
        .iter()
        .all(|i| i.amount_paid.is_zero()));
    assert!(fx
        .ledger
        .payments_for_student(&fx.admin, student_id, true)
        .unwrap()
        .is_empty());
}

#[test]
fn test_bank_transfer_waits_for_confirmation() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, march) = two_invoices(&time);

    let request = AllocationRequest::new(
        student_id,
        vec![february.id, march.id],
        Money::from_major(500),
        PaymentMethod::BankTransfer,
    )
    .with_reference("CBE-0042");
    let outcome = fx.ledger.allocate_payment(&fx.accountant, request, &time).unwrap();

    assert!(outcome
        .payments
        .iter()
        .all(|p| p.status == PaymentStatus::Unconfirmed));
    assert!(fx
        .invoices(student_id)
        .iter()
        .all(|i| i.amount_paid.is_zero() && i.status == InvoiceStatus::Unpaid));

    // held amounts cannot be paid a second time
    let err = fx
        .ledger
        .allocate_payment(&fx.accountant, cash(student_id, &[&february, &march], 500), &time)
        .unwrap_err();
    assert!(matches!(err, LedgerError::NoEligibleInvoices));

    for payment in &outcome.payments {
        let confirmed = fx
            .ledger
            .confirm_payment(&fx.accountant, payment.id, &time)
            .unwrap();
        assert!(confirmed.changed);
        assert_eq!(confirmed.payment.confirmed_by, Some(fx.accountant.actor_id));
    }

    assert!(fx
        .invoices(student_id)
        .iter()
        .all(|i| i.status == InvoiceStatus::Paid));
    let student = fx.ledger.student(&fx.admin, student_id).unwrap();
    assert_eq!(student.payment_status, StudentPaymentStatus::Paid);

    let again = fx
        .ledger
        .confirm_payment(&fx.accountant, outcome.payments[0].id, &time)
        .unwrap();
    assert!(!again.changed);
    assert!(again.events.is_empty());
}

#[test]
fn test_reversal_is_single_shot() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, march) = two_invoices(&time);
    let outcome = fx
        .ledger
        .allocate_payment(&fx.accountant, cash(student_id, &[&february, &march], 500), &time)
        .unwrap();
    let february_payment = outcome.payments[0].clone();

    let reversal = fx
        .ledger
        .reverse_payment(&fx.accountant, february_payment.id, "posted to wrong student", &time)
        .unwrap();
    assert_eq!(reversal.invoice.status, InvoiceStatus::Unpaid);
    assert!(reversal.invoice.amount_paid.is_zero());
    assert_eq!(reversal.payment.status, PaymentStatus::Reversed);
    assert_eq!(reversal.reversal.reversed_by, fx.accountant.actor_id);
    assert_eq!(
        fx.ledger.student(&fx.admin, student_id).unwrap().payment_status,
        StudentPaymentStatus::Unpaid
    );

    let err = fx
        .ledger
        .reverse_payment(&fx.accountant, february_payment.id, "again", &time)
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyReversed { .. }));

    let february = fx.ledger.invoice(&fx.admin, february.id).unwrap();
    assert!(february.amount_paid.is_zero());
    assert_eq!(fx.ledger.reversals(&fx.admin).unwrap().len(), 1);
    assert_eq!(
        fx.ledger
            .payments_for_student(&fx.admin, student_id, false)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_reversal_keeps_other_confirmed_payments() {
    let time = clock(2025, 3, 15);
    let (fx, _, february, _) = two_invoices(&time);
    let mut payment_ids = Vec::new();
    for (amount, reference) in [(100, "TB-1"), (200, "TB-2")] {
        let recorded = fx
            .ledger
            .record_provider_payment(
                &fx.system,
                ProviderPayment::new(february.id, Money::from_major(amount), PaymentMethod::MobileMoney, "telebirr", reference),
                &time,
            )
            .unwrap();
        fx.ledger
            .confirm_provider_payment(&fx.system, "telebirr", reference, &time)
            .unwrap();
        payment_ids.push(recorded.payment.id);
    }

    let reversal = fx
        .ledger
        .reverse_payment(&fx.accountant, payment_ids[1], "duplicate charge", &time)
        .unwrap();
    assert_eq!(reversal.invoice.status, InvoiceStatus::Partial);
    assert_eq!(reversal.invoice.amount_paid, Money::from_major(100));
}

#[test]
fn test_reversed_opening_balance_returns_to_opening_status() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);
    let student = fx.enroll(
        BillingProfile::monthly(date(2025, 3, 1)).with_opening_balance(Money::from_major(800)),
        &[tuition.id],
        &time,
    );
    fx.generate(&time);
    let opening = fx
        .invoices(student.id)
        .into_iter()
        .find(|i| i.is_opening_balance())
        .unwrap();
    assert_eq!(opening.status, InvoiceStatus::OpeningBalance);

    let outcome = fx
        .ledger
        .allocate_payment(&fx.accountant, cash(student.id, &[&opening], 800), &time)
        .unwrap();
    let reversal = fx
        .ledger
        .reverse_payment(&fx.admin, outcome.payments[0].id, "duplicate entry", &time)
        .unwrap();
    assert_eq!(reversal.invoice.status, InvoiceStatus::OpeningBalance);
}

#[test]
fn test_unconfirmed_payment_cannot_be_reversed() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, _) = two_invoices(&time);
    let request = AllocationRequest::new(
        student_id,
        vec![february.id],
        Money::from_major(300),
        PaymentMethod::BankTransfer,
    );
    let outcome = fx.ledger.allocate_payment(&fx.accountant, request, &time).unwrap();

    let err = fx
        .ledger
        .reverse_payment(&fx.admin, outcome.payments[0].id, "typo", &time)
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    assert!(fx.ledger.reversals(&fx.admin).unwrap().is_empty());
}

/// two provider payments on one 300 invoice, confirmed in the given order
fn confirm_in_order(first_b: bool) -> Invoice {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 300, &time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 3, 1)), &[tuition.id], &time);
    fx.generate(&time);
    let invoice = fx.invoices(student.id).remove(0);

    for (ext, amount) in [("A", 100), ("B", 200)] {
        fx.ledger
            .record_provider_payment(
                &fx.system,
                ProviderPayment::new(invoice.id, Money::from_major(amount), PaymentMethod::MobileMoney, "telebirr", ext),
                &time,
            )
            .unwrap();
    }

    let order = if first_b { ["B", "A"] } else { ["A", "B"] };
    for ext in order {
        fx.ledger
            .confirm_provider_payment(&fx.system, "telebirr", ext, &time)
            .unwrap();
    }
    fx.ledger.invoice(&fx.admin, invoice.id).unwrap()
}

#[test]
fn test_confirmation_order_does_not_matter() {
    let forward = confirm_in_order(false);
    let backward = confirm_in_order(true);
    assert_eq!(forward.amount_paid, Money::from_major(300));
    assert_eq!(backward.amount_paid, forward.amount_paid);
    assert_eq!(backward.status, InvoiceStatus::Paid);
}

#[test]
fn test_pending_mobile_money_changes_nothing_until_confirmed() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 300, &time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 3, 1)), &[tuition.id], &time);
    fx.generate(&time);
    let invoice = fx.invoices(student.id).remove(0);

    let pending = fx
        .ledger
        .record_provider_payment(
            &fx.system,
            ProviderPayment::new(invoice.id, Money::from_major(300), PaymentMethod::MobileMoney, "telebirr", "TB-1"),
            &time,
        )
        .unwrap();
    assert_eq!(pending.payment.status, PaymentStatus::Pending);
    assert!(matches!(
        pending.events.as_slice(),
        [Event::PaymentRecorded { confirmed: false, .. }]
    ));

    let unchanged = fx.ledger.invoice(&fx.admin, invoice.id).unwrap();
    assert!(unchanged.amount_paid.is_zero());
    assert_eq!(unchanged.status, InvoiceStatus::Unpaid);
    assert_eq!(
        fx.ledger
            .outstanding_total(&fx.admin, student.id, &[invoice.id])
            .unwrap(),
        Money::ZERO
    );

    let confirmed = fx
        .ledger
        .confirm_payment(&fx.accountant, pending.payment.id, &time)
        .unwrap();
    assert_eq!(confirmed.invoice.status, InvoiceStatus::Paid);
    assert!(confirmed
        .events
        .iter()
        .any(|e| matches!(e, Event::PaymentConfirmed { .. })));
}

#[test]
fn test_provider_notifications_are_idempotent() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, _) = two_invoices(&time);
    let notice = ProviderPayment::new(
        february.id,
        Money::from_major(300),
        PaymentMethod::Online,
        "chapa",
        "CH-77",
    );

    let first = fx
        .ledger
        .record_provider_payment(&fx.system, notice.clone(), &time)
        .unwrap();
    let second = fx
        .ledger
        .record_provider_payment(&fx.system, notice, &time)
        .unwrap();

    assert!(first.changed);
    assert!(!second.changed);
    assert_eq!(first.payment.id, second.payment.id);
    assert_eq!(
        fx.ledger
            .payments_for_student(&fx.admin, student_id, true)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_conflicting_provider_notification_rejected() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, march) = two_invoices(&time);
    fx.ledger
        .record_provider_payment(
            &fx.system,
            ProviderPayment::new(february.id, Money::from_major(100), PaymentMethod::MobileMoney, "telebirr", "TB-41"),
            &time,
        )
        .unwrap();

    let different_amount = fx
        .ledger
        .record_provider_payment(
            &fx.system,
            ProviderPayment::new(february.id, Money::from_major(200), PaymentMethod::MobileMoney, "telebirr", "TB-41"),
            &time,
        )
        .unwrap_err();
    assert!(matches!(different_amount, LedgerError::Validation { .. }));

    let different_invoice = fx
        .ledger
        .record_provider_payment(
            &fx.system,
            ProviderPayment::new(march.id, Money::from_major(100), PaymentMethod::MobileMoney, "telebirr", "TB-41"),
            &time,
        )
        .unwrap_err();
    assert!(matches!(different_invoice, LedgerError::Validation { .. }));

    let payments = fx
        .ledger
        .payments_for_student(&fx.admin, student_id, true)
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].amount, Money::from_major(100));
}

#[test]
fn test_provider_payment_over_available_rejected() {
    let time = clock(2025, 3, 15);
    let (fx, _, february, _) = two_invoices(&time);
    let err = fx
        .ledger
        .record_provider_payment(
            &fx.system,
            ProviderPayment::new(february.id, Money::from_major(301), PaymentMethod::MobileMoney, "telebirr", "TB-9"),
            &time,
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::AmountMismatch { .. }));
}

#[test]
fn test_rejected_provider_payment() {
    let time = clock(2025, 3, 15);
    let (fx, _, february, _) = two_invoices(&time);
    fx.ledger
        .record_provider_payment(
            &fx.system,
            ProviderPayment::new(february.id, Money::from_major(300), PaymentMethod::MobileMoney, "telebirr", "TB-2"),
            &time,
        )
        .unwrap();

    let rejected = fx
        .ledger
        .reject_provider_payment(&fx.system, "telebirr", "TB-2", &time)
        .unwrap();
    assert!(rejected.changed);
    assert_eq!(rejected.payment.status, PaymentStatus::Rejected);
    assert!(rejected.invoice.amount_paid.is_zero());
    assert!(rejected
        .events
        .iter()
        .any(|e| matches!(e, Event::PaymentRejected { .. })));

    let again = fx
        .ledger
        .reject_provider_payment(&fx.system, "telebirr", "TB-2", &time)
        .unwrap();
    assert!(!again.changed);

    let err = fx
        .ledger
        .confirm_provider_payment(&fx.system, "telebirr", "TB-2", &time)
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));

    // the hold is released once rejected
    assert_eq!(
        fx.ledger
            .outstanding_total(&fx.admin, february.student_id, &[february.id])
            .unwrap(),
        Money::from_major(300)
    );

    let err = fx
        .ledger
        .confirm_provider_payment(&fx.system, "telebirr", "missing", &time)
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_stale_outstanding_is_a_conflict() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, march) = two_invoices(&time);
    let seen = fx
        .ledger
        .outstanding_total(&fx.accountant, student_id, &[february.id, march.id])
        .unwrap();
    assert_eq!(seen, Money::from_major(500));

    // another clerk pays February in the meantime
    fx.ledger
        .allocate_payment(&fx.accountant, cash(student_id, &[&february], 300), &time)
        .unwrap();

    let err = fx
        .ledger
        .allocate_payment(
            &fx.accountant,
            cash(student_id, &[&february, &march], 500).expecting(seen),
            &time,
        )
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        LedgerError::ConcurrencyConflict { actual, .. } if actual == Money::from_major(200)
    ));
}

#[test]
fn test_outstanding_total_ignores_repeated_ids() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, _) = two_invoices(&time);
    let ids = vec![february.id, february.id];

    let total = fx
        .ledger
        .outstanding_total(&fx.accountant, student_id, &ids)
        .unwrap();
    assert_eq!(total, Money::from_major(300));

    let outcome = fx
        .ledger
        .allocate_payment(
            &fx.accountant,
            AllocationRequest::new(student_id, ids, total, PaymentMethod::Cash).expecting(total),
            &time,
        )
        .unwrap();
    assert_eq!(outcome.payments.len(), 1);
    assert_eq!(outcome.payments[0].amount, Money::from_major(300));
}

#[test]
fn test_concurrent_allocations_pay_once() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, march) = two_invoices(&time);
    let ids = vec![february.id, march.id];
    let ledger = &fx.ledger;
    let accountant = fx.accountant;

    let results: Vec<Result<AllocationOutcome>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                s.spawn(move || {
                    let time = clock(2025, 3, 15);
                    let request = AllocationRequest::new(
                        student_id,
                        ids,
                        Money::from_major(500),
                        PaymentMethod::Cash,
                    );
                    ledger.allocate_payment(&accountant, request, &time)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, LedgerError::NoEligibleInvoices)));

    let paid: Money = fx
        .invoices(student_id)
        .iter()
        .map(|i| i.amount_paid)
        .sum();
    assert_eq!(paid, Money::from_major(500));
}

#[test]
fn test_roles_and_tenancy() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, march) = two_invoices(&time);

    let teacher = Principal::new(Uuid::new_v4(), fx.school_id, Role::Teacher);
    let err = fx
        .ledger
        .allocate_payment(&teacher, cash(student_id, &[&february, &march], 500), &time)
        .unwrap_err();
    assert!(matches!(err, LedgerError::PermissionDenied { .. }));
    assert!(fx.ledger.invoices_for_student(&teacher, student_id).is_ok());

    let err = fx
        .ledger
        .record_provider_payment(
            &fx.admin,
            ProviderPayment::new(february.id, Money::from_major(300), PaymentMethod::Online, "chapa", "X"),
            &time,
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::PermissionDenied { .. }));

    let anonymous = Principal {
        actor_id: Uuid::new_v4(),
        school_id: None,
        role: Role::SchoolAdmin,
    };
    assert!(matches!(
        fx.ledger.school_summary(&anonymous).unwrap_err(),
        LedgerError::MissingTenant
    ));

    // another school cannot see this school's rows
    let other_school = Uuid::new_v4();
    fx.ledger.register_school(other_school, "Hawassa Prep").unwrap();
    let outsider = Principal::new(Uuid::new_v4(), other_school, Role::SchoolAdmin);
    assert!(fx.ledger.invoice(&outsider, february.id).unwrap_err().is_not_found());
    assert!(fx
        .ledger
        .allocate_payment(&outsider, cash(student_id, &[&february, &march], 500), &time)
        .unwrap_err()
        .is_not_found());

    // an invoice of another student is not found either
    let sibling = fx.enroll(BillingProfile::monthly(date(2025, 3, 1)), &[], &time);
    assert!(fx
        .ledger
        .allocate_payment(&fx.accountant, cash(sibling.id, &[&february], 300), &time)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_failing_student_does_not_block_other_schools() {
    let time = clock(2025, 3, 15);
    let ledger = FeeLedger::new(LedgerConfig::standard()).unwrap();
    let mut schools = Vec::new();
    for name in ["Bole", "Piassa"] {
        let school_id = Uuid::new_v4();
        ledger.register_school(school_id, name).unwrap();
        let admin = Principal::new(Uuid::new_v4(), school_id, Role::SchoolAdmin);
        let fee = ledger
            .create_fee_structure(
                &admin,
                NewFeeStructure::school_wide(FeeKind::Tuition, Money::from_major(500), "Tuition"),
                &time,
            )
            .unwrap();
        ledger
            .enroll_student(
                &admin,
                NewStudent::new("Meron", BillingProfile::monthly(date(2025, 1, 1))).with_fees([fee.id]),
                &time,
            )
            .unwrap();
        schools.push(school_id);
    }

    // corrupt one school's student behind the ledger's back
    let broken = schools[0];
    ledger
        .with_book(broken, |book| {
            for student in book.students.values_mut() {
                student.billing.billing_cycle = BillingCycle::Custom;
                student.billing.custom_months = None;
            }
            Ok(())
        })
        .unwrap();

    let report = ledger.generate_invoices_for_all_schools(&time);
    assert_eq!(report.runs.len(), 2);
    assert!(report.failures().is_empty());
    assert_eq!(report.total_created(), 3);

    let broken_run = report.outcome(broken).unwrap().as_ref().unwrap();
    assert_eq!(broken_run.invoices_created, 0);
    assert_eq!(broken_run.skipped.len(), 1);

    let healthy_run = report.outcome(schools[1]).unwrap().as_ref().unwrap();
    assert_eq!(healthy_run.invoices_created, 3);
}

#[test]
fn test_aborted_school_run_does_not_stop_the_others() {
    let time = clock(2025, 3, 15);
    let ledger = FeeLedger::new(LedgerConfig::standard()).unwrap();
    let mut schools = Vec::new();
    for name in ["Bole", "Piassa", "Merkato"] {
        let school_id = Uuid::new_v4();
        ledger.register_school(school_id, name).unwrap();
        let admin = Principal::new(Uuid::new_v4(), school_id, Role::SchoolAdmin);
        let fee = ledger
            .create_fee_structure(
                &admin,
                NewFeeStructure::school_wide(FeeKind::Tuition, Money::from_major(500), "Tuition"),
                &time,
            )
            .unwrap();
        ledger
            .enroll_student(
                &admin,
                NewStudent::new("Meron", BillingProfile::monthly(date(2025, 1, 1))).with_fees([fee.id]),
                &time,
            )
            .unwrap();
        schools.push(school_id);
    }
    let (panicking, failing, healthy) = (schools[0], schools[1], schools[2]);

    let report = ledger.generate_isolated(&time, |ledger, principal, time| {
        if principal.school_id == Some(panicking) {
            panic!("generation crashed");
        }
        if principal.school_id == Some(failing) {
            return Err(LedgerError::validation("fee catalog unavailable"));
        }
        ledger.generate_invoices_for_school(principal, time)
    });

    assert_eq!(report.runs.len(), 3);
    assert_eq!(report.failures().len(), 2);
    assert!(matches!(
        report.outcome(panicking),
        Some(Err(LedgerError::GenerationAborted { school_id })) if *school_id == panicking
    ));
    assert!(matches!(
        report.outcome(failing),
        Some(Err(LedgerError::Validation { .. }))
    ));

    let healthy_run = report.outcome(healthy).unwrap().as_ref().unwrap();
    assert_eq!(healthy_run.invoices_created, 3);
    assert_eq!(report.total_created(), 3);

    // the aborted school is still usable afterwards
    let rerun = ledger
        .generate_invoices_for_school(&Principal::system(panicking), &time)
        .unwrap();
    assert_eq!(rerun.invoices_created, 3);
}

#[test]
fn test_catalog_rules() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);

    let err = fx
        .ledger
        .create_fee_structure(
            &fx.admin,
            NewFeeStructure::school_wide(FeeKind::Tuition, Money::from_major(600), "Tuition again"),
            &time,
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateFeeStructure { .. }));

    let (class_id, division_id) = (Uuid::new_v4(), Uuid::new_v4());
    fx.ledger.register_class(&fx.admin, class_id, division_id).unwrap();
    let err = fx
        .ledger
        .create_fee_structure(
            &fx.admin,
            NewFeeStructure::school_wide(FeeKind::Tuition, Money::from_major(700), "Grade 5")
                .for_division(Uuid::new_v4())
                .for_class(class_id),
            &time,
        )
        .unwrap_err();
    assert!(err.is_configuration());

    let grade_five = fx
        .ledger
        .create_fee_structure(
            &fx.admin,
            NewFeeStructure::school_wide(FeeKind::Tuition, Money::from_major(700), "Grade 5")
                .for_division(division_id)
                .for_class(class_id),
            &time,
        )
        .unwrap();

    // a student outside that class may not carry it
    let err = fx
        .ledger
        .enroll_student(
            &fx.admin,
            NewStudent::new("Selam", BillingProfile::monthly(date(2025, 3, 1))).with_fees([grade_five.id]),
            &time,
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::ContradictoryScope { .. }));
    let student = fx
        .ledger
        .enroll_student(
            &fx.admin,
            NewStudent::new("Selam", BillingProfile::monthly(date(2025, 3, 1)))
                .in_class(class_id)
                .with_fees([grade_five.id]),
            &time,
        )
        .unwrap();
    assert_eq!(student.division_id, Some(division_id));

    let updated = fx
        .ledger
        .update_fee_structure(&fx.admin, tuition.id, Some(Money::from_major(550)), None)
        .unwrap();
    assert_eq!(updated.amount, Money::from_major(550));

    fx.ledger.set_fee_active(&fx.admin, tuition.id, false).unwrap();
    assert_eq!(fx.ledger.fee_structures(&fx.admin, true).unwrap().len(), 1);
    assert_eq!(fx.ledger.fee_structures(&fx.admin, false).unwrap().len(), 2);
    let err = fx
        .ledger
        .assign_fee(&fx.admin, student.id, tuition.id)
        .unwrap_err();
    assert!(err.is_validation());

    let accountant_err = fx
        .ledger
        .set_fee_active(&fx.accountant, tuition.id, true)
        .unwrap_err();
    assert!(matches!(accountant_err, LedgerError::PermissionDenied { .. }));
}

#[test]
fn test_deactivated_fee_is_not_billed() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 3, 1)), &[tuition.id], &time);
    fx.ledger.set_fee_active(&fx.admin, tuition.id, false).unwrap();

    assert_eq!(fx.generate(&time).invoices_created, 0);
    assert!(fx.invoices(student.id).is_empty());
}

#[test]
fn test_manual_invoice_dedupe() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, _) = two_invoices(&time);
    let fee_id = february.fee_id.unwrap();

    let err = fx
        .ledger
        .create_manual_invoice(
            &fx.admin,
            ManualInvoice::new(student_id, fee_id, date(2025, 3, 20)),
            &time,
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateInvoice { .. }));

    let april = fx
        .ledger
        .create_manual_invoice(
            &fx.admin,
            ManualInvoice::new(student_id, fee_id, date(2025, 4, 5)),
            &time,
        )
        .unwrap();
    assert_eq!(april.invoice.amount_due, Money::from_major(200));
    assert_eq!(april.invoice.billing_month, date(2025, 4, 1));
}

#[test]
fn test_profile_update_is_validated() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 1, 1)), &[tuition.id], &time);

    let mut broken = BillingProfile::custom(2, date(2025, 1, 1));
    broken.custom_months = None;
    let err = fx
        .ledger
        .update_billing_profile(&fx.admin, student.id, broken, &time)
        .unwrap_err();
    assert!(matches!(err, LedgerError::CustomCycleWithoutMonths { .. }));

    let updated = fx
        .ledger
        .update_billing_profile(&fx.admin, student.id, BillingProfile::custom(2, date(2025, 1, 1)), &time)
        .unwrap();
    assert_eq!(updated.billing.next_payment_date, Some(date(2025, 1, 1)));

    assert_eq!(fx.generate(&time).invoices_created, 2);
}

#[test]
fn test_due_soon_reminders() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);
    let transport = fx.fee(FeeKind::Transport, 150, &time);
    let other = fx.fee(FeeKind::Other, 80, &time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 6, 1)), &[tuition.id], &time);

    for (fee_id, due) in [
        (tuition.id, date(2025, 3, 17)),
        (transport.id, date(2025, 3, 25)),
        (other.id, date(2025, 3, 10)),
    ] {
        fx.ledger
            .create_manual_invoice(&fx.admin, ManualInvoice::new(student.id, fee_id, due), &time)
            .unwrap();
    }

    let reminders = fx.ledger.due_soon_reminders(&fx.admin, &time).unwrap();
    assert_eq!(reminders.len(), 2);
    match &reminders[0] {
        Event::FeeReminderDue {
            due_date,
            balance,
            overdue,
            ..
        } => {
            assert_eq!(*due_date, date(2025, 3, 10));
            assert_eq!(*balance, Money::from_major(80));
            assert!(*overdue);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match &reminders[1] {
        Event::FeeReminderDue {
            due_date,
            balance,
            overdue,
            ..
        } => {
            assert_eq!(*due_date, date(2025, 3, 17));
            assert_eq!(*balance, Money::from_major(500));
            assert!(!*overdue);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(reminders.iter().all(|r| r.notification().is_some()));
}

#[test]
fn test_overdue_rollup() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 1, 1)), &[tuition.id], &time);
    fx.generate(&time);

    let events = fx.ledger.refresh_overdue_statuses(&fx.system, &time).unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::StudentPaymentStatusChanged {
            new_status: StudentPaymentStatus::Overdue,
            ..
        }
    )));

    let invoices = fx.invoices(student.id);
    let refs: Vec<&Invoice> = invoices.iter().collect();
    fx.ledger
        .allocate_payment(&fx.accountant, cash(student.id, &refs, 1_500), &time)
        .unwrap();
    fx.ledger.refresh_overdue_statuses(&fx.system, &time).unwrap();
    assert_eq!(
        fx.ledger.student(&fx.admin, student.id).unwrap().payment_status,
        StudentPaymentStatus::Paid
    );
}

#[test]
fn test_statement_and_snapshot_round_trip() {
    let time = clock(2025, 3, 15);
    let (fx, student_id, february, _) = two_invoices(&time);
    fx.ledger
        .allocate_payment(&fx.accountant, cash(student_id, &[&february], 300), &time)
        .unwrap();

    let statement = fx.ledger.student_statement(&fx.admin, student_id, &time).unwrap();
    assert_eq!(statement.totals.total_due, Money::from_major(500));
    assert_eq!(statement.totals.total_paid, Money::from_major(300));
    assert_eq!(statement.totals.outstanding, Money::from_major(200));
    assert_eq!(statement.payments.len(), 1);

    let json = fx
        .ledger
        .export_snapshot(&fx.admin)
        .unwrap()
        .to_json_pretty()
        .unwrap();
    let restored = FeeLedger::new(LedgerConfig::standard()).unwrap();
    restored
        .import_snapshot(SchoolSnapshot::from_json(&json).unwrap())
        .unwrap();
    assert_eq!(
        restored.student_statement(&fx.admin, student_id, &time).unwrap(),
        statement
    );

    let summary = restored.school_summary(&fx.admin).unwrap();
    assert_eq!(summary.total_collected, Money::from_major(300));
    assert!(restored
        .import_snapshot(fx.ledger.export_snapshot(&fx.admin).unwrap())
        .is_err());
    assert!(matches!(
        fx.ledger.export_snapshot(&fx.accountant).unwrap_err(),
        LedgerError::PermissionDenied { .. }
    ));
}

#[test]
fn test_assignments_and_listings() {
    let time = clock(2025, 3, 15);
    let fx = Fixture::new();
    let tuition = fx.fee(FeeKind::Tuition, 500, &time);
    let transport = fx.fee(FeeKind::Transport, 150, &time);
    let student = fx.enroll(BillingProfile::monthly(date(2025, 3, 1)), &[tuition.id], &time);

    let student = fx.ledger.assign_fee(&fx.admin, student.id, transport.id).unwrap();
    assert_eq!(student.fee_structure_ids.len(), 2);
    let student = fx
        .ledger
        .unassign_fee(&fx.admin, student.id, transport.id)
        .unwrap();
    assert_eq!(student.fee_structure_ids.len(), 1);
    assert!(fx
        .ledger
        .unassign_fee(&fx.admin, student.id, transport.id)
        .unwrap_err()
        .is_not_found());

    // only tuition is billed after the transport fee was removed
    assert_eq!(fx.generate(&time).invoices_created, 1);

    let (class_id, division_id) = (Uuid::new_v4(), Uuid::new_v4());
    fx.ledger.register_class(&fx.admin, class_id, division_id).unwrap();
    fx.ledger.register_class(&fx.admin, class_id, division_id).unwrap();
    let err = fx
        .ledger
        .register_class(&fx.admin, class_id, Uuid::new_v4())
        .unwrap_err();
    assert!(matches!(err, LedgerError::ContradictoryScope { .. }));

    let invoice = fx.invoices(student.id).remove(0);
    let request = AllocationRequest::new(
        student.id,
        vec![invoice.id],
        Money::from_major(500),
        PaymentMethod::BankTransfer,
    );
    let outcome = fx.ledger.allocate_payment(&fx.accountant, request, &time).unwrap();
    let awaiting = fx.ledger.payments_awaiting_confirmation(&fx.admin).unwrap();
    assert_eq!(awaiting.len(), 1);
    assert_eq!(awaiting[0].id, outcome.payments[0].id);

    fx.ledger
        .reject_payment(&fx.accountant, outcome.payments[0].id, &time)
        .unwrap();
    assert!(fx
        .ledger
        .payments_awaiting_confirmation(&fx.admin)
        .unwrap()
        .is_empty());

    let students = fx.ledger.students(&fx.admin).unwrap();
    assert_eq!(students.len(), 1);
    assert_eq!(students[0].full_name, "Dawit Alemu");
}
