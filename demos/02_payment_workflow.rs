/// payment workflow - bank transfers, provider callbacks and reversals
use school_fees_rs::{
    AllocationRequest, BillingProfile, FeeKind, FeeLedger, LedgerConfig, ManualInvoice, Money,
    NewFeeStructure, NewStudent, PaymentMethod, Principal, ProviderPayment, ReceiptMode, Role,
    SafeTimeProvider, TimeSource, Uuid,
};
use chrono::{NaiveDate, TimeZone, Utc};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== payment workflow example ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2025, 3, 15, 10, 30, 0).unwrap()
    ));
    let config = LedgerConfig::standard().with_receipt_mode(ReceiptMode::PerInvoice);
    let ledger = FeeLedger::new(config)?;

    let school_id = Uuid::new_v4();
    ledger.register_school(school_id, "Hawassa Prep")?;
    let admin = Principal::new(Uuid::new_v4(), school_id, Role::SchoolAdmin);
    let accountant = Principal::new(Uuid::new_v4(), school_id, Role::Accountant);
    let webhook = Principal::system(school_id);

    let tuition = ledger.create_fee_structure(
        &admin,
        NewFeeStructure::school_wide(FeeKind::Tuition, Money::from_major(200), "Tuition"),
        &time,
    )?;
    let student = ledger.enroll_student(
        &admin,
        NewStudent::new("Yonas Haile", BillingProfile::monthly(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()))
            .with_fees([tuition.id]),
        &time,
    )?;
    ledger.generate_invoices_for_school(&webhook, &time)?;

    // February was billed by hand
    ledger.create_manual_invoice(
        &accountant,
        ManualInvoice::new(student.id, tuition.id, NaiveDate::from_ymd_opt(2025, 2, 10).unwrap())
            .with_amount(Money::from_major(300))
            .with_description("February tuition"),
        &time,
    )?;

    // a parent pays both months by bank transfer
    let invoice_ids: Vec<_> = ledger
        .outstanding_invoices(&accountant, student.id)?
        .iter()
        .map(|i| i.id)
        .collect();
    let expected = ledger.outstanding_total(&accountant, student.id, &invoice_ids)?;
    println!("outstanding: {}", expected);

    let transfer = ledger.allocate_payment(
        &accountant,
        AllocationRequest::new(student.id, invoice_ids, expected, PaymentMethod::BankTransfer)
            .with_reference("CBE-20250315-0042")
            .expecting(expected),
        &time,
    )?;
    for payment in &transfer.payments {
        println!("recorded {} against {} as {}", payment.amount, payment.invoice_id, payment.status);
    }
    if let Some(receipt) = &transfer.receipt {
        println!("receipts to print: {}", receipt.receipts().len());
    }

    // the accountant verifies the transfer
    for payment in &transfer.payments {
        let confirmed = ledger.confirm_payment(&accountant, payment.id, &time)?;
        println!("invoice {} is now {}", confirmed.invoice.id, confirmed.invoice.status);
    }

    // a duplicate telebirr callback for a new invoice
    let april = ledger.create_manual_invoice(
        &accountant,
        ManualInvoice::new(student.id, tuition.id, NaiveDate::from_ymd_opt(2025, 4, 1).unwrap()),
        &time,
    )?;
    let notice = ProviderPayment::new(
        april.invoice.id,
        Money::from_major(200),
        PaymentMethod::MobileMoney,
        "telebirr",
        "TB-889102",
    );
    ledger.record_provider_payment(&webhook, notice.clone(), &time)?;
    let repeat = ledger.record_provider_payment(&webhook, notice, &time)?;
    println!("\nrepeat callback changed anything: {}", repeat.changed);
    ledger.confirm_provider_payment(&webhook, "telebirr", "TB-889102", &time)?;

    // the February transfer was posted to the wrong student
    let reversal = ledger.reverse_payment(
        &accountant,
        transfer.payments[0].id,
        "transfer belonged to a sibling",
        &time,
    )?;
    println!("reversed {}: invoice back to {}", reversal.payment.amount, reversal.invoice.status);

    // collect notifications for the messaging service
    let notifications: Vec<_> = reversal.events.iter().filter_map(|e| e.notification()).collect();
    println!("notifications to send: {}", notifications.len());

    println!("\n{}", ledger.student_statement(&admin, student.id, &time)?.to_json_pretty()?);

    Ok(())
}
