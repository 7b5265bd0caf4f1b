/// quick start - bill one student and take a cash payment
use school_fees_rs::{
    AllocationRequest, BillingProfile, FeeKind, FeeLedger, LedgerConfig, Money, NewFeeStructure,
    NewStudent, PaymentMethod, Principal, Role, SafeTimeProvider, TimeSource, Uuid,
};
use chrono::{NaiveDate, TimeZone, Utc};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2025, 3, 15, 9, 0, 0).unwrap()
    ));

    // one school with an admin
    let ledger = FeeLedger::new(LedgerConfig::standard())?;
    let school_id = Uuid::new_v4();
    ledger.register_school(school_id, "Addis Academy")?;
    let admin = Principal::new(Uuid::new_v4(), school_id, Role::SchoolAdmin);

    // monthly tuition of 500
    let tuition = ledger.create_fee_structure(
        &admin,
        NewFeeStructure::school_wide(FeeKind::Tuition, Money::from_major(500), "Monthly tuition"),
        &time,
    )?;

    // enrol a student billed from March
    let student = ledger.enroll_student(
        &admin,
        NewStudent::new("Hana Tesfaye", BillingProfile::monthly(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()))
            .with_fees([tuition.id]),
        &time,
    )?;

    // generate this month's invoice
    let outcome = ledger.generate_invoices_for_school(&Principal::system(school_id), &time)?;
    println!("invoices created: {}", outcome.invoices_created);

    // pay it in cash
    let invoices = ledger.outstanding_invoices(&admin, student.id)?;
    let request = AllocationRequest::new(
        student.id,
        invoices.iter().map(|i| i.id).collect(),
        Money::from_major(500),
        PaymentMethod::Cash,
    );
    let paid = ledger.allocate_payment(&admin, request, &time)?;
    println!("student status: {:?}", paid.student_status);

    // print the statement
    println!("{}", ledger.student_statement(&admin, student.id, &time)?.to_json_pretty()?);

    Ok(())
}
