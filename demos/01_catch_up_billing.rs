/// catch-up billing - scheduled generation across schools with controlled time
use school_fees_rs::{
    BillingCycle, BillingProfile, FeeKind, FeeLedger, LedgerConfig, Money, NewFeeStructure,
    NewStudent, Principal, Role, SafeTimeProvider, TimeSource, Uuid,
};
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== catch-up billing example ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2025, 3, 15, 2, 0, 0).unwrap()
    ));
    let controller = time.test_control().unwrap();
    let ledger = FeeLedger::new(LedgerConfig::standard())?;

    // two schools, each with tuition, transport and registration
    for name in ["Bole Primary", "Piassa Secondary"] {
        let school_id = Uuid::new_v4();
        ledger.register_school(school_id, name)?;
        let admin = Principal::new(Uuid::new_v4(), school_id, Role::SchoolAdmin);

        let mut fee_ids = Vec::new();
        for (kind, amount, description) in [
            (FeeKind::Tuition, 1_200, "Tuition"),
            (FeeKind::Transport, 300, "School bus"),
            (FeeKind::Registration, 2_000, "Registration"),
        ] {
            let fee = ledger.create_fee_structure(
                &admin,
                NewFeeStructure::school_wide(kind, Money::from_major(amount), description),
                &time,
            )?;
            fee_ids.push(fee.id);
        }

        // a monthly student who joined in January with debt from last year
        let january = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        ledger.enroll_student(
            &admin,
            NewStudent::new("Abel Girma", BillingProfile::monthly(january).with_opening_balance(Money::from_major(750)))
                .with_fees(fee_ids.iter().copied()),
            &time,
        )?;

        // a quarterly student on tuition only
        ledger.enroll_student(
            &admin,
            NewStudent::new("Liya Bekele", BillingProfile::with_cycle(BillingCycle::Quarterly, january))
                .with_fees([fee_ids[0]]),
            &time,
        )?;
    }

    // first run catches up January to March
    let report = ledger.generate_invoices_for_all_schools(&time);
    println!("run on {}: {} invoices", time.now().format("%Y-%m-%d"), report.total_created());
    for run in &report.runs {
        match &run.result {
            Ok(outcome) => println!(
                "  school {}: {} invoices for {} students",
                run.school_id, outcome.invoices_created, outcome.students_billed
            ),
            Err(err) => println!("  school {} failed: {}", run.school_id, err),
        }
    }

    // a second run the same day is a no-op
    let rerun = ledger.generate_invoices_for_all_schools(&time);
    println!("rerun on {}: {} invoices", time.now().format("%Y-%m-%d"), rerun.total_created());

    // the next month only bills April
    controller.advance(Duration::days(20));
    let april = ledger.generate_invoices_for_all_schools(&time);
    println!("run on {}: {} invoices", time.now().format("%Y-%m-%d"), april.total_created());

    // per-school summary
    for school_id in ledger.school_ids() {
        let admin = Principal::new(Uuid::new_v4(), school_id, Role::SchoolAdmin);
        println!("\n{}", ledger.school_summary(&admin)?.to_json_pretty()?);
    }

    Ok(())
}
