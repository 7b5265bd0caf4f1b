use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::billing::Student;
use crate::config::BillingConfig;
use crate::errors::{LedgerError, Result};
use crate::events::Event;
use crate::fees::FeeStructure;
use crate::invoice::Invoice;
use crate::types::{FeeStructureId, SchoolId, StudentId};

/// what has already been billed, used to skip duplicates
#[derive(Debug, Clone, Default)]
pub struct BilledIndex {
    periods: HashSet<(StudentId, FeeStructureId, NaiveDate)>,
    fees: HashSet<(StudentId, FeeStructureId)>,
    opening: HashSet<StudentId>,
}

impl BilledIndex {
    pub fn from_invoices<'a>(invoices: impl IntoIterator<Item = &'a Invoice>) -> Self {
        let mut index = Self::default();
        for invoice in invoices {
            index.record(invoice);
        }
        index
    }

    pub fn record(&mut self, invoice: &Invoice) {
        match invoice.fee_id {
            Some(fee_id) => {
                self.fees.insert((invoice.student_id, fee_id));
                self.periods
                    .insert((invoice.student_id, fee_id, invoice.billing_month));
            }
            None => {
                self.opening.insert(invoice.student_id);
            }
        }
    }

    pub fn merge(&mut self, other: BilledIndex) {
        self.periods.extend(other.periods);
        self.fees.extend(other.fees);
        self.opening.extend(other.opening);
    }

    /// billed for this fee at any time
    pub fn has_fee(&self, student_id: StudentId, fee_id: FeeStructureId) -> bool {
        self.fees.contains(&(student_id, fee_id))
    }

    /// billed for this fee in the given billing month
    pub fn has_period(
        &self,
        student_id: StudentId,
        fee_id: FeeStructureId,
        billing_month: NaiveDate,
    ) -> bool {
        self.periods.contains(&(student_id, fee_id, billing_month))
    }

    pub fn has_opening_balance(&self, student_id: StudentId) -> bool {
        self.opening.contains(&student_id)
    }
}

/// invoices planned for one student, not yet persisted
#[derive(Debug, Clone)]
pub struct StudentBilling {
    pub student_id: StudentId,
    pub invoices: Vec<Invoice>,
    /// cursor after the run; `None` leaves the student untouched
    pub next_payment_date: Option<NaiveDate>,
    pub periods: u32,
    billed: BilledIndex,
}

impl StudentBilling {
    pub fn created(&self) -> usize {
        self.invoices.len()
    }

    /// invoices, new cursor and the billed keys this plan adds
    pub fn into_parts(self) -> (Vec<Invoice>, Option<NaiveDate>, BilledIndex) {
        (self.invoices, self.next_payment_date, self.billed)
    }
}

/// catch-up invoice planner
pub struct InvoiceGenerator<'c> {
    config: &'c BillingConfig,
}

impl<'c> InvoiceGenerator<'c> {
    pub fn new(config: &'c BillingConfig) -> Self {
        Self { config }
    }

    /// plan every invoice owed by `student` up to `today`
    ///
    /// Walks the billing cursor forward one cycle at a time, billing each
    /// assigned fee once per billing month and one-time fees once ever.
    /// Nothing is written; a configuration error means the student is skipped
    /// as a whole.
    pub fn bill_student(
        &self,
        student: &Student,
        fees: &HashMap<FeeStructureId, FeeStructure>,
        existing: &BilledIndex,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<StudentBilling> {
        let mut plan = StudentBilling {
            student_id: student.id,
            invoices: Vec::new(),
            next_payment_date: None,
            periods: 0,
            billed: BilledIndex::default(),
        };

        let opening = student.billing.opening_balance;
        if opening.is_positive() && !existing.has_opening_balance(student.id) {
            let invoice = Invoice::opening_balance(
                student.school_id,
                student.id,
                opening,
                student.billing.opening_balance_due(today),
                now,
            );
            plan.billed.record(&invoice);
            plan.invoices.push(invoice);
        }

        let Some(mut cursor) = student.billing.billing_cursor() else {
            return Ok(plan);
        };
        if cursor > today {
            return Ok(plan);
        }

        while cursor <= today {
            plan.periods += 1;
            if plan.periods > self.config.max_catch_up_periods {
                return Err(LedgerError::configuration(format!(
                    "student {} needs more than {} catch-up periods",
                    student.id, self.config.max_catch_up_periods
                )));
            }

            for fee_id in &student.fee_structure_ids {
                let Some(fee) = fees.get(fee_id) else {
                    debug!(student_id = %student.id, fee_id = %fee_id, "assigned fee not in catalog");
                    continue;
                };
                if !fee.active && !self.config.bill_inactive_fees {
                    continue;
                }

                let invoice = Invoice::for_fee(student.id, fee, cursor, now);
                let already_billed = if fee.is_recurring() {
                    existing.has_period(student.id, fee.id, invoice.billing_month)
                        || plan.billed.has_period(student.id, fee.id, invoice.billing_month)
                } else {
                    existing.has_fee(student.id, fee.id) || plan.billed.has_fee(student.id, fee.id)
                };
                if already_billed {
                    continue;
                }

                plan.billed.record(&invoice);
                plan.invoices.push(invoice);
            }

            cursor = student.calculate_next_payment_date(Some(cursor), today)?;
        }

        plan.next_payment_date = Some(cursor);
        Ok(plan)
    }
}

/// a student left out of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedStudent {
    pub student_id: StudentId,
    pub reason: String,
}

/// result of generating one school's invoices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub school_id: SchoolId,
    pub invoices_created: usize,
    pub students_billed: usize,
    pub skipped: Vec<SkippedStudent>,
    pub events: Vec<Event>,
}

/// one school's entry in an all-schools run
#[derive(Debug)]
pub struct SchoolRun {
    pub school_id: SchoolId,
    pub result: Result<GenerationOutcome>,
}

/// per-school results of a scheduled run
#[derive(Debug, Default)]
pub struct GenerationReport {
    pub runs: Vec<SchoolRun>,
}

impl GenerationReport {
    pub fn total_created(&self) -> usize {
        self.runs
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .map(|o| o.invoices_created)
            .sum()
    }

    pub fn failures(&self) -> Vec<&SchoolRun> {
        self.runs.iter().filter(|r| r.result.is_err()).collect()
    }

    pub fn outcome(&self, school_id: SchoolId) -> Option<&Result<GenerationOutcome>> {
        self.runs
            .iter()
            .find(|r| r.school_id == school_id)
            .map(|r| &r.result)
    }
}
