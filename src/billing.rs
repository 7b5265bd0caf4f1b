use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::events::{Event, EventStore};
use crate::types::{
    BillingCycle, ClassId, DivisionId, FeeStructureId, SchoolId, StudentId, StudentPaymentStatus,
};

/// billing fields carried by a student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingProfile {
    pub billing_cycle: BillingCycle,
    pub custom_months: Option<u32>,
    /// billing anchor
    pub starting_billing_month: Option<NaiveDate>,
    pub opening_balance: Money,
    /// billing cursor, advanced by invoice generation
    pub next_payment_date: Option<NaiveDate>,
}

impl BillingProfile {
    pub fn monthly(starting_billing_month: NaiveDate) -> Self {
        Self::with_cycle(BillingCycle::Monthly, starting_billing_month)
    }

    pub fn with_cycle(billing_cycle: BillingCycle, starting_billing_month: NaiveDate) -> Self {
        Self {
            billing_cycle,
            custom_months: None,
            starting_billing_month: Some(starting_billing_month),
            opening_balance: Money::ZERO,
            next_payment_date: None,
        }
    }

    /// every `months` months
    pub fn custom(months: u32, starting_billing_month: NaiveDate) -> Self {
        Self {
            custom_months: Some(months),
            ..Self::with_cycle(BillingCycle::Custom, starting_billing_month)
        }
    }

    pub fn with_opening_balance(mut self, amount: Money) -> Self {
        self.opening_balance = amount;
        self
    }

    /// length of one billing period, `None` when a custom cycle lacks months
    pub fn cycle_months(&self) -> Option<u32> {
        match self.billing_cycle {
            BillingCycle::Custom => self.custom_months.filter(|m| *m > 0),
            fixed => fixed.fixed_months(),
        }
    }

    /// first date the generator may bill from
    pub fn billing_cursor(&self) -> Option<NaiveDate> {
        match (self.next_payment_date, self.starting_billing_month) {
            (Some(next), Some(start)) => Some(next.max(start)),
            (next, start) => next.or(start),
        }
    }

    /// date the opening balance invoice falls due
    pub fn opening_balance_due(&self, today: NaiveDate) -> NaiveDate {
        self.starting_billing_month.unwrap_or(today)
    }
}

/// student entity, restricted to what billing needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub school_id: SchoolId,
    pub full_name: String,
    pub division_id: Option<DivisionId>,
    pub class_id: Option<ClassId>,
    pub billing: BillingProfile,
    pub fee_structure_ids: BTreeSet<FeeStructureId>,
    pub payment_status: StudentPaymentStatus,
    pub created_at: DateTime<Utc>,
}

/// input for enrolling a student into billing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStudent {
    pub full_name: String,
    pub division_id: Option<DivisionId>,
    pub class_id: Option<ClassId>,
    pub billing: BillingProfile,
    pub fee_structure_ids: Vec<FeeStructureId>,
}

impl NewStudent {
    pub fn new(full_name: &str, billing: BillingProfile) -> Self {
        Self {
            full_name: full_name.to_string(),
            division_id: None,
            class_id: None,
            billing,
            fee_structure_ids: Vec::new(),
        }
    }

    pub fn in_division(mut self, division_id: DivisionId) -> Self {
        self.division_id = Some(division_id);
        self
    }

    pub fn in_class(mut self, class_id: ClassId) -> Self {
        self.class_id = Some(class_id);
        self
    }

    pub fn with_fees(mut self, fee_ids: impl IntoIterator<Item = FeeStructureId>) -> Self {
        self.fee_structure_ids.extend(fee_ids);
        self
    }
}

impl Student {
    /// build and persist-initialize a student; fee assignment is checked by the ledger
    pub fn enroll(
        school_id: SchoolId,
        input: NewStudent,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut student = Self {
            id: Uuid::new_v4(),
            school_id,
            full_name: input.full_name,
            division_id: input.division_id,
            class_id: input.class_id,
            billing: input.billing,
            fee_structure_ids: input.fee_structure_ids.into_iter().collect(),
            payment_status: StudentPaymentStatus::Pending,
            created_at: now,
        };
        student.validate_profile()?;
        student.initialize_cursor(today);
        Ok(student)
    }

    pub fn validate_profile(&self) -> Result<()> {
        let billing = &self.billing;
        match billing.billing_cycle {
            BillingCycle::Custom if billing.cycle_months().is_none() => {
                return Err(LedgerError::CustomCycleWithoutMonths {
                    student_id: self.id,
                });
            }
            BillingCycle::Custom => {}
            _ if billing.custom_months.is_some() => {
                return Err(LedgerError::configuration(format!(
                    "custom months set on a {:?} cycle",
                    billing.billing_cycle
                )));
            }
            _ => {}
        }

        if billing.opening_balance.is_negative() {
            return Err(LedgerError::InvalidAmount {
                amount: billing.opening_balance,
            });
        }
        Ok(())
    }

    /// cursor is never left empty after the first save
    pub fn initialize_cursor(&mut self, today: NaiveDate) {
        if self.billing.next_payment_date.is_none() {
            self.billing.next_payment_date =
                Some(self.billing.starting_billing_month.unwrap_or(today));
        }
    }

    /// length of one billing period in months
    pub fn cycle_months(&self) -> Result<u32> {
        match self.billing.cycle_months() {
            Some(months) => Ok(months),
            None => Err(LedgerError::CustomCycleWithoutMonths {
                student_id: self.id,
            }),
        }
    }

    /// next billing date one period after `from_date` (or the current cursor); pure
    pub fn calculate_next_payment_date(
        &self,
        from_date: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<NaiveDate> {
        let base = from_date
            .or(self.billing.next_payment_date)
            .or(self.billing.starting_billing_month)
            .unwrap_or(today);
        let months = self.cycle_months()?;

        base.checked_add_months(Months::new(months))
            .ok_or_else(|| {
                LedgerError::configuration(format!(
                    "billing date overflow adding {} months to {}",
                    months, base
                ))
            })
    }

    pub fn is_billable(&self) -> bool {
        !self.fee_structure_ids.is_empty() && self.billing.next_payment_date.is_some()
    }

    /// update the coarse status, emitting a change event when it moves
    pub fn set_payment_status(&mut self, new_status: StudentPaymentStatus, events: &mut EventStore) {
        if self.payment_status == new_status {
            return;
        }
        events.emit(Event::StudentPaymentStatusChanged {
            student_id: self.id,
            old_status: self.payment_status,
            new_status,
        });
        self.payment_status = new_status;
    }
}

/// first day of the month containing `date`
pub fn billing_month_of(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}
