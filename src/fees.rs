use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::types::{ClassId, DivisionId, FeeKind, FeeStructureId, SchoolId};

/// billable line-item template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeStructure {
    pub id: FeeStructureId,
    pub school_id: SchoolId,
    pub kind: FeeKind,
    pub division_id: Option<DivisionId>,
    pub class_id: Option<ClassId>,
    pub amount: Money,
    pub description: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// uniqueness key within a school
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeeScope {
    pub kind: FeeKind,
    pub division_id: Option<DivisionId>,
    pub class_id: Option<ClassId>,
}

/// input for a new fee structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFeeStructure {
    pub kind: FeeKind,
    pub division_id: Option<DivisionId>,
    pub class_id: Option<ClassId>,
    pub amount: Money,
    pub description: String,
}

impl NewFeeStructure {
    /// fee billed to every student of the school
    pub fn school_wide(kind: FeeKind, amount: Money, description: &str) -> Self {
        Self {
            kind,
            division_id: None,
            class_id: None,
            amount,
            description: description.to_string(),
        }
    }

    pub fn for_division(mut self, division_id: DivisionId) -> Self {
        self.division_id = Some(division_id);
        self
    }

    pub fn for_class(mut self, class_id: ClassId) -> Self {
        self.class_id = Some(class_id);
        self
    }
}

impl FeeStructure {
    pub fn new(school_id: SchoolId, input: NewFeeStructure, now: DateTime<Utc>) -> Result<Self> {
        validate_amount(input.amount)?;

        Ok(Self {
            id: Uuid::new_v4(),
            school_id,
            kind: input.kind,
            division_id: input.division_id,
            class_id: input.class_id,
            amount: input.amount,
            description: input.description,
            active: true,
            created_at: now,
        })
    }

    pub fn scope(&self) -> FeeScope {
        FeeScope {
            kind: self.kind,
            division_id: self.division_id,
            class_id: self.class_id,
        }
    }

    /// registration fees are billed once, everything else every period
    pub fn is_recurring(&self) -> bool {
        self.kind.is_recurring()
    }

    /// check the division/class pair against the school's class registry
    pub fn validate_scope(&self, class_divisions: &HashMap<ClassId, DivisionId>) -> Result<()> {
        let Some(class_id) = self.class_id else {
            return Ok(());
        };

        let Some(class_division) = class_divisions.get(&class_id) else {
            return Err(LedgerError::ContradictoryScope {
                message: format!("class {} is not registered for this school", class_id),
            });
        };

        match self.division_id {
            Some(division_id) if division_id != *class_division => {
                Err(LedgerError::ContradictoryScope {
                    message: format!(
                        "class {} belongs to division {}, not {}",
                        class_id, class_division, division_id
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    /// whether a student placed in `division`/`class` may carry this fee
    pub fn applies_to(&self, division: Option<DivisionId>, class: Option<ClassId>) -> bool {
        let division_ok = self.division_id.map_or(true, |d| division == Some(d));
        let class_ok = self.class_id.map_or(true, |c| class == Some(c));
        division_ok && class_ok
    }

    pub fn update_amount(&mut self, amount: Money) -> Result<()> {
        validate_amount(amount)?;
        self.amount = amount;
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn reactivate(&mut self) {
        self.active = true;
    }
}

fn validate_amount(amount: Money) -> Result<()> {
    if !amount.is_positive() {
        return Err(LedgerError::InvalidAmount { amount });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_fee_rejects_non_positive_amount() {
        let input = NewFeeStructure::school_wide(FeeKind::Tuition, Money::ZERO, "tuition");
        let err = FeeStructure::new(Uuid::new_v4(), input, now()).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount { .. }));
    }

    #[test]
    fn test_registration_not_recurring() {
        let input =
            NewFeeStructure::school_wide(FeeKind::Registration, Money::from_major(100), "reg");
        let fee = FeeStructure::new(Uuid::new_v4(), input, now()).unwrap();
        assert!(!fee.is_recurring());
        assert!(fee.active);
    }

    #[test]
    fn test_scope_validation() {
        let division = Uuid::new_v4();
        let other_division = Uuid::new_v4();
        let class = Uuid::new_v4();
        let registry = HashMap::from([(class, division)]);

        let consistent = FeeStructure::new(
            Uuid::new_v4(),
            NewFeeStructure::school_wide(FeeKind::Tuition, Money::from_major(500), "t")
                .for_division(division)
                .for_class(class),
            now(),
        )
        .unwrap();
        assert!(consistent.validate_scope(&registry).is_ok());

        let contradictory = FeeStructure::new(
            Uuid::new_v4(),
            NewFeeStructure::school_wide(FeeKind::Tuition, Money::from_major(500), "t")
                .for_division(other_division)
                .for_class(class),
            now(),
        )
        .unwrap();
        let err = contradictory.validate_scope(&registry).unwrap_err();
        assert!(err.is_configuration());

        let unknown_class = FeeStructure::new(
            Uuid::new_v4(),
            NewFeeStructure::school_wide(FeeKind::Other, Money::from_major(10), "o")
                .for_class(Uuid::new_v4()),
            now(),
        )
        .unwrap();
        assert!(unknown_class.validate_scope(&registry).is_err());
    }

    #[test]
    fn test_applies_to() {
        let division = Uuid::new_v4();
        let class = Uuid::new_v4();
        let fee = FeeStructure::new(
            Uuid::new_v4(),
            NewFeeStructure::school_wide(FeeKind::Transport, Money::from_major(80), "bus")
                .for_division(division),
            now(),
        )
        .unwrap();

        assert!(fee.applies_to(Some(division), Some(class)));
        assert!(fee.applies_to(Some(division), None));
        assert!(!fee.applies_to(Some(Uuid::new_v4()), Some(class)));
        assert!(!fee.applies_to(None, None));
    }
}
