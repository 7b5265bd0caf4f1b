use thiserror::Error;
use uuid::Uuid;

use crate::decimal::Money;
use crate::types::{Action, PaymentStatus, Role, StudentId};

#[derive(Error, Debug)]
pub enum LedgerError {
    // tenant and identity
    #[error("principal carries no school")]
    MissingTenant,

    #[error("role {role} may not perform {action:?}")]
    PermissionDenied {
        role: Role,
        action: Action,
    },

    #[error("{entity} not found: {id}")]
    NotFound {
        entity: &'static str,
        id: Uuid,
    },

    #[error("no {provider} transaction {external_id}")]
    UnknownTransaction {
        provider: String,
        external_id: String,
    },

    // validation
    #[error("validation failed: {message}")]
    Validation {
        message: String,
    },

    #[error("payment amount {provided} does not equal outstanding total {expected}")]
    AmountMismatch {
        expected: Money,
        provided: Money,
    },

    #[error("no eligible invoices selected")]
    NoEligibleInvoices,

    #[error("invalid amount: {amount}")]
    InvalidAmount {
        amount: Money,
    },

    #[error("payment {payment_id} has already been reversed")]
    AlreadyReversed {
        payment_id: Uuid,
    },

    #[error("payment {payment_id} cannot be {action} while {from}")]
    InvalidTransition {
        payment_id: Uuid,
        from: PaymentStatus,
        action: &'static str,
    },

    #[error("duplicate fee structure: {message}")]
    DuplicateFeeStructure {
        message: String,
    },

    #[error("duplicate invoice: {message}")]
    DuplicateInvoice {
        message: String,
    },

    // configuration
    #[error("invalid configuration: {message}")]
    Configuration {
        message: String,
    },

    #[error("student {student_id} uses a custom billing cycle without custom months")]
    CustomCycleWithoutMonths {
        student_id: StudentId,
    },

    #[error("contradictory fee scope: {message}")]
    ContradictoryScope {
        message: String,
    },

    // concurrency
    #[error("outstanding total changed: expected {expected}, found {actual}")]
    ConcurrencyConflict {
        expected: Money,
        actual: Money,
    },

    #[error("invoice generation for school {school_id} aborted")]
    GenerationAborted {
        school_id: Uuid,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        LedgerError::NotFound { entity, id }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        LedgerError::Configuration {
            message: message.into(),
        }
    }

    /// rejected input, nothing was mutated
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::Validation { .. }
                | LedgerError::AmountMismatch { .. }
                | LedgerError::NoEligibleInvoices
                | LedgerError::InvalidAmount { .. }
                | LedgerError::AlreadyReversed { .. }
                | LedgerError::InvalidTransition { .. }
                | LedgerError::DuplicateFeeStructure { .. }
                | LedgerError::DuplicateInvoice { .. }
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LedgerError::Configuration { .. }
                | LedgerError::CustomCycleWithoutMonths { .. }
                | LedgerError::ContradictoryScope { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::NotFound { .. } | LedgerError::UnknownTransaction { .. }
        )
    }

    /// the caller should re-read and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
