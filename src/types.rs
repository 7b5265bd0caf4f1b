use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{LedgerError, Result};

/// tenant root identifier
pub type SchoolId = Uuid;
pub type StudentId = Uuid;
pub type DivisionId = Uuid;
pub type ClassId = Uuid;
pub type FeeStructureId = Uuid;
pub type InvoiceId = Uuid;
pub type PaymentId = Uuid;
pub type ReversalId = Uuid;
/// staff or system user acting on the ledger
pub type ActorId = Uuid;

/// kind of charge a fee structure bills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeeKind {
    Tuition,
    Transport,
    /// one-time, never re-billed
    Registration,
    Other,
}

impl FeeKind {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, FeeKind::Registration)
    }
}

/// how often a student is billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    HalfYearly,
    Yearly,
    /// uses the profile's `custom_months`
    Custom,
}

impl BillingCycle {
    /// fixed length in months, `None` for custom cycles
    pub fn fixed_months(&self) -> Option<u32> {
        match self {
            BillingCycle::Monthly => Some(1),
            BillingCycle::Quarterly => Some(3),
            BillingCycle::HalfYearly => Some(6),
            BillingCycle::Yearly => Some(12),
            BillingCycle::Custom => None,
        }
    }
}

/// invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
    /// imported pre-existing debt, nothing paid yet
    OpeningBalance,
}

impl InvoiceStatus {
    /// statuses the allocator accepts
    pub fn is_payable(&self) -> bool {
        !matches!(self, InvoiceStatus::Paid)
    }

    /// statuses that keep a student from being fully paid up
    pub fn is_outstanding(&self) -> bool {
        self.is_payable()
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvoiceStatus::Unpaid => "UNPAID",
            InvoiceStatus::Partial => "PARTIAL",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::OpeningBalance => "OPENING_BALANCE",
        };
        f.write_str(s)
    }
}

/// payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// awaiting a provider callback
    Pending,
    /// recorded by staff, awaiting verification
    Unconfirmed,
    Confirmed,
    Reversed,
    Rejected,
}

impl PaymentStatus {
    /// not yet confirmed nor rejected
    pub fn is_awaiting_confirmation(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Unconfirmed)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Unconfirmed => "UNCONFIRMED",
            PaymentStatus::Confirmed => "CONFIRMED",
            PaymentStatus::Reversed => "REVERSED",
            PaymentStatus::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// payment method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    BankTransfer,
    MobileMoney,
    Online,
}

impl PaymentMethod {
    /// only cash settles at the desk
    pub fn is_auto_confirmed(&self) -> bool {
        matches!(self, PaymentMethod::Cash)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentMethod::Cash => "Cash",
            PaymentMethod::BankTransfer => "Bank Transfer",
            PaymentMethod::MobileMoney => "Mobile Money",
            PaymentMethod::Online => "Online",
        };
        f.write_str(s)
    }
}

/// coarse per-student payment status shown on dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StudentPaymentStatus {
    Paid,
    Pending,
    Unpaid,
    Overdue,
}

/// caller role, supplied by the identity collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    SuperAdmin,
    SchoolAdmin,
    Accountant,
    Teacher,
    Parent,
    /// scheduler and provider webhooks
    System,
}

/// actions gated by role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    ManageCatalog,
    ManageStudents,
    IssueInvoices,
    GenerateInvoices,
    RecordPayment,
    IngestProviderPayment,
    ConfirmPayment,
    ReversePayment,
    Read,
}

impl Role {
    pub fn permits(&self, action: Action) -> bool {
        use Action::*;
        match self {
            Role::SuperAdmin | Role::SchoolAdmin => action != IngestProviderPayment,
            Role::Accountant => matches!(
                action,
                RecordPayment | ConfirmPayment | ReversePayment | IssueInvoices | Read
            ),
            Role::Teacher | Role::Parent => action == Read,
            Role::System => matches!(
                action,
                GenerateInvoices | IngestProviderPayment | ConfirmPayment | Read
            ),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// authenticated caller as seen by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub actor_id: ActorId,
    pub school_id: Option<SchoolId>,
    pub role: Role,
}

impl Principal {
    pub fn new(actor_id: ActorId, school_id: SchoolId, role: Role) -> Self {
        Self {
            actor_id,
            school_id: Some(school_id),
            role,
        }
    }

    /// scheduler / webhook principal for one school
    pub fn system(school_id: SchoolId) -> Self {
        Self {
            actor_id: Uuid::nil(),
            school_id: Some(school_id),
            role: Role::System,
        }
    }

    /// tenant id, rejecting principals without one
    pub fn school(&self) -> Result<SchoolId> {
        self.school_id.ok_or(LedgerError::MissingTenant)
    }

    /// tenant id after checking the role may perform `action`
    pub fn authorize(&self, action: Action) -> Result<SchoolId> {
        let school_id = self.school()?;
        if !self.role.permits(action) {
            return Err(LedgerError::PermissionDenied {
                role: self.role,
                action,
            });
        }
        Ok(school_id)
    }
}
