pub mod billing;
pub mod config;
pub mod decimal;
pub mod errors;
pub mod events;
pub mod fees;
pub mod generator;
pub mod invoice;
pub mod ledger;
pub mod payments;
pub mod serialization;
pub mod types;

// re-export key types
pub use billing::{BillingProfile, NewStudent, Student};
pub use config::{BillingConfig, LedgerConfig, PaymentConfig, ReceiptMode, ReminderConfig};
pub use decimal::Money;
pub use errors::{LedgerError, Result};
pub use events::{Event, EventStore, Notification, NotificationKind};
pub use fees::{FeeScope, FeeStructure, NewFeeStructure};
pub use generator::{GenerationOutcome, GenerationReport, InvoiceGenerator, SchoolRun, SkippedStudent};
pub use invoice::Invoice;
pub use ledger::{
    AllocationOutcome, FeeLedger, InvoiceOutcome, ManualInvoice, PaymentOutcome, ProviderPayment,
    ReversalOutcome,
};
pub use payments::{
    AllocationPlan, AllocationRequest, Payment, PaymentAllocator, PaymentDetails, PaymentReversal,
    Receipt, ReceiptRequest,
};
pub use serialization::{SchoolSnapshot, SchoolSummary, StudentStatement};
pub use types::{
    Action, ActorId, BillingCycle, ClassId, DivisionId, FeeKind, FeeStructureId, InvoiceId,
    InvoiceStatus, PaymentId, PaymentMethod, PaymentStatus, Principal, Role, SchoolId, StudentId,
    StudentPaymentStatus,
};

// re-export external dependencies that users will need
pub use chrono;
pub use hourglass_rs::{SafeTimeProvider, TimeSource};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
