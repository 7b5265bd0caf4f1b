use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::types::{
    ActorId, FeeStructureId, InvoiceId, InvoiceStatus, PaymentId, PaymentMethod, SchoolId,
    StudentId, StudentPaymentStatus,
};

/// all events that can be emitted by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // invoice events
    InvoiceIssued {
        school_id: SchoolId,
        student_id: StudentId,
        invoice_id: InvoiceId,
        fee_id: Option<FeeStructureId>,
        amount_due: Money,
        due_date: NaiveDate,
        billing_month: NaiveDate,
    },
    InvoiceStatusChanged {
        student_id: StudentId,
        invoice_id: InvoiceId,
        old_status: InvoiceStatus,
        new_status: InvoiceStatus,
        amount_due: Money,
        amount_paid: Money,
        due_date: NaiveDate,
    },

    // payment events
    PaymentRecorded {
        student_id: StudentId,
        invoice_id: InvoiceId,
        payment_id: PaymentId,
        amount: Money,
        method: PaymentMethod,
        confirmed: bool,
        timestamp: DateTime<Utc>,
    },
    PaymentConfirmed {
        student_id: StudentId,
        invoice_id: InvoiceId,
        payment_id: PaymentId,
        amount: Money,
        confirmed_by: ActorId,
        timestamp: DateTime<Utc>,
    },
    PaymentRejected {
        student_id: StudentId,
        invoice_id: InvoiceId,
        payment_id: PaymentId,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    PaymentReversed {
        student_id: StudentId,
        invoice_id: InvoiceId,
        payment_id: PaymentId,
        amount: Money,
        reason: String,
        reversed_by: ActorId,
        timestamp: DateTime<Utc>,
    },

    // student events
    StudentPaymentStatusChanged {
        student_id: StudentId,
        old_status: StudentPaymentStatus,
        new_status: StudentPaymentStatus,
    },
    FeeReminderDue {
        student_id: StudentId,
        invoice_id: InvoiceId,
        balance: Money,
        due_date: NaiveDate,
        overdue: bool,
    },

    // batch events
    GenerationCompleted {
        school_id: SchoolId,
        invoices_created: usize,
        students_billed: usize,
        timestamp: DateTime<Utc>,
    },
}

/// kind tag carried by notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    InvoiceIssued,
    InvoiceStatusChanged,
    PaymentConfirmed,
    PaymentReversed,
    FeeReminder,
}

/// flat payload handed to the messaging collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub student_id: StudentId,
    pub invoice_id: InvoiceId,
    pub kind: NotificationKind,
    pub amount: Money,
    pub amount_paid: Option<Money>,
    pub due_date: Option<NaiveDate>,
}

impl Event {
    /// student the event concerns, if any
    pub fn student_id(&self) -> Option<StudentId> {
        match self {
            Event::InvoiceIssued { student_id, .. }
            | Event::InvoiceStatusChanged { student_id, .. }
            | Event::PaymentRecorded { student_id, .. }
            | Event::PaymentConfirmed { student_id, .. }
            | Event::PaymentRejected { student_id, .. }
            | Event::PaymentReversed { student_id, .. }
            | Event::StudentPaymentStatusChanged { student_id, .. }
            | Event::FeeReminderDue { student_id, .. } => Some(*student_id),
            Event::GenerationCompleted { .. } => None,
        }
    }

    /// project the event into a notification, if it is one parents care about
    pub fn notification(&self) -> Option<Notification> {
        match self {
            Event::InvoiceIssued {
                student_id,
                invoice_id,
                amount_due,
                due_date,
                ..
            } => Some(Notification {
                student_id: *student_id,
                invoice_id: *invoice_id,
                kind: NotificationKind::InvoiceIssued,
                amount: *amount_due,
                amount_paid: None,
                due_date: Some(*due_date),
            }),
            Event::InvoiceStatusChanged {
                student_id,
                invoice_id,
                amount_due,
                amount_paid,
                due_date,
                ..
            } => Some(Notification {
                student_id: *student_id,
                invoice_id: *invoice_id,
                kind: NotificationKind::InvoiceStatusChanged,
                amount: *amount_due,
                amount_paid: Some(*amount_paid),
                due_date: Some(*due_date),
            }),
            Event::PaymentConfirmed {
                student_id,
                invoice_id,
                amount,
                ..
            } => Some(Notification {
                student_id: *student_id,
                invoice_id: *invoice_id,
                kind: NotificationKind::PaymentConfirmed,
                amount: *amount,
                amount_paid: None,
                due_date: None,
            }),
            Event::PaymentReversed {
                student_id,
                invoice_id,
                amount,
                ..
            } => Some(Notification {
                student_id: *student_id,
                invoice_id: *invoice_id,
                kind: NotificationKind::PaymentReversed,
                amount: *amount,
                amount_paid: None,
                due_date: None,
            }),
            Event::FeeReminderDue {
                student_id,
                invoice_id,
                balance,
                due_date,
                ..
            } => Some(Notification {
                student_id: *student_id,
                invoice_id: *invoice_id,
                kind: NotificationKind::FeeReminder,
                amount: *balance,
                amount_paid: None,
                due_date: Some(*due_date),
            }),
            _ => None,
        }
    }
}

/// event store for collecting events during operations
#[derive(Debug, Default, Clone)]
pub struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = Event>) {
        self.events.extend(events);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// notifications for every event that maps to one
    pub fn notifications(&self) -> Vec<Notification> {
        self.events.iter().filter_map(Event::notification).collect()
    }
}
