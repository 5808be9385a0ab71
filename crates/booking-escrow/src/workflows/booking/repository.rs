use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{Booking, BookingId, PartyId};
use crate::workflows::checkin::CheckInState;
use crate::workflows::escrow::{EscrowAccount, LedgerEntry, MovementReason, Payee};
use crate::workflows::rectification::RectificationCase;

/// Repository record: the booking plus everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub booking: Booking,
    pub escrow: Option<EscrowAccount>,
    pub case: Option<RectificationCase>,
    #[serde(default)]
    pub check_in: CheckInState,
}

impl BookingRecord {
    pub fn new(booking: Booking) -> Self {
        Self {
            booking,
            escrow: None,
            case: None,
            check_in: CheckInState::default(),
        }
    }

    /// Rail instruction for a committed ledger entry of this booking.
    pub fn instruction_for(&self, entry: &LedgerEntry) -> PaymentInstruction {
        let party = match entry.payee {
            Payee::Provider => self.booking.provider_id.clone(),
            Payee::Client => self.booking.client_id.clone(),
        };
        PaymentInstruction {
            reference: entry.reference.clone(),
            booking_id: self.booking.id.clone(),
            payee: entry.payee,
            party,
            amount: entry.amount,
            reason: entry.reason,
        }
    }
}

/// Storage abstraction so the engine can be exercised in isolation.
pub trait BookingRepository: Send + Sync {
    fn insert(&self, record: BookingRecord) -> Result<BookingRecord, RepositoryError>;
    fn update(&self, record: BookingRecord) -> Result<(), RepositoryError>;
    fn fetch(&self, id: &BookingId) -> Result<Option<BookingRecord>, RepositoryError>;
    fn list(&self, limit: usize) -> Result<Vec<BookingRecord>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Timer kinds the scheduler can deliver to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineKind {
    ProviderConfirmation,
    NoShow,
    ObservationExpiry,
    ProviderResponse,
    FixDeadline,
    MiniObservationExpiry,
}

impl DeadlineKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::ProviderConfirmation => "provider_confirmation",
            Self::NoShow => "no_show",
            Self::ObservationExpiry => "observation_expiry",
            Self::ProviderResponse => "provider_response",
            Self::FixDeadline => "fix_deadline",
            Self::MiniObservationExpiry => "mini_observation_expiry",
        }
    }

    pub const fn all() -> [Self; 6] {
        [
            Self::ProviderConfirmation,
            Self::NoShow,
            Self::ObservationExpiry,
            Self::ProviderResponse,
            Self::FixDeadline,
            Self::MiniObservationExpiry,
        ]
    }
}

/// One armed timer. At most one entry exists per booking and kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadline {
    pub booking_id: BookingId,
    pub kind: DeadlineKind,
    pub due_at: DateTime<Utc>,
}

/// Durable timer storage. Delivery is at-least-once: `due` does not remove entries,
/// `acknowledge` does, and only when the stored entry still matches.
pub trait DeadlineStore: Send + Sync {
    fn schedule(&self, deadline: Deadline) -> Result<(), RepositoryError>;
    fn cancel(&self, booking_id: &BookingId, kind: DeadlineKind) -> Result<(), RepositoryError>;
    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Deadline>, RepositoryError>;
    fn acknowledge(&self, deadline: &Deadline) -> Result<(), RepositoryError>;
    fn pending_for(&self, booking_id: &BookingId) -> Result<Vec<Deadline>, RepositoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTopic {
    #[serde(rename = "booking.status_changed")]
    BookingStatusChanged,
    #[serde(rename = "escrow.status_changed")]
    EscrowStatusChanged,
    #[serde(rename = "rectification.status_changed")]
    RectificationStatusChanged,
    #[serde(rename = "rectification.escalated")]
    RectificationEscalated,
    #[serde(rename = "provider.no_show")]
    ProviderNoShow,
    #[serde(rename = "provider.dispute_outcome")]
    ProviderDisputeOutcome,
}

impl EventTopic {
    pub const fn label(self) -> &'static str {
        match self {
            Self::BookingStatusChanged => "booking.status_changed",
            Self::EscrowStatusChanged => "escrow.status_changed",
            Self::RectificationStatusChanged => "rectification.status_changed",
            Self::RectificationEscalated => "rectification.escalated",
            Self::ProviderNoShow => "provider.no_show",
            Self::ProviderDisputeOutcome => "provider.dispute_outcome",
        }
    }
}

/// Fire-and-forget notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingEvent {
    pub topic: EventTopic,
    pub booking_id: BookingId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl BookingEvent {
    pub fn transition(
        topic: EventTopic,
        booking_id: &BookingId,
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic,
            booking_id: booking_id.clone(),
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            at,
            details: BTreeMap::new(),
        }
    }

    pub fn signal(topic: EventTopic, booking_id: &BookingId, at: DateTime<Utc>) -> Self {
        Self {
            topic,
            booking_id: booking_id.clone(),
            from: None,
            to: None,
            at,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

/// Outbound notification hook (notification service, provider standing).
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: BookingEvent) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("event transport unavailable: {0}")]
    Transport(String),
}

/// Release or refund handed to the payment rail after the ledger commits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInstruction {
    pub reference: String,
    pub booking_id: BookingId,
    pub payee: Payee,
    pub party: PartyId,
    pub amount: u64,
    pub reason: MovementReason,
}

pub trait PaymentRail: Send + Sync {
    fn submit(&self, instruction: PaymentInstruction) -> Result<(), PaymentRailError>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PaymentRailError {
    #[error("payment rail rejected {reference}: {reason}")]
    Rejected { reference: String, reason: String },
    #[error("payment rail unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    ForceRelease,
    ForceFreeze,
    LiftFreeze,
    ForceRefund,
    RuleOnEscalation,
}

impl AdminAction {
    pub const fn label(self) -> &'static str {
        match self {
            Self::ForceRelease => "force_release",
            Self::ForceFreeze => "force_freeze",
            Self::LiftFreeze => "lift_freeze",
            Self::ForceRefund => "force_refund",
            Self::RuleOnEscalation => "rule_on_escalation",
        }
    }
}

/// Audit trail entry written for every admin override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub booking_id: BookingId,
    pub actor: String,
    pub action: AdminAction,
    pub reason: String,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone_phase: Option<u32>,
    /// Set when the override released a milestone ahead of an earlier phase.
    pub bypassed_ordering: bool,
}

pub trait AuditLog: Send + Sync {
    fn record(&self, entry: AuditRecord) -> Result<(), RepositoryError>;
}
