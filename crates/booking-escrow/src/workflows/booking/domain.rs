use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflows::checkin::ServiceLocation;
use crate::workflows::policy::ServiceTier;

/// Identifier wrapper for bookings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookingId(pub String);

impl BookingId {
    pub fn generate() -> Self {
        Self(format!("bkg-{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client or provider account reference owned by an external identity service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseId(pub String);

impl CaseId {
    pub fn generate() -> Self {
        Self(format!("case-{}", Uuid::new_v4().simple()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    ProviderConfirmed,
    EnRoute,
    CheckedIn,
    InProgress,
    Complete,
    Observation,
    Paid,
    Disputed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::ProviderConfirmed => "provider_confirmed",
            Self::EnRoute => "en_route",
            Self::CheckedIn => "checked_in",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Observation => "observation",
            Self::Paid => "paid",
            Self::Disputed => "disputed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// States from which the booking can still be cancelled by either party.
    pub const fn is_before_check_in(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Confirmed | Self::ProviderConfirmed | Self::EnRoute
        )
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, ProviderConfirmed)
                | (Confirmed, Cancelled)
                | (ProviderConfirmed, EnRoute)
                | (ProviderConfirmed, Cancelled)
                | (EnRoute, CheckedIn)
                | (EnRoute, Cancelled)
                | (EnRoute, NoShow)
                | (CheckedIn, InProgress)
                | (InProgress, Complete)
                | (Complete, Observation)
                | (Observation, Paid)
                | (Observation, Disputed)
                | (Paid, Completed)
                | (Disputed, Completed)
                | (Disputed, Cancelled)
        )
    }

    /// Admin overrides skip the ordering rules but may only land on a terminal outcome.
    pub fn accepts_override_to(self, next: BookingStatus) -> bool {
        !self.is_terminal() && matches!(next, BookingStatus::Completed | BookingStatus::Cancelled)
    }
}

/// Who drove a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    Client,
    Provider,
    Scheduler,
    Admin { id: String },
}

impl Actor {
    pub fn label(&self) -> &str {
        match self {
            Actor::Client => "client",
            Actor::Provider => "provider",
            Actor::Scheduler => "scheduler",
            Actor::Admin { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Payload accepted when a client books a quoted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBooking {
    pub tier: ServiceTier,
    pub total_price: u64,
    #[serde(default)]
    pub location: Option<ServiceLocation>,
    pub scheduled_at: DateTime<Utc>,
    pub provider_id: PartyId,
    pub client_id: PartyId,
}

/// One service engagement. Mutated only by the booking engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub tier: ServiceTier,
    pub total_price: u64,
    pub status: BookingStatus,
    pub location: Option<ServiceLocation>,
    pub scheduled_at: DateTime<Utc>,
    pub provider_id: PartyId,
    pub client_id: PartyId,
    pub config_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmation_due_at: Option<DateTime<Utc>>,
    pub no_show_due_at: Option<DateTime<Utc>>,
    pub observation_ends_at: Option<DateTime<Utc>>,
    pub history: Vec<StatusChange>,
}

impl Booking {
    pub fn new(
        id: BookingId,
        request: NewBooking,
        config_version: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tier: request.tier,
            total_price: request.total_price,
            status: BookingStatus::Pending,
            location: request.location,
            scheduled_at: request.scheduled_at,
            provider_id: request.provider_id,
            client_id: request.client_id,
            config_version,
            created_at: now,
            updated_at: now,
            confirmation_due_at: None,
            no_show_due_at: None,
            observation_ends_at: None,
            history: Vec::new(),
        }
    }

    /// Apply a transition from the table, leaving the booking untouched on rejection.
    pub fn transition(
        &mut self,
        to: BookingStatus,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.record(to, actor, now, None);
        Ok(())
    }

    /// Jump straight to a terminal outcome on an admin decision.
    pub fn force_transition(
        &mut self,
        to: BookingStatus,
        actor: Actor,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if self.status.can_transition_to(to) || self.status.accepts_override_to(to) {
            self.record(to, actor, now, Some(note.to_string()));
            return Ok(());
        }
        Err(InvalidTransition {
            from: self.status,
            to,
        })
    }

    /// Ensure the booking currently sits in `expected`, reporting `attempted` otherwise.
    pub fn expect_status(
        &self,
        expected: BookingStatus,
        attempted: BookingStatus,
    ) -> Result<(), InvalidTransition> {
        if self.status == expected {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.status,
                to: attempted,
            })
        }
    }

    fn record(&mut self, to: BookingStatus, actor: Actor, now: DateTime<Utc>, note: Option<String>) {
        self.history.push(StatusChange {
            from: self.status,
            to,
            actor,
            at: now,
            note,
        });
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.confirmation_due_at = None;
            self.no_show_due_at = None;
            self.observation_ends_at = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move booking from {} to {}", .from.label(), .to.label())]
pub struct InvalidTransition {
    pub from: BookingStatus,
    pub to: BookingStatus,
}
