//! Operator overrides. Each call requires an actor and a reason, is written to the audit
//! log as part of its commit, and may bypass the freeze and ordering guards. None of them can
//! move more money than the escrow still holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::domain::{Actor, Booking, BookingId, BookingStatus};
use super::repository::{
    AdminAction, AuditRecord, BookingEvent, BookingRecord, BookingRepository, DeadlineKind,
    DeadlineStore, EventTopic,
};
use super::service::{disarm_case_deadlines, funded, BookingEngine, BookingError, Effects};
use crate::workflows::escrow::{
    Authority, EscrowAccount, EscrowStatus, MilestoneId, MovementReason,
};
use crate::workflows::rectification::{RectificationStatus, Ruling};

/// Who is overriding and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRequest {
    pub actor: String,
    pub reason: String,
}

impl AdminRequest {
    fn validated(self) -> Result<Self, BookingError> {
        let actor = self.actor.trim().to_string();
        let reason = self.reason.trim().to_string();
        if actor.is_empty() {
            return Err(BookingError::Validation("admin actor is required".to_string()));
        }
        if reason.is_empty() {
            return Err(BookingError::MissingReason);
        }
        Ok(Self { actor, reason })
    }

    fn as_actor(&self) -> Actor {
        Actor::Admin {
            id: self.actor.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ReleaseTarget {
    /// Release `amount`, or everything still held when omitted.
    Balance {
        #[serde(default)]
        amount: Option<u64>,
    },
    Milestone { milestone_id: MilestoneId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverrideOutcome {
    pub action: AdminAction,
    pub amount: u64,
    pub escrow_status: EscrowStatus,
    pub booking_status: BookingStatus,
    pub bypassed_ordering: bool,
}

impl<R, D> BookingEngine<R, D>
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    pub fn force_release(
        &self,
        booking_id: &BookingId,
        request: AdminRequest,
        target: ReleaseTarget,
        now: DateTime<Utc>,
    ) -> Result<OverrideOutcome, BookingError> {
        let request = request.validated()?;
        self.mutate(booking_id, now, |record, _config, effects| {
            let account = funded(&mut record.escrow)?;
            let (amount, phase, bypassed_ordering) = match &target {
                ReleaseTarget::Balance { amount } => {
                    let amount = amount.unwrap_or_else(|| account.remaining());
                    account.release_balance(
                        amount,
                        MovementReason::AdminRelease,
                        Authority::Override,
                        now,
                    )?;
                    (amount, None, false)
                }
                ReleaseTarget::Milestone { milestone_id } => {
                    let release =
                        account.release_milestone(milestone_id, Authority::Override, now)?;
                    (release.entry.amount, Some(release.phase), release.bypassed_ordering)
                }
            };

            if bypassed_ordering {
                warn!(
                    booking_id = %booking_id,
                    actor = %request.actor,
                    phase = ?phase,
                    "admin released a milestone out of phase order"
                );
            }

            effects.audit(AuditRecord {
                booking_id: booking_id.clone(),
                actor: request.actor.clone(),
                action: AdminAction::ForceRelease,
                reason: request.reason.clone(),
                at: now,
                amount: Some(amount),
                milestone_phase: phase,
                bypassed_ordering,
            });

            let ruling = Ruling::AdminRelease {
                actor: request.actor.clone(),
                note: request.reason.clone(),
            };
            settle_if_drained(record, effects, &request, ruling, now)?;
            Ok(outcome(record, AdminAction::ForceRelease, amount, bypassed_ordering))
        })
    }

    pub fn force_freeze(
        &self,
        booking_id: &BookingId,
        request: AdminRequest,
        now: DateTime<Utc>,
    ) -> Result<OverrideOutcome, BookingError> {
        let request = request.validated()?;
        self.mutate(booking_id, now, |record, _config, effects| {
            funded(&mut record.escrow)?.freeze(format!("admin: {}", request.reason))?;
            effects.audit(AuditRecord {
                booking_id: booking_id.clone(),
                actor: request.actor.clone(),
                action: AdminAction::ForceFreeze,
                reason: request.reason.clone(),
                at: now,
                amount: None,
                milestone_phase: None,
                bypassed_ordering: false,
            });
            Ok(outcome(record, AdminAction::ForceFreeze, 0, false))
        })
    }

    /// Lift an admin freeze. Refused while a rectification case still needs the hold.
    pub fn lift_freeze(
        &self,
        booking_id: &BookingId,
        request: AdminRequest,
        now: DateTime<Utc>,
    ) -> Result<OverrideOutcome, BookingError> {
        let request = request.validated()?;
        self.mutate(booking_id, now, |record, _config, effects| {
            if record
                .case
                .as_ref()
                .is_some_and(|case| case.status != RectificationStatus::Resolved)
            {
                return Err(BookingError::CaseOpen);
            }

            funded(&mut record.escrow)?.unfreeze()?;

            // Timers that fired while frozen were deferred; deliver them again.
            if let Some((kind, due)) = deferred_timer(&record.booking, now) {
                effects.arm(kind, due);
            }

            effects.audit(AuditRecord {
                booking_id: booking_id.clone(),
                actor: request.actor.clone(),
                action: AdminAction::LiftFreeze,
                reason: request.reason.clone(),
                at: now,
                amount: None,
                milestone_phase: None,
                bypassed_ordering: false,
            });
            Ok(outcome(record, AdminAction::LiftFreeze, 0, false))
        })
    }

    pub fn force_refund(
        &self,
        booking_id: &BookingId,
        request: AdminRequest,
        amount: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<OverrideOutcome, BookingError> {
        let request = request.validated()?;
        self.mutate(booking_id, now, |record, _config, effects| {
            let account = funded(&mut record.escrow)?;
            let amount = amount.unwrap_or_else(|| account.remaining());
            account.refund(amount, MovementReason::AdminRefund, Authority::Override, now)?;

            effects.audit(AuditRecord {
                booking_id: booking_id.clone(),
                actor: request.actor.clone(),
                action: AdminAction::ForceRefund,
                reason: request.reason.clone(),
                at: now,
                amount: Some(amount),
                milestone_phase: None,
                bypassed_ordering: false,
            });

            let ruling = Ruling::AdminRefund {
                actor: request.actor.clone(),
                note: request.reason.clone(),
            };
            settle_if_drained(record, effects, &request, ruling, now)?;
            Ok(outcome(record, AdminAction::ForceRefund, amount, false))
        })
    }

    /// Close an escalated case: refund `refund_amount` to the client and release whatever
    /// is left to the provider.
    pub fn rule_on_escalation(
        &self,
        booking_id: &BookingId,
        request: AdminRequest,
        refund_amount: u64,
        now: DateTime<Utc>,
    ) -> Result<OverrideOutcome, BookingError> {
        let request = request.validated()?;
        self.mutate(booking_id, now, |record, _config, effects| {
            let case = record
                .case
                .as_ref()
                .ok_or(BookingError::NoRectificationCase)?;
            if case.status != RectificationStatus::Escalated {
                return Err(BookingError::CaseNotEscalated {
                    status: case.status,
                });
            }

            let account = funded(&mut record.escrow)?;
            if refund_amount > 0 {
                account.refund(
                    refund_amount,
                    MovementReason::EscalationRuling,
                    Authority::Override,
                    now,
                )?;
            }
            let released = account.remaining();
            if released > 0 {
                account.release_balance(
                    released,
                    MovementReason::EscalationRuling,
                    Authority::Override,
                    now,
                )?;
            }
            let target = settled_outcome(account);

            effects.audit(AuditRecord {
                booking_id: booking_id.clone(),
                actor: request.actor.clone(),
                action: AdminAction::RuleOnEscalation,
                reason: request.reason.clone(),
                at: now,
                amount: Some(refund_amount),
                milestone_phase: None,
                bypassed_ordering: false,
            });

            if let Some(case) = record.case.as_mut() {
                case.close_by_admin(
                    Ruling::AdminSplit {
                        actor: request.actor.clone(),
                        note: request.reason.clone(),
                    },
                    refund_amount,
                    released,
                    now,
                )?;
            }
            record
                .booking
                .transition(target, request.as_actor(), now)?;

            effects.signal(
                BookingEvent::signal(EventTopic::ProviderDisputeOutcome, booking_id, now)
                    .with_detail("provider_id", &record.booking.provider_id.0)
                    .with_detail("outcome", "admin_ruling")
                    .with_detail("refunded", refund_amount)
                    .with_detail("released", released),
            );
            Ok(outcome(record, AdminAction::RuleOnEscalation, refund_amount, false))
        })
    }
}

/// The lifecycle timer for the booking's current status, if it is already due.
fn deferred_timer(
    booking: &Booking,
    now: DateTime<Utc>,
) -> Option<(DeadlineKind, DateTime<Utc>)> {
    let (kind, due) = match booking.status {
        BookingStatus::Confirmed => {
            (DeadlineKind::ProviderConfirmation, booking.confirmation_due_at)
        }
        BookingStatus::EnRoute => (DeadlineKind::NoShow, booking.no_show_due_at),
        BookingStatus::Observation => {
            (DeadlineKind::ObservationExpiry, booking.observation_ends_at)
        }
        _ => return None,
    };
    due.filter(|due| *due <= now).map(|due| (kind, due))
}

/// Booking outcome once an override has drained the escrow.
fn settled_outcome(account: &EscrowAccount) -> BookingStatus {
    if account.status == EscrowStatus::Refunded {
        BookingStatus::Cancelled
    } else {
        BookingStatus::Completed
    }
}

/// When the override left nothing in escrow, close any open case and move the booking to
/// its terminal outcome.
fn settle_if_drained(
    record: &mut BookingRecord,
    effects: &mut Effects,
    request: &AdminRequest,
    ruling: Ruling,
    now: DateTime<Utc>,
) -> Result<(), BookingError> {
    let Some(account) = record.escrow.as_ref() else {
        return Ok(());
    };
    if !account.status.is_terminal() {
        return Ok(());
    }
    let target = settled_outcome(account);
    let (refunded, released) = (account.refunded_to_date, account.released_to_date);

    if let Some(case) = record
        .case
        .as_mut()
        .filter(|case| case.status != RectificationStatus::Resolved)
    {
        case.close_by_admin(ruling, refunded, released, now)?;
        disarm_case_deadlines(effects);
    }

    if !record.booking.status.is_terminal() {
        record
            .booking
            .force_transition(target, request.as_actor(), &request.reason, now)?;
    }
    for kind in DeadlineKind::all() {
        effects.disarm(kind);
    }
    Ok(())
}

fn outcome(
    record: &BookingRecord,
    action: AdminAction,
    amount: u64,
    bypassed_ordering: bool,
) -> OverrideOutcome {
    OverrideOutcome {
        action,
        amount,
        escrow_status: record
            .escrow
            .as_ref()
            .map_or(EscrowStatus::Held, |account| account.status),
        booking_status: record.booking.status,
        bypassed_ordering,
    }
}
