//! Rectification sub-workflow opened when a client reports an issue during observation.
//!
//! The case is a child state machine of the booking: the booking engine freezes escrow on
//! entry and either releases, refunds, or hands the case to an admin on exit. Deadlines are
//! stored on the case so a late scheduler delivery can be recognised as stale.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::workflows::booking::domain::{BookingId, CaseId};
use crate::workflows::policy::RectificationPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RectificationStatus {
    Reported,
    ProviderNotified,
    FixScheduled,
    FixInProgress,
    FixComplete,
    MiniObservation,
    Resolved,
    Escalated,
}

impl RectificationStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Reported => "reported",
            Self::ProviderNotified => "provider_notified",
            Self::FixScheduled => "fix_scheduled",
            Self::FixInProgress => "fix_in_progress",
            Self::FixComplete => "fix_complete",
            Self::MiniObservation => "mini_observation",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
        }
    }

    /// Open cases keep the parent escrow frozen.
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Resolved | Self::Escalated)
    }

    fn can_transition_to(self, next: Self) -> bool {
        use RectificationStatus::*;
        match (self, next) {
            (Reported, ProviderNotified)
            | (ProviderNotified, FixScheduled)
            | (FixScheduled, FixInProgress)
            | (FixInProgress, FixComplete)
            | (FixComplete, MiniObservation)
            | (MiniObservation, Resolved)
            | (MiniObservation, FixScheduled) => true,
            (from, Escalated) => from.is_open(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Workmanship,
    IncompleteWork,
    PropertyDamage,
    Safety,
    Other,
}

impl IssueCategory {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Workmanship => "workmanship",
            Self::IncompleteWork => "incomplete_work",
            Self::PropertyDamage => "property_damage",
            Self::Safety => "safety",
            Self::Other => "other",
        }
    }
}

/// What the client wrote when reporting the issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReport {
    pub category: IssueCategory,
    pub description: String,
}

/// Which SLA clock ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaKind {
    ProviderResponse,
    FixDeadline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    SlaBreach { sla: SlaKind },
    AttemptsExhausted { attempts: u32 },
    Requested { by: String, note: String },
}

impl EscalationReason {
    pub fn label(&self) -> &'static str {
        match self {
            EscalationReason::SlaBreach {
                sla: SlaKind::ProviderResponse,
            } => "provider_response_sla",
            EscalationReason::SlaBreach {
                sla: SlaKind::FixDeadline,
            } => "fix_deadline_sla",
            EscalationReason::AttemptsExhausted { .. } => "attempts_exhausted",
            EscalationReason::Requested { .. } => "requested",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ruling {
    FixAccepted,
    AdminSplit { actor: String, note: String },
    AdminRelease { actor: String, note: String },
    AdminRefund { actor: String, note: String },
}

impl Ruling {
    pub fn label(&self) -> &'static str {
        match self {
            Ruling::FixAccepted => "fix_accepted",
            Ruling::AdminSplit { .. } => "admin_split",
            Ruling::AdminRelease { .. } => "admin_release",
            Ruling::AdminRefund { .. } => "admin_refund",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub ruling: Ruling,
    pub refund_amount: u64,
    pub released_amount: u64,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub reason: EscalationReason,
    pub escalated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseTransition {
    pub from: RectificationStatus,
    pub to: RectificationStatus,
    pub at: DateTime<Utc>,
}

/// Outcome of a repeat report during mini-observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Reopened { fix_due: DateTime<Utc> },
    Escalated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectificationCase {
    pub id: CaseId,
    pub booking_id: BookingId,
    pub category: IssueCategory,
    pub description: String,
    pub status: RectificationStatus,
    pub attempts: u32,
    pub reports: Vec<IssueReport>,
    pub opened_at: DateTime<Utc>,
    pub provider_response_due: Option<DateTime<Utc>>,
    pub fix_due: Option<DateTime<Utc>>,
    pub fix_scheduled_for: Option<DateTime<Utc>>,
    pub mini_observation_ends: Option<DateTime<Utc>>,
    pub escalation: Option<Escalation>,
    pub resolution: Option<Resolution>,
    pub history: Vec<CaseTransition>,
}

impl RectificationCase {
    pub fn open(
        booking_id: &BookingId,
        report: IssueReport,
        policy: &RectificationPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CaseId::generate(),
            booking_id: booking_id.clone(),
            category: report.category,
            description: report.description.clone(),
            status: RectificationStatus::Reported,
            attempts: 1,
            reports: vec![report],
            opened_at: now,
            provider_response_due: Some(now + policy.provider_response_window()),
            fix_due: Some(now + policy.fix_window()),
            fix_scheduled_for: None,
            mini_observation_ends: None,
            escalation: None,
            resolution: None,
            history: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn notify_provider(&mut self, now: DateTime<Utc>) -> Result<(), RectificationError> {
        self.advance(RectificationStatus::ProviderNotified, now)
    }

    pub fn schedule_fix(
        &mut self,
        fix_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), RectificationError> {
        self.advance(RectificationStatus::FixScheduled, now)?;
        self.fix_scheduled_for = Some(fix_at);
        self.provider_response_due = None;
        Ok(())
    }

    pub fn start_fix(&mut self, now: DateTime<Utc>) -> Result<(), RectificationError> {
        self.advance(RectificationStatus::FixInProgress, now)
    }

    /// Record the fix and open the mini-observation window. Returns when it ends.
    pub fn complete_fix(
        &mut self,
        policy: &RectificationPolicy,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RectificationError> {
        self.advance(RectificationStatus::FixComplete, now)?;
        self.advance(RectificationStatus::MiniObservation, now)?;
        self.fix_due = None;
        let ends = now + policy.mini_observation_window();
        self.mini_observation_ends = Some(ends);
        Ok(ends)
    }

    /// A further issue raised during mini-observation either re-opens the fix cycle or,
    /// once the attempt budget is spent, escalates.
    pub fn report_recurrence(
        &mut self,
        report: IssueReport,
        policy: &RectificationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Recurrence, RectificationError> {
        if self.status != RectificationStatus::MiniObservation {
            return Err(RectificationError::InvalidTransition {
                from: self.status,
                to: RectificationStatus::FixScheduled,
            });
        }

        self.reports.push(report);
        self.attempts += 1;
        self.mini_observation_ends = None;

        if self.attempts > policy.max_attempts {
            self.escalate(
                EscalationReason::AttemptsExhausted {
                    attempts: self.attempts,
                },
                now,
            )?;
            return Ok(Recurrence::Escalated);
        }

        self.advance(RectificationStatus::FixScheduled, now)?;
        let fix_due = now + policy.fix_window();
        self.fix_due = Some(fix_due);
        self.fix_scheduled_for = None;
        Ok(Recurrence::Reopened { fix_due })
    }

    pub fn escalate(
        &mut self,
        reason: EscalationReason,
        now: DateTime<Utc>,
    ) -> Result<(), RectificationError> {
        self.advance(RectificationStatus::Escalated, now)?;
        self.provider_response_due = None;
        self.fix_due = None;
        self.mini_observation_ends = None;
        self.escalation = Some(Escalation {
            reason,
            escalated_at: now,
        });
        Ok(())
    }

    /// Mini-observation elapsed without a new report.
    pub fn accept_fix(
        &mut self,
        released_amount: u64,
        now: DateTime<Utc>,
    ) -> Result<(), RectificationError> {
        self.advance(RectificationStatus::Resolved, now)?;
        self.mini_observation_ends = None;
        self.resolution = Some(Resolution {
            ruling: Ruling::FixAccepted,
            refund_amount: 0,
            released_amount,
            resolved_at: now,
        });
        Ok(())
    }

    /// Close the case on an admin decision. Escalated cases are the normal entry point; an
    /// admin override may also close a case that is still open.
    pub fn close_by_admin(
        &mut self,
        ruling: Ruling,
        refund_amount: u64,
        released_amount: u64,
        now: DateTime<Utc>,
    ) -> Result<(), RectificationError> {
        if self.status == RectificationStatus::Resolved {
            return Err(RectificationError::AlreadyResolved);
        }

        self.record(RectificationStatus::Resolved, now);
        self.provider_response_due = None;
        self.fix_due = None;
        self.mini_observation_ends = None;
        self.resolution = Some(Resolution {
            ruling,
            refund_amount,
            released_amount,
            resolved_at: now,
        });
        Ok(())
    }

    /// Whether a provider-response deadline due at `due_at` is still live and missed.
    pub fn provider_response_breached(&self, due_at: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            RectificationStatus::Reported | RectificationStatus::ProviderNotified
        ) && self.provider_response_due == Some(due_at)
    }

    /// Whether a fix deadline due at `due_at` is still live and missed.
    pub fn fix_deadline_breached(&self, due_at: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            RectificationStatus::Reported
                | RectificationStatus::ProviderNotified
                | RectificationStatus::FixScheduled
                | RectificationStatus::FixInProgress
        ) && self.fix_due == Some(due_at)
    }

    pub fn mini_observation_elapsed(&self, due_at: DateTime<Utc>) -> bool {
        self.status == RectificationStatus::MiniObservation
            && self.mini_observation_ends == Some(due_at)
    }

    /// The deadline the case is currently racing against, if any.
    pub fn sla_deadline(&self) -> Option<DateTime<Utc>> {
        match self.status {
            RectificationStatus::Reported | RectificationStatus::ProviderNotified => {
                match (self.provider_response_due, self.fix_due) {
                    (Some(response), Some(fix)) => Some(response.min(fix)),
                    (response, fix) => response.or(fix),
                }
            }
            RectificationStatus::FixScheduled | RectificationStatus::FixInProgress => {
                self.fix_due
            }
            RectificationStatus::MiniObservation => self.mini_observation_ends,
            _ => None,
        }
    }

    /// Hours left before the current deadline, floored at zero.
    pub fn sla_hours_remaining(&self, now: DateTime<Utc>) -> Option<f64> {
        self.sla_deadline().map(|deadline| {
            let remaining = (deadline - now).max(Duration::zero());
            remaining.num_seconds() as f64 / 3600.0
        })
    }

    fn advance(
        &mut self,
        to: RectificationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), RectificationError> {
        if !self.status.can_transition_to(to) {
            return Err(RectificationError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.record(to, now);
        Ok(())
    }

    fn record(&mut self, to: RectificationStatus, now: DateTime<Utc>) {
        self.history.push(CaseTransition {
            from: self.status,
            to,
            at: now,
        });
        self.status = to;
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RectificationError {
    #[error("rectification cannot move from {} to {}", .from.label(), .to.label())]
    InvalidTransition {
        from: RectificationStatus,
        to: RectificationStatus,
    },
    #[error("rectification case already resolved")]
    AlreadyResolved,
}
