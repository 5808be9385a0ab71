use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::domain::{
    Actor, Booking, BookingId, BookingStatus, InvalidTransition, NewBooking,
};
use super::repository::{
    AuditLog, AuditRecord, BookingEvent, BookingRecord, BookingRepository, Deadline, DeadlineKind,
    DeadlineStore, EventPublisher, EventTopic, PaymentRail, RepositoryError,
};
use super::scheduler::DeadlineOutcome;
use super::views::BookingView;
use crate::workflows::checkin::{
    acquire_fix, CheckInGate, CheckInSubmission, CheckInVerdict, GeoPoint, IssuedCode,
    LocationSource, VerificationFailure,
};
use crate::workflows::escrow::{
    self, Authority, EscrowAccount, EscrowError, LedgerEntry, MilestoneId, MovementReason,
};
use crate::workflows::policy::{percent_of, CancellationStage, EngineConfig, PolicyError};
use crate::workflows::rectification::{
    EscalationReason, IssueReport, RectificationCase, RectificationError, RectificationStatus,
    Recurrence, Ruling, SlaKind,
};

/// Fire-and-forget collaborators the engine talks to after a transition commits.
#[derive(Clone)]
pub struct Outbound {
    pub events: Arc<dyn EventPublisher>,
    pub payments: Arc<dyn PaymentRail>,
    pub audit: Arc<dyn AuditLog>,
}

impl Outbound {
    pub fn new(
        events: Arc<dyn EventPublisher>,
        payments: Arc<dyn PaymentRail>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            events,
            payments,
            audit,
        }
    }
}

struct ConfigRegistry {
    current: u32,
    versions: BTreeMap<u32, Arc<EngineConfig>>,
}

/// Orchestrates the booking lifecycle over the escrow ledger, the check-in gate and the
/// rectification workflow. Mutations to one booking are serialized through a per-id lock.
pub struct BookingEngine<R, D> {
    repository: Arc<R>,
    deadlines: Arc<D>,
    outbound: Outbound,
    configs: RwLock<ConfigRegistry>,
    locks: Mutex<HashMap<BookingId, Arc<Mutex<()>>>>,
}

/// Deadline changes and extra signals collected while a mutation runs.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    events: Vec<BookingEvent>,
    schedule: Vec<(DeadlineKind, DateTime<Utc>)>,
    cancel: Vec<DeadlineKind>,
    audit: Option<AuditRecord>,
}

impl Effects {
    pub(crate) fn arm(&mut self, kind: DeadlineKind, due_at: DateTime<Utc>) {
        self.schedule.push((kind, due_at));
    }

    pub(crate) fn disarm(&mut self, kind: DeadlineKind) {
        self.cancel.push(kind);
    }

    pub(crate) fn signal(&mut self, event: BookingEvent) {
        self.events.push(event);
    }

    /// Audit entry written once the record is persisted. A failed write undoes the update.
    pub(crate) fn audit(&mut self, entry: AuditRecord) {
        self.audit = Some(entry);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellingParty {
    Client,
    Provider,
}

impl CancellingParty {
    fn actor(self) -> Actor {
        match self {
            CancellingParty::Client => Actor::Client,
            CancellingParty::Provider => Actor::Provider,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub by: CancellingParty,
    #[serde(default)]
    pub reason: Option<String>,
}

/// What a cancellation costs at this moment. Providers never pay a cancellation fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancellationQuote {
    pub status: BookingStatus,
    pub stage: CancellationStage,
    pub fee: u64,
    pub refund: u64,
    pub allowed: bool,
    pub free_of_charge: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckInRequest {
    pub code: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoShowSettlement {
    pub penalty: u64,
    pub refund: u64,
}

impl<R, D> BookingEngine<R, D>
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    pub fn new(
        repository: Arc<R>,
        deadlines: Arc<D>,
        outbound: Outbound,
        config: EngineConfig,
    ) -> Result<Self, BookingError> {
        config.validate()?;
        let current = config.version;
        let mut versions = BTreeMap::new();
        versions.insert(current, Arc::new(config));

        Ok(Self {
            repository,
            deadlines,
            outbound,
            configs: RwLock::new(ConfigRegistry { current, versions }),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn deadlines(&self) -> &Arc<D> {
        &self.deadlines
    }

    /// Policy applied to bookings created from now on.
    pub fn current_config(&self) -> Arc<EngineConfig> {
        let registry = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .versions
            .get(&registry.current)
            .cloned()
            .unwrap_or_else(|| Arc::new(EngineConfig::standard()))
    }

    pub fn config_version(&self, version: u32) -> Result<Arc<EngineConfig>, BookingError> {
        let registry = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .versions
            .get(&version)
            .cloned()
            .ok_or(BookingError::UnknownConfigVersion(version))
    }

    /// Register a newer policy for new bookings. In-flight bookings keep the version they
    /// were created under.
    pub fn publish_config(&self, config: EngineConfig) -> Result<u32, BookingError> {
        config.validate()?;
        let mut registry = self.configs.write().unwrap_or_else(PoisonError::into_inner);
        if config.version <= registry.current {
            return Err(BookingError::StaleConfigVersion {
                current: registry.current,
                offered: config.version,
            });
        }
        let version = config.version;
        registry.versions.insert(version, Arc::new(config));
        registry.current = version;
        info!(version, "published engine policy");
        Ok(version)
    }

    pub fn create_booking(
        &self,
        request: NewBooking,
        now: DateTime<Utc>,
    ) -> Result<BookingRecord, BookingError> {
        validate_request(&request, now)?;
        let config = self.current_config();
        let booking = Booking::new(BookingId::generate(), request, config.version, now);
        let stored = self.repository.insert(BookingRecord::new(booking))?;
        info!(
            booking_id = %stored.booking.id,
            tier = stored.booking.tier.number(),
            total_price = stored.booking.total_price,
            config_version = config.version,
            "booking created"
        );
        Ok(stored)
    }

    /// Change the quoted price. Only possible before escrow is funded.
    pub fn reprice(
        &self,
        booking_id: &BookingId,
        total_price: u64,
        now: DateTime<Utc>,
    ) -> Result<BookingRecord, BookingError> {
        if total_price == 0 {
            return Err(BookingError::Validation(
                "total price must be greater than zero".to_string(),
            ));
        }
        self.mutate(booking_id, now, |record, _config, _effects| {
            if record.escrow.is_some() || record.booking.status != BookingStatus::Pending {
                return Err(BookingError::PriceLocked);
            }
            record.booking.total_price = total_price;
            record.booking.updated_at = now;
            Ok(record.clone())
        })
    }

    /// Client payment confirmed: fund escrow and start the provider confirmation clock.
    pub fn confirm_booking(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<EscrowAccount, BookingError> {
        self.mutate(booking_id, now, |record, config, effects| {
            record
                .booking
                .transition(BookingStatus::Confirmed, Actor::Client, now)?;
            let account = escrow::fund(
                &mut record.escrow,
                &record.booking.id,
                record.booking.total_price,
                config.tier(record.booking.tier),
                config.version,
                now,
            )?
            .clone();

            let due = now + config.booking.provider_confirmation_window();
            record.booking.confirmation_due_at = Some(due);
            effects.arm(DeadlineKind::ProviderConfirmation, due);
            Ok(account)
        })
    }

    pub fn accept_booking(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        self.mutate(booking_id, now, |record, _config, effects| {
            record
                .booking
                .expect_status(BookingStatus::Confirmed, BookingStatus::ProviderConfirmed)?;
            if let Some(due_at) = record.booking.confirmation_due_at.filter(|due| now > *due) {
                return Err(BookingError::ConfirmationExpired { due_at });
            }
            record
                .booking
                .transition(BookingStatus::ProviderConfirmed, Actor::Provider, now)?;
            record.booking.confirmation_due_at = None;
            effects.disarm(DeadlineKind::ProviderConfirmation);
            Ok(())
        })
    }

    /// Provider leaves for the job. Arms the no-show timer at the scheduled time plus grace.
    pub fn depart(&self, booking_id: &BookingId, now: DateTime<Utc>) -> Result<(), BookingError> {
        self.mutate(booking_id, now, |record, config, effects| {
            record
                .booking
                .transition(BookingStatus::EnRoute, Actor::Provider, now)?;
            let due = record.booking.scheduled_at + config.booking.no_show_grace();
            record.booking.no_show_due_at = Some(due);
            effects.arm(DeadlineKind::NoShow, due);
            Ok(())
        })
    }

    /// Client asks for a fresh one-time code to read out to the provider on site.
    pub fn issue_check_in_code(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, BookingError> {
        self.mutate(booking_id, now, |record, config, _effects| {
            let status = record.booking.status;
            if !matches!(
                status,
                BookingStatus::ProviderConfirmed | BookingStatus::EnRoute
            ) {
                return Err(BookingError::NotAllowed {
                    status,
                    operation: "issue_check_in_code",
                });
            }
            let gate = CheckInGate::new(config.check_in.clone());
            gate.issue(&mut record.check_in, &record.booking.id, now)
                .map_err(BookingError::VerificationFailed)
        })
    }

    /// Verify the provider on site. The GPS fix is acquired before the booking lock is
    /// taken; the verdict and any transition are then applied atomically.
    pub async fn check_in(
        &self,
        booking_id: &BookingId,
        request: &CheckInRequest,
        source: &dyn LocationSource,
        now: DateTime<Utc>,
    ) -> Result<CheckInVerdict, BookingError> {
        let snapshot = self.fetch(booking_id)?;
        snapshot
            .booking
            .expect_status(BookingStatus::EnRoute, BookingStatus::CheckedIn)?;
        let config = self.config_version(snapshot.booking.config_version)?;

        let fix = match snapshot.booking.location {
            Some(_) => match acquire_fix(source, &config.check_in).await {
                Ok(fix) => Some(fix),
                Err(err) => {
                    warn!(booking_id = %booking_id, error = %err, "check-in location unavailable");
                    None
                }
            },
            None => None,
        };

        let verdict = self.mutate(booking_id, now, |record, config, effects| {
            record
                .booking
                .expect_status(BookingStatus::EnRoute, BookingStatus::CheckedIn)?;
            let gate = CheckInGate::new(config.check_in.clone());
            let submission = CheckInSubmission {
                code: &request.code,
                fix,
            };
            let verdict = gate.evaluate(
                &mut record.check_in,
                &record.booking.id,
                &submission,
                record.booking.location.as_ref(),
                now,
            );

            if verdict.passed {
                record
                    .booking
                    .transition(BookingStatus::CheckedIn, Actor::Provider, now)?;
                record.booking.no_show_due_at = None;
                effects.disarm(DeadlineKind::NoShow);
                funded(&mut record.escrow)?.release_commitment(now)?;
            }
            Ok(verdict)
        })?;

        match verdict.failure.clone() {
            Some(failure) => {
                info!(
                    booking_id = %booking_id,
                    reason = failure.code(),
                    distance_meters = ?verdict.distance_meters,
                    "check-in rejected"
                );
                Err(BookingError::VerificationFailed(failure))
            }
            None => Ok(verdict),
        }
    }

    pub fn start_work(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        self.mutate(booking_id, now, |record, _config, _effects| {
            record
                .booking
                .transition(BookingStatus::InProgress, Actor::Provider, now)?;
            Ok(())
        })
    }

    /// Client signs off a tier-4 phase. The final phase is paid by the observation window.
    pub fn approve_milestone(
        &self,
        booking_id: &BookingId,
        milestone_id: &MilestoneId,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, BookingError> {
        self.mutate(booking_id, now, |record, _config, _effects| {
            let status = record.booking.status;
            if status != BookingStatus::InProgress {
                return Err(BookingError::NotAllowed {
                    status,
                    operation: "approve_milestone",
                });
            }

            let account = funded(&mut record.escrow)?;
            let final_phase = account.milestones.len() as u32;
            if let Some(milestone) = account
                .milestones
                .iter()
                .find(|milestone| &milestone.id == milestone_id)
            {
                if milestone.phase == final_phase {
                    return Err(BookingError::MilestoneHeldForObservation {
                        phase: milestone.phase,
                    });
                }
            }

            let release = account.release_milestone(milestone_id, Authority::Standard, now)?;
            Ok(release.entry)
        })
    }

    /// Provider marks the work done, which opens the observation window.
    pub fn mark_complete(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, BookingError> {
        self.mutate(booking_id, now, |record, config, effects| {
            record
                .booking
                .transition(BookingStatus::Complete, Actor::Provider, now)?;
            record
                .booking
                .transition(BookingStatus::Observation, Actor::Provider, now)?;
            funded(&mut record.escrow)?.begin_observation()?;

            let ends = now + config.tier(record.booking.tier).observation_window();
            record.booking.observation_ends_at = Some(ends);
            effects.arm(DeadlineKind::ObservationExpiry, ends);
            Ok(ends)
        })
    }

    /// Client reports a problem. During observation this opens a rectification case; during
    /// mini-observation it counts as a recurrence on the open case.
    pub fn report_issue(
        &self,
        booking_id: &BookingId,
        report: IssueReport,
        now: DateTime<Utc>,
    ) -> Result<RectificationCase, BookingError> {
        if report.description.trim().is_empty() {
            return Err(BookingError::Validation(
                "issue description is required".to_string(),
            ));
        }

        self.mutate(booking_id, now, |record, config, effects| {
            match record.booking.status {
                BookingStatus::Observation => {
                    if let Some(ended_at) = record
                        .booking
                        .observation_ends_at
                        .filter(|ends| now >= *ends)
                    {
                        return Err(BookingError::ObservationClosed { ended_at });
                    }

                    record
                        .booking
                        .transition(BookingStatus::Disputed, Actor::Client, now)?;
                    record.booking.observation_ends_at = None;
                    effects.disarm(DeadlineKind::ObservationExpiry);
                    funded(&mut record.escrow)?.freeze("issue reported")?;

                    let mut case = RectificationCase::open(
                        &record.booking.id,
                        report,
                        &config.rectification,
                        now,
                    );
                    case.notify_provider(now)?;
                    if let Some(due) = case.provider_response_due {
                        effects.arm(DeadlineKind::ProviderResponse, due);
                    }
                    if let Some(due) = case.fix_due {
                        effects.arm(DeadlineKind::FixDeadline, due);
                    }
                    record.case = Some(case.clone());
                    Ok(case)
                }
                BookingStatus::Disputed => {
                    let case = open_case(&mut record.case)?;
                    match case.report_recurrence(report, &config.rectification, now)? {
                        Recurrence::Reopened { fix_due } => {
                            effects.disarm(DeadlineKind::MiniObservationExpiry);
                            effects.arm(DeadlineKind::FixDeadline, fix_due);
                        }
                        Recurrence::Escalated => {
                            effects.disarm(DeadlineKind::MiniObservationExpiry);
                        }
                    }
                    Ok(case.clone())
                }
                status => Err(BookingError::NotAllowed {
                    status,
                    operation: "report_issue",
                }),
            }
        })
    }

    pub fn schedule_fix(
        &self,
        booking_id: &BookingId,
        fix_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RectificationCase, BookingError> {
        self.mutate(booking_id, now, |record, _config, effects| {
            let case = open_case(&mut record.case)?;
            case.schedule_fix(fix_at, now)?;
            effects.disarm(DeadlineKind::ProviderResponse);
            Ok(case.clone())
        })
    }

    pub fn start_fix(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<RectificationCase, BookingError> {
        self.mutate(booking_id, now, |record, _config, _effects| {
            let case = open_case(&mut record.case)?;
            case.start_fix(now)?;
            Ok(case.clone())
        })
    }

    pub fn complete_fix(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<RectificationCase, BookingError> {
        self.mutate(booking_id, now, |record, config, effects| {
            let case = open_case(&mut record.case)?;
            let ends = case.complete_fix(&config.rectification, now)?;
            effects.disarm(DeadlineKind::FixDeadline);
            effects.arm(DeadlineKind::MiniObservationExpiry, ends);
            Ok(case.clone())
        })
    }

    /// Either party hands the case to an admin before the SLA runs out.
    pub fn escalate_case(
        &self,
        booking_id: &BookingId,
        by: Actor,
        note: String,
        now: DateTime<Utc>,
    ) -> Result<RectificationCase, BookingError> {
        self.mutate(booking_id, now, |record, _config, effects| {
            let case = open_case(&mut record.case)?;
            case.escalate(
                EscalationReason::Requested {
                    by: by.label().to_string(),
                    note,
                },
                now,
            )?;
            disarm_case_deadlines(effects);
            Ok(case.clone())
        })
    }

    pub fn cancellation_quote(
        &self,
        booking_id: &BookingId,
        by: CancellingParty,
        now: DateTime<Utc>,
    ) -> Result<CancellationQuote, BookingError> {
        let record = self.fetch(booking_id)?;
        let config = self.config_version(record.booking.config_version)?;
        Ok(quote(&record, &config, by, now))
    }

    /// Cancel before check-in. The fee, if any, goes to the provider and the rest of the
    /// escrow is refunded.
    pub fn cancel(
        &self,
        booking_id: &BookingId,
        request: CancelRequest,
        now: DateTime<Utc>,
    ) -> Result<CancellationQuote, BookingError> {
        self.mutate(booking_id, now, |record, config, effects| {
            let quote = quote(record, config, request.by, now);
            if !quote.allowed {
                return Err(InvalidTransition {
                    from: record.booking.status,
                    to: BookingStatus::Cancelled,
                }
                .into());
            }

            record
                .booking
                .transition(BookingStatus::Cancelled, request.by.actor(), now)?;
            if let Some(reason) = request.reason.as_ref() {
                if let Some(change) = record.booking.history.last_mut() {
                    change.note = Some(reason.clone());
                }
            }

            if let Some(account) = record.escrow.as_mut() {
                account.release_balance(
                    quote.fee,
                    MovementReason::CancellationFee,
                    Authority::Standard,
                    now,
                )?;
                let remaining = account.remaining();
                if remaining > 0 {
                    account.refund(
                        remaining,
                        MovementReason::CancellationRefund,
                        Authority::Standard,
                        now,
                    )?;
                }
            }
            effects.disarm(DeadlineKind::ProviderConfirmation);
            effects.disarm(DeadlineKind::NoShow);
            Ok(quote)
        })
    }

    /// Provider reports the client absent once the grace period has passed.
    pub fn report_client_no_show(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<NoShowSettlement, BookingError> {
        self.mutate(booking_id, now, |record, config, effects| {
            record
                .booking
                .expect_status(BookingStatus::EnRoute, BookingStatus::NoShow)?;
            let eligible_at = record.booking.scheduled_at + config.booking.no_show_grace();
            if now < eligible_at {
                return Err(BookingError::NoShowTooEarly { eligible_at });
            }

            record
                .booking
                .transition(BookingStatus::NoShow, Actor::Provider, now)?;
            effects.disarm(DeadlineKind::NoShow);

            let account = funded(&mut record.escrow)?;
            let penalty = percent_of(
                account.commitment_fee,
                config.fees.client_no_show_forfeit_percent,
            )
            .min(account.remaining());
            account.release_balance(
                penalty,
                MovementReason::NoShowPenalty,
                Authority::Standard,
                now,
            )?;
            let refund = account.remaining();
            if refund > 0 {
                account.refund(refund, MovementReason::NoShowRefund, Authority::Standard, now)?;
            }
            Ok(NoShowSettlement { penalty, refund })
        })
    }

    /// Apply a timer delivered by the scheduler. Deliveries that no longer match the armed
    /// deadline are absorbed as stale.
    pub fn handle_deadline(
        &self,
        deadline: &Deadline,
        now: DateTime<Utc>,
    ) -> Result<DeadlineOutcome, BookingError> {
        if now < deadline.due_at {
            return Ok(DeadlineOutcome::NotYetDue);
        }

        let due = deadline.due_at;
        let outcome = self.mutate(&deadline.booking_id, now, |record, config, effects| {
            match deadline.kind {
                DeadlineKind::ProviderConfirmation => expire_confirmation(record, due, now),
                DeadlineKind::NoShow => provider_no_show(record, config, effects, due, now),
                DeadlineKind::ObservationExpiry => expire_observation(record, due, now),
                DeadlineKind::ProviderResponse => {
                    breach_sla(record, effects, SlaKind::ProviderResponse, due, now)
                }
                DeadlineKind::FixDeadline => {
                    breach_sla(record, effects, SlaKind::FixDeadline, due, now)
                }
                DeadlineKind::MiniObservationExpiry => accept_fix(record, effects, due, now),
            }
        });

        match outcome {
            Err(BookingError::NotFound(_)) => Ok(DeadlineOutcome::Stale),
            other => other,
        }
    }

    /// Record the payment rail's acknowledgement for a ledger entry.
    pub fn acknowledge_payment(
        &self,
        booking_id: &BookingId,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, BookingError> {
        self.mutate(booking_id, now, |record, _config, _effects| {
            Ok(funded(&mut record.escrow)?.acknowledge(reference, now)?)
        })
    }

    /// Resubmit every ledger entry the rail has not acknowledged yet.
    pub fn replay_unacknowledged(&self, booking_id: &BookingId) -> Result<usize, BookingError> {
        let record = self.fetch(booking_id)?;
        let Some(account) = record.escrow.as_ref() else {
            return Ok(0);
        };

        let mut submitted = 0;
        for entry in account.unacknowledged() {
            match self.outbound.payments.submit(record.instruction_for(entry)) {
                Ok(()) => submitted += 1,
                Err(err) => warn!(
                    booking_id = %booking_id,
                    reference = %entry.reference,
                    error = %err,
                    "payment replay failed"
                ),
            }
        }
        Ok(submitted)
    }

    pub fn fetch(&self, booking_id: &BookingId) -> Result<BookingRecord, BookingError> {
        self.repository
            .fetch(booking_id)?
            .ok_or_else(|| BookingError::NotFound(booking_id.clone()))
    }

    pub fn booking_view(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<BookingView, BookingError> {
        Ok(self.fetch(booking_id)?.view(now))
    }

    pub fn list_bookings(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<BookingView>, BookingError> {
        Ok(self
            .repository
            .list(limit)?
            .iter()
            .map(|record| record.view(now))
            .collect())
    }

    /// Run `apply` against a copy of the record while holding the booking lock. The copy is
    /// persisted only when `apply` succeeds; notifications and payment instructions are
    /// dispatched after the lock is released.
    pub(crate) fn mutate<T>(
        &self,
        booking_id: &BookingId,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut BookingRecord, &EngineConfig, &mut Effects) -> Result<T, BookingError>,
    ) -> Result<T, BookingError> {
        let lock = self.lock_for(booking_id);
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let original = self.fetch(booking_id)?;
        let config = self.config_version(original.booking.config_version)?;
        let mut record = original.clone();
        let mut effects = Effects::default();

        let value = apply(&mut record, config.as_ref(), &mut effects)?;

        if record != original {
            self.repository.update(record.clone())?;
        }
        if let Some(entry) = effects.audit.take() {
            self.commit_audit(&original, entry)?;
        }
        self.apply_deadlines(booking_id, &effects)?;
        drop(guard);

        if record.booking.status.is_terminal() {
            self.release_lock(booking_id, &lock);
        }
        self.dispatch(&original, &record, effects.events, now);
        Ok(value)
    }

    fn commit_audit(
        &self,
        original: &BookingRecord,
        entry: AuditRecord,
    ) -> Result<(), BookingError> {
        info!(
            booking_id = %entry.booking_id,
            actor = %entry.actor,
            action = entry.action.label(),
            reason = %entry.reason,
            amount = ?entry.amount,
            bypassed_ordering = entry.bypassed_ordering,
            "admin override"
        );
        let booking_id = entry.booking_id.clone();
        if let Err(err) = self.outbound.audit.record(entry) {
            if let Err(restore) = self.repository.update(original.clone()) {
                warn!(
                    booking_id = %booking_id,
                    error = %restore,
                    "could not restore booking after audit failure"
                );
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn lock_for(&self, booking_id: &BookingId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(booking_id.clone()).or_default().clone()
    }

    /// Drop the lock of a settled booking unless another caller is waiting on it. Later
    /// calls for the same id get a fresh lock.
    fn release_lock(&self, booking_id: &BookingId, held: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = locks
            .get(booking_id)
            .is_some_and(|lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(booking_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn apply_deadlines(&self, booking_id: &BookingId, effects: &Effects) -> Result<(), BookingError> {
        for kind in &effects.cancel {
            self.deadlines.cancel(booking_id, *kind)?;
        }
        for (kind, due_at) in &effects.schedule {
            debug!(booking_id = %booking_id, kind = kind.label(), %due_at, "deadline armed");
            self.deadlines.schedule(Deadline {
                booking_id: booking_id.clone(),
                kind: *kind,
                due_at: *due_at,
            })?;
        }
        Ok(())
    }

    /// Mirror committed changes to the notification service and the payment rail. Failures
    /// are logged and never undo the transition.
    fn dispatch(
        &self,
        before: &BookingRecord,
        after: &BookingRecord,
        extra: Vec<BookingEvent>,
        now: DateTime<Utc>,
    ) {
        let booking_id = &after.booking.id;
        let mut events = Vec::new();

        for change in after.booking.history.iter().skip(before.booking.history.len()) {
            info!(
                booking_id = %booking_id,
                from = change.from.label(),
                to = change.to.label(),
                actor = change.actor.label(),
                "booking status changed"
            );
            events.push(
                BookingEvent::transition(
                    EventTopic::BookingStatusChanged,
                    booking_id,
                    change.from.label(),
                    change.to.label(),
                    change.at,
                )
                .with_detail("actor", change.actor.label()),
            );
        }

        let escrow_before = before.escrow.as_ref().map(|account| account.status);
        if let Some(account) = after.escrow.as_ref() {
            if escrow_before != Some(account.status) {
                let from = escrow_before.map_or("unfunded", |status| status.label());
                info!(
                    booking_id = %booking_id,
                    from,
                    to = account.status.label(),
                    released = account.released_to_date,
                    refunded = account.refunded_to_date,
                    "escrow status changed"
                );
                events.push(BookingEvent::transition(
                    EventTopic::EscrowStatusChanged,
                    booking_id,
                    from,
                    account.status.label(),
                    now,
                ));
            }

            let seen = before.escrow.as_ref().map_or(0, |prior| prior.entries.len());
            for entry in account.entries.iter().skip(seen) {
                info!(
                    booking_id = %booking_id,
                    reference = %entry.reference,
                    amount = entry.amount,
                    reason = entry.reason.label(),
                    "ledger movement committed"
                );
                if let Err(err) = self.outbound.payments.submit(after.instruction_for(entry)) {
                    warn!(
                        booking_id = %booking_id,
                        reference = %entry.reference,
                        error = %err,
                        "payment instruction not accepted; left for replay"
                    );
                }
            }
        }

        if let Some(case) = after.case.as_ref() {
            let prior = before.case.as_ref();
            if prior.is_none() {
                events.push(
                    BookingEvent::transition(
                        EventTopic::RectificationStatusChanged,
                        booking_id,
                        "none",
                        RectificationStatus::Reported.label(),
                        case.opened_at,
                    )
                    .with_detail("case_id", &case.id.0),
                );
            }
            let seen = prior.map_or(0, |prior| prior.history.len());
            for change in case.history.iter().skip(seen) {
                info!(
                    booking_id = %booking_id,
                    case_id = %case.id.0,
                    from = change.from.label(),
                    to = change.to.label(),
                    "rectification status changed"
                );
                events.push(
                    BookingEvent::transition(
                        EventTopic::RectificationStatusChanged,
                        booking_id,
                        change.from.label(),
                        change.to.label(),
                        change.at,
                    )
                    .with_detail("case_id", &case.id.0),
                );
                if change.to == RectificationStatus::Escalated {
                    let reason = case
                        .escalation
                        .as_ref()
                        .map_or("unknown", |escalation| escalation.reason.label());
                    events.push(
                        BookingEvent::signal(EventTopic::RectificationEscalated, booking_id, change.at)
                            .with_detail("case_id", &case.id.0)
                            .with_detail("reason", reason),
                    );
                }
            }
        }

        events.extend(extra);
        for event in events {
            let topic = event.topic.label();
            if let Err(err) = self.outbound.events.publish(event) {
                warn!(booking_id = %booking_id, topic, error = %err, "event publish failed");
            }
        }
    }
}

fn validate_request(request: &NewBooking, now: DateTime<Utc>) -> Result<(), BookingError> {
    if request.total_price == 0 {
        return Err(BookingError::Validation(
            "total price must be greater than zero".to_string(),
        ));
    }
    if request.scheduled_at <= now {
        return Err(BookingError::Validation(
            "scheduled time must be in the future".to_string(),
        ));
    }
    if let Some(location) = request.location.as_ref() {
        if !location.point.is_valid() {
            return Err(BookingError::Validation(
                "service location coordinates are out of range".to_string(),
            ));
        }
        if location
            .radius_meters
            .is_some_and(|radius| !radius.is_finite() || radius <= 0.0)
        {
            return Err(BookingError::Validation(
                "service location radius must be positive".to_string(),
            ));
        }
    }
    Ok(())
}

pub(crate) fn funded(
    escrow: &mut Option<EscrowAccount>,
) -> Result<&mut EscrowAccount, BookingError> {
    escrow
        .as_mut()
        .ok_or(BookingError::Escrow(EscrowError::NotFunded))
}

fn open_case(
    case: &mut Option<RectificationCase>,
) -> Result<&mut RectificationCase, BookingError> {
    case.as_mut().ok_or(BookingError::NoRectificationCase)
}

pub(crate) fn disarm_case_deadlines(effects: &mut Effects) {
    effects.disarm(DeadlineKind::ProviderResponse);
    effects.disarm(DeadlineKind::FixDeadline);
    effects.disarm(DeadlineKind::MiniObservationExpiry);
}

fn cancellation_stage(
    status: BookingStatus,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> CancellationStage {
    match status {
        BookingStatus::Pending | BookingStatus::Confirmed => {
            if scheduled_at - now > Duration::hours(24) {
                CancellationStage::Before24h
            } else {
                CancellationStage::Within24h
            }
        }
        BookingStatus::ProviderConfirmed => CancellationStage::AfterProviderConfirmed,
        BookingStatus::EnRoute => CancellationStage::AfterEnRoute,
        _ => CancellationStage::AfterCheckedIn,
    }
}

fn quote(
    record: &BookingRecord,
    config: &EngineConfig,
    by: CancellingParty,
    now: DateTime<Utc>,
) -> CancellationQuote {
    let status = record.booking.status;
    let stage = cancellation_stage(status, record.booking.scheduled_at, now);
    let (commitment_fee, held) = record
        .escrow
        .as_ref()
        .map_or((0, 0), |account| (account.commitment_fee, account.remaining()));

    let fee = match by {
        CancellingParty::Client => config.fees.cancellation_fee(stage, commitment_fee).min(held),
        CancellingParty::Provider => 0,
    };

    CancellationQuote {
        status,
        stage,
        fee,
        refund: held - fee,
        allowed: status.is_before_check_in(),
        free_of_charge: fee == 0,
    }
}

fn expire_confirmation(
    record: &mut BookingRecord,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DeadlineOutcome, BookingError> {
    if record.booking.status != BookingStatus::Confirmed
        || record.booking.confirmation_due_at != Some(due)
    {
        return Ok(DeadlineOutcome::Stale);
    }
    if funded(&mut record.escrow)?.is_frozen() {
        info!(
            booking_id = %record.booking.id,
            "confirmation expired while escrow frozen; deferred"
        );
        return Ok(DeadlineOutcome::Deferred);
    }

    record
        .booking
        .transition(BookingStatus::Cancelled, Actor::Scheduler, now)?;
    let account = funded(&mut record.escrow)?;
    let remaining = account.remaining();
    account.refund(
        remaining,
        MovementReason::CancellationRefund,
        Authority::Standard,
        now,
    )?;
    info!(booking_id = %record.booking.id, "provider did not confirm in time; refunded");
    Ok(DeadlineOutcome::Applied)
}

fn provider_no_show(
    record: &mut BookingRecord,
    config: &EngineConfig,
    effects: &mut Effects,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DeadlineOutcome, BookingError> {
    if record.booking.status != BookingStatus::EnRoute
        || record.booking.no_show_due_at != Some(due)
    {
        return Ok(DeadlineOutcome::Stale);
    }
    if funded(&mut record.escrow)?.is_frozen() {
        info!(
            booking_id = %record.booking.id,
            "no-show grace elapsed while escrow frozen; deferred"
        );
        return Ok(DeadlineOutcome::Deferred);
    }

    record
        .booking
        .transition(BookingStatus::NoShow, Actor::Scheduler, now)?;
    let account = funded(&mut record.escrow)?;
    let forfeited = percent_of(
        account.commitment_fee,
        config.fees.provider_no_show_forfeit_percent,
    );
    let remaining = account.remaining();
    account.refund(
        remaining,
        MovementReason::NoShowRefund,
        Authority::Standard,
        now,
    )?;

    effects.signal(
        BookingEvent::signal(EventTopic::ProviderNoShow, &record.booking.id, now)
            .with_detail("provider_id", &record.booking.provider_id.0)
            .with_detail("forfeited_commitment", forfeited),
    );
    warn!(
        booking_id = %record.booking.id,
        provider_id = %record.booking.provider_id.0,
        forfeited,
        "provider no-show recorded"
    );
    Ok(DeadlineOutcome::Applied)
}

fn expire_observation(
    record: &mut BookingRecord,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DeadlineOutcome, BookingError> {
    if record.booking.status != BookingStatus::Observation
        || record.booking.observation_ends_at != Some(due)
    {
        return Ok(DeadlineOutcome::Stale);
    }

    let account = funded(&mut record.escrow)?;
    if account.is_frozen() {
        info!(booking_id = %record.booking.id, "observation elapsed while escrow frozen; deferred");
        return Ok(DeadlineOutcome::Deferred);
    }

    let remaining = account.remaining();
    account.release_balance(
        remaining,
        MovementReason::ObservationElapsed,
        Authority::Standard,
        now,
    )?;
    record
        .booking
        .transition(BookingStatus::Paid, Actor::Scheduler, now)?;
    record
        .booking
        .transition(BookingStatus::Completed, Actor::Scheduler, now)?;
    Ok(DeadlineOutcome::Applied)
}

fn breach_sla(
    record: &mut BookingRecord,
    effects: &mut Effects,
    sla: SlaKind,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DeadlineOutcome, BookingError> {
    let Some(case) = record.case.as_mut() else {
        return Ok(DeadlineOutcome::Stale);
    };
    let breached = match sla {
        SlaKind::ProviderResponse => case.provider_response_breached(due),
        SlaKind::FixDeadline => case.fix_deadline_breached(due),
    };
    if !breached {
        return Ok(DeadlineOutcome::Stale);
    }

    case.escalate(EscalationReason::SlaBreach { sla }, now)?;
    disarm_case_deadlines(effects);
    warn!(
        booking_id = %record.booking.id,
        case_id = %case.id.0,
        sla = ?sla,
        "rectification SLA breached; escalated"
    );
    Ok(DeadlineOutcome::Applied)
}

fn accept_fix(
    record: &mut BookingRecord,
    effects: &mut Effects,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DeadlineOutcome, BookingError> {
    let Some(case) = record.case.as_mut() else {
        return Ok(DeadlineOutcome::Stale);
    };
    if !case.mini_observation_elapsed(due) {
        return Ok(DeadlineOutcome::Stale);
    }

    let account = funded(&mut record.escrow)?;
    account.unfreeze()?;
    let released = account.remaining();
    account.release_balance(
        released,
        MovementReason::FixAccepted,
        Authority::Standard,
        now,
    )?;
    case.accept_fix(released, now)?;
    record
        .booking
        .transition(BookingStatus::Completed, Actor::Scheduler, now)?;

    effects.signal(
        BookingEvent::signal(EventTopic::ProviderDisputeOutcome, &record.booking.id, now)
            .with_detail("provider_id", &record.booking.provider_id.0)
            .with_detail("outcome", Ruling::FixAccepted.label()),
    );
    Ok(DeadlineOutcome::Applied)
}

/// Error raised by the booking engine.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("booking {0} not found")]
    NotFound(BookingId),
    #[error("cannot move booking from {} to {}", .from.label(), .to.label())]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("{operation} is not allowed while booking is {}", .status.label())]
    NotAllowed {
        status: BookingStatus,
        operation: &'static str,
    },
    #[error(transparent)]
    Escrow(#[from] EscrowError),
    #[error("check-in failed: {0}")]
    VerificationFailed(VerificationFailure),
    #[error(transparent)]
    Rectification(#[from] RectificationError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("{0}")]
    Validation(String),
    #[error("price cannot change once escrow is funded")]
    PriceLocked,
    #[error("provider confirmation window closed at {due_at}")]
    ConfirmationExpired { due_at: DateTime<Utc> },
    #[error("observation window closed at {ended_at}")]
    ObservationClosed { ended_at: DateTime<Utc> },
    #[error("client no-show can be reported from {eligible_at}")]
    NoShowTooEarly { eligible_at: DateTime<Utc> },
    #[error("milestone phase {phase} is released when observation ends")]
    MilestoneHeldForObservation { phase: u32 },
    #[error("booking has no rectification case")]
    NoRectificationCase,
    #[error("rectification case is {} and cannot be ruled on", .status.label())]
    CaseNotEscalated { status: RectificationStatus },
    #[error("escrow stays frozen while a rectification case is open")]
    CaseOpen,
    #[error("admin overrides require a reason")]
    MissingReason,
    #[error("engine policy version {0} is not registered")]
    UnknownConfigVersion(u32),
    #[error("policy version {offered} is not newer than current version {current}")]
    StaleConfigVersion { current: u32, offered: u32 },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<InvalidTransition> for BookingError {
    fn from(err: InvalidTransition) -> Self {
        BookingError::InvalidTransition {
            from: err.from,
            to: err.to,
        }
    }
}

impl BookingError {
    /// Stable machine-readable reason for API responses.
    pub fn reason(&self) -> &'static str {
        match self {
            BookingError::NotFound(_) => "not_found",
            BookingError::InvalidTransition { .. } => "invalid_transition",
            BookingError::NotAllowed { .. } => "not_allowed",
            BookingError::Escrow(EscrowError::InsufficientEscrow { .. }) => "insufficient_escrow",
            BookingError::Escrow(EscrowError::AlreadyFunded) => "already_funded",
            BookingError::Escrow(EscrowError::OutOfOrder { .. }) => "out_of_order",
            BookingError::Escrow(EscrowError::Frozen) => "escrow_frozen",
            BookingError::Escrow(_) => "escrow_conflict",
            BookingError::VerificationFailed(failure) => failure.code(),
            BookingError::Rectification(_) => "rectification_conflict",
            BookingError::Policy(_) => "invalid_policy",
            BookingError::Validation(_) => "validation",
            BookingError::PriceLocked => "price_locked",
            BookingError::ConfirmationExpired { .. } => "confirmation_expired",
            BookingError::ObservationClosed { .. } => "observation_closed",
            BookingError::NoShowTooEarly { .. } => "no_show_too_early",
            BookingError::MilestoneHeldForObservation { .. } => "milestone_held",
            BookingError::NoRectificationCase => "no_rectification_case",
            BookingError::CaseNotEscalated { .. } => "case_not_escalated",
            BookingError::CaseOpen => "case_open",
            BookingError::MissingReason => "missing_reason",
            BookingError::UnknownConfigVersion(_) => "unknown_policy_version",
            BookingError::StaleConfigVersion { .. } => "stale_policy_version",
            BookingError::Repository(_) => "repository_unavailable",
        }
    }
}
