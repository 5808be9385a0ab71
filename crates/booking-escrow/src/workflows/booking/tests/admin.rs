use std::sync::Arc;

use super::common::*;
use chrono::Duration;

use crate::workflows::booking::admin::{AdminRequest, ReleaseTarget};
use crate::workflows::booking::domain::{BookingId, BookingStatus};
use crate::workflows::booking::memory::{
    MemoryAuditLog, MemoryDeadlineStore, MemoryEventPublisher, MemoryPaymentRail,
};
use crate::workflows::booking::repository::{AdminAction, EventTopic, RepositoryError};
use crate::workflows::booking::scheduler::DeadlineOutcome;
use crate::workflows::booking::service::{BookingEngine, BookingError, CheckInRequest, Outbound};
use crate::workflows::checkin::ReportedLocation;
use crate::workflows::escrow::{EscrowError, EscrowStatus, MilestoneId, MovementReason};
use crate::workflows::policy::{EngineConfig, ServiceTier};
use crate::workflows::rectification::{RectificationStatus, Ruling};

fn ops(reason: &str) -> AdminRequest {
    AdminRequest {
        actor: "ops-jordan".to_string(),
        reason: reason.to_string(),
    }
}

async fn check_in_on_site(harness: &Harness, id: &BookingId) {
    let issued = harness
        .engine
        .issue_check_in_code(id, scheduled() - Duration::minutes(10))
        .expect("code issued");
    harness
        .engine
        .check_in(
            id,
            &CheckInRequest {
                code: issued.code,
                location: Some(site()),
            },
            &ReportedLocation(Some(site())),
            scheduled() - Duration::minutes(5),
        )
        .await
        .expect("check-in passes");
}

#[tokio::test]
async fn ruling_splits_escalated_escrow_between_parties() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    let reported_at = ends - Duration::days(4);
    harness
        .engine
        .report_issue(&id, issue("window seal missing"), reported_at)
        .expect("issue accepted");
    harness
        .scheduler()
        .run_due(reported_at + Duration::hours(24))
        .expect("sla breach applied");

    let ruled_at = reported_at + Duration::days(2);
    let outcome = harness
        .engine
        .rule_on_escalation(&id, ops("partial refund agreed on call"), 30_000, ruled_at)
        .expect("ruling applied");
    assert_eq!(outcome.action, AdminAction::RuleOnEscalation);
    assert_eq!(outcome.booking_status, BookingStatus::Completed);
    assert_eq!(outcome.escrow_status, EscrowStatus::Released);

    let record = harness.record(&id);
    let escrow = record.escrow.expect("escrow funded");
    assert_eq!(escrow.refunded_to_date, 30_000);
    assert_eq!(escrow.released_to_date, 70_000);
    assert_eq!(escrow.remaining(), 0);

    let case = record.case.expect("case kept");
    assert_eq!(case.status, RectificationStatus::Resolved);
    let resolution = case.resolution.expect("resolution recorded");
    assert!(matches!(resolution.ruling, Ruling::AdminSplit { .. }));
    assert_eq!(resolution.refund_amount, 30_000);
    assert_eq!(resolution.released_amount, 45_000);

    let last = record.booking.history.last().expect("history recorded");
    assert_eq!(last.to, BookingStatus::Completed);
    assert_eq!(last.actor.label(), "ops-jordan");

    let audit = harness.audit.entries();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AdminAction::RuleOnEscalation);
    assert_eq!(audit[0].reason, "partial refund agreed on call");
    assert_eq!(audit[0].amount, Some(30_000));

    let outcome = harness.events_for(&id, EventTopic::ProviderDisputeOutcome);
    assert_eq!(
        outcome[0].details.get("released").map(String::as_str),
        Some("45000")
    );
}

#[tokio::test]
async fn ruling_requires_an_escalated_case() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;

    assert!(matches!(
        harness.engine.rule_on_escalation(&id, ops("no case"), 0, ends),
        Err(BookingError::NoRectificationCase)
    ));

    harness
        .engine
        .report_issue(&id, issue("door squeaks"), ends - Duration::days(1))
        .expect("issue accepted");
    assert!(matches!(
        harness
            .engine
            .rule_on_escalation(&id, ops("too early"), 0, ends),
        Err(BookingError::CaseNotEscalated {
            status: RectificationStatus::ProviderNotified
        })
    ));
    assert!(harness.audit.entries().is_empty());
}

#[tokio::test]
async fn overrides_without_a_reason_are_refused() {
    let harness = harness();
    let id = harness.confirmed(ServiceTier::One, 20_000);

    assert!(matches!(
        harness.engine.force_freeze(&id, ops("   "), t0()),
        Err(BookingError::MissingReason)
    ));
    assert!(matches!(
        harness.engine.force_refund(
            &id,
            AdminRequest {
                actor: String::new(),
                reason: "chargeback".to_string(),
            },
            None,
            t0()
        ),
        Err(BookingError::Validation(_))
    ));
    assert!(harness.audit.entries().is_empty());
    assert_eq!(harness.escrow(&id).status, EscrowStatus::Held);
}

#[tokio::test]
async fn overrides_cannot_move_more_than_remains() {
    let harness = harness();
    let id = harness.checked_in(ServiceTier::Two, 100_000).await;

    let err = harness
        .engine
        .force_release(
            &id,
            ops("pay provider early"),
            ReleaseTarget::Balance {
                amount: Some(80_000),
            },
            scheduled(),
        )
        .expect_err("overdraw refused");
    assert!(matches!(
        err,
        BookingError::Escrow(EscrowError::InsufficientEscrow {
            requested: 80_000,
            remaining: 75_000
        })
    ));

    let escrow = harness.escrow(&id);
    assert_eq!(escrow.released_to_date, 25_000);
    assert!(harness.audit.entries().is_empty());
}

#[tokio::test]
async fn out_of_order_milestone_release_is_audited() {
    let harness = harness();
    let id = harness.in_progress(ServiceTier::Four, 100_000).await;

    let outcome = harness
        .engine
        .force_release(
            &id,
            ops("final phase inspected early"),
            ReleaseTarget::Milestone {
                milestone_id: MilestoneId("ms-3".to_string()),
            },
            scheduled() + Duration::hours(2),
        )
        .expect("override releases milestone");
    assert!(outcome.bypassed_ordering);
    assert_eq!(outcome.amount, 30_000);

    let audit = harness.audit.entries();
    assert_eq!(audit.len(), 1);
    assert!(audit[0].bypassed_ordering);
    assert_eq!(audit[0].milestone_phase, Some(3));

    let escrow = harness.escrow(&id);
    assert_eq!(escrow.released_to_date, 45_000);
    assert_eq!(escrow.status, EscrowStatus::MilestonePartial);
}

#[tokio::test]
async fn freeze_defers_observation_until_lifted() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::One, 40_000).await;

    harness
        .engine
        .force_freeze(&id, ops("payment dispute opened"), ends - Duration::hours(6))
        .expect("frozen");
    assert_eq!(harness.escrow(&id).status, EscrowStatus::Frozen);

    let report = harness.scheduler().run_due(ends).expect("scheduler runs");
    assert_eq!(report.deferred, 1);
    assert_eq!(harness.record(&id).booking.status, BookingStatus::Observation);
    assert!(harness.deadlines.is_empty());

    harness
        .engine
        .lift_freeze(&id, ops("dispute withdrawn"), ends + Duration::hours(1))
        .expect("unfrozen");
    assert_eq!(harness.escrow(&id).status, EscrowStatus::ObservationActive);
    assert_eq!(harness.deadlines.len(), 1);

    let report = harness
        .scheduler()
        .run_due(ends + Duration::hours(1))
        .expect("scheduler runs");
    assert_eq!(report.applied, 1);
    assert_eq!(harness.record(&id).booking.status, BookingStatus::Completed);
    assert_eq!(harness.escrow(&id).status, EscrowStatus::AutoReleased);

    let actions: Vec<AdminAction> = harness
        .audit
        .entries()
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    assert_eq!(actions, vec![AdminAction::ForceFreeze, AdminAction::LiftFreeze]);
}

#[tokio::test]
async fn open_case_keeps_escrow_frozen() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    harness
        .engine
        .report_issue(&id, issue("leak under sink"), ends - Duration::days(1))
        .expect("issue accepted");

    assert!(matches!(
        harness.engine.lift_freeze(&id, ops("provider asked"), ends),
        Err(BookingError::CaseOpen)
    ));
    assert_eq!(harness.escrow(&id).status, EscrowStatus::Frozen);
}

#[tokio::test]
async fn failed_audit_write_aborts_the_override() {
    let (engine, _events) = engine_with(
        Arc::new(MemoryPaymentRail::default()),
        Arc::new(FailingAuditLog),
    );
    let id = engine
        .create_booking(new_booking(ServiceTier::One, 20_000), t0())
        .expect("booking created")
        .booking
        .id;
    engine.confirm_booking(&id, t0()).expect("confirmed");

    let err = engine
        .force_refund(&id, ops("goodwill"), None, t0() + Duration::hours(2))
        .expect_err("audit failure aborts");
    assert!(matches!(
        err,
        BookingError::Repository(RepositoryError::Unavailable(_))
    ));

    let record = engine.fetch(&id).expect("record exists");
    assert_eq!(record.booking.status, BookingStatus::Confirmed);
    let escrow = record.escrow.expect("escrow funded");
    assert_eq!(escrow.status, EscrowStatus::Held);
    assert_eq!(escrow.refunded_to_date, 0);
    assert!(escrow.entries.is_empty());
}

#[tokio::test]
async fn full_refund_cancels_the_booking() {
    let harness = harness();
    let id = harness.confirmed(ServiceTier::Three, 50_000);

    let outcome = harness
        .engine
        .force_refund(&id, ops("provider banned"), None, t0() + Duration::hours(3))
        .expect("refunded");
    assert_eq!(outcome.amount, 50_000);
    assert_eq!(outcome.escrow_status, EscrowStatus::Refunded);
    assert_eq!(outcome.booking_status, BookingStatus::Cancelled);

    let record = harness.record(&id);
    let last = record.booking.history.last().expect("history recorded");
    assert_eq!(last.note.as_deref(), Some("provider banned"));
    assert!(harness.deadlines.is_empty());

    let outcome = harness
        .engine
        .handle_deadline(
            &crate::workflows::booking::repository::Deadline {
                booking_id: id.clone(),
                kind: crate::workflows::booking::repository::DeadlineKind::NoShow,
                due_at: scheduled() + Duration::minutes(30),
            },
            scheduled() + Duration::hours(1),
        )
        .expect("late delivery absorbed");
    assert_eq!(outcome, DeadlineOutcome::Stale);
}

#[tokio::test]
async fn check_in_after_an_admin_advance_pays_only_what_remains() {
    let harness = harness();
    let id = harness.en_route(ServiceTier::Two, 100_000);
    harness
        .engine
        .force_release(
            &id,
            ops("materials advance"),
            ReleaseTarget::Balance {
                amount: Some(90_000),
            },
            scheduled() - Duration::minutes(30),
        )
        .expect("advance paid");
    assert_eq!(harness.escrow(&id).status, EscrowStatus::Held);

    check_in_on_site(&harness, &id).await;

    let escrow = harness.escrow(&id);
    assert_eq!(escrow.released_to_date, 100_000);
    assert_eq!(escrow.remaining(), 0);
    assert_eq!(escrow.status, EscrowStatus::CommitmentReleased);
    let commitment = escrow
        .entries
        .iter()
        .find(|entry| entry.reason == MovementReason::CommitmentFee)
        .expect("commitment entry");
    assert_eq!(commitment.amount, 10_000);
    assert_eq!(harness.record(&id).booking.status, BookingStatus::CheckedIn);

    let view = harness
        .engine
        .booking_view(&id, scheduled())
        .expect("view renders");
    assert_eq!(view.escrow.expect("escrow shown").remaining, 0);
}

#[tokio::test]
async fn check_in_after_a_partial_refund_stays_within_escrow() {
    let harness = harness();
    let id = harness.en_route(ServiceTier::Two, 100_000);
    harness
        .engine
        .force_refund(
            &id,
            ops("scope reduced"),
            Some(90_000),
            scheduled() - Duration::minutes(30),
        )
        .expect("partial refund");

    check_in_on_site(&harness, &id).await;

    let escrow = harness.escrow(&id);
    assert_eq!(escrow.refunded_to_date, 90_000);
    assert_eq!(escrow.released_to_date, 10_000);
    assert_conserved(&escrow, "after check-in");
}

#[tokio::test]
async fn escrow_never_overdraws_across_overrides_and_lifecycle() {
    let harness = harness();
    let id = harness.en_route(ServiceTier::Two, 100_000);
    let before = scheduled() - Duration::minutes(30);

    harness
        .engine
        .force_release(
            &id,
            ops("deposit for parts"),
            ReleaseTarget::Balance {
                amount: Some(30_000),
            },
            before,
        )
        .expect("released");
    assert_conserved(&harness.escrow(&id), "admin release");

    harness
        .engine
        .force_refund(&id, ops("client dropped one room"), Some(20_000), before)
        .expect("refunded");
    assert_conserved(&harness.escrow(&id), "admin refund");

    check_in_on_site(&harness, &id).await;
    let escrow = harness.escrow(&id);
    assert_conserved(&escrow, "check-in");
    assert_eq!(escrow.released_to_date, 55_000);

    harness.engine.start_work(&id, scheduled()).expect("started");
    harness
        .engine
        .force_freeze(&id, ops("chargeback inquiry"), scheduled() + Duration::hours(1))
        .expect("frozen");
    harness
        .engine
        .lift_freeze(&id, ops("inquiry closed"), scheduled() + Duration::hours(2))
        .expect("unfrozen");
    assert_conserved(&harness.escrow(&id), "freeze cycle");

    let ends = harness
        .engine
        .mark_complete(&id, scheduled() + Duration::hours(4))
        .expect("completed");
    assert_conserved(&harness.escrow(&id), "observation");

    harness
        .engine
        .force_release(
            &id,
            ops("tip agreed by client"),
            ReleaseTarget::Balance {
                amount: Some(5_000),
            },
            ends - Duration::days(1),
        )
        .expect("released");
    assert_conserved(&harness.escrow(&id), "release during observation");

    let report = harness.scheduler().run_due(ends).expect("scheduler runs");
    assert_eq!(report.applied, 1);
    let escrow = harness.escrow(&id);
    assert_conserved(&escrow, "auto release");
    assert_eq!(escrow.status, EscrowStatus::AutoReleased);
    assert_eq!(escrow.released_to_date, 80_000);
    assert_eq!(escrow.refunded_to_date, 20_000);
    assert_eq!(harness.record(&id).booking.status, BookingStatus::Completed);
}

#[test]
fn audit_is_not_written_when_the_update_fails() {
    let repository = ReadOnlyAfterSwitch::default();
    let audit = MemoryAuditLog::default();
    let engine = BookingEngine::new(
        Arc::new(repository.clone()),
        Arc::new(MemoryDeadlineStore::default()),
        Outbound::new(
            Arc::new(MemoryEventPublisher::default()),
            Arc::new(MemoryPaymentRail::default()),
            Arc::new(audit.clone()),
        ),
        EngineConfig::standard(),
    )
    .expect("standard policy validates");
    let id = engine
        .create_booking(new_booking(ServiceTier::One, 20_000), t0())
        .expect("booking created")
        .booking
        .id;
    engine.confirm_booking(&id, t0()).expect("confirmed");

    repository.lock_writes();
    let err = engine
        .force_freeze(&id, ops("fraud review"), t0() + Duration::hours(1))
        .expect_err("update rejected");
    assert!(matches!(
        err,
        BookingError::Repository(RepositoryError::Unavailable(_))
    ));
    assert!(audit.entries().is_empty());
    assert_eq!(
        engine.fetch(&id).expect("record").escrow.expect("funded").status,
        EscrowStatus::Held
    );
}

#[test]
fn settled_bookings_release_their_lock() {
    let harness = harness();
    let live = harness.confirmed(ServiceTier::Two, 40_000);
    let settled = harness.confirmed(ServiceTier::Two, 60_000);
    assert_eq!(harness.engine.tracked_locks(), 2);

    harness
        .engine
        .force_refund(&settled, ops("duplicate booking"), None, t0() + Duration::hours(2))
        .expect("refunded");
    assert_eq!(harness.engine.tracked_locks(), 1);
    assert_eq!(harness.record(&settled).booking.status, BookingStatus::Cancelled);

    harness
        .engine
        .acknowledge_payment(&settled, &format!("{}-001", settled.0), t0() + Duration::hours(3))
        .expect("acknowledged after settlement");
    assert_eq!(harness.engine.tracked_locks(), 1);
    assert_eq!(harness.record(&live).booking.status, BookingStatus::ProviderConfirmed);
}
