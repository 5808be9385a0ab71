use super::common::*;
use chrono::Duration;

use crate::workflows::booking::domain::{Actor, BookingStatus};
use crate::workflows::booking::repository::{Deadline, DeadlineKind, DeadlineStore, EventTopic};
use crate::workflows::booking::scheduler::DeadlineOutcome;
use crate::workflows::booking::service::BookingError;
use crate::workflows::escrow::{EscrowStatus, MovementReason};
use crate::workflows::policy::ServiceTier;
use crate::workflows::rectification::{EscalationReason, RectificationStatus, SlaKind};

fn pending_kinds(harness: &Harness, id: &crate::workflows::booking::domain::BookingId) -> Vec<DeadlineKind> {
    harness
        .deadlines
        .pending_for(id)
        .expect("store readable")
        .into_iter()
        .map(|deadline| deadline.kind)
        .collect()
}

#[tokio::test]
async fn reported_issue_freezes_escrow_and_arms_sla_clocks() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    let reported_at = ends - Duration::days(3);

    let case = harness
        .engine
        .report_issue(&id, issue("grout cracked in the shower"), reported_at)
        .expect("issue accepted");
    assert_eq!(case.status, RectificationStatus::ProviderNotified);
    assert_eq!(case.attempts, 1);

    let record = harness.record(&id);
    assert_eq!(record.booking.status, BookingStatus::Disputed);
    assert_eq!(record.booking.observation_ends_at, None);
    assert_eq!(
        record.escrow.expect("escrow funded").status,
        EscrowStatus::Frozen
    );
    assert_eq!(
        pending_kinds(&harness, &id),
        vec![DeadlineKind::ProviderResponse, DeadlineKind::FixDeadline]
    );

    let view = harness.engine.booking_view(&id, reported_at).expect("view");
    let rectification = view.rectification.expect("case shown");
    assert_eq!(rectification.status_label, "provider_notified");
    assert_eq!(rectification.sla_deadline, Some(reported_at + Duration::hours(24)));
    assert_eq!(rectification.sla_hours_remaining, Some(24.0));
}

#[tokio::test]
async fn accepted_fix_releases_the_remaining_escrow() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    let reported_at = ends - Duration::days(2);

    harness
        .engine
        .report_issue(&id, issue("sink still leaking"), reported_at)
        .expect("issue accepted");
    harness
        .engine
        .schedule_fix(&id, reported_at + Duration::days(1), reported_at + Duration::hours(2))
        .expect("fix scheduled");
    harness
        .engine
        .start_fix(&id, reported_at + Duration::days(1))
        .expect("fix started");
    let case = harness
        .engine
        .complete_fix(&id, reported_at + Duration::days(1) + Duration::hours(3))
        .expect("fix completed");
    assert_eq!(case.status, RectificationStatus::MiniObservation);
    let mini_ends = case.mini_observation_ends.expect("mini observation armed");
    assert_eq!(pending_kinds(&harness, &id), vec![DeadlineKind::MiniObservationExpiry]);

    let report = harness.scheduler().run_due(mini_ends).expect("scheduler runs");
    assert_eq!(report.applied, 1);

    let record = harness.record(&id);
    assert_eq!(record.booking.status, BookingStatus::Completed);
    let escrow = record.escrow.expect("escrow funded");
    assert_eq!(escrow.status, EscrowStatus::Released);
    assert_eq!(escrow.released_to_date, 100_000);
    assert_eq!(
        escrow.entries.last().map(|entry| entry.reason),
        Some(MovementReason::FixAccepted)
    );
    let case = record.case.expect("case kept");
    assert_eq!(case.status, RectificationStatus::Resolved);

    let outcome = harness.events_for(&id, EventTopic::ProviderDisputeOutcome);
    assert_eq!(outcome.len(), 1);
    assert_eq!(
        outcome[0].details.get("outcome").map(String::as_str),
        Some("fix_accepted")
    );
    assert!(harness.deadlines.is_empty());
}

#[tokio::test]
async fn missed_provider_response_escalates_the_case() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    let reported_at = ends - Duration::days(4);
    harness
        .engine
        .report_issue(&id, issue("cabinet door off its hinge"), reported_at)
        .expect("issue accepted");

    let report = harness
        .scheduler()
        .run_due(reported_at + Duration::hours(24))
        .expect("scheduler runs");
    assert_eq!(report.applied, 1);

    let record = harness.record(&id);
    let case = record.case.expect("case kept");
    assert_eq!(case.status, RectificationStatus::Escalated);
    assert_eq!(
        case.escalation.map(|escalation| escalation.reason),
        Some(EscalationReason::SlaBreach {
            sla: SlaKind::ProviderResponse
        })
    );
    assert_eq!(record.booking.status, BookingStatus::Disputed);
    assert_eq!(
        record.escrow.expect("escrow funded").status,
        EscrowStatus::Frozen
    );
    assert!(harness.deadlines.is_empty());

    let escalated = harness.events_for(&id, EventTopic::RectificationEscalated);
    assert_eq!(escalated.len(), 1);
    assert_eq!(
        escalated[0].details.get("reason").map(String::as_str),
        Some("provider_response_sla")
    );
}

#[tokio::test]
async fn recurring_issue_escalates_once_attempts_are_spent() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    let mut now = ends - Duration::days(4);

    harness
        .engine
        .report_issue(&id, issue("paint peeling"), now)
        .expect("issue accepted");
    harness
        .engine
        .schedule_fix(&id, now + Duration::hours(6), now + Duration::hours(1))
        .expect("fix scheduled");

    for round in 1..=2 {
        now += Duration::hours(6);
        harness.engine.start_fix(&id, now).expect("fix started");
        now += Duration::hours(2);
        harness.engine.complete_fix(&id, now).expect("fix completed");
        now += Duration::hours(12);

        let case = harness
            .engine
            .report_issue(&id, issue("paint peeling again"), now)
            .expect("recurrence accepted");
        if round == 1 {
            assert_eq!(case.status, RectificationStatus::FixScheduled);
            assert_eq!(case.attempts, 2);
        } else {
            assert_eq!(case.status, RectificationStatus::Escalated);
            assert_eq!(case.attempts, 3);
            assert_eq!(
                case.escalation.map(|escalation| escalation.reason),
                Some(EscalationReason::AttemptsExhausted { attempts: 3 })
            );
        }
    }

    assert_eq!(harness.escrow(&id).status, EscrowStatus::Frozen);
    assert!(harness.deadlines.is_empty());
}

#[tokio::test]
async fn party_can_escalate_before_the_deadline() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Three, 60_000).await;
    let now = ends - Duration::days(1);
    harness
        .engine
        .report_issue(&id, issue("tiles uneven"), now)
        .expect("issue accepted");

    let case = harness
        .engine
        .escalate_case(&id, Actor::Client, "provider unreachable".to_string(), now + Duration::hours(2))
        .expect("escalated");
    assert_eq!(case.status, RectificationStatus::Escalated);
    assert!(matches!(
        case.escalation.map(|escalation| escalation.reason),
        Some(EscalationReason::Requested { by, .. }) if by == "client"
    ));

    assert!(matches!(
        harness.engine.start_fix(&id, now + Duration::hours(3)),
        Err(BookingError::Rectification(_))
    ));
}

#[tokio::test]
async fn issue_after_observation_window_is_rejected() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::One, 30_000).await;

    assert!(matches!(
        harness.engine.report_issue(&id, issue("too late"), ends),
        Err(BookingError::ObservationClosed { .. })
    ));
    assert!(matches!(
        harness
            .engine
            .report_issue(&id, issue("   "), ends - Duration::hours(1)),
        Err(BookingError::Validation(_))
    ));
    assert_eq!(harness.record(&id).booking.status, BookingStatus::Observation);
}

#[tokio::test]
async fn late_observation_delivery_after_dispute_is_stale() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    harness
        .engine
        .report_issue(&id, issue("light fixture flickers"), ends - Duration::minutes(1))
        .expect("issue accepted");

    let stale = Deadline {
        booking_id: id.clone(),
        kind: DeadlineKind::ObservationExpiry,
        due_at: ends,
    };
    let outcome = harness
        .engine
        .handle_deadline(&stale, ends + Duration::seconds(1))
        .expect("delivery handled");
    assert_eq!(outcome, DeadlineOutcome::Stale);

    let escrow = harness.escrow(&id);
    assert_eq!(escrow.status, EscrowStatus::Frozen);
    assert_eq!(escrow.released_to_date, 25_000);
}

#[tokio::test]
async fn replayed_deadline_is_applied_once() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    let deadline = Deadline {
        booking_id: id.clone(),
        kind: DeadlineKind::ObservationExpiry,
        due_at: ends,
    };

    let first = harness
        .engine
        .handle_deadline(&deadline, ends)
        .expect("first delivery");
    let second = harness
        .engine
        .handle_deadline(&deadline, ends + Duration::minutes(5))
        .expect("second delivery");
    assert_eq!(first, DeadlineOutcome::Applied);
    assert_eq!(second, DeadlineOutcome::Stale);

    let escrow = harness.escrow(&id);
    assert_eq!(escrow.released_to_date, 100_000);
    assert_eq!(escrow.entries.len(), 2);
    assert_eq!(harness.payments.instructions().len(), 2);
}

#[tokio::test]
async fn early_delivery_is_not_applied() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    let deadline = Deadline {
        booking_id: id.clone(),
        kind: DeadlineKind::ObservationExpiry,
        due_at: ends,
    };

    let outcome = harness
        .engine
        .handle_deadline(&deadline, ends - Duration::hours(1))
        .expect("delivery handled");
    assert_eq!(outcome, DeadlineOutcome::NotYetDue);
    assert_eq!(harness.record(&id).booking.status, BookingStatus::Observation);
}

#[tokio::test]
async fn fix_left_unfinished_past_the_deadline_waits_for_a_ruling() {
    let harness = harness();
    let (id, ends) = harness.in_observation(ServiceTier::Two, 100_000).await;
    let reported_at = ends - Duration::days(3);
    harness
        .engine
        .report_issue(&id, issue("tiles lifting by the door"), reported_at)
        .expect("issue accepted");
    harness
        .engine
        .schedule_fix(
            &id,
            reported_at + Duration::hours(30),
            reported_at + Duration::hours(10),
        )
        .expect("fix scheduled in time");
    harness
        .engine
        .start_fix(&id, reported_at + Duration::hours(30))
        .expect("fix started");
    let entries_before = harness.escrow(&id).entries.len();

    let report = harness
        .scheduler()
        .run_due(reported_at + Duration::hours(72))
        .expect("scheduler runs");
    assert_eq!(report.applied, 1);

    let record = harness.record(&id);
    let case = record.case.expect("case kept");
    assert_eq!(case.status, RectificationStatus::Escalated);
    assert_eq!(
        case.escalation.map(|escalation| escalation.reason),
        Some(EscalationReason::SlaBreach {
            sla: SlaKind::FixDeadline
        })
    );
    assert_eq!(record.booking.status, BookingStatus::Disputed);
    let escrow = record.escrow.expect("escrow funded");
    assert_eq!(escrow.status, EscrowStatus::Frozen);
    assert_eq!(escrow.entries.len(), entries_before);
    assert_eq!(escrow.released_to_date, 25_000);

    let report = harness
        .scheduler()
        .run_due(reported_at + Duration::days(10))
        .expect("scheduler runs");
    assert_eq!(report.delivered(), 0);
    assert_eq!(harness.escrow(&id).entries.len(), entries_before);
    assert_eq!(harness.record(&id).booking.status, BookingStatus::Disputed);

    harness
        .engine
        .rule_on_escalation(
            &id,
            crate::workflows::booking::admin::AdminRequest {
                actor: "ops-jordan".to_string(),
                reason: "provider abandoned the fix".to_string(),
            },
            50_000,
            reported_at + Duration::days(10),
        )
        .expect("ruling applied");
    let record = harness.record(&id);
    assert_eq!(record.booking.status, BookingStatus::Completed);
    let escrow = record.escrow.expect("escrow funded");
    assert_eq!(escrow.refunded_to_date, 50_000);
    assert_eq!(escrow.released_to_date, 50_000);
}
