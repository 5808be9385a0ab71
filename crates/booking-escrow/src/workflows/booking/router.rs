use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use super::admin::{AdminRequest, ReleaseTarget};
use super::domain::{Actor, BookingId, NewBooking};
use super::repository::{BookingRepository, DeadlineStore};
use super::service::{BookingEngine, BookingError, CancelRequest, CancellingParty, CheckInRequest};
use crate::workflows::checkin::ReportedLocation;
use crate::workflows::escrow::{EscrowError, MilestoneId};
use crate::workflows::policy::EngineConfig;
use crate::workflows::rectification::IssueReport;

type Engine<R, D> = Arc<BookingEngine<R, D>>;

/// Client and provider facing lifecycle endpoints.
pub fn booking_router<R, D>(engine: Engine<R, D>) -> Router
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    Router::new()
        .route(
            "/api/v1/bookings",
            post(create_handler::<R, D>).get(list_handler::<R, D>),
        )
        .route("/api/v1/bookings/:booking_id", get(view_handler::<R, D>))
        .route(
            "/api/v1/bookings/:booking_id/reprice",
            post(reprice_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/confirm",
            post(confirm_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/accept",
            post(accept_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/depart",
            post(depart_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/check-in/code",
            post(issue_code_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/check-in",
            post(check_in_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/start",
            post(start_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/milestones/:milestone_id/approve",
            post(approve_milestone_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/complete",
            post(complete_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/issues",
            post(report_issue_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/cancellation-quote/:party",
            get(quote_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/cancel",
            post(cancel_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/client-no-show",
            post(client_no_show_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/rectification/schedule",
            post(schedule_fix_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/rectification/start",
            post(start_fix_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/rectification/complete",
            post(complete_fix_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/rectification/escalate",
            post(escalate_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/payments/:reference/ack",
            post(acknowledge_payment_handler::<R, D>),
        )
        .route(
            "/api/v1/bookings/:booking_id/payments/replay",
            post(replay_payments_handler::<R, D>),
        )
        .with_state(engine)
}

/// Operator endpoints. Mount behind the admin authentication layer.
pub fn admin_router<R, D>(engine: Engine<R, D>) -> Router
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    Router::new()
        .route(
            "/api/v1/admin/bookings/:booking_id/release",
            post(force_release_handler::<R, D>),
        )
        .route(
            "/api/v1/admin/bookings/:booking_id/freeze",
            post(force_freeze_handler::<R, D>),
        )
        .route(
            "/api/v1/admin/bookings/:booking_id/unfreeze",
            post(lift_freeze_handler::<R, D>),
        )
        .route(
            "/api/v1/admin/bookings/:booking_id/refund",
            post(force_refund_handler::<R, D>),
        )
        .route(
            "/api/v1/admin/bookings/:booking_id/ruling",
            post(ruling_handler::<R, D>),
        )
        .route("/api/v1/admin/policy", post(publish_policy_handler::<R, D>))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepriceBody {
    total_price: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScheduleFixBody {
    fix_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EscalateBody {
    by: CancellingParty,
    note: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ForceReleaseBody {
    #[serde(flatten)]
    request: AdminRequest,
    #[serde(default)]
    milestone_id: Option<String>,
    #[serde(default)]
    amount: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ForceRefundBody {
    #[serde(flatten)]
    request: AdminRequest,
    #[serde(default)]
    amount: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RulingBody {
    #[serde(flatten)]
    request: AdminRequest,
    refund_amount: u64,
}

fn respond<T: Serialize>(result: Result<T, BookingError>, success: StatusCode) -> Response {
    match result {
        Ok(body) => (success, axum::Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Map engine failures onto HTTP. Infrastructure details stay in the logs.
pub(crate) fn error_response(err: BookingError) -> Response {
    let status = match &err {
        BookingError::NotFound(_) => StatusCode::NOT_FOUND,
        BookingError::VerificationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BookingError::Validation(_) | BookingError::MissingReason | BookingError::Policy(_) => {
            StatusCode::BAD_REQUEST
        }
        BookingError::Escrow(EscrowError::UnknownReference(_)) => StatusCode::NOT_FOUND,
        BookingError::Repository(_) | BookingError::UnknownConfigVersion(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::CONFLICT,
    };

    let mut payload = json!({
        "error": err.to_string(),
        "reason": err.reason(),
    });
    match &err {
        BookingError::InvalidTransition { from, to } => {
            payload["current_status"] = json!(from.label());
            payload["attempted_status"] = json!(to.label());
        }
        BookingError::VerificationFailed(failure) => {
            payload["detail"] = serde_json::to_value(failure).unwrap_or_default();
        }
        _ => {}
    }

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "booking request failed");
        payload = json!({
            "error": "temporarily unavailable, please retry",
            "reason": err.reason(),
        });
    }

    (status, axum::Json(payload)).into_response()
}

pub(crate) async fn create_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    axum::Json(request): axum::Json<NewBooking>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let now = Utc::now();
    respond(
        engine
            .create_booking(request, now)
            .map(|record| record.view(now)),
        StatusCode::CREATED,
    )
}

pub(crate) async fn list_handler<R, D>(State(engine): State<Engine<R, D>>) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(engine.list_bookings(100, Utc::now()), StatusCode::OK)
}

pub(crate) async fn view_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.booking_view(&BookingId(booking_id), Utc::now()),
        StatusCode::OK,
    )
}

pub(crate) async fn reprice_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(body): axum::Json<RepriceBody>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let now = Utc::now();
    respond(
        engine
            .reprice(&BookingId(booking_id), body.total_price, now)
            .map(|record| record.view(now)),
        StatusCode::OK,
    )
}

pub(crate) async fn confirm_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    respond(
        engine
            .confirm_booking(&id, now)
            .and_then(|_| engine.booking_view(&id, now)),
        StatusCode::OK,
    )
}

pub(crate) async fn accept_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    respond(
        engine
            .accept_booking(&id, now)
            .and_then(|()| engine.booking_view(&id, now)),
        StatusCode::OK,
    )
}

pub(crate) async fn depart_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    respond(
        engine
            .depart(&id, now)
            .and_then(|()| engine.booking_view(&id, now)),
        StatusCode::OK,
    )
}

pub(crate) async fn issue_code_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.issue_check_in_code(&BookingId(booking_id), Utc::now()),
        StatusCode::CREATED,
    )
}

pub(crate) async fn check_in_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(request): axum::Json<CheckInRequest>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let source = ReportedLocation(request.location);
    let result = engine
        .check_in(&BookingId(booking_id), &request, &source, Utc::now())
        .await;
    respond(result, StatusCode::OK)
}

pub(crate) async fn start_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    respond(
        engine
            .start_work(&id, now)
            .and_then(|()| engine.booking_view(&id, now)),
        StatusCode::OK,
    )
}

pub(crate) async fn approve_milestone_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path((booking_id, milestone_id)): Path<(String, String)>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.approve_milestone(
            &BookingId(booking_id),
            &MilestoneId(milestone_id),
            Utc::now(),
        ),
        StatusCode::OK,
    )
}

pub(crate) async fn complete_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    respond(
        engine
            .mark_complete(&id, now)
            .and_then(|_| engine.booking_view(&id, now)),
        StatusCode::OK,
    )
}

pub(crate) async fn report_issue_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(report): axum::Json<IssueReport>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    respond(
        engine
            .report_issue(&id, report, now)
            .and_then(|_| engine.booking_view(&id, now)),
        StatusCode::CREATED,
    )
}

pub(crate) async fn quote_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path((booking_id, party)): Path<(String, CancellingParty)>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.cancellation_quote(&BookingId(booking_id), party, Utc::now()),
        StatusCode::OK,
    )
}

pub(crate) async fn cancel_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(request): axum::Json<CancelRequest>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.cancel(&BookingId(booking_id), request, Utc::now()),
        StatusCode::OK,
    )
}

pub(crate) async fn client_no_show_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.report_client_no_show(&BookingId(booking_id), Utc::now()),
        StatusCode::OK,
    )
}

pub(crate) async fn schedule_fix_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(body): axum::Json<ScheduleFixBody>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    respond(
        engine
            .schedule_fix(&id, body.fix_at, now)
            .and_then(|_| engine.booking_view(&id, now)),
        StatusCode::OK,
    )
}

pub(crate) async fn start_fix_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    respond(
        engine
            .start_fix(&id, now)
            .and_then(|_| engine.booking_view(&id, now)),
        StatusCode::OK,
    )
}

pub(crate) async fn complete_fix_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    respond(
        engine
            .complete_fix(&id, now)
            .and_then(|_| engine.booking_view(&id, now)),
        StatusCode::OK,
    )
}

pub(crate) async fn escalate_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(body): axum::Json<EscalateBody>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let id = BookingId(booking_id);
    let now = Utc::now();
    let by = match body.by {
        CancellingParty::Client => Actor::Client,
        CancellingParty::Provider => Actor::Provider,
    };
    respond(
        engine
            .escalate_case(&id, by, body.note, now)
            .and_then(|_| engine.booking_view(&id, now)),
        StatusCode::OK,
    )
}

pub(crate) async fn acknowledge_payment_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path((booking_id, reference)): Path<(String, String)>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine
            .acknowledge_payment(&BookingId(booking_id), &reference, Utc::now())
            .map(|recorded| json!({ "reference": reference, "newly_acknowledged": recorded })),
        StatusCode::OK,
    )
}

pub(crate) async fn replay_payments_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine
            .replay_unacknowledged(&BookingId(booking_id))
            .map(|resubmitted| json!({ "resubmitted": resubmitted })),
        StatusCode::ACCEPTED,
    )
}

pub(crate) async fn force_release_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(body): axum::Json<ForceReleaseBody>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    let target = match body.milestone_id {
        Some(milestone_id) => ReleaseTarget::Milestone {
            milestone_id: MilestoneId(milestone_id),
        },
        None => ReleaseTarget::Balance {
            amount: body.amount,
        },
    };
    respond(
        engine.force_release(&BookingId(booking_id), body.request, target, Utc::now()),
        StatusCode::OK,
    )
}

pub(crate) async fn force_freeze_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(request): axum::Json<AdminRequest>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.force_freeze(&BookingId(booking_id), request, Utc::now()),
        StatusCode::OK,
    )
}

pub(crate) async fn lift_freeze_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(request): axum::Json<AdminRequest>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.lift_freeze(&BookingId(booking_id), request, Utc::now()),
        StatusCode::OK,
    )
}

pub(crate) async fn force_refund_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(body): axum::Json<ForceRefundBody>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.force_refund(&BookingId(booking_id), body.request, body.amount, Utc::now()),
        StatusCode::OK,
    )
}

pub(crate) async fn ruling_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    Path(booking_id): Path<String>,
    axum::Json(body): axum::Json<RulingBody>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine.rule_on_escalation(
            &BookingId(booking_id),
            body.request,
            body.refund_amount,
            Utc::now(),
        ),
        StatusCode::OK,
    )
}

pub(crate) async fn publish_policy_handler<R, D>(
    State(engine): State<Engine<R, D>>,
    axum::Json(config): axum::Json<EngineConfig>,
) -> Response
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    respond(
        engine
            .publish_config(config)
            .map(|version| json!({ "version": version })),
        StatusCode::CREATED,
    )
}
