use crate::infra::{LoggingEventPublisher, LoggingPaymentRail};
use booking_escrow::error::AppError;
use booking_escrow::workflows::booking::{
    BookingEngine, BookingError, BookingId, BookingView, CheckInRequest, MemoryAuditLog,
    MemoryBookingRepository, MemoryDeadlineStore, NewBooking, Outbound, PartyId,
    SchedulerService,
};
use booking_escrow::workflows::checkin::{GeoPoint, ReportedLocation, ServiceLocation};
use booking_escrow::workflows::escrow::MilestoneId;
use booking_escrow::workflows::policy::{EngineConfig, ServiceTier};
use booking_escrow::workflows::rectification::{IssueCategory, IssueReport};
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use std::sync::Arc;

type DemoEngine = BookingEngine<MemoryBookingRepository, MemoryDeadlineStore>;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Service tier (1-4). Tier 4 pays out in milestones.
    #[arg(long, default_value_t = 2)]
    pub(crate) tier: u8,
    /// Total price in minor currency units.
    #[arg(long, default_value_t = 100_000)]
    pub(crate) price: u64,
    /// Raise an issue during observation and run it through a fix cycle.
    #[arg(long)]
    pub(crate) dispute: bool,
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let tier = ServiceTier::try_from(args.tier).map_err(BookingError::from)?;

    let events = LoggingEventPublisher::default();
    let payments = LoggingPaymentRail::default();
    let engine: Arc<DemoEngine> = Arc::new(BookingEngine::new(
        Arc::new(MemoryBookingRepository::default()),
        Arc::new(MemoryDeadlineStore::default()),
        Outbound::new(
            Arc::new(events.clone()),
            Arc::new(payments.clone()),
            Arc::new(MemoryAuditLog::default()),
        ),
        EngineConfig::standard(),
    )?);
    let scheduler = SchedulerService::new(engine.clone());

    let start = Utc::now();
    let scheduled_at = start + Duration::days(2);
    let site = GeoPoint::new(40.7128, -74.0060);

    println!("Booking escrow demo (tier {}, price {})", args.tier, args.price);
    let id = engine
        .create_booking(
            NewBooking {
                tier,
                total_price: args.price,
                location: Some(ServiceLocation {
                    point: site,
                    radius_meters: None,
                }),
                scheduled_at,
                provider_id: PartyId("prov-demo".to_string()),
                client_id: PartyId("client-demo".to_string()),
            },
            start,
        )?
        .booking
        .id;
    step(&engine, &id, "created", start)?;

    let account = engine.confirm_booking(&id, start)?;
    println!(
        "  escrow funded: {} held, commitment fee {}",
        account.total_held, account.commitment_fee
    );
    engine.accept_booking(&id, start + Duration::hours(1))?;
    step(&engine, &id, "provider accepted", start + Duration::hours(1))?;

    let departed_at = scheduled_at - Duration::hours(1);
    engine.depart(&id, departed_at)?;
    let issued = engine.issue_check_in_code(&id, scheduled_at - Duration::minutes(10))?;
    println!(
        "  check-in code issued, valid until {}",
        issued.expires_at.format("%Y-%m-%d %H:%M UTC")
    );
    let verdict = engine
        .check_in(
            &id,
            &CheckInRequest {
                code: issued.code,
                location: Some(site),
            },
            &ReportedLocation(Some(site.offset_north(35.0))),
            scheduled_at - Duration::minutes(5),
        )
        .await?;
    println!(
        "  check-in passed ({:.0}m from site)",
        verdict.distance_meters.unwrap_or_default()
    );
    step(&engine, &id, "checked in", scheduled_at)?;

    engine.start_work(&id, scheduled_at)?;
    if tier.uses_milestones() {
        for (offset, milestone) in ["ms-1", "ms-2"].iter().enumerate() {
            let at = scheduled_at + Duration::hours(2 * (offset as i64 + 1));
            engine.approve_milestone(&id, &MilestoneId((*milestone).to_string()), at)?;
            step(&engine, &id, &format!("{milestone} approved"), at)?;
        }
    }

    let completed_at = scheduled_at + Duration::hours(6);
    let observation_ends = engine.mark_complete(&id, completed_at)?;
    step(&engine, &id, "work complete", completed_at)?;

    let settle_at = if args.dispute {
        let reported_at = completed_at + Duration::days(1);
        let case = engine.report_issue(
            &id,
            IssueReport {
                category: IssueCategory::Workmanship,
                description: "sealant missing around the tub".to_string(),
            },
            reported_at,
        )?;
        step(&engine, &id, "issue reported", reported_at)?;
        println!("  rectification case {} opened", case.id.0);

        let fix_at = reported_at + Duration::hours(20);
        engine.schedule_fix(&id, fix_at, reported_at + Duration::hours(3))?;
        engine.start_fix(&id, fix_at)?;
        let case = engine.complete_fix(&id, fix_at + Duration::hours(2))?;
        step(&engine, &id, "fix completed", fix_at + Duration::hours(2))?;
        case.mini_observation_ends.unwrap_or(observation_ends)
    } else {
        observation_ends
    };

    let report = scheduler.run_due(settle_at)?;
    println!(
        "  scheduler pass: {} applied, {} stale, {} deferred",
        report.applied, report.stale, report.deferred
    );
    let view = step(&engine, &id, "settled", settle_at)?;

    println!("\nLedger");
    for instruction in payments.instructions() {
        println!(
            "  {} {:>10} to {:?} ({})",
            instruction.reference,
            instruction.amount,
            instruction.payee,
            instruction.reason.label()
        );
    }
    println!("\n{} events published", events.events().len());

    match serde_json::to_string_pretty(&view) {
        Ok(json) => println!("\nFinal booking view:\n{json}"),
        Err(err) => println!("\nFinal booking view unavailable: {err}"),
    }
    Ok(())
}

fn step(
    engine: &DemoEngine,
    id: &BookingId,
    label: &str,
    now: DateTime<Utc>,
) -> Result<BookingView, AppError> {
    let view = engine.booking_view(id, now)?;
    let escrow = view
        .escrow
        .as_ref()
        .map(|escrow| {
            format!(
                "escrow {} | released {} | refunded {}",
                escrow.status_label, escrow.released_to_date, escrow.refunded_to_date
            )
        })
        .unwrap_or_else(|| "escrow unfunded".to_string());
    println!(
        "- {:<18} {:<14} {}",
        label, view.status_label, escrow
    );
    Ok(view)
}
