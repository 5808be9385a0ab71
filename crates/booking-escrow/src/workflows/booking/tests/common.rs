use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::response::Response;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

use crate::workflows::booking::domain::{BookingId, NewBooking, PartyId};
use crate::workflows::booking::memory::{
    MemoryAuditLog, MemoryBookingRepository, MemoryDeadlineStore, MemoryEventPublisher,
    MemoryPaymentRail,
};
use crate::workflows::booking::repository::{
    AuditLog, AuditRecord, BookingEvent, BookingRecord, BookingRepository, EventTopic,
    PaymentInstruction, PaymentRail, PaymentRailError, RepositoryError,
};
use crate::workflows::booking::scheduler::SchedulerService;
use crate::workflows::booking::service::{BookingEngine, CheckInRequest, Outbound};
use crate::workflows::checkin::{GeoPoint, ReportedLocation, ServiceLocation};
use crate::workflows::escrow::EscrowAccount;
use crate::workflows::policy::{EngineConfig, ServiceTier};
use crate::workflows::rectification::{IssueCategory, IssueReport};

pub(super) type MemoryEngine = BookingEngine<MemoryBookingRepository, MemoryDeadlineStore>;

pub(super) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0)
        .single()
        .expect("valid start time")
}

/// Appointment time used by most scenarios, two days after booking.
pub(super) fn scheduled() -> DateTime<Utc> {
    t0() + Duration::days(2)
}

pub(super) fn site() -> GeoPoint {
    GeoPoint::new(40.7128, -74.0060)
}

pub(super) fn new_booking(tier: ServiceTier, total_price: u64) -> NewBooking {
    NewBooking {
        tier,
        total_price,
        location: Some(ServiceLocation {
            point: site(),
            radius_meters: None,
        }),
        scheduled_at: scheduled(),
        provider_id: PartyId("prov-ana".to_string()),
        client_id: PartyId("client-lee".to_string()),
    }
}

pub(super) fn issue(description: &str) -> IssueReport {
    IssueReport {
        category: IssueCategory::Workmanship,
        description: description.to_string(),
    }
}

/// A six digit code guaranteed to differ from `code`.
pub(super) fn wrong_code(code: &str) -> String {
    if code == "000000" {
        "111111".to_string()
    } else {
        "000000".to_string()
    }
}

pub(super) struct Harness {
    pub(super) engine: Arc<MemoryEngine>,
    pub(super) deadlines: Arc<MemoryDeadlineStore>,
    pub(super) events: MemoryEventPublisher,
    pub(super) payments: MemoryPaymentRail,
    pub(super) audit: MemoryAuditLog,
}

pub(super) fn harness() -> Harness {
    harness_with(EngineConfig::standard())
}

pub(super) fn harness_with(config: EngineConfig) -> Harness {
    let events = MemoryEventPublisher::default();
    let payments = MemoryPaymentRail::default();
    let audit = MemoryAuditLog::default();
    let outbound = Outbound::new(
        Arc::new(events.clone()),
        Arc::new(payments.clone()),
        Arc::new(audit.clone()),
    );
    let deadlines = Arc::new(MemoryDeadlineStore::default());
    let engine = BookingEngine::new(
        Arc::new(MemoryBookingRepository::default()),
        deadlines.clone(),
        outbound,
        config,
    )
    .expect("standard policy validates");

    Harness {
        engine: Arc::new(engine),
        deadlines,
        events,
        payments,
        audit,
    }
}

/// Engine whose payment rail and audit log are swapped for the given collaborators.
pub(super) fn engine_with(
    payments: Arc<dyn PaymentRail>,
    audit: Arc<dyn AuditLog>,
) -> (Arc<MemoryEngine>, MemoryEventPublisher) {
    let events = MemoryEventPublisher::default();
    let engine = BookingEngine::new(
        Arc::new(MemoryBookingRepository::default()),
        Arc::new(MemoryDeadlineStore::default()),
        Outbound::new(Arc::new(events.clone()), payments, audit),
        EngineConfig::standard(),
    )
    .expect("standard policy validates");
    (Arc::new(engine), events)
}

impl Harness {
    pub(super) fn scheduler(&self) -> SchedulerService<MemoryBookingRepository, MemoryDeadlineStore> {
        SchedulerService::new(self.engine.clone())
    }

    pub(super) fn book(&self, tier: ServiceTier, total_price: u64) -> BookingId {
        self.engine
            .create_booking(new_booking(tier, total_price), t0())
            .expect("booking created")
            .booking
            .id
    }

    /// Booked, paid, and accepted by the provider.
    pub(super) fn confirmed(&self, tier: ServiceTier, total_price: u64) -> BookingId {
        let id = self.book(tier, total_price);
        self.engine.confirm_booking(&id, t0()).expect("confirmed");
        self.engine
            .accept_booking(&id, t0() + Duration::hours(1))
            .expect("provider accepted");
        id
    }

    pub(super) fn en_route(&self, tier: ServiceTier, total_price: u64) -> BookingId {
        let id = self.confirmed(tier, total_price);
        self.engine
            .depart(&id, scheduled() - Duration::hours(1))
            .expect("provider departed");
        id
    }

    pub(super) async fn checked_in(&self, tier: ServiceTier, total_price: u64) -> BookingId {
        let id = self.en_route(tier, total_price);
        let issued = self
            .engine
            .issue_check_in_code(&id, scheduled() - Duration::minutes(10))
            .expect("code issued");
        let request = CheckInRequest {
            code: issued.code,
            location: Some(site()),
        };
        self.engine
            .check_in(
                &id,
                &request,
                &ReportedLocation(Some(site())),
                scheduled() - Duration::minutes(5),
            )
            .await
            .expect("check-in passes");
        id
    }

    pub(super) async fn in_progress(&self, tier: ServiceTier, total_price: u64) -> BookingId {
        let id = self.checked_in(tier, total_price).await;
        self.engine
            .start_work(&id, scheduled())
            .expect("work started");
        id
    }

    /// Work marked complete four hours after the appointment. Returns when observation ends.
    pub(super) async fn in_observation(
        &self,
        tier: ServiceTier,
        total_price: u64,
    ) -> (BookingId, DateTime<Utc>) {
        let id = self.in_progress(tier, total_price).await;
        let ends = self
            .engine
            .mark_complete(&id, scheduled() + Duration::hours(4))
            .expect("work completed");
        (id, ends)
    }

    pub(super) fn record(&self, id: &BookingId) -> BookingRecord {
        self.engine.fetch(id).expect("record exists")
    }

    pub(super) fn escrow(&self, id: &BookingId) -> EscrowAccount {
        self.record(id).escrow.expect("escrow funded")
    }

    pub(super) fn events_for(&self, id: &BookingId, topic: EventTopic) -> Vec<BookingEvent> {
        self.events
            .events()
            .into_iter()
            .filter(|event| &event.booking_id == id && event.topic == topic)
            .collect()
    }

    pub(super) fn status_events(&self, id: &BookingId) -> Vec<String> {
        self.events_for(id, EventTopic::BookingStatusChanged)
            .into_iter()
            .filter_map(|event| event.to)
            .collect()
    }
}

#[derive(Default, Clone)]
pub(super) struct FailingAuditLog;

impl AuditLog for FailingAuditLog {
    fn record(&self, _entry: AuditRecord) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("audit store offline".to_string()))
    }
}

#[derive(Default, Clone)]
pub(super) struct OfflinePaymentRail;

impl PaymentRail for OfflinePaymentRail {
    fn submit(&self, _instruction: PaymentInstruction) -> Result<(), PaymentRailError> {
        Err(PaymentRailError::Unavailable("rail maintenance".to_string()))
    }
}

#[derive(Default, Clone)]
pub(super) struct UnavailableRepository;

impl BookingRepository for UnavailableRepository {
    fn insert(&self, _record: BookingRecord) -> Result<BookingRecord, RepositoryError> {
        Err(RepositoryError::Unavailable("db offline".to_string()))
    }

    fn update(&self, _record: BookingRecord) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("db offline".to_string()))
    }

    fn fetch(&self, _id: &BookingId) -> Result<Option<BookingRecord>, RepositoryError> {
        Err(RepositoryError::Unavailable("db offline".to_string()))
    }

    fn list(&self, _limit: usize) -> Result<Vec<BookingRecord>, RepositoryError> {
        Err(RepositoryError::Unavailable("db offline".to_string()))
    }
}

/// In-memory repository whose updates can be switched off mid-scenario.
#[derive(Default, Clone)]
pub(super) struct ReadOnlyAfterSwitch {
    inner: MemoryBookingRepository,
    read_only: Arc<AtomicBool>,
}

impl ReadOnlyAfterSwitch {
    pub(super) fn lock_writes(&self) {
        self.read_only.store(true, Ordering::SeqCst);
    }
}

impl BookingRepository for ReadOnlyAfterSwitch {
    fn insert(&self, record: BookingRecord) -> Result<BookingRecord, RepositoryError> {
        self.inner.insert(record)
    }

    fn update(&self, record: BookingRecord) -> Result<(), RepositoryError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("replica is read-only".to_string()));
        }
        self.inner.update(record)
    }

    fn fetch(&self, id: &BookingId) -> Result<Option<BookingRecord>, RepositoryError> {
        self.inner.fetch(id)
    }

    fn list(&self, limit: usize) -> Result<Vec<BookingRecord>, RepositoryError> {
        self.inner.list(limit)
    }
}

/// Asserts no point in a scenario has moved more money than the escrow held.
pub(super) fn assert_conserved(account: &EscrowAccount, step: &str) {
    assert!(
        account.released_to_date + account.refunded_to_date <= account.total_held,
        "{step}: released {} + refunded {} exceeds held {}",
        account.released_to_date,
        account.refunded_to_date,
        account.total_held
    );
    assert_eq!(
        account.remaining() + account.released_to_date + account.refunded_to_date,
        account.total_held,
        "{step}: balance does not add up"
    );
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
