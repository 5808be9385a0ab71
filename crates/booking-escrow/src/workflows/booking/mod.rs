//! Booking lifecycle: the status machine, the engine that drives escrow, check-in and
//! rectification through it, the deadline scheduler, and the admin override surface.

pub mod admin;
pub mod domain;
pub mod memory;
pub mod repository;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod views;

#[cfg(test)]
mod tests;

pub use admin::{AdminRequest, OverrideOutcome, ReleaseTarget};
pub use domain::{
    Actor, Booking, BookingId, BookingStatus, CaseId, InvalidTransition, NewBooking, PartyId,
    StatusChange,
};
pub use memory::{
    MemoryAuditLog, MemoryBookingRepository, MemoryDeadlineStore, MemoryEventPublisher,
    MemoryPaymentRail,
};
pub use repository::{
    AdminAction, AuditLog, AuditRecord, BookingEvent, BookingRecord, BookingRepository,
    Deadline, DeadlineKind, DeadlineStore, EventPublisher, EventTopic, PaymentInstruction,
    PaymentRail, PaymentRailError, PublishError, RepositoryError,
};
pub use router::{admin_router, booking_router};
pub use scheduler::{DeadlineOutcome, SchedulerError, SchedulerReport, SchedulerService};
pub use service::{
    BookingEngine, BookingError, CancelRequest, CancellationQuote, CancellingParty,
    CheckInRequest, NoShowSettlement, Outbound,
};
pub use views::{BookingView, EscrowView, MilestoneView, RectificationView};
