use booking_escrow::workflows::booking::{
    BookingEvent, EventPublisher, MemoryEventPublisher, MemoryPaymentRail, PaymentInstruction,
    PaymentRail, PaymentRailError, PublishError,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Notification outbox that mirrors every event into the service log until a broker is wired.
#[derive(Default, Clone)]
pub(crate) struct LoggingEventPublisher {
    outbox: MemoryEventPublisher,
}

impl EventPublisher for LoggingEventPublisher {
    fn publish(&self, event: BookingEvent) -> Result<(), PublishError> {
        info!(
            topic = event.topic.label(),
            booking_id = %event.booking_id,
            from = event.from.as_deref().unwrap_or("-"),
            to = event.to.as_deref().unwrap_or("-"),
            details = ?event.details,
            "event published"
        );
        self.outbox.publish(event)
    }
}

impl LoggingEventPublisher {
    pub(crate) fn events(&self) -> Vec<BookingEvent> {
        self.outbox.events()
    }
}

/// Payment rail stand-in. Instructions are logged and kept for replay inspection.
#[derive(Default, Clone)]
pub(crate) struct LoggingPaymentRail {
    submitted: MemoryPaymentRail,
}

impl PaymentRail for LoggingPaymentRail {
    fn submit(&self, instruction: PaymentInstruction) -> Result<(), PaymentRailError> {
        info!(
            reference = %instruction.reference,
            booking_id = %instruction.booking_id,
            payee = ?instruction.payee,
            party = %instruction.party.0,
            amount = instruction.amount,
            reason = instruction.reason.label(),
            "payment instruction submitted"
        );
        self.submitted.submit(instruction)
    }
}

impl LoggingPaymentRail {
    pub(crate) fn instructions(&self) -> Vec<PaymentInstruction> {
        self.submitted.instructions()
    }
}
