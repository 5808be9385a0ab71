use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::repository::{BookingRepository, DeadlineStore, RepositoryError};
use super::service::BookingEngine;

/// What the engine did with one delivered deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineOutcome {
    Applied,
    /// The booking already moved past the state the deadline was armed for.
    Stale,
    /// The deadline fell due while escrow was frozen; lifting the freeze re-arms it.
    Deferred,
    NotYetDue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub applied: usize,
    pub stale: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl SchedulerReport {
    pub fn delivered(&self) -> usize {
        self.applied + self.stale + self.deferred
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("deadline store unavailable: {0}")]
    Store(#[from] RepositoryError),
}

/// Polls the deadline store and feeds due entries back into the engine. Entries are
/// acknowledged only after the engine handled them, so a failed delivery is retried on
/// the next poll.
pub struct SchedulerService<R, D> {
    engine: Arc<BookingEngine<R, D>>,
    batch_size: usize,
}

impl<R, D> SchedulerService<R, D>
where
    R: BookingRepository + 'static,
    D: DeadlineStore + 'static,
{
    pub fn new(engine: Arc<BookingEngine<R, D>>) -> Self {
        Self {
            engine,
            batch_size: 256,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn run_due(&self, now: DateTime<Utc>) -> Result<SchedulerReport, SchedulerError> {
        let store = self.engine.deadlines();
        let mut report = SchedulerReport::default();

        for deadline in store.due(now, self.batch_size)? {
            match self.engine.handle_deadline(&deadline, now) {
                Ok(DeadlineOutcome::NotYetDue) => continue,
                Ok(outcome) => {
                    debug!(
                        booking_id = %deadline.booking_id,
                        kind = deadline.kind.label(),
                        outcome = ?outcome,
                        "deadline delivered"
                    );
                    match outcome {
                        DeadlineOutcome::Applied => report.applied += 1,
                        DeadlineOutcome::Deferred => report.deferred += 1,
                        _ => report.stale += 1,
                    }
                    if let Err(err) = store.acknowledge(&deadline) {
                        warn!(
                            booking_id = %deadline.booking_id,
                            kind = deadline.kind.label(),
                            error = %err,
                            "deadline acknowledgement failed; will be redelivered"
                        );
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        booking_id = %deadline.booking_id,
                        kind = deadline.kind.label(),
                        error = %err,
                        "deadline handling failed; will be redelivered"
                    );
                }
            }
        }

        if report.delivered() > 0 || report.failed > 0 {
            info!(
                applied = report.applied,
                stale = report.stale,
                deferred = report.deferred,
                failed = report.failed,
                "scheduler pass complete"
            );
        }
        Ok(report)
    }

    /// Poll forever at `poll_interval` on the current runtime.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                poll_interval_secs = poll_interval.as_secs(),
                "scheduler loop started"
            );

            loop {
                ticker.tick().await;
                if let Err(err) = self.run_due(Utc::now()) {
                    error!(error = %err, "scheduler pass failed");
                }
            }
        })
    }
}
