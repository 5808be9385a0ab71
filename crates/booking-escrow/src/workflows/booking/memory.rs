//! In-process adapters used by the API service, the demo command, and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::domain::BookingId;
use super::repository::{
    AuditLog, AuditRecord, BookingEvent, BookingRecord, BookingRepository, Deadline,
    DeadlineKind, DeadlineStore, EventPublisher, PaymentInstruction, PaymentRail,
    PaymentRailError, PublishError, RepositoryError,
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default, Clone)]
pub struct MemoryBookingRepository {
    records: Arc<Mutex<HashMap<BookingId, BookingRecord>>>,
}

impl BookingRepository for MemoryBookingRepository {
    fn insert(&self, record: BookingRecord) -> Result<BookingRecord, RepositoryError> {
        let mut guard = locked(&self.records);
        if guard.contains_key(&record.booking.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(record.booking.id.clone(), record.clone());
        Ok(record)
    }

    fn update(&self, record: BookingRecord) -> Result<(), RepositoryError> {
        let mut guard = locked(&self.records);
        match guard.get_mut(&record.booking.id) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    fn fetch(&self, id: &BookingId) -> Result<Option<BookingRecord>, RepositoryError> {
        Ok(locked(&self.records).get(id).cloned())
    }

    fn list(&self, limit: usize) -> Result<Vec<BookingRecord>, RepositoryError> {
        let guard = locked(&self.records);
        let mut records: Vec<BookingRecord> = guard.values().cloned().collect();
        records.sort_by(|left, right| {
            left.booking
                .created_at
                .cmp(&right.booking.created_at)
                .then_with(|| left.booking.id.cmp(&right.booking.id))
        });
        records.truncate(limit);
        Ok(records)
    }
}

/// Deadlines keyed by booking and kind; re-scheduling replaces the earlier entry.
#[derive(Default, Clone)]
pub struct MemoryDeadlineStore {
    entries: Arc<Mutex<BTreeMap<(BookingId, DeadlineKind), DateTime<Utc>>>>,
}

impl MemoryDeadlineStore {
    pub fn len(&self) -> usize {
        locked(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadlineStore for MemoryDeadlineStore {
    fn schedule(&self, deadline: Deadline) -> Result<(), RepositoryError> {
        locked(&self.entries).insert((deadline.booking_id, deadline.kind), deadline.due_at);
        Ok(())
    }

    fn cancel(&self, booking_id: &BookingId, kind: DeadlineKind) -> Result<(), RepositoryError> {
        locked(&self.entries).remove(&(booking_id.clone(), kind));
        Ok(())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Deadline>, RepositoryError> {
        let guard = locked(&self.entries);
        let mut due: Vec<Deadline> = guard
            .iter()
            .filter(|(_, due_at)| **due_at <= now)
            .map(|((booking_id, kind), due_at)| Deadline {
                booking_id: booking_id.clone(),
                kind: *kind,
                due_at: *due_at,
            })
            .collect();
        due.sort_by_key(|deadline| deadline.due_at);
        due.truncate(limit);
        Ok(due)
    }

    fn acknowledge(&self, deadline: &Deadline) -> Result<(), RepositoryError> {
        let mut guard = locked(&self.entries);
        let key = (deadline.booking_id.clone(), deadline.kind);
        if guard.get(&key) == Some(&deadline.due_at) {
            guard.remove(&key);
        }
        Ok(())
    }

    fn pending_for(&self, booking_id: &BookingId) -> Result<Vec<Deadline>, RepositoryError> {
        let guard = locked(&self.entries);
        Ok(guard
            .iter()
            .filter(|((id, _), _)| id == booking_id)
            .map(|((id, kind), due_at)| Deadline {
                booking_id: id.clone(),
                kind: *kind,
                due_at: *due_at,
            })
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct MemoryEventPublisher {
    events: Arc<Mutex<Vec<BookingEvent>>>,
}

impl MemoryEventPublisher {
    pub fn events(&self) -> Vec<BookingEvent> {
        locked(&self.events).clone()
    }
}

impl EventPublisher for MemoryEventPublisher {
    fn publish(&self, event: BookingEvent) -> Result<(), PublishError> {
        locked(&self.events).push(event);
        Ok(())
    }
}

/// Records instructions instead of moving money.
#[derive(Default, Clone)]
pub struct MemoryPaymentRail {
    instructions: Arc<Mutex<Vec<PaymentInstruction>>>,
}

impl MemoryPaymentRail {
    pub fn instructions(&self) -> Vec<PaymentInstruction> {
        locked(&self.instructions).clone()
    }
}

impl PaymentRail for MemoryPaymentRail {
    fn submit(&self, instruction: PaymentInstruction) -> Result<(), PaymentRailError> {
        locked(&self.instructions).push(instruction);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryAuditLog {
    entries: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditLog {
    pub fn entries(&self) -> Vec<AuditRecord> {
        locked(&self.entries).clone()
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, entry: AuditRecord) -> Result<(), RepositoryError> {
        locked(&self.entries).push(entry);
        Ok(())
    }
}
