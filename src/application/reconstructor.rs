use crate::domain::event::EventRecord;
use crate::domain::lease::{AggregateState, LeaseId, LeaseStatus};
use crate::domain::money::Money;
use crate::domain::ports::EventStoreRef;
use crate::domain::state_machine;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One step of a lease's history with the status on either side of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub sequence_no: u64,
    pub event_type: String,
    pub amount: Option<Money>,
    pub timestamp: DateTime<Utc>,
    pub status_before: Option<LeaseStatus>,
    pub status_after: Option<LeaseStatus>,
}

/// Answers point-in-time questions by replaying the stream. Reads only.
pub struct StateReconstructor {
    store: EventStoreRef,
}

impl StateReconstructor {
    pub fn new(store: EventStoreRef) -> Self {
        Self { store }
    }

    /// State of the lease as of `point_in_time`, inclusive. A time before the
    /// lease was created yields a state that does not exist.
    pub async fn state_at(
        &self,
        lease_id: LeaseId,
        point_in_time: DateTime<Utc>,
    ) -> Result<AggregateState> {
        let events = self.store.read(lease_id, 0).await?;
        state_at(&events, point_in_time)
    }

    pub async fn timeline(&self, lease_id: LeaseId) -> Result<Vec<TimelineEntry>> {
        let events = self.store.read(lease_id, 0).await?;
        let mut state = AggregateState::default();
        let mut entries = Vec::with_capacity(events.len());

        for record in &events {
            let status_before = state.status();
            state = state_machine::apply(state, record)?;
            entries.push(TimelineEntry {
                sequence_no: record.sequence_no,
                event_type: record.event_type.clone(),
                amount: record.amount,
                timestamp: record.timestamp,
                status_before,
                status_after: state.status(),
            });
        }
        Ok(entries)
    }
}

/// Folds the events with `timestamp <= point_in_time`. Stream timestamps are
/// non-decreasing, so the selection is always a prefix.
pub fn state_at(events: &[EventRecord], point_in_time: DateTime<Utc>) -> Result<AggregateState> {
    let visible: Vec<EventRecord> = events
        .iter()
        .filter(|e| e.timestamp <= point_in_time)
        .cloned()
        .collect();
    state_machine::reduce(&visible)
}
