use crate::domain::event::{EventRecord, PublishedEvent};
use crate::domain::lease::LeaseId;
use crate::domain::ports::EventPublisherRef;
use std::collections::{HashSet, VecDeque};
use tokio::sync::Mutex;

/// An event whose publication failed, waiting for redelivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub event: PublishedEvent,
    pub error: String,
    pub attempts: u32,
}

impl DeadLetter {
    pub fn key(&self) -> (LeaseId, u64) {
        (self.event.aggregate_id, self.event.sequence_no)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryReport {
    pub delivered: usize,
    pub remaining: usize,
}

/// Hands committed events to the publisher without ever failing the caller.
///
/// Failed events are parked in a bounded dead-letter area keyed by
/// `(aggregate_id, sequence_no)`. While an aggregate has anything parked, its
/// later events are parked behind it so redelivery keeps commit order. When
/// the area is full, the lease parked longest is evicted as a whole.
pub struct EventDispatcher {
    publisher: EventPublisherRef,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl EventDispatcher {
    pub fn new(publisher: EventPublisherRef, capacity: usize) -> Self {
        Self {
            publisher,
            dead_letters: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn dispatch(&self, records: &[EventRecord]) {
        for record in records {
            let event = PublishedEvent::from(record);

            let blocked = self
                .dead_letters
                .lock()
                .await
                .iter()
                .any(|dl| dl.event.aggregate_id == event.aggregate_id);
            if blocked {
                self.park(event, "an earlier event of this lease is parked".to_string())
                    .await;
                continue;
            }

            match self.publisher.publish(&event).await {
                Ok(()) => tracing::debug!(
                    lease_id = %event.aggregate_id,
                    sequence_no = event.sequence_no,
                    event_type = %event.event_type,
                    "event published"
                ),
                Err(e) => {
                    tracing::warn!(
                        lease_id = %event.aggregate_id,
                        sequence_no = event.sequence_no,
                        error = %e,
                        "publish failed, parking event"
                    );
                    self.park(event, e.to_string()).await;
                }
            }
        }
    }

    async fn park(&self, event: PublishedEvent, error: String) {
        let mut dead_letters = self.dead_letters.lock().await;
        let key = (event.aggregate_id, event.sequence_no);
        if dead_letters.iter().any(|dl| dl.key() == key) {
            return;
        }
        // a full area evicts the oldest lease's whole chain, never just its head
        if dead_letters.len() >= self.capacity
            && let Some(oldest) = dead_letters.front().map(|dl| dl.event.aggregate_id)
        {
            let before = dead_letters.len();
            dead_letters.retain(|dl| dl.event.aggregate_id != oldest);
            tracing::warn!(
                lease_id = %oldest,
                dropped = before - dead_letters.len(),
                "dead-letter area full, evicting oldest lease"
            );
            if oldest == event.aggregate_id {
                return;
            }
        }
        dead_letters.push_back(DeadLetter {
            event,
            error,
            attempts: 1,
        });
    }

    /// Retries every parked event in order. An aggregate whose redelivery
    /// fails keeps the rest of its events parked.
    pub async fn redeliver(&self) -> RedeliveryReport {
        let mut dead_letters = self.dead_letters.lock().await;
        let pending: Vec<DeadLetter> = dead_letters.drain(..).collect();
        let mut failed: HashSet<LeaseId> = HashSet::new();
        let mut report = RedeliveryReport::default();

        for mut letter in pending {
            if failed.contains(&letter.event.aggregate_id) {
                dead_letters.push_back(letter);
                continue;
            }
            match self.publisher.publish(&letter.event).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    letter.attempts += 1;
                    letter.error = e.to_string();
                    failed.insert(letter.event.aggregate_id);
                    dead_letters.push_back(letter);
                }
            }
        }

        report.remaining = dead_letters.len();
        if report.delivered > 0 || report.remaining > 0 {
            tracing::info!(
                delivered = report.delivered,
                remaining = report.remaining,
                "dead-letter redelivery pass"
            );
        }
        report
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.iter().cloned().collect()
    }
}
