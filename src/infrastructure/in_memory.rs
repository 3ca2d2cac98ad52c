use crate::domain::command::RequestFingerprint;
use crate::domain::event::{EventRecord, NewEvent};
use crate::domain::lease::LeaseId;
use crate::domain::ports::{BeginOutcome, EventStore, IdempotencyGuard, IdempotencyRecord};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Default)]
struct EventLog {
    /// Every committed event, in commit order.
    arena: Vec<EventRecord>,
    /// Arena positions of each stream, in sequence order.
    streams: HashMap<LeaseId, Vec<usize>>,
    /// Streams in the order they were first appended to.
    order: Vec<LeaseId>,
}

/// A thread-safe in-memory event store.
///
/// Events live in one append-only arena indexed per aggregate. Appends take
/// the write lock, so the expected-sequence check and the push are one step.
/// Ideal for testing or for runs where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<EventLog>>,
}

impl InMemoryEventStore {
    /// Creates a new, empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_id: LeaseId,
        expected_sequence: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>> {
        if events.is_empty() {
            return Err(LedgerError::Validation(
                "cannot append an empty batch".to_string(),
            ));
        }

        let mut log = self.log.write().await;
        let current = log.streams.get(&aggregate_id).map_or(0, |s| s.len() as u64);
        if current != expected_sequence {
            return Err(LedgerError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_sequence,
                actual: current,
            });
        }

        let committed: Vec<EventRecord> = events
            .into_iter()
            .enumerate()
            .map(|(idx, e)| e.into_record(aggregate_id, current + idx as u64 + 1))
            .collect();

        let start = log.arena.len();
        log.arena.extend(committed.iter().cloned());
        if current == 0 {
            log.order.push(aggregate_id);
        }
        log.streams
            .entry(aggregate_id)
            .or_default()
            .extend(start..start + committed.len());

        Ok(committed)
    }

    async fn read(&self, aggregate_id: LeaseId, from_sequence: u64) -> Result<Vec<EventRecord>> {
        let log = self.log.read().await;
        let Some(positions) = log.streams.get(&aggregate_id) else {
            return Ok(Vec::new());
        };
        Ok(positions
            .iter()
            .skip(from_sequence as usize)
            .map(|&pos| log.arena[pos].clone())
            .collect())
    }

    async fn current_sequence(&self, aggregate_id: LeaseId) -> Result<u64> {
        let log = self.log.read().await;
        Ok(log.streams.get(&aggregate_id).map_or(0, |s| s.len() as u64))
    }

    async fn read_all(&self) -> Result<Vec<EventRecord>> {
        Ok(self.log.read().await.arena.clone())
    }

    async fn aggregate_ids(&self) -> Result<Vec<LeaseId>> {
        Ok(self.log.read().await.order.clone())
    }
}

/// A thread-safe in-memory idempotency guard.
///
/// One mutex covers the whole map, which makes `begin` a compare-and-set:
/// exactly one caller inserts the placeholder for a given `(operation, key)`.
#[derive(Clone)]
pub struct InMemoryIdempotencyGuard {
    records: Arc<Mutex<HashMap<(String, String), IdempotencyRecord>>>,
    ttl: Duration,
}

impl InMemoryIdempotencyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn record(&self, operation: &str, key: &str) -> Option<IdempotencyRecord> {
        self.records
            .lock()
            .await
            .get(&(operation.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl IdempotencyGuard for InMemoryIdempotencyGuard {
    async fn begin(
        &self,
        operation: &str,
        key: &str,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome> {
        let mut records = self.records.lock().await;
        let slot = (operation.to_string(), key.to_string());

        if let Some(existing) = records.get(&slot)
            && !existing.is_expired(now)
        {
            if existing.fingerprint != *fingerprint {
                return Err(LedgerError::IdempotencyKeyReuse {
                    operation: operation.to_string(),
                    key: key.to_string(),
                });
            }
            return match &existing.response {
                Some(response) => Ok(BeginOutcome::Replay(response.clone())),
                None => Err(LedgerError::DuplicateInFlight {
                    operation: operation.to_string(),
                    key: key.to_string(),
                }),
            };
        }

        records.insert(
            slot,
            IdempotencyRecord::placeholder(operation, key, fingerprint, now, self.ttl),
        );
        Ok(BeginOutcome::Proceed)
    }

    async fn complete(&self, operation: &str, key: &str, response: Value) -> Result<()> {
        let mut records = self.records.lock().await;
        match records.get_mut(&(operation.to_string(), key.to_string())) {
            Some(record) if record.is_in_flight() => {
                record.response = Some(response);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(LedgerError::Storage(format!(
                "no idempotency placeholder for {operation}/{key}"
            ))),
        }
    }

    async fn release(&self, operation: &str, key: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let slot = (operation.to_string(), key.to_string());
        if records.get(&slot).is_some_and(|r| r.is_in_flight()) {
            records.remove(&slot);
        }
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok(before - records.len())
    }
}
