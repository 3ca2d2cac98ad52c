use crate::domain::command::RequestFingerprint;
use crate::domain::event::{EventRecord, NewEvent};
use crate::domain::lease::LeaseId;
use crate::domain::ports::{BeginOutcome, EventStore, IdempotencyGuard, IdempotencyRecord};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for event records, keyed by `lease_id ++ sequence_no`.
pub const CF_EVENTS: &str = "events";
/// Column Family for stream heads, keyed by `lease_id`.
pub const CF_STREAMS: &str = "streams";
/// Column Family for the global commit log, keyed by position.
pub const CF_LOG: &str = "log";
/// Column Family for idempotency records, keyed by `operation \0 key`.
pub const CF_IDEMPOTENCY: &str = "idempotency";

/// A persistent store implementation using RocksDB.
///
/// Events, stream heads and the global commit log are written in one
/// `WriteBatch`, so an append commits completely or not at all. Writers are
/// serialised by a mutex; the expected-sequence check runs under it.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<u64>>,
    ttl: Duration,
}

impl RocksDbStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Idempotency placeholders found on open belong to commands that were
    /// cut off by a crash before `complete` or `release`; they are released.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    /// * `idempotency_ttl` - Lifetime of idempotency records written here.
    pub fn open<P: AsRef<Path>>(path: P, idempotency_ttl: Duration) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_EVENTS, CF_STREAMS, CF_LOG, CF_IDEMPOTENCY]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let next_position = {
            let cf = cf(&db, CF_LOG)?;
            match db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    decode_u64(&key)? + 1
                }
                None => 0,
            }
        };

        let abandoned = release_in_flight(&db)?;
        if abandoned > 0 {
            tracing::warn!(abandoned, "released idempotency keys left in flight by a previous run");
        }

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(next_position)),
            ttl: idempotency_ttl,
        })
    }

    fn head(&self, aggregate_id: LeaseId) -> Result<u64> {
        let cf = cf(&self.db, CF_STREAMS)?;
        match self.db.get_cf(cf, aggregate_id.as_uuid().as_bytes())? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn event_at(&self, key: &[u8]) -> Result<EventRecord> {
        let cf = cf(&self.db, CF_EVENTS)?;
        let bytes = self.db.get_cf(cf, key)?.ok_or_else(|| {
            LedgerError::Storage("commit log points at a missing event".to_string())
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| LedgerError::Storage(format!("{name} column family not found")))
}

fn release_in_flight(db: &DB) -> Result<usize> {
    let cf = cf(db, CF_IDEMPOTENCY)?;
    let mut batch = WriteBatch::default();
    let mut released = 0;
    for item in db.iterator_cf(cf, IteratorMode::Start) {
        let (key, value) = item?;
        let record: IdempotencyRecord = serde_json::from_slice(&value)?;
        if record.is_in_flight() {
            batch.delete_cf(cf, key);
            released += 1;
        }
    }
    db.write(batch)?;
    Ok(released)
}

fn event_key(aggregate_id: LeaseId, sequence_no: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(aggregate_id.as_uuid().as_bytes());
    key.extend_from_slice(&sequence_no.to_be_bytes());
    key
}

fn idempotency_key(operation: &str, key: &str) -> Vec<u8> {
    format!("{operation}\0{key}").into_bytes()
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LedgerError::Storage("corrupt sequence value".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

#[async_trait]
impl EventStore for RocksDbStore {
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

        let mut next_position = self.write_lock.lock().await;
        let current = self.head(aggregate_id)?;
        if current != expected_sequence {
            return Err(LedgerError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_sequence,
                actual: current,
            });
        }

        let events_cf = cf(&self.db, CF_EVENTS)?;
        let log_cf = cf(&self.db, CF_LOG)?;
        let streams_cf = cf(&self.db, CF_STREAMS)?;

        let mut batch = WriteBatch::default();
        let mut committed = Vec::with_capacity(events.len());
        let mut position = *next_position;
        for (idx, event) in events.into_iter().enumerate() {
            let record = event.into_record(aggregate_id, current + idx as u64 + 1);
            let key = event_key(aggregate_id, record.sequence_no);
            batch.put_cf(events_cf, &key, serde_json::to_vec(&record)?);
            batch.put_cf(log_cf, position.to_be_bytes(), &key);
            position += 1;
            committed.push(record);
        }
        let head = current + committed.len() as u64;
        batch.put_cf(streams_cf, aggregate_id.as_uuid().as_bytes(), head.to_be_bytes());

        self.db.write(batch)?;
        *next_position = position;
        Ok(committed)
    }

    async fn read(&self, aggregate_id: LeaseId, from_sequence: u64) -> Result<Vec<EventRecord>> {
        let cf = cf(&self.db, CF_EVENTS)?;
        let start = event_key(aggregate_id, from_sequence + 1);
        let prefix = aggregate_id.as_uuid().as_bytes();

        let mut events = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            events.push(serde_json::from_slice(&value)?);
        }
        Ok(events)
    }

    async fn current_sequence(&self, aggregate_id: LeaseId) -> Result<u64> {
        self.head(aggregate_id)
    }

    async fn read_all(&self) -> Result<Vec<EventRecord>> {
        let cf = cf(&self.db, CF_LOG)?;
        let mut events = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, event_key) = item?;
            events.push(self.event_at(&event_key)?);
        }
        Ok(events)
    }

    async fn aggregate_ids(&self) -> Result<Vec<LeaseId>> {
        let cf = cf(&self.db, CF_LOG)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, event_key) = item?;
            let uuid = Uuid::from_slice(&event_key[..16.min(event_key.len())])
                .map_err(|e| LedgerError::Storage(format!("corrupt log entry: {e}")))?;
            let id = LeaseId::from_uuid(uuid);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl IdempotencyGuard for RocksDbStore {
    async fn begin(
        &self,
        operation: &str,
        key: &str,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome> {
        let _guard = self.write_lock.lock().await;
        let cf = cf(&self.db, CF_IDEMPOTENCY)?;
        let slot = idempotency_key(operation, key);

        if let Some(bytes) = self.db.get_cf(cf, &slot)? {
            let existing: IdempotencyRecord = serde_json::from_slice(&bytes)?;
            if !existing.is_expired(now) {
                if existing.fingerprint != *fingerprint {
                    return Err(LedgerError::IdempotencyKeyReuse {
                        operation: operation.to_string(),
                        key: key.to_string(),
                    });
                }
                return match existing.response {
                    Some(response) => Ok(BeginOutcome::Replay(response)),
                    None => Err(LedgerError::DuplicateInFlight {
                        operation: operation.to_string(),
                        key: key.to_string(),
                    }),
                };
            }
        }

        let record = IdempotencyRecord::placeholder(operation, key, fingerprint, now, self.ttl);
        self.db.put_cf(cf, &slot, serde_json::to_vec(&record)?)?;
        Ok(BeginOutcome::Proceed)
    }

    async fn complete(&self, operation: &str, key: &str, response: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let cf = cf(&self.db, CF_IDEMPOTENCY)?;
        let slot = idempotency_key(operation, key);

        let bytes = self.db.get_cf(cf, &slot)?.ok_or_else(|| {
            LedgerError::Storage(format!("no idempotency placeholder for {operation}/{key}"))
        })?;
        let mut record: IdempotencyRecord = serde_json::from_slice(&bytes)?;
        if record.is_in_flight() {
            record.response = Some(response);
            self.db.put_cf(cf, &slot, serde_json::to_vec(&record)?)?;
        }
        Ok(())
    }

    async fn release(&self, operation: &str, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let cf = cf(&self.db, CF_IDEMPOTENCY)?;
        let slot = idempotency_key(operation, key);

        if let Some(bytes) = self.db.get_cf(cf, &slot)? {
            let record: IdempotencyRecord = serde_json::from_slice(&bytes)?;
            if record.is_in_flight() {
                self.db.delete_cf(cf, &slot)?;
            }
        }
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let cf = cf(&self.db, CF_IDEMPOTENCY)?;

        let mut expired = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let record: IdempotencyRecord = serde_json::from_slice(&value)?;
            if record.is_expired(now) {
                expired.push(key);
            }
        }

        let mut batch = WriteBatch::default();
        for key in &expired {
            batch.delete_cf(cf, key);
        }
        self.db.write(batch)?;
        Ok(expired.len())
    }
}
