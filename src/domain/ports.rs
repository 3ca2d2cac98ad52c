use super::command::RequestFingerprint;
use super::event::{EventRecord, NewEvent, PublishedEvent};
use super::lease::LeaseId;
use super::money::Money;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Append-only event log, the single source of truth.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` atomically after `expected_sequence`.
    ///
    /// Fails with `ConcurrencyConflict` when the stream's current sequence is
    /// not `expected_sequence`; nothing is written in that case.
    async fn append(
        &self,
        aggregate_id: LeaseId,
        expected_sequence: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>>;

    /// Events of one stream with `sequence_no > from_sequence`, in order.
    async fn read(&self, aggregate_id: LeaseId, from_sequence: u64) -> Result<Vec<EventRecord>>;

    /// Highest committed sequence for the stream, 0 if it has no events.
    async fn current_sequence(&self, aggregate_id: LeaseId) -> Result<u64>;

    /// Every committed event in global commit order.
    async fn read_all(&self) -> Result<Vec<EventRecord>>;

    /// Aggregates in the order their first event was committed.
    async fn aggregate_ids(&self) -> Result<Vec<LeaseId>>;
}

/// Stored deduplication entry for one `(operation, key)` pair. A record
/// without a response is an in-flight placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation: String,
    pub fingerprint: RequestFingerprint,
    pub response: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn placeholder(
        operation: &str,
        key: &str,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            key: key.to_string(),
            operation: operation.to_string(),
            fingerprint: fingerprint.clone(),
            response: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_in_flight(&self) -> bool {
        self.response.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The caller won the key and must execute the command.
    Proceed,
    /// The command already completed; this is its cached response.
    Replay(Value),
}

/// Deduplicates command execution by `(operation, key)`.
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Claims the key, or reports a replay. Fails with
    /// `IdempotencyKeyReuse` when the stored fingerprint differs and with
    /// `DuplicateInFlight` while another caller holds the placeholder.
    async fn begin(
        &self,
        operation: &str,
        key: &str,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome>;

    async fn complete(&self, operation: &str, key: &str, response: Value) -> Result<()>;

    /// Drops an in-flight placeholder so the key can be retried.
    async fn release(&self, operation: &str, key: &str) -> Result<()>;

    /// Removes records whose TTL has elapsed. Returns how many were removed.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Outbound fan-out of committed events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &PublishedEvent) -> Result<()>;
}

/// A charge the core asks the gateway to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub lease_id: LeaseId,
    /// Set for installment payments, absent for an early payoff.
    pub payment_id: Option<Uuid>,
    pub installment_number: Option<u32>,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayVerdict {
    Succeeded,
    Failed { reason: String },
}

impl GatewayVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, GatewayVerdict::Succeeded)
    }
}

/// Opaque success/failure oracle. The core never retries a call itself.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn attempt(&self, charge: &Charge) -> Result<GatewayVerdict>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type EventStoreRef = Arc<dyn EventStore>;
pub type IdempotencyGuardRef = Arc<dyn IdempotencyGuard>;
pub type EventPublisherRef = Arc<dyn EventPublisher>;
pub type PaymentGatewayRef = Arc<dyn PaymentGateway>;
pub type ClockRef = Arc<dyn Clock>;
