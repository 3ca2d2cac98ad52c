//! Ledger event records and the closed set of lease events.
//!
//! The store persists [`EventRecord`]s with a string `event_type` and a JSON
//! payload. Decoding back into [`LeaseEvent`] is strict: a type outside the
//! closed set is a validation error, never skipped.

use super::lease::LeaseId;
use super::money::Money;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An immutable, committed ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub aggregate_id: LeaseId,
    /// Strictly increasing and gapless per aggregate, starting at 1.
    pub sequence_no: u64,
    pub event_type: String,
    pub payload: Value,
    pub amount: Option<Money>,
    pub timestamp: DateTime<Utc>,
    pub origin_command_id: String,
}

/// An event decided by the command processor but not yet committed. The
/// store assigns the sequence number at append time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Value,
    pub amount: Option<Money>,
    pub timestamp: DateTime<Utc>,
    pub origin_command_id: String,
}

impl NewEvent {
    pub fn into_record(self, aggregate_id: LeaseId, sequence_no: u64) -> EventRecord {
        EventRecord {
            aggregate_id,
            sequence_no,
            event_type: self.event_type,
            payload: self.payload,
            amount: self.amount,
            timestamp: self.timestamp,
            origin_command_id: self.origin_command_id,
        }
    }
}

/// Payload shape handed to the external bus for each committed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub aggregate_id: LeaseId,
    pub sequence_no: u64,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl From<&EventRecord> for PublishedEvent {
    fn from(record: &EventRecord) -> Self {
        Self {
            aggregate_id: record.aggregate_id,
            sequence_no: record.sequence_no,
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
            timestamp: record.timestamp,
        }
    }
}

/// Every fact that can happen to a lease. Adding a variant forces every
/// reducer and decision `match` to handle it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseEvent {
    LeaseCreated {
        customer_id: String,
        principal_amount: Money,
        term_months: u32,
    },
    PaymentScheduled {
        payment_id: Uuid,
        installment_number: u32,
        due_date: NaiveDate,
        amount: Money,
    },
    LeaseActivated,
    PaymentSucceeded {
        installment_number: u32,
        attempt_number: u32,
        amount: Money,
    },
    PaymentFailed {
        installment_number: u32,
        attempt_number: u32,
        reason: String,
    },
    PaymentRetryDue {
        installment_number: u32,
    },
    EarlyPayoffSettled {
        remaining_balance: Money,
        discount_amount: Money,
        payoff_amount: Money,
    },
    LeaseCompleted {
        total_paid: Money,
    },
    LeaseDefaulted {
        installment_number: u32,
        reason: String,
    },
}

impl LeaseEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LeaseEvent::LeaseCreated { .. } => "LEASE_CREATED",
            LeaseEvent::PaymentScheduled { .. } => "PAYMENT_SCHEDULED",
            LeaseEvent::LeaseActivated => "LEASE_ACTIVATED",
            LeaseEvent::PaymentSucceeded { .. } => "PAYMENT_SUCCEEDED",
            LeaseEvent::PaymentFailed { .. } => "PAYMENT_FAILED",
            LeaseEvent::PaymentRetryDue { .. } => "PAYMENT_RETRY_DUE",
            LeaseEvent::EarlyPayoffSettled { .. } => "EARLY_PAYOFF_SETTLED",
            LeaseEvent::LeaseCompleted { .. } => "LEASE_COMPLETED",
            LeaseEvent::LeaseDefaulted { .. } => "LEASE_DEFAULTED",
        }
    }

    /// Monetary amount carried by the event, mirrored into the record's
    /// `amount` column for export.
    pub fn amount(&self) -> Option<Money> {
        match self {
            LeaseEvent::LeaseCreated {
                principal_amount, ..
            } => Some(*principal_amount),
            LeaseEvent::PaymentScheduled { amount, .. } => Some(*amount),
            LeaseEvent::PaymentSucceeded { amount, .. } => Some(*amount),
            LeaseEvent::EarlyPayoffSettled { payoff_amount, .. } => Some(*payoff_amount),
            LeaseEvent::LeaseCompleted { total_paid } => Some(*total_paid),
            LeaseEvent::LeaseActivated
            | LeaseEvent::PaymentFailed { .. }
            | LeaseEvent::PaymentRetryDue { .. }
            | LeaseEvent::LeaseDefaulted { .. } => None,
        }
    }

    /// Lease-level events change the lease status; the rest touch installments.
    pub fn is_lease_level(&self) -> bool {
        matches!(
            self,
            LeaseEvent::LeaseCreated { .. }
                | LeaseEvent::LeaseActivated
                | LeaseEvent::LeaseCompleted { .. }
                | LeaseEvent::LeaseDefaulted { .. }
        )
    }

    pub fn to_new_event(
        &self,
        timestamp: DateTime<Utc>,
        origin_command_id: &str,
    ) -> Result<NewEvent> {
        // Adjacent tagging yields `{"type": ..., "data": ...}`; the record
        // keeps the two halves in separate columns.
        let mut tagged = serde_json::to_value(self)?;
        let payload = tagged
            .as_object_mut()
            .and_then(|obj| obj.remove("data"))
            .unwrap_or(Value::Null);

        Ok(NewEvent {
            event_type: self.event_type().to_string(),
            payload,
            amount: self.amount(),
            timestamp,
            origin_command_id: origin_command_id.to_string(),
        })
    }

    /// Decodes a stored record. Unknown event types and malformed payloads
    /// are rejected.
    pub fn decode(record: &EventRecord) -> Result<Self> {
        let tagged = if record.payload.is_null() {
            serde_json::json!({ "type": record.event_type })
        } else {
            serde_json::json!({ "type": record.event_type, "data": record.payload })
        };

        serde_json::from_value(tagged).map_err(|e| {
            LedgerError::Validation(format!(
                "cannot decode event {} #{} of type '{}': {}",
                record.aggregate_id, record.sequence_no, record.event_type, e
            ))
        })
    }
}
