use super::lease::{LeaseId, LeaseStatus};
use super::money::Money;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Requests the core accepts. Each variant is scoped to exactly one lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum LeaseCommand {
    CreateLease {
        customer_id: String,
        principal_amount: Decimal,
        term_months: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_due_date: Option<NaiveDate>,
    },
    AttemptPayment {
        lease_id: LeaseId,
        installment_number: u32,
    },
    /// Moves a FAILED installment back to PENDING once its retry is due.
    ReopenInstallment {
        lease_id: LeaseId,
        installment_number: u32,
    },
    DefaultLease {
        lease_id: LeaseId,
        installment_number: u32,
    },
    EarlyPayoff {
        lease_id: LeaseId,
    },
}

impl LeaseCommand {
    pub fn operation(&self) -> &'static str {
        match self {
            LeaseCommand::CreateLease { .. } => "CREATE_LEASE",
            LeaseCommand::AttemptPayment { .. } => "ATTEMPT_PAYMENT",
            LeaseCommand::ReopenInstallment { .. } => "REOPEN_INSTALLMENT",
            LeaseCommand::DefaultLease { .. } => "DEFAULT_LEASE",
            LeaseCommand::EarlyPayoff { .. } => "EARLY_PAYOFF",
        }
    }

    /// Target aggregate, or `None` when the command creates a new one.
    pub fn lease_id(&self) -> Option<LeaseId> {
        match self {
            LeaseCommand::CreateLease { .. } => None,
            LeaseCommand::AttemptPayment { lease_id, .. }
            | LeaseCommand::ReopenInstallment { lease_id, .. }
            | LeaseCommand::DefaultLease { lease_id, .. }
            | LeaseCommand::EarlyPayoff { lease_id } => Some(*lease_id),
        }
    }

    fn normalized(&self) -> Self {
        match self {
            LeaseCommand::CreateLease {
                customer_id,
                principal_amount,
                term_months,
                first_due_date,
            } => LeaseCommand::CreateLease {
                customer_id: customer_id.trim().to_string(),
                principal_amount: principal_amount.normalize(),
                term_months: *term_months,
                first_due_date: *first_due_date,
            },
            other => other.clone(),
        }
    }

}

/// Hash of the normalised request body, used to tell a legitimate retry from
/// a reused key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn of(command: &LeaseCommand) -> Result<Self> {
        // serde_json emits struct fields in declaration order, so the only
        // normalisation needed is the decimal scale.
        let body = serde_json::to_vec(&command.normalized())?;
        let digest = Sha256::digest(&body);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            let _ = write!(hex, "{byte:02x}");
        }
        Ok(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A command as it arrives from the request-handling boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub idempotency_key: String,
    pub fingerprint: RequestFingerprint,
    /// Declared time of the command; the only clock business rules may read.
    pub issued_at: DateTime<Utc>,
    pub command: LeaseCommand,
}

impl CommandEnvelope {
    pub fn new(
        command: LeaseCommand,
        idempotency_key: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Result<Self> {
        let idempotency_key = idempotency_key.into();
        if idempotency_key.trim().is_empty() {
            return Err(LedgerError::Validation(
                "Idempotency key must not be empty".to_string(),
            ));
        }
        let fingerprint = RequestFingerprint::of(&command)?;
        Ok(Self {
            idempotency_key,
            fingerprint,
            issued_at,
            command,
        })
    }

    pub fn operation(&self) -> &'static str {
        self.command.operation()
    }

    /// Identifier stamped on every event this command produces. Derived from
    /// `(operation, key, fingerprint)`: a re-execution of the same request
    /// recognises its own events, while a different body sent under an
    /// expired key does not.
    pub fn command_id(&self) -> String {
        format!(
            "{}/{}#{}",
            self.operation(),
            self.idempotency_key,
            self.fingerprint.as_str()
        )
    }
}

/// The response returned for a command, and cached verbatim for replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub operation: String,
    pub lease_id: LeaseId,
    pub status: LeaseStatus,
    pub last_sequence_no: u64,
    pub event_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_charged: Option<Money>,
}
