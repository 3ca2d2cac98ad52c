use super::money::Money;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of a lease aggregate and of its event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Identity of the lease created by a command. Re-executing the same
    /// command with the same body always targets the same stream.
    pub fn for_command(command_id: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, command_id.as_bytes()))
    }

    /// Deterministic payment id for one installment of this lease.
    pub fn payment_id(&self, installment_number: u32) -> Uuid {
        Uuid::new_v5(&self.0, &installment_number.to_be_bytes())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LeaseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseStatus {
    Pending,
    Active,
    Completed,
    Defaulted,
}

impl LeaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeaseStatus::Completed | LeaseStatus::Defaulted)
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LeaseStatus::Pending => "PENDING",
            LeaseStatus::Active => "ACTIVE",
            LeaseStatus::Completed => "COMPLETED",
            LeaseStatus::Defaulted => "DEFAULTED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallmentStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
}

impl InstallmentStatus {
    /// Installments still owed by the lessee.
    pub fn is_open(&self) -> bool {
        matches!(self, InstallmentStatus::Pending | InstallmentStatus::Failed)
    }
}

/// One scheduled installment, owned by its lease and mutated only by the
/// lease's events.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct PaymentInstallment {
    pub payment_id: Uuid,
    pub lease_id: LeaseId,
    pub installment_number: u32,
    pub due_date: NaiveDate,
    pub amount: Money,
    pub status: InstallmentStatus,
    /// Failed attempts so far. Failures on one installment are always
    /// consecutive because a success moves it to PAID.
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Summary of an early payoff, kept on the aggregate once settled.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct PayoffSummary {
    pub remaining_balance: Money,
    pub discount_amount: Money,
    pub payoff_amount: Money,
}

/// Derived view of a lease: always computable by folding its events from
/// sequence 1. Any stored copy is a cache.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct LeaseAggregate {
    pub lease_id: LeaseId,
    pub customer_id: String,
    pub status: LeaseStatus,
    pub principal_amount: Money,
    pub term_months: u32,
    pub installments: Vec<PaymentInstallment>,
    pub total_paid: Money,
    pub payoff: Option<PayoffSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LeaseAggregate {
    pub fn installment(&self, number: u32) -> Option<&PaymentInstallment> {
        number
            .checked_sub(1)
            .and_then(|idx| self.installments.get(idx as usize))
    }

    pub(crate) fn installment_mut(&mut self, number: u32) -> Option<&mut PaymentInstallment> {
        number
            .checked_sub(1)
            .and_then(|idx| self.installments.get_mut(idx as usize))
    }

    pub fn schedule_complete(&self) -> bool {
        self.installments.len() == self.term_months as usize
    }

    /// Sum of installments not yet paid or cancelled.
    pub fn remaining_balance(&self) -> Money {
        self.installments
            .iter()
            .filter(|i| i.status.is_open())
            .map(|i| i.amount)
            .sum()
    }

    pub fn all_paid(&self) -> bool {
        self.schedule_complete()
            && self
                .installments
                .iter()
                .all(|i| i.status == InstallmentStatus::Paid)
    }

    /// Completion guard: every installment paid, or settled by a payoff.
    pub fn can_complete(&self) -> bool {
        if self.payoff.is_some() {
            self.installments.iter().all(|i| !i.status.is_open())
        } else {
            self.all_paid()
        }
    }

    /// The first installment that has reached the default threshold, if any.
    pub fn defaulting_installment(&self, threshold: u32) -> Option<&PaymentInstallment> {
        self.installments.iter().find(|i| i.retry_count >= threshold)
    }

    pub(crate) fn cancel_open_installments(&mut self) {
        for installment in self.installments.iter_mut().filter(|i| i.status.is_open()) {
            installment.status = InstallmentStatus::Cancelled;
        }
    }
}

/// The result of folding a stream: `lease` is `None` while the aggregate does
/// not exist (no events, or a point in time before creation).
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Default)]
pub struct AggregateState {
    /// Sequence number of the last applied event; 0 for an empty stream.
    pub version: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub lease: Option<LeaseAggregate>,
}

impl AggregateState {
    pub fn exists(&self) -> bool {
        self.lease.is_some()
    }

    pub fn status(&self) -> Option<LeaseStatus> {
        self.lease.as_ref().map(|l| l.status)
    }
}
