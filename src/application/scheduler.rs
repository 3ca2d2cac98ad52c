//! Soft retry timers for failed installments.
//!
//! Timers live in a min-heap and are never authoritative: whoever pops a due
//! timer re-reads the lease and drops the timer if the installment can no
//! longer be retried or the lease has left ACTIVE.

use crate::domain::lease::{LeaseId, PaymentInstallment};
use crate::domain::state_machine::DEFAULT_FAILURE_THRESHOLD;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub failure_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::seconds(60),
            max_delay: Duration::hours(24),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl RetryPolicy {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay after a failure preceded by `prior_failures` failures on the
    /// same installment: `base * 2^prior_failures`, capped at `max_delay`.
    pub fn delay_for(&self, prior_failures: u32) -> Duration {
        2_i32
            .checked_pow(prior_failures)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RetryTimer {
    pub due_at: DateTime<Utc>,
    pub lease_id: LeaseId,
    pub installment_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled(RetryTimer),
    /// The installment reached the failure threshold; the lease must be
    /// defaulted instead of retried.
    Default {
        lease_id: LeaseId,
        installment_number: u32,
    },
}

pub struct RetryScheduler {
    policy: RetryPolicy,
    timers: Mutex<BinaryHeap<Reverse<RetryTimer>>>,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            timers: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Schedules the next attempt for a freshly failed installment, or asks
    /// for a default once the threshold is reached.
    pub async fn on_payment_failure(&self, installment: &PaymentInstallment) -> Result<RetryDecision> {
        if installment.retry_count >= self.policy.failure_threshold {
            return Ok(RetryDecision::Default {
                lease_id: installment.lease_id,
                installment_number: installment.installment_number,
            });
        }

        let last_attempt_at = installment.last_attempt_at.ok_or_else(|| {
            LedgerError::Validation(format!(
                "installment {} of lease {} has no recorded attempt",
                installment.installment_number, installment.lease_id
            ))
        })?;
        let prior_failures = installment.retry_count.saturating_sub(1);
        let timer = RetryTimer {
            due_at: last_attempt_at + self.policy.delay_for(prior_failures),
            lease_id: installment.lease_id,
            installment_number: installment.installment_number,
        };
        self.timers.lock().await.push(Reverse(timer));

        tracing::debug!(
            lease_id = %timer.lease_id,
            installment = timer.installment_number,
            due_at = %timer.due_at,
            "retry scheduled"
        );
        Ok(RetryDecision::Scheduled(timer))
    }

    pub async fn schedule(&self, timer: RetryTimer) {
        self.timers.lock().await.push(Reverse(timer));
    }

    /// Pops every timer due at or before `now`, earliest first.
    pub async fn due_retries(&self, now: DateTime<Utc>) -> Vec<RetryTimer> {
        let mut timers = self.timers.lock().await;
        let mut due = Vec::new();
        while let Some(Reverse(next)) = timers.peek() {
            if next.due_at > now {
                break;
            }
            if let Some(Reverse(timer)) = timers.pop() {
                due.push(timer);
            }
        }
        due
    }

    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.timers.lock().await.peek().map(|Reverse(t)| t.due_at)
    }

    pub async fn pending(&self) -> usize {
        self.timers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lease::InstallmentStatus;
    use crate::domain::money::Money;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn failed(retry_count: u32, at: DateTime<Utc>) -> PaymentInstallment {
        let lease_id = LeaseId::new();
        PaymentInstallment {
            payment_id: lease_id.payment_id(1),
            lease_id,
            installment_number: 1,
            due_date: at.date_naive(),
            amount: Money::new(dec!(100)),
            status: InstallmentStatus::Failed,
            retry_count,
            last_attempt_at: Some(at),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::minutes(1))
            .with_max_delay(Duration::minutes(5));
        assert_eq!(policy.delay_for(0), Duration::minutes(1));
        assert_eq!(policy.delay_for(1), Duration::minutes(2));
        assert_eq!(policy.delay_for(2), Duration::minutes(4));
        assert_eq!(policy.delay_for(3), Duration::minutes(5));
        assert_eq!(policy.delay_for(64), Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_failure_schedules_from_last_attempt() {
        let scheduler = RetryScheduler::new(RetryPolicy::default());
        let decision = scheduler.on_payment_failure(&failed(2, t0())).await.unwrap();
        match decision {
            RetryDecision::Scheduled(timer) => {
                assert_eq!(timer.due_at, t0() + Duration::minutes(2));
            }
            other => panic!("expected a timer, got {other:?}"),
        }
        assert_eq!(scheduler.pending().await, 1);
    }

    #[tokio::test]
    async fn test_third_failure_requests_default() {
        let scheduler = RetryScheduler::new(RetryPolicy::default());
        let decision = scheduler.on_payment_failure(&failed(3, t0())).await.unwrap();
        assert!(matches!(decision, RetryDecision::Default { .. }));
        assert_eq!(scheduler.pending().await, 0);
    }

    #[tokio::test]
    async fn test_due_retries_pops_in_due_order() {
        let scheduler = RetryScheduler::new(RetryPolicy::default());
        let late = failed(2, t0());
        let early = failed(1, t0());
        scheduler.on_payment_failure(&late).await.unwrap();
        scheduler.on_payment_failure(&early).await.unwrap();

        assert!(scheduler.due_retries(t0()).await.is_empty());
        assert_eq!(scheduler.next_due().await, Some(t0() + Duration::minutes(1)));

        let due = scheduler.due_retries(t0() + Duration::minutes(10)).await;
        let leases: Vec<LeaseId> = due.iter().map(|t| t.lease_id).collect();
        assert_eq!(leases, vec![early.lease_id, late.lease_id]);
        assert_eq!(scheduler.pending().await, 0);
    }
}
