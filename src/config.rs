//! Runtime configuration.
//!
//! Values come from `LedgerConfig::default()`, overridden by environment
//! variables and finally by CLI flags.

use crate::application::scheduler::RetryPolicy;
use crate::domain::state_machine::DEFAULT_FAILURE_THRESHOLD;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry of a failed installment.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// How long a completed idempotency record deduplicates repeats.
    pub idempotency_ttl: Duration,
    pub retry: RetryConfig,
    /// Reload-and-retry budget for optimistic concurrency conflicts.
    pub max_append_retries: u32,
    pub early_payoff_discount_percent: Decimal,
    pub sweep_interval: Duration,
    pub scheduler_poll_interval: Duration,
    pub dead_letter_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            retry: RetryConfig {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(24 * 60 * 60),
            },
            max_append_retries: 3,
            early_payoff_discount_percent: dec!(2.0),
            sweep_interval: Duration::from_secs(60),
            scheduler_poll_interval: Duration::from_secs(1),
            dead_letter_capacity: 10_000,
        }
    }
}

impl LedgerConfig {
    /// Defaults overridden by any `LEDGER_*` variables that are set and parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            idempotency_ttl: env_secs("LEDGER_IDEMPOTENCY_TTL_SECS")
                .unwrap_or(defaults.idempotency_ttl),
            retry: RetryConfig {
                base_delay: env_secs("LEDGER_RETRY_BASE_DELAY_SECS")
                    .unwrap_or(defaults.retry.base_delay),
                max_delay: env_secs("LEDGER_RETRY_MAX_DELAY_SECS")
                    .unwrap_or(defaults.retry.max_delay),
            },
            max_append_retries: env::var("LEDGER_MAX_APPEND_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_append_retries),
            early_payoff_discount_percent: env::var("LEDGER_PAYOFF_DISCOUNT_PERCENT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.early_payoff_discount_percent),
            sweep_interval: env_secs("LEDGER_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval),
            scheduler_poll_interval: env_secs("LEDGER_SCHEDULER_POLL_SECS")
                .unwrap_or(defaults.scheduler_poll_interval),
            dead_letter_capacity: env::var("LEDGER_DEAD_LETTER_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.dead_letter_capacity),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.idempotency_ttl.is_zero() {
            return Err(invalid("idempotency_ttl must be positive"));
        }
        if self.retry.base_delay.is_zero() {
            return Err(invalid("retry.base_delay must be positive"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid("retry.max_delay must not be below retry.base_delay"));
        }
        if self.early_payoff_discount_percent < Decimal::ZERO
            || self.early_payoff_discount_percent >= Decimal::ONE_HUNDRED
        {
            return Err(invalid(
                "early_payoff_discount_percent must be in [0, 100)",
            ));
        }
        if self.sweep_interval.is_zero() || self.scheduler_poll_interval.is_zero() {
            return Err(invalid("background intervals must be positive"));
        }
        if self.dead_letter_capacity == 0 {
            return Err(invalid("dead_letter_capacity must be positive"));
        }
        Ok(())
    }

    pub fn idempotency_ttl(&self) -> Result<chrono::Duration> {
        to_chrono(self.idempotency_ttl, "idempotency_ttl")
    }
}

impl TryFrom<&LedgerConfig> for RetryPolicy {
    type Error = LedgerError;

    fn try_from(config: &LedgerConfig) -> Result<Self> {
        Ok(RetryPolicy {
            base_delay: to_chrono(config.retry.base_delay, "retry.base_delay")?,
            max_delay: to_chrono(config.retry.max_delay, "retry.max_delay")?,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        })
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

fn to_chrono(value: Duration, field: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(value).map_err(|_| invalid(&format!("{field} is out of range")))
}

fn invalid(message: &str) -> LedgerError {
    LedgerError::Validation(format!("Invalid configuration: {message}"))
}
