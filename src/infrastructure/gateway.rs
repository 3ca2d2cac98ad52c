use crate::domain::ports::{Charge, GatewayVerdict, PaymentGateway};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Replays queued verdicts in order and approves once the queue is empty.
/// Every charge it receives is recorded. `fail_next` makes the following
/// calls error out as if the processor could not be reached.
#[derive(Default, Clone)]
pub struct ScriptedGateway {
    verdicts: Arc<Mutex<VecDeque<GatewayVerdict>>>,
    charges: Arc<Mutex<Vec<Charge>>>,
    outages: Arc<Mutex<usize>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, verdict: GatewayVerdict) {
        self.verdicts.lock().await.push_back(verdict);
    }

    pub async fn push_failure(&self, reason: &str) {
        self.push(GatewayVerdict::Failed {
            reason: reason.to_string(),
        })
        .await;
    }

    pub async fn fail_next(&self, count: usize) {
        *self.outages.lock().await = count;
    }

    /// Drops verdicts nothing consumed.
    pub async fn clear(&self) {
        self.verdicts.lock().await.clear();
    }

    pub async fn charges(&self) -> Vec<Charge> {
        self.charges.lock().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn attempt(&self, charge: &Charge) -> Result<GatewayVerdict> {
        self.charges.lock().await.push(charge.clone());
        {
            let mut outages = self.outages.lock().await;
            if *outages > 0 {
                *outages -= 1;
                return Err(LedgerError::GatewayUnavailable(
                    "connection refused".to_string(),
                ));
            }
        }
        Ok(self
            .verdicts
            .lock()
            .await
            .pop_front()
            .unwrap_or(GatewayVerdict::Succeeded))
    }
}

const DECLINE_REASONS: [&str; 4] = [
    "Insufficient funds",
    "Card declined",
    "Card expired",
    "Processing error",
];

/// Stand-in for a real processor: approves with a fixed probability and
/// declines with a random reason otherwise.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedGateway {
    success_rate: f64,
}

impl SimulatedGateway {
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(0.7)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn attempt(&self, charge: &Charge) -> Result<GatewayVerdict> {
        let verdict = {
            let mut rng = rand::thread_rng();
            if rng.gen_bool(self.success_rate) {
                GatewayVerdict::Succeeded
            } else {
                let reason = DECLINE_REASONS[rng.gen_range(0..DECLINE_REASONS.len())];
                GatewayVerdict::Failed {
                    reason: reason.to_string(),
                }
            }
        };
        tracing::debug!(
            lease_id = %charge.lease_id,
            amount = %charge.amount,
            ?verdict,
            "simulated charge"
        );
        Ok(verdict)
    }
}
