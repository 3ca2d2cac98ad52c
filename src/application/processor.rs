//! Idempotent command handling.
//!
//! `handle` claims the idempotency key, derives the current state (cache
//! first, store tail folded on top), asks the pure decision rules for new
//! events, checks them against the reducer and appends them with optimistic
//! concurrency. A `ConcurrencyConflict` reloads and retries a bounded number
//! of times. Publishing happens after the response is recorded and can never
//! fail the command.

use super::projection::{Projection, ProjectionCache};
use super::publisher::EventDispatcher;
use crate::domain::command::{CommandEnvelope, CommandResponse};
use crate::domain::decision::{self, DecisionContext};
use crate::domain::event::{EventRecord, NewEvent};
use crate::domain::lease::{AggregateState, LeaseId};
use crate::domain::ports::{
    BeginOutcome, ClockRef, EventStoreRef, GatewayVerdict, IdempotencyGuardRef, PaymentGatewayRef,
};
use crate::domain::state_machine::{self, DEFAULT_FAILURE_THRESHOLD};
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessorSettings {
    pub max_append_retries: u32,
    pub payoff_discount_percent: Decimal,
    pub failure_threshold: u32,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_append_retries: 3,
            payoff_discount_percent: dec!(2.0),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Result of one `handle` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    pub response: CommandResponse,
    /// Events appended by this call. Empty when the response was replayed.
    pub committed: Vec<EventRecord>,
}

impl Handled {
    pub fn replayed(&self) -> bool {
        self.committed.is_empty()
    }
}

pub struct CommandProcessor {
    store: EventStoreRef,
    guard: IdempotencyGuardRef,
    gateway: PaymentGatewayRef,
    clock: ClockRef,
    cache: ProjectionCache,
    dispatcher: EventDispatcher,
    settings: ProcessorSettings,
}

impl CommandProcessor {
    pub fn new(
        store: EventStoreRef,
        guard: IdempotencyGuardRef,
        gateway: PaymentGatewayRef,
        clock: ClockRef,
        dispatcher: EventDispatcher,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            guard,
            gateway,
            clock,
            cache: ProjectionCache::new(),
            dispatcher,
            settings,
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn guard(&self) -> &IdempotencyGuardRef {
        &self.guard
    }

    pub async fn handle(&self, envelope: &CommandEnvelope) -> Result<Handled> {
        let operation = envelope.operation();
        let key = envelope.idempotency_key.as_str();

        match self
            .guard
            .begin(operation, key, &envelope.fingerprint, self.clock.now())
            .await?
        {
            BeginOutcome::Replay(cached) => {
                tracing::debug!(operation, key, "replaying cached response");
                return Ok(Handled {
                    response: serde_json::from_value(cached)?,
                    committed: Vec::new(),
                });
            }
            BeginOutcome::Proceed => {}
        }

        let handled = match self.execute(envelope).await {
            Ok(handled) => handled,
            Err(e) => {
                self.release(operation, key).await;
                return Err(e);
            }
        };

        // The events are durable at this point. If the response cannot be
        // recorded, free the key: a retry will find the events by origin.
        let recorded = match serde_json::to_value(&handled.response) {
            Ok(value) => self.guard.complete(operation, key, value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = recorded {
            tracing::warn!(operation, key, error = %e, "failed to record idempotent response");
            self.release(operation, key).await;
        }

        self.dispatcher.dispatch(&handled.committed).await;
        Ok(handled)
    }

    async fn release(&self, operation: &str, key: &str) {
        if let Err(e) = self.guard.release(operation, key).await {
            tracing::warn!(operation, key, error = %e, "failed to release idempotency key");
        }
    }

    async fn execute(&self, envelope: &CommandEnvelope) -> Result<Handled> {
        let command_id = envelope.command_id();
        let lease_id = envelope
            .command
            .lease_id()
            .unwrap_or_else(|| LeaseId::for_command(&command_id));
        let mut verdict: Option<GatewayVerdict> = None;
        let mut conflicts = 0;

        loop {
            let projection = self.load(lease_id).await?;

            if projection.command_ids.contains(&command_id) {
                let response = self.rebuild_response(envelope, lease_id, &command_id).await?;
                tracing::debug!(%lease_id, %command_id, "command already applied, rebuilt response");
                return Ok(Handled {
                    response,
                    committed: Vec::new(),
                });
            }

            let state = &projection.state;
            if let Some(last) = state.last_event_at
                && envelope.issued_at < last
            {
                return Err(LedgerError::Validation(format!(
                    "command timestamp {} precedes the last event of lease {} at {}",
                    envelope.issued_at, lease_id, last
                )));
            }

            // The gateway is charged at most once per execution, even if the
            // append has to be retried.
            if verdict.is_none()
                && let Some(charge) = decision::charge_for(
                    state,
                    &envelope.command,
                    self.settings.payoff_discount_percent,
                )?
            {
                let result = self.gateway.attempt(&charge).await?;
                tracing::info!(
                    %lease_id,
                    amount = %charge.amount,
                    succeeded = result.is_success(),
                    "gateway verdict"
                );
                verdict = Some(result);
            }

            let ctx = DecisionContext {
                lease_id,
                issued_at: envelope.issued_at,
                verdict: verdict.clone(),
                payoff_discount_percent: self.settings.payoff_discount_percent,
                failure_threshold: self.settings.failure_threshold,
            };
            let events = decision::decide(state, &envelope.command, &ctx)?;
            let batch = events
                .iter()
                .map(|e| e.to_new_event(envelope.issued_at, &command_id))
                .collect::<Result<Vec<NewEvent>>>()?;

            // Candidate events must reduce cleanly before they are committed.
            let preview: Vec<EventRecord> = batch
                .iter()
                .cloned()
                .enumerate()
                .map(|(idx, e)| e.into_record(lease_id, state.version + idx as u64 + 1))
                .collect();
            let next = projection.clone().advance(&preview)?;

            match self.store.append(lease_id, state.version, batch).await {
                Ok(committed) => {
                    self.cache.put(lease_id, next.clone()).await;
                    let response = respond(envelope, lease_id, &next.state, &committed)?;
                    tracing::info!(
                        %lease_id,
                        operation = envelope.operation(),
                        key = %envelope.idempotency_key,
                        sequence_no = response.last_sequence_no,
                        status = %response.status,
                        events = committed.len(),
                        "command committed"
                    );
                    return Ok(Handled {
                        response,
                        committed,
                    });
                }
                Err(LedgerError::ConcurrencyConflict {
                    expected, actual, ..
                }) if conflicts < self.settings.max_append_retries => {
                    conflicts += 1;
                    tracing::warn!(
                        %lease_id,
                        expected,
                        actual,
                        attempt = conflicts,
                        "concurrent append, reloading"
                    );
                    self.cache.invalidate(lease_id).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current projection of a lease: the cached copy if it is still at the
    /// store's sequence, otherwise the cache (or nothing) plus the missing tail.
    pub async fn load(&self, lease_id: LeaseId) -> Result<Projection> {
        let current = self.store.current_sequence(lease_id).await?;
        let cached = self
            .cache
            .get(lease_id)
            .await
            .filter(|p| p.version() <= current)
            .unwrap_or_default();

        if cached.version() == current {
            tracing::debug!(%lease_id, sequence_no = current, "projection cache hit");
            return Ok(cached);
        }

        let tail = self.store.read(lease_id, cached.version()).await?;
        let projection = cached.advance(&tail)?;
        self.cache.put(lease_id, projection.clone()).await;
        Ok(projection)
    }

    pub async fn state(&self, lease_id: LeaseId) -> Result<AggregateState> {
        Ok(self.load(lease_id).await?.state)
    }

    async fn rebuild_response(
        &self,
        envelope: &CommandEnvelope,
        lease_id: LeaseId,
        command_id: &str,
    ) -> Result<CommandResponse> {
        let events = self.store.read(lease_id, 0).await?;
        let last = events
            .iter()
            .rposition(|e| e.origin_command_id == command_id)
            .ok_or_else(|| {
                LedgerError::Storage(format!(
                    "events of {command_id} vanished from lease {lease_id}"
                ))
            })?;
        let state = state_machine::reduce(&events[..=last])?;
        let own: Vec<EventRecord> = events[..=last]
            .iter()
            .filter(|e| e.origin_command_id == command_id)
            .cloned()
            .collect();
        respond(envelope, lease_id, &state, &own)
    }
}

fn respond(
    envelope: &CommandEnvelope,
    lease_id: LeaseId,
    state: &AggregateState,
    events: &[EventRecord],
) -> Result<CommandResponse> {
    let status = state.status().ok_or_else(|| {
        LedgerError::StateConflict(format!("lease {lease_id} does not exist"))
    })?;
    let amount_charged = events
        .iter()
        .find(|e| matches!(e.event_type.as_str(), "PAYMENT_SUCCEEDED" | "EARLY_PAYOFF_SETTLED"))
        .and_then(|e| e.amount);

    Ok(CommandResponse {
        operation: envelope.operation().to_string(),
        lease_id,
        status,
        last_sequence_no: events.last().map_or(state.version, |e| e.sequence_no),
        event_types: events.iter().map(|e| e.event_type.clone()).collect(),
        amount_charged,
    })
}
