use super::processor::{CommandProcessor, Handled, ProcessorSettings};
use super::publisher::{EventDispatcher, RedeliveryReport};
use super::reconstructor::{StateReconstructor, TimelineEntry};
use super::scheduler::{RetryDecision, RetryPolicy, RetryScheduler, RetryTimer};
use crate::config::LedgerConfig;
use crate::domain::command::{CommandEnvelope, CommandResponse, LeaseCommand};
use crate::domain::event::{EventRecord, LeaseEvent};
use crate::domain::lease::{
    AggregateState, InstallmentStatus, LeaseId, LeaseStatus, PaymentInstallment,
};
use crate::domain::ports::{
    ClockRef, EventPublisherRef, EventStoreRef, IdempotencyGuardRef, PaymentGatewayRef,
};
use crate::error::Result;
use chrono::{DateTime, Utc};

/// Filter applied to audit exports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportFilter {
    pub lease_id: Option<LeaseId>,
    /// Empty means every event type.
    pub event_types: Vec<String>,
}

impl ExportFilter {
    pub fn matches(&self, record: &EventRecord) -> bool {
        self.lease_id.is_none_or(|id| id == record.aggregate_id)
            && (self.event_types.is_empty()
                || self
                    .event_types
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(&record.event_type)))
    }
}

/// The main entry point of the ledger.
///
/// `LeaseEngine` wires the command processor to the retry scheduler and the
/// state reconstructor. Every write goes through [`LeaseEngine::submit`] or
/// the scheduler's poll; reads are pure replays of the event store.
pub struct LeaseEngine {
    processor: CommandProcessor,
    scheduler: RetryScheduler,
    reconstructor: StateReconstructor,
    store: EventStoreRef,
    clock: ClockRef,
}

impl LeaseEngine {
    /// Creates a new `LeaseEngine`.
    ///
    /// # Arguments
    ///
    /// * `store` - The event store holding every lease stream.
    /// * `guard` - Idempotency records, scoped by `(operation, key)`.
    /// * `gateway` - Payment capability used for installments and payoffs.
    /// * `publisher` - Receives committed events; failures are parked.
    /// * `clock` - Source of `now` for polling and idempotency expiry.
    pub fn new(
        config: &LedgerConfig,
        store: EventStoreRef,
        guard: IdempotencyGuardRef,
        gateway: PaymentGatewayRef,
        publisher: EventPublisherRef,
        clock: ClockRef,
    ) -> Result<Self> {
        let policy = RetryPolicy::try_from(config)?;
        let settings = ProcessorSettings {
            max_append_retries: config.max_append_retries,
            payoff_discount_percent: config.early_payoff_discount_percent,
            failure_threshold: policy.failure_threshold,
        };
        let dispatcher = EventDispatcher::new(publisher, config.dead_letter_capacity);

        Ok(Self {
            processor: CommandProcessor::new(
                store.clone(),
                guard,
                gateway,
                clock.clone(),
                dispatcher,
                settings,
            ),
            scheduler: RetryScheduler::new(policy),
            reconstructor: StateReconstructor::new(store.clone()),
            store,
            clock,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// Handles a command and feeds any payment failure it produced to the
    /// retry scheduler.
    pub async fn submit(&self, envelope: CommandEnvelope) -> Result<CommandResponse> {
        let handled = self.processor.handle(&envelope).await?;
        self.observe(&handled).await;
        Ok(handled.response)
    }

    /// The command is committed by the time this runs, so a follow-up that
    /// fails is logged and re-armed rather than reported to the caller.
    async fn observe(&self, handled: &Handled) {
        for record in &handled.committed {
            if record.event_type != "PAYMENT_FAILED" {
                continue;
            }
            let installment_number = match LeaseEvent::decode(record) {
                Ok(LeaseEvent::PaymentFailed {
                    installment_number,
                    ..
                }) => installment_number,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(
                        lease_id = %record.aggregate_id,
                        sequence_no = record.sequence_no,
                        error = %e,
                        "undecodable payment failure"
                    );
                    continue;
                }
            };
            if let Err(e) = self
                .schedule_retry(record.aggregate_id, installment_number, record.timestamp)
                .await
            {
                tracing::warn!(
                    lease_id = %record.aggregate_id,
                    installment = installment_number,
                    error = %e,
                    "retry follow-up failed, re-arming timer"
                );
                self.rearm(record.aggregate_id, installment_number, self.clock.now())
                    .await;
            }
        }
    }

    async fn rearm(&self, lease_id: LeaseId, installment_number: u32, now: DateTime<Utc>) {
        self.scheduler
            .schedule(RetryTimer {
                due_at: now + self.scheduler.policy().base_delay,
                lease_id,
                installment_number,
            })
            .await;
    }

    async fn schedule_retry(
        &self,
        lease_id: LeaseId,
        installment_number: u32,
        at: DateTime<Utc>,
    ) -> Result<Option<RetryTimer>> {
        let state = self.processor.state(lease_id).await?;
        let Some(installment) = state
            .lease
            .as_ref()
            .and_then(|l| l.installment(installment_number))
        else {
            return Ok(None);
        };

        match self.scheduler.on_payment_failure(installment).await? {
            RetryDecision::Scheduled(timer) => Ok(Some(timer)),
            RetryDecision::Default {
                lease_id,
                installment_number,
            } => {
                tracing::warn!(
                    %lease_id,
                    installment = installment_number,
                    failures = installment.retry_count,
                    "failure threshold reached, defaulting lease"
                );
                let envelope = CommandEnvelope::new(
                    LeaseCommand::DefaultLease {
                        lease_id,
                        installment_number,
                    },
                    format!("auto-default:{lease_id}:{installment_number}"),
                    at.max(state.last_event_at.unwrap_or(at)),
                )?;
                self.processor.handle(&envelope).await?;
                Ok(None)
            }
        }
    }

    /// Fires every retry due at `now`. Each timer is re-validated against the
    /// current state first; timers of settled installments or terminal leases
    /// are dropped silently.
    pub async fn poll_retries(&self, now: DateTime<Utc>) -> Result<Vec<CommandResponse>> {
        let mut responses = Vec::new();

        for timer in self.scheduler.due_retries(now).await {
            match self.retry(timer, now).await {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        lease_id = %timer.lease_id,
                        installment = timer.installment_number,
                        error = %e,
                        "retry failed, re-arming timer"
                    );
                    self.rearm(timer.lease_id, timer.installment_number, now)
                        .await;
                }
            }
        }
        Ok(responses)
    }

    async fn retry(&self, timer: RetryTimer, now: DateTime<Utc>) -> Result<Option<CommandResponse>> {
        let state = self.processor.state(timer.lease_id).await?;
        let Some(installment) = retryable(&state, timer.installment_number) else {
            tracing::debug!(
                lease_id = %timer.lease_id,
                installment = timer.installment_number,
                "stale retry timer"
            );
            return Ok(None);
        };
        let (status, retry_count) = (installment.status, installment.retry_count);
        let issued_at = state.last_event_at.map_or(now, |last| now.max(last));

        // the default owed by the last failure never committed
        if retry_count >= self.scheduler.policy().failure_threshold {
            self.schedule_retry(timer.lease_id, timer.installment_number, issued_at)
                .await?;
            return Ok(None);
        }

        let scope = format!(
            "{}:{}:{}",
            timer.lease_id, timer.installment_number, retry_count
        );

        // PENDING here means an earlier attempt reopened the installment but
        // never got a verdict from the gateway.
        if status == InstallmentStatus::Failed {
            let reopen = CommandEnvelope::new(
                LeaseCommand::ReopenInstallment {
                    lease_id: timer.lease_id,
                    installment_number: timer.installment_number,
                },
                format!("retry:{scope}"),
                issued_at,
            )?;
            self.processor.handle(&reopen).await?;
        }

        let attempt = CommandEnvelope::new(
            LeaseCommand::AttemptPayment {
                lease_id: timer.lease_id,
                installment_number: timer.installment_number,
            },
            format!("retry-attempt:{scope}"),
            issued_at,
        )?;
        self.submit(attempt).await.map(Some)
    }

    /// Current state of a lease, folded from the store.
    pub async fn state(&self, lease_id: LeaseId) -> Result<AggregateState> {
        self.processor.state(lease_id).await
    }

    pub async fn state_at(&self, lease_id: LeaseId, at: DateTime<Utc>) -> Result<AggregateState> {
        self.reconstructor.state_at(lease_id, at).await
    }

    pub async fn timeline(&self, lease_id: LeaseId) -> Result<Vec<TimelineEntry>> {
        self.reconstructor.timeline(lease_id).await
    }

    /// Committed events in commit order, narrowed by `filter`.
    pub async fn export(&self, filter: &ExportFilter) -> Result<Vec<EventRecord>> {
        let records = match filter.lease_id {
            Some(lease_id) => self.store.read(lease_id, 0).await?,
            None => self.store.read_all().await?,
        };
        Ok(records.into_iter().filter(|r| filter.matches(r)).collect())
    }

    /// Rebuilds retry timers from the store. Timers are not persisted, so
    /// this runs once at startup. Installments already at the failure
    /// threshold get the default they are owed.
    pub async fn rehydrate(&self) -> Result<usize> {
        let mut armed = 0;
        for lease_id in self.store.aggregate_ids().await? {
            let state = self.processor.state(lease_id).await?;
            let Some(lease) = state.lease.as_ref() else {
                continue;
            };
            if lease.status != LeaseStatus::Active {
                continue;
            }
            let failed: Vec<(u32, Option<DateTime<Utc>>)> = lease
                .installments
                .iter()
                .filter(|i| retryable(&state, i.installment_number).is_some())
                .map(|i| (i.installment_number, i.last_attempt_at))
                .collect();
            for (installment_number, last_attempt_at) in failed {
                let at = last_attempt_at.unwrap_or_else(|| self.clock.now());
                if self
                    .schedule_retry(lease_id, installment_number, at)
                    .await?
                    .is_some()
                {
                    armed += 1;
                }
            }
        }
        tracing::info!(timers = armed, "retry timers rehydrated");
        Ok(armed)
    }

    pub async fn redeliver_dead_letters(&self) -> RedeliveryReport {
        self.processor.dispatcher().redeliver().await
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.processor.dispatcher().dead_letters().await.len()
    }

    /// Drops expired idempotency records.
    pub async fn sweep_idempotency(&self) -> Result<usize> {
        let removed = self.processor.guard().sweep(self.clock.now()).await?;
        if removed > 0 {
            tracing::debug!(removed, "expired idempotency records swept");
        }
        Ok(removed)
    }
}

/// The installment, if it may be retried now: FAILED, or PENDING after a
/// failure whose retry was interrupted.
fn retryable(state: &AggregateState, installment_number: u32) -> Option<&PaymentInstallment> {
    let lease = state.lease.as_ref()?;
    if lease.status != LeaseStatus::Active {
        return None;
    }
    lease.installment(installment_number).filter(|i| match i.status {
        InstallmentStatus::Failed => true,
        InstallmentStatus::Pending => i.retry_count > 0,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::RequestFingerprint;
    use crate::domain::money::Money;
    use crate::domain::ports::{Clock, IdempotencyGuard};
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::gateway::ScriptedGateway;
    use crate::infrastructure::in_memory::{InMemoryEventStore, InMemoryIdempotencyGuard};
    use crate::infrastructure::publishers::RecordingPublisher;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Harness {
        engine: LeaseEngine,
        gateway: Arc<ScriptedGateway>,
        clock: Arc<ManualClock>,
        store: Arc<InMemoryEventStore>,
        guard: Arc<InMemoryIdempotencyGuard>,
    }

    fn harness() -> Harness {
        let config = LedgerConfig::default();
        let store = Arc::new(InMemoryEventStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let guard = Arc::new(InMemoryIdempotencyGuard::new(Duration::hours(24)));
        let engine = LeaseEngine::new(
            &config,
            store.clone(),
            guard.clone(),
            gateway.clone(),
            Arc::new(RecordingPublisher::new()),
            clock.clone(),
        )
        .unwrap();
        Harness {
            engine,
            gateway,
            clock,
            store,
            guard,
        }
    }

    async fn create(h: &Harness, principal: rust_decimal::Decimal, term: u32) -> LeaseId {
        let envelope = CommandEnvelope::new(
            LeaseCommand::CreateLease {
                customer_id: "cust-1".to_string(),
                principal_amount: principal,
                term_months: term,
                first_due_date: None,
            },
            "create-1",
            h.clock.now(),
        )
        .unwrap();
        h.engine.submit(envelope).await.unwrap().lease_id
    }

    async fn pay(h: &Harness, lease_id: LeaseId, n: u32) -> CommandResponse {
        let envelope = CommandEnvelope::new(
            LeaseCommand::AttemptPayment {
                lease_id,
                installment_number: n,
            },
            format!("pay-{n}"),
            h.clock.now(),
        )
        .unwrap();
        h.engine.submit(envelope).await.unwrap()
    }

    #[tokio::test]
    async fn test_failure_arms_retry_and_poll_retries() {
        let h = harness();
        let lease_id = create(&h, dec!(300), 3).await;

        h.gateway.push_failure("Card declined").await;
        pay(&h, lease_id, 1).await;
        assert_eq!(h.engine.scheduler().pending().await, 1);

        // not due yet
        assert!(h.engine.poll_retries(h.clock.now()).await.unwrap().is_empty());

        h.clock.advance(Duration::minutes(1));
        let responses = h.engine.poll_retries(h.clock.now()).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].event_types, vec!["PAYMENT_SUCCEEDED"]);

        let state = h.engine.state(lease_id).await.unwrap();
        let installment = state.lease.unwrap().installments[0].clone();
        assert_eq!(installment.status, InstallmentStatus::Paid);
        assert_eq!(installment.retry_count, 1);
    }

    #[tokio::test]
    async fn test_stale_timer_is_dropped() {
        let h = harness();
        let lease_id = create(&h, dec!(300), 3).await;

        h.gateway.push_failure("Card declined").await;
        pay(&h, lease_id, 1).await;

        let payoff = CommandEnvelope::new(
            LeaseCommand::EarlyPayoff { lease_id },
            "payoff-1",
            h.clock.now(),
        )
        .unwrap();
        h.engine.submit(payoff).await.unwrap();

        h.clock.advance(Duration::hours(1));
        assert!(h.engine.poll_retries(h.clock.now()).await.unwrap().is_empty());
        assert_eq!(h.gateway.charges().await.len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_default_does_not_fail_the_payment() {
        let h = harness();
        let lease_id = create(&h, dec!(300), 3).await;
        for _ in 0..3 {
            h.gateway.push_failure("Card declined").await;
        }

        // hold the automatic default's key so it cannot commit
        let default_key = format!("auto-default:{lease_id}:1");
        let fingerprint = RequestFingerprint::of(&LeaseCommand::DefaultLease {
            lease_id,
            installment_number: 1,
        })
        .unwrap();
        h.guard
            .begin("DEFAULT_LEASE", &default_key, &fingerprint, h.clock.now())
            .await
            .unwrap();

        pay(&h, lease_id, 1).await;
        h.clock.advance(Duration::minutes(1));
        h.engine.poll_retries(h.clock.now()).await.unwrap();
        h.clock.advance(Duration::minutes(2));
        let responses = h.engine.poll_retries(h.clock.now()).await.unwrap();
        assert_eq!(responses[0].event_types, vec!["PAYMENT_FAILED"]);

        let state = h.engine.state(lease_id).await.unwrap();
        assert_eq!(state.status(), Some(LeaseStatus::Active));
        assert_eq!(h.engine.scheduler().pending().await, 1);

        h.guard.release("DEFAULT_LEASE", &default_key).await.unwrap();
        h.clock.advance(Duration::minutes(1));
        assert!(h.engine.poll_retries(h.clock.now()).await.unwrap().is_empty());

        let state = h.engine.state(lease_id).await.unwrap();
        assert_eq!(state.status(), Some(LeaseStatus::Defaulted));
        assert_eq!(h.gateway.charges().await.len(), 3);
    }

    #[tokio::test]
    async fn test_rehydrate_rebuilds_timers() {
        let h = harness();
        let lease_id = create(&h, dec!(300), 3).await;
        h.gateway.push_failure("Card declined").await;
        pay(&h, lease_id, 2).await;

        let fresh = LeaseEngine::new(
            &LedgerConfig::default(),
            h.store.clone(),
            Arc::new(InMemoryIdempotencyGuard::new(Duration::hours(24))),
            h.gateway.clone(),
            Arc::new(RecordingPublisher::new()),
            h.clock.clone(),
        )
        .unwrap();
        assert_eq!(fresh.rehydrate().await.unwrap(), 1);
        assert_eq!(fresh.scheduler().pending().await, 1);
    }

    #[tokio::test]
    async fn test_export_filters_by_type() {
        let h = harness();
        let lease_id = create(&h, dec!(300), 3).await;
        pay(&h, lease_id, 1).await;

        let filter = ExportFilter {
            lease_id: Some(lease_id),
            event_types: vec!["payment_succeeded".to_string()],
        };
        let records = h.engine.export(&filter).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, Some(Money::new(dec!(100))));

        let everything = h.engine.export(&ExportFilter::default()).await.unwrap();
        let sequences: Vec<u64> = everything.iter().map(|r| r.sequence_no).collect();
        assert_eq!(sequences, (1..=6).collect::<Vec<u64>>());
    }
}
