#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use lease_ledger::application::engine::LeaseEngine;
use lease_ledger::config::LedgerConfig;
use lease_ledger::domain::command::{CommandEnvelope, CommandResponse, LeaseCommand};
use lease_ledger::domain::lease::LeaseId;
use lease_ledger::domain::ports::Clock;
use lease_ledger::error::Result;
use lease_ledger::infrastructure::clock::ManualClock;
use lease_ledger::infrastructure::gateway::ScriptedGateway;
use lease_ledger::infrastructure::in_memory::{InMemoryEventStore, InMemoryIdempotencyGuard};
use lease_ledger::infrastructure::publishers::RecordingPublisher;
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

pub struct Harness {
    pub engine: LeaseEngine,
    pub store: Arc<InMemoryEventStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub publisher: Arc<RecordingPublisher>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    harness_with(LedgerConfig::default())
}

pub fn harness_with(config: LedgerConfig) -> Harness {
    let store = Arc::new(InMemoryEventStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let clock = Arc::new(ManualClock::new(start()));
    let engine = LeaseEngine::new(
        &config,
        store.clone(),
        Arc::new(InMemoryIdempotencyGuard::new(config.idempotency_ttl().unwrap())),
        gateway.clone(),
        publisher.clone(),
        clock.clone(),
    )
    .unwrap();
    Harness {
        engine,
        store,
        gateway,
        publisher,
        clock,
    }
}

impl Harness {
    pub fn envelope(&self, command: LeaseCommand, key: &str) -> CommandEnvelope {
        CommandEnvelope::new(command, key, self.clock.now()).unwrap()
    }

    pub async fn create(&self, principal: Decimal, term: u32) -> CommandResponse {
        let envelope = self.envelope(
            LeaseCommand::CreateLease {
                customer_id: "cust-1".to_string(),
                principal_amount: principal,
                term_months: term,
                first_due_date: None,
            },
            "create-1",
        );
        self.engine.submit(envelope).await.unwrap()
    }

    pub async fn pay(&self, lease_id: LeaseId, installment_number: u32) -> Result<CommandResponse> {
        let envelope = self.envelope(
            LeaseCommand::AttemptPayment {
                lease_id,
                installment_number,
            },
            &format!("pay-{installment_number}"),
        );
        self.engine.submit(envelope).await
    }

    pub async fn payoff(&self, lease_id: LeaseId, key: &str) -> Result<CommandResponse> {
        let envelope = self.envelope(LeaseCommand::EarlyPayoff { lease_id }, key);
        self.engine.submit(envelope).await
    }
}

/// Writes a script that creates one lease and pays `payments` installments.
pub fn generate_script(path: &Path, term: u32, payments: u32) -> std::result::Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record([
        "op",
        "key",
        "lease",
        "customer",
        "amount",
        "term",
        "installment",
        "at",
        "outcome",
    ])?;
    let principal = (term * 100).to_string();
    wtr.write_record([
        "create",
        "c-1",
        "L1",
        "cust-1",
        principal.as_str(),
        &term.to_string(),
        "",
        "2025-01-01T00:00:00Z",
        "",
    ])?;

    for n in 1..=payments {
        let at = start() + chrono::Duration::days(30 * i64::from(n));
        wtr.write_record([
            "pay",
            &format!("p-{n}"),
            "L1",
            "",
            "",
            "",
            &n.to_string(),
            &at.to_rfc3339(),
            "ok",
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
