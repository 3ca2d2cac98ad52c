use super::csv::command_reader::{ScriptOp, ScriptRow};
use crate::application::engine::LeaseEngine;
use crate::domain::command::{CommandEnvelope, CommandResponse, LeaseCommand};
use crate::domain::lease::LeaseId;
use crate::domain::ports::Clock;
use crate::error::{LedgerError, Result};
use crate::infrastructure::clock::ManualClock;
use crate::infrastructure::gateway::ScriptedGateway;
use std::collections::HashMap;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReport {
    pub applied: usize,
    pub rejected: usize,
}

/// Replays a command script against an engine.
///
/// The runner owns the clock and the gateway the engine was built with, so
/// each row can declare its time and the verdicts of the charges it causes.
/// Scripts name leases by alias; the alias of a `create` row is bound to
/// the lease it produced.
pub struct ScriptRunner<'a> {
    engine: &'a LeaseEngine,
    gateway: ScriptedGateway,
    clock: ManualClock,
    aliases: HashMap<String, LeaseId>,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(engine: &'a LeaseEngine, gateway: ScriptedGateway, clock: ManualClock) -> Self {
        Self {
            engine,
            gateway,
            clock,
            aliases: HashMap::new(),
        }
    }

    /// Applies every row in order. A rejected row is logged and skipped.
    pub async fn run<I>(&mut self, rows: I) -> ScriptReport
    where
        I: IntoIterator<Item = Result<ScriptRow>>,
    {
        let mut report = ScriptReport::default();
        for (index, row) in rows.into_iter().enumerate() {
            let line = index + 2;
            let outcome = match row {
                Ok(row) => self.apply(row).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) => report.applied += 1,
                Err(e) => {
                    tracing::warn!(line, error = %e, "script row rejected");
                    report.rejected += 1;
                }
            }
        }
        report
    }

    /// Applies a single row and returns the responses it produced.
    pub async fn apply(&mut self, row: ScriptRow) -> Result<Vec<CommandResponse>> {
        if let Some(at) = row.at {
            self.clock.set(at);
        }
        for verdict in row.verdicts()? {
            self.gateway.push(verdict).await;
        }

        let result = self.dispatch(&row).await;
        self.gateway.clear().await;
        result
    }

    pub fn lease_id(&self, alias: &str) -> Option<LeaseId> {
        self.aliases.get(alias).copied()
    }

    async fn dispatch(&mut self, row: &ScriptRow) -> Result<Vec<CommandResponse>> {
        let now = self.clock.now();
        let command = match row.op {
            ScriptOp::Tick => return self.engine.poll_retries(now).await,
            ScriptOp::Create => LeaseCommand::CreateLease {
                customer_id: required(&row.customer, "customer")?.clone(),
                principal_amount: *required(&row.amount, "amount")?,
                term_months: *required(&row.term, "term")?,
                first_due_date: None,
            },
            ScriptOp::Pay => LeaseCommand::AttemptPayment {
                lease_id: self.resolve(row)?,
                installment_number: *required(&row.installment, "installment")?,
            },
            ScriptOp::Default => LeaseCommand::DefaultLease {
                lease_id: self.resolve(row)?,
                installment_number: *required(&row.installment, "installment")?,
            },
            ScriptOp::Payoff => LeaseCommand::EarlyPayoff {
                lease_id: self.resolve(row)?,
            },
        };

        let key = required(&row.key, "key")?;
        let envelope = CommandEnvelope::new(command, key.as_str(), now)?;
        let response = self.engine.submit(envelope).await?;

        if row.op == ScriptOp::Create
            && let Some(alias) = row.lease.as_deref()
        {
            self.aliases.insert(alias.to_string(), response.lease_id);
        }
        Ok(vec![response])
    }

    fn resolve(&self, row: &ScriptRow) -> Result<LeaseId> {
        let lease = required(&row.lease, "lease")?;
        if let Some(id) = self.lease_id(lease) {
            return Ok(id);
        }
        lease
            .parse()
            .map_err(|_| LedgerError::Validation(format!("unknown lease '{lease}'")))
    }
}

fn required<'r, T>(value: &'r Option<T>, column: &str) -> Result<&'r T> {
    value
        .as_ref()
        .ok_or_else(|| LedgerError::Validation(format!("column '{column}' is required")))
}
