use crate::error::{LedgerError, Result};
use crate::domain::ports::GatewayVerdict;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ScriptOp {
    Create,
    Pay,
    Payoff,
    Default,
    /// Advances the clock and fires due retries.
    Tick,
}

/// One line of a command script. Which columns are required depends on `op`.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ScriptRow {
    pub op: ScriptOp,
    pub key: Option<String>,
    /// Alias the script uses for a lease, or a lease id.
    pub lease: Option<String>,
    pub customer: Option<String>,
    pub amount: Option<Decimal>,
    pub term: Option<u32>,
    pub installment: Option<u32>,
    pub at: Option<DateTime<Utc>>,
    /// Gateway verdicts for the charges this row triggers, `;`-separated:
    /// `ok`, `fail` or `fail:<reason>`.
    pub outcome: Option<String>,
}

impl ScriptRow {
    pub fn verdicts(&self) -> Result<Vec<GatewayVerdict>> {
        let Some(outcome) = self.outcome.as_deref() else {
            return Ok(Vec::new());
        };
        outcome
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| match s.split_once(':') {
                None if s.eq_ignore_ascii_case("ok") => Ok(GatewayVerdict::Succeeded),
                None if s.eq_ignore_ascii_case("fail") => Ok(GatewayVerdict::Failed {
                    reason: "Card declined".to_string(),
                }),
                Some((verdict, reason)) if verdict.trim().eq_ignore_ascii_case("fail") => {
                    Ok(GatewayVerdict::Failed {
                        reason: reason.trim().to_string(),
                    })
                }
                _ => Err(LedgerError::Validation(format!("unknown outcome '{s}'"))),
            })
            .collect()
    }
}

/// Reads command script rows from a CSV source.
///
/// Wraps `csv::Reader`, trimming whitespace and tolerating short rows, so
/// each op only has to fill the columns it uses.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes rows.
    pub fn rows(self) -> impl Iterator<Item = Result<ScriptRow>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(LedgerError::from))
    }
}
