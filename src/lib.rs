//! Event-sourced ledger for leases paid in monthly installments.
//!
//! Every state change is an immutable event appended to a per-lease stream;
//! current and historical state are replays of that stream.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
pub mod telemetry;

pub use application::engine::{ExportFilter, LeaseEngine};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
