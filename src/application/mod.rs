//! Application layer containing the ledger's orchestration logic.
//!
//! This module defines the `LeaseEngine`, which acts as the primary entry
//! point for commands and queries. The engine owns the command processor,
//! the retry scheduler and the state reconstructor; all of them share the
//! event store through the ports defined in `domain::ports`.

pub mod background;
pub mod engine;
pub mod processor;
pub mod projection;
pub mod publisher;
pub mod reconstructor;
pub mod scheduler;
