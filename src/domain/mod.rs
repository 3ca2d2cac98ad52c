//! Domain layer: value types, events, the pure reducer and business rules,
//! and the ports the application layer drives.

pub mod command;
pub mod decision;
pub mod event;
pub mod lease;
pub mod money;
pub mod ports;
pub mod schedule;
pub mod state_machine;
