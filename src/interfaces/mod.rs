//! Boundary adapters: the CSV command script and the audit export views.

pub mod csv;
pub mod export;
pub mod script;
