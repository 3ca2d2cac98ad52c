//! Adapters for the domain ports: storage backends, payment gateways,
//! publishers and clocks.

pub mod clock;
pub mod gateway;
pub mod in_memory;
pub mod publishers;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
