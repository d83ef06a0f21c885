//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod memory_store;
pub mod telemetry;
pub mod upstream;
