//! pagefront: a full-page HTTP response cache.
//!
//! The [`cache`] module holds the decision engine; [`infra`] carries the
//! runtime adapters (telemetry, the in-memory store, the origin forwarder)
//! used by the `pagefront` binary.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod util;
