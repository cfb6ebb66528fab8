//! Quota Relay Library
//!
//! Rate-limited, queue-decoupled request/response relay. Callers submit
//! outbound REST calls that are admitted against shared per-route buckets,
//! handed to a durable queue, executed by a worker elsewhere, and answered
//! over a point-to-point connection back to the exact calling process.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod metrics_server;
pub mod rate_limit;
pub mod relay;

pub use error::{RelayError, Result};
