#![deny(missing_docs)]

//! Shared configuration, error types, and observability primitives for
//! packflow crates.
//!
//! Architecture role:
//! - defines scheduler configuration passed across layers
//! - provides common [`PfwError`] / [`Result`] contracts
//! - hosts the metrics registry shared by scheduler and dataset layers
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`metrics`]

/// Shared scheduler configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::PacketizerConfig;
pub use error::{PfwError, Result};
pub use metrics::MetricsRegistry;
