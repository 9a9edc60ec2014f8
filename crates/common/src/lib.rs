//! Shared configuration, error types, IDs, accounting and observability primitives
//! for fanout crates.
//!
//! Architecture role:
//! - defines coordinator/node configuration passed across layers
//! - provides the common [`FanoutError`] / [`Result`] contracts
//! - hosts the query circuit breaker used for per-group RAM accounting
//! - hosts metrics and the optional exporter
//!
//! Key modules:
//! - [`breaker`]
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

pub mod breaker;
pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
#[cfg(feature = "profiling")]
pub mod metrics_exporter;

pub use breaker::{AccountingContext, CircuitBreaker};
pub use config::{CoordinatorConfig, NodeConfig};
pub use error::{FanoutError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
#[cfg(feature = "profiling")]
pub use metrics_exporter::{run_metrics_exporter, spawn_metrics_exporter};
