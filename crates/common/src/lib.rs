//! Shared configuration, error types, IDs, and observability primitives for QueryFleet crates.
//!
//! Architecture role:
//! - defines fleet configuration passed across layers
//! - provides common [`QfError`] / [`Result`] contracts
//! - hosts typed query/attempt identifiers
//! - hosts the Prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::FleetConfig;
pub use error::{QfError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
