//! Observability: health probes and registry metrics.

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::{MetricsSnapshot, RegistryMetrics};
