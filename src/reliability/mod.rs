//! Process-level reliability and observability.
//!
//! - Graceful shutdown handling
//! - Prometheus metrics export
//! - Log output setup

pub mod graceful_shutdown;
pub mod metrics;
pub mod tracing;

pub use graceful_shutdown::GracefulShutdown;
pub use metrics::GatewayMetrics;
pub use self::tracing::{init_tracing, TracingConfig};
