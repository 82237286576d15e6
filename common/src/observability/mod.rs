//! Observability utilities (metrics + tracing).

mod metrics;
mod tracing;

pub use metrics::{DropReason, MetricsContext, MetricsServerConfig};
pub use tracing::init_tracing;
