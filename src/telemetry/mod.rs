mod metrics;
mod tracing;

pub use self::metrics::{counters, render_registry, Metrics};
pub use self::tracing::{init_tracing, shutdown_tracing, TracingConfig};
