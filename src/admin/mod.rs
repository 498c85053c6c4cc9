//! Admin HTTP API using Axum.
//!
//! Provides endpoints for:
//! - Health checks (/healthz, /livez, /readyz)
//! - Metrics (/metrics)
//! - Firewall and grace stats (/stats)

mod handlers;
mod server;

pub use handlers::{
    health_handler, metrics_handler, ready_handler, stats_handler, GraceSummary, HealthResponse,
    ReadinessResponse, StatsResponse,
};
pub use server::{AdminServer, AdminState};
