//! Usage telemetry: per-session byte deltas and host health.

mod host;
mod sync;

pub use host::HostSampler;
pub use sync::{usage_delta, SyncReport, UsageSync};
