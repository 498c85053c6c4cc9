//! Temporal grace access.
//!
//! Short, bandwidth-capped access granted while a payment is verified:
//!
//! ```text
//! UNMONITORED -> GRANTED -> EXPIRED   (deadline)
//!                        -> REVOKED   (caller)
//!                        -> BLOCKED   (sampling policy)
//! ```
//!
//! The monitor owns its own chain, separate from the session chains.

mod monitor;
pub mod policy;

pub use monitor::{GraceError, GraceGrant, GraceMonitor, GraceOutcome, GraceStatus};
pub use policy::{GracePolicy, TrafficStats, Violation};
