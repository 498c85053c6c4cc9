//! Network access surface for the HTTP layer.

mod facade;
mod gate;

pub use facade::{AccessResult, NetworkFacade};
pub use gate::{GateError, NetworkGate, RETRY_AFTER};
