//! portald: captive-portal edge agent.
//!
//! Turns session decisions from the remote authority into packet-filter
//! rules, grants short monitored access while payments are verified, and
//! reports usage back.

pub mod admin;
pub mod authority;
pub mod bootstrap;
pub mod config;
pub mod firewall;
pub mod grace;
pub mod network;
pub mod ruletool;
pub mod telemetry;
pub mod usage;
