//! Session firewall.
//!
//! Each granted session owns three tagged rules:
//!
//! ```text
//! filter <auth_chain>   -d <ip> -j ACCEPT   /* dl_<contract>_<session> */
//! filter <auth_chain>   -s <ip> -j ACCEPT   /* ul_<contract>_<session> */
//! nat    PREROUTING     -s <ip> -j RETURN   /* <contract>_<session> */
//! ```
//!
//! The counting rules double as the session's traffic meter. The nat rule
//! lets the client past the portal redirect. The comment tags are the only
//! link between a rule and its session, so restoration after a restart is
//! driven entirely by the authority's session list and those tags.

mod engine;
pub mod ledger;
pub mod locks;
mod types;

pub use engine::{compute_time_update, FirewallEngine, MAX_ELAPSED_PER_TICK_SECS};
pub use ledger::{DriftReport, RuleDescriptor, RuleLedger};
pub use locks::{chain_lock, ChainLock, KeyedLocks};
pub use types::*;
