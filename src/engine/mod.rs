//! Engine module.
//!
//! Wires the stores, capabilities and reconciler into `TrustEngine`:
//! - `ledger` - latest discovery record per address
//! - `trust_file` - single-writer trust-state publication
//! - `service` - the engine operations

pub mod ledger;
pub mod service;
pub mod trust_file;

pub use ledger::*;
pub use service::*;
pub use trust_file::*;
