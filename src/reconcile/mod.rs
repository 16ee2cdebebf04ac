//! Trust reconciliation module.
//!
//! Turns identities, discovery results and telemetry into the canonical
//! per-device trust view:
//! - `rules` - default table and issue/severity classification
//! - `sensors` - human-readable sensor digest
//! - `reconciler` - the pure merge producing `TrustRecord`s
//! - `alerts` - fleet-level alert digest

pub mod alerts;
pub mod reconciler;
pub mod rules;
pub mod sensors;

pub use alerts::*;
pub use reconciler::*;
pub use rules::*;
pub use sensors::*;
