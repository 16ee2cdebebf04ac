//! DevTrust Core - Device identity and trust-state engine
//!
//! This crate issues device identities, discovers devices on the network,
//! ingests their telemetry and reconciles all three into one trust record
//! per device. The implementation prioritizes:
//!
//! 1. **Exactly-once issuance** - one identity per device id, even under races
//! 2. **Conservative defaults** - anything unknown is reported unverified
//! 3. **Logging** - Every decision point logged with operation context
//!
//! ## Architecture
//!
//! The crate is organized into modules:
//! - `engine` - `TrustEngine`, the operations exposed to callers
//! - `issuance` - CSR signing, the local CA and certificate delivery
//! - `discovery` - subnet sweep and mTLS handshake probing
//! - `telemetry` - payload validation and latest-sample storage
//! - `reconcile` - the pure merge into `TrustRecord`s and alert digest
//! - `storage` - durable keyed stores and persisted models
//! - `config` - `EngineConfig` loading and validation
//! - `error` - error taxonomy shared by every component
//! - `logging` - Structured logging with operation context
//!
//! With the `python` feature the crate builds as an extension module
//! exposing the engine to the dashboard.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod issuance;
pub mod logging;
pub mod reconcile;
pub mod storage;
pub mod telemetry;

#[cfg(feature = "python")]
mod python;

pub use config::EngineConfig;
pub use engine::{EngineComponents, TrustEngine, TrustState};
pub use error::{EngineError, ErrorKind};
pub use issuance::IssueRequest;
pub use reconcile::{IssueReason, SeverityClass, TrustRecord, TrustSummary};
pub use telemetry::IngestOutcome;
