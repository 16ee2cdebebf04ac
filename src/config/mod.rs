//! Configuration module.
//!
//! Engine settings loaded from a TOML file, overridable through
//! `DEVTRUST_*` environment variables and validated before use.

pub mod settings;

pub use settings::*;
