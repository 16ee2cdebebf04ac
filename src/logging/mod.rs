//! Structured logging with operation context.
//!
//! Provides logging macros and utilities that include the operation id and
//! device id in every log message for easy correlation.

pub mod structured;

pub use structured::*;
