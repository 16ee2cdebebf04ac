//! Structured logging utilities.
//!
//! Provides context-aware logging with the operation id and device id
//! included in every log message.

use std::fmt;

use uuid::Uuid;

/// Initialize the process logger.
///
/// Info level by default, overridable through `RUST_LOG`. Safe to call more
/// than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Logging context for one engine operation.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub operation_id: String,
    pub device_id: Option<String>,
}

impl LogContext {
    /// New context with a fresh operation id such as `prov-1a2b3c4d`.
    pub fn new(operation: &str) -> Self {
        Self {
            operation_id: format!("{}-{}", operation, &Uuid::new_v4().simple().to_string()[..8]),
            device_id: None,
        }
    }

    pub fn with_device(&self, device_id: &str) -> Self {
        Self {
            operation_id: self.operation_id.clone(),
            device_id: Some(device_id.to_string()),
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_id {
            Some(device) => write!(f, "[op={}] [device={}]", self.operation_id, device),
            None => write!(f, "[op={}]", self.operation_id),
        }
    }
}

/// Log `<ctx> EVENT key=value ...` at `level`.
///
/// Values use their `Display` form; the line is only built when the level
/// is enabled.
#[macro_export]
macro_rules! log_event {
    ($level:expr, $ctx:expr, $event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        if log::log_enabled!($level) {
            #[allow(unused_mut)]
            let mut line = format!("{} {}", $ctx, $event);
            $(line.push_str(&format!(" {}={}", stringify!($key), $value));)*
            log::log!($level, "{}", line);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => { $crate::log_event!(log::Level::Info, $($arg)+) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => { $crate::log_event!(log::Level::Warn, $($arg)+) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => { $crate::log_event!(log::Level::Error, $($arg)+) };
}
