//! Content scanning for telemetry values.
//!
//! Sensor values and statuses end up rendered by the dashboard, so string
//! content is checked for markup, script and shell injection patterns.
//! Detections are logged, never removed: the raw mapping is kept verbatim.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::logging::structured::LogContext;

/// Largest single string value scanned without flagging.
pub const MAX_FIELD_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threat {
    Markup,
    Command,
    PathTraversal,
}

impl Threat {
    fn as_str(&self) -> &'static str {
        match self {
            Threat::Markup => "markup",
            Threat::Command => "cmd",
            Threat::PathTraversal => "path",
        }
    }
}

lazy_static! {
    static ref PATTERNS: Vec<(Threat, Regex)> = vec![
        (Threat::Markup, Regex::new(r"(?i)<script[^>]*>").unwrap()),
        (Threat::Markup, Regex::new(r"(?i)javascript:").unwrap()),
        (Threat::Markup, Regex::new(r"(?i)\bon\w+\s*=").unwrap()),
        (Threat::Markup, Regex::new(r"(?i)<(iframe|object|embed|svg)[^>]*>").unwrap()),
        (Threat::Command, Regex::new(r";\s*(rm|cat|wget|curl|chmod)\s").unwrap()),
        (Threat::Command, Regex::new(r"\|\s*(bash|sh|zsh)\b").unwrap()),
        (Threat::Command, Regex::new(r"\$\([^)]+\)").unwrap()),
        (Threat::PathTraversal, Regex::new(r"\.\.[\\/]").unwrap()),
        (Threat::PathTraversal, Regex::new(r"[\\/]etc[\\/](passwd|shadow)").unwrap()),
    ];
}

/// Detection counts for one payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ContentScan {
    pub markup: usize,
    pub command: usize,
    pub path_traversal: usize,
    pub oversized_fields: usize,
}

impl ContentScan {
    pub fn total(&self) -> usize {
        self.markup + self.command + self.path_traversal + self.oversized_fields
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    fn record(&mut self, threat: Threat) {
        match threat {
            Threat::Markup => self.markup += 1,
            Threat::Command => self.command += 1,
            Threat::PathTraversal => self.path_traversal += 1,
        }
    }
}

/// Scan every key and string value of `payload`.
pub fn scan_payload(payload: &Value, ctx: &LogContext) -> ContentScan {
    let mut scan = ContentScan::default();
    scan_value(payload, ctx, &mut scan);

    if scan.is_clean() {
        log::debug!("{} CONTENT_SCAN_CLEAN", ctx);
    } else {
        log::warn!(
            "{} CONTENT_DETECTIONS markup={} cmd={} path={} oversized={}",
            ctx,
            scan.markup,
            scan.command,
            scan.path_traversal,
            scan.oversized_fields
        );
    }
    scan
}

fn scan_value(value: &Value, ctx: &LogContext, scan: &mut ContentScan) {
    match value {
        Value::String(s) => scan_str(s, ctx, scan),
        Value::Array(items) => items.iter().for_each(|item| scan_value(item, ctx, scan)),
        Value::Object(map) => {
            for (key, item) in map {
                scan_str(key, ctx, scan);
                scan_value(item, ctx, scan);
            }
        }
        _ => {}
    }
}

fn scan_str(s: &str, ctx: &LogContext, scan: &mut ContentScan) {
    if s.len() > MAX_FIELD_SIZE {
        log::debug!("{} FIELD_OVERSIZED size={} limit={}", ctx, s.len(), MAX_FIELD_SIZE);
        scan.oversized_fields += 1;
    }
    for (threat, pattern) in PATTERNS.iter() {
        if pattern.is_match(s) {
            log::debug!(
                "{} PATTERN_DETECTED type={} pattern={}",
                ctx,
                threat.as_str(),
                pattern.as_str()
            );
            scan.record(*threat);
        }
    }
}
