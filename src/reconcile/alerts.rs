//! Alert digest over reconciled records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::reconciler::TrustRecord;
use super::rules::{IssueReason, SeverityClass};

/// Alerts shown before the rest collapse into `extra_alerts`.
pub const MAX_DISPLAYED_ALERTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub device_id: String,
    pub reasons: Vec<IssueReason>,
    pub severity: SeverityClass,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustSummary {
    pub total_devices: usize,
    pub devices_with_issues: usize,
    pub critical: usize,
    pub warning: usize,
    /// Critical first, then by device id.
    pub alerts: Vec<Alert>,
    pub extra_alerts: usize,
    pub total_alerts: usize,
    /// Most recent `last_seen` across the fleet.
    pub last_updated: Option<DateTime<Utc>>,
}

pub fn summarize(records: &BTreeMap<String, TrustRecord>) -> TrustSummary {
    let mut alerts: Vec<Alert> = records
        .values()
        .filter(|record| record.has_issues())
        .map(|record| Alert {
            device_id: record.device_id.clone(),
            reasons: record.issue_reasons.clone(),
            severity: record.severity_class,
        })
        .collect();
    alerts.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });

    let total_alerts = alerts.len();
    let critical = alerts.iter().filter(|a| a.severity == SeverityClass::Critical).count();
    let warning = alerts.iter().filter(|a| a.severity == SeverityClass::Warning).count();
    alerts.truncate(MAX_DISPLAYED_ALERTS);

    TrustSummary {
        total_devices: records.len(),
        devices_with_issues: total_alerts,
        critical,
        warning,
        extra_alerts: total_alerts - alerts.len(),
        alerts,
        total_alerts,
        last_updated: records.values().filter_map(|r| r.last_seen).max(),
    }
}
