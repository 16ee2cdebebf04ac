//! Sensor digest.
//!
//! Renders the known subsystems of a sensor mapping as a short line such as
//! `43.5°C · CPU 12% · Mem 7% · Disk 6%`. Unknown subsystems and
//! non-numeric values are skipped; the raw mapping is kept elsewhere.

use serde_json::Value;

use super::rules::NO_SENSOR_DATA;
use crate::storage::SensorMap;

const SEPARATOR: &str = " · ";

pub fn summarize_sensors(sensors: Option<&SensorMap>) -> String {
    let Some(sensors) = sensors else {
        return NO_SENSOR_DATA.to_string();
    };

    let mut parts = Vec::new();
    if let Some(temp) = metric(sensors, "cpu", "temp_celsius") {
        parts.push(format!("{:.1}°C", temp));
    }
    // Idle CPUs report 0, which is noise in the digest.
    if let Some(usage) = metric(sensors, "cpu", "usage_percent").filter(|u| *u != 0.0) {
        parts.push(format!("CPU {:.0}%", usage));
    }
    if let Some(mem) = metric(sensors, "memory", "used_percent") {
        parts.push(format!("Mem {:.0}%", mem));
    }
    if let Some(disk) = metric(sensors, "disk", "used_percent") {
        parts.push(format!("Disk {:.0}%", disk));
    }

    if parts.is_empty() {
        NO_SENSOR_DATA.to_string()
    } else {
        parts.join(SEPARATOR)
    }
}

fn metric(sensors: &SensorMap, subsystem: &str, name: &str) -> Option<f64> {
    match sensors.get(subsystem)?.get(name)? {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
