//! Python bindings for the dashboard.
//!
//! One process-wide engine, opened by `open_engine` and shared by every
//! call. Trust records cross the boundary as JSON strings so the dashboard
//! keeps its existing `json.loads` handling.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::config::EngineConfig;
use crate::engine::TrustEngine;
use crate::error::{EngineError, ErrorKind};
use crate::logging::init_logging;
use crate::storage::DeviceIdentity;
use crate::telemetry::IngestOutcome;

lazy_static! {
    static ref ENGINE: RwLock<Option<Arc<TrustEngine>>> = RwLock::new(None);
}

fn engine() -> PyResult<Arc<TrustEngine>> {
    ENGINE
        .read()
        .clone()
        .ok_or_else(|| PyRuntimeError::new_err("engine not opened; call open_engine first"))
}

fn to_py_err(e: EngineError) -> PyErr {
    let message = format!("{}: {}", e.reason_code(), e);
    match e.kind() {
        ErrorKind::InputValidation => PyValueError::new_err(message),
        _ => PyRuntimeError::new_err(message),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> PyResult<String> {
    serde_json::to_string(value).map_err(|e| PyRuntimeError::new_err(e.to_string()))
}

fn load_config(config_path: Option<&str>, state_dir: Option<&str>) -> anyhow::Result<EngineConfig> {
    let mut config = match config_path {
        Some(path) => EngineConfig::load_from_file(Path::new(path))?,
        None => {
            let mut config = EngineConfig::default();
            config.merge_with_env()?;
            config
        }
    };
    if let Some(dir) = state_dir {
        config.state_dir = dir.into();
    }
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

fn identity_dict<'py>(py: Python<'py>, identity: &DeviceIdentity) -> PyResult<&'py PyDict> {
    let dict = PyDict::new(py);
    dict.set_item("device_id", &identity.device_id)?;
    dict.set_item("common_name", &identity.certificate_common_name)?;
    dict.set_item("serial", &identity.serial)?;
    dict.set_item("issued_at", identity.issued_at.to_rfc3339())?;
    dict.set_item("valid_to", identity.certificate_validity_window.to.to_rfc3339())?;
    dict.set_item("certificate_pem", &identity.certificate_pem)?;
    dict.set_item("revoked", identity.revoked)?;
    Ok(dict)
}

/// Open (or reopen) the process-wide engine.
///
/// # Arguments
/// * `config_path` - Optional TOML config file
/// * `state_dir` - Optional override of the config's state directory
#[pyfunction]
#[pyo3(signature = (config_path=None, state_dir=None))]
fn open_engine(config_path: Option<String>, state_dir: Option<String>) -> PyResult<()> {
    init_logging();

    let config = load_config(config_path.as_deref(), state_dir.as_deref())
        .map_err(|e| PyValueError::new_err(format!("{:#}", e)))?;
    let engine = TrustEngine::open(&config).map_err(to_py_err)?;
    *ENGINE.write() = Some(Arc::new(engine));

    log::info!("PY_ENGINE_OPENED state_dir={}", config.state_dir.display());
    Ok(())
}

/// Issue an identity for a device from a PEM CSR.
#[pyfunction]
#[pyo3(signature = (device_id, csr_pem, force=false))]
fn provision(py: Python<'_>, device_id: String, csr_pem: String, force: bool) -> PyResult<Py<PyAny>> {
    let engine = engine()?;
    let identity = py
        .allow_threads(|| engine.provision(&device_id, csr_pem.as_bytes(), force))
        .map_err(to_py_err)?;
    Ok(identity_dict(py, &identity)?.into())
}

/// Retry delivery of a device's pending certificate without re-signing.
#[pyfunction]
fn redeliver(py: Python<'_>, device_id: String) -> PyResult<Py<PyAny>> {
    let engine = engine()?;
    let identity = py.allow_threads(|| engine.redeliver(&device_id)).map_err(to_py_err)?;
    Ok(identity_dict(py, &identity)?.into())
}

/// Revoke a device's live identity.
#[pyfunction]
fn revoke(py: Python<'_>, device_id: String) -> PyResult<Py<PyAny>> {
    let engine = engine()?;
    let identity = py.allow_threads(|| engine.revoke(&device_id)).map_err(to_py_err)?;
    Ok(identity_dict(py, &identity)?.into())
}

/// Scan a CIDR and return the discovery records as JSON.
#[pyfunction]
fn scan(py: Python<'_>, cidr: String) -> PyResult<String> {
    let engine = engine()?;
    let records = py.allow_threads(|| engine.scan(&cidr)).map_err(to_py_err)?;
    to_json(&records)
}

/// Ingest one raw JSON telemetry payload.
///
/// Returns a dict with `device_id` and `stored` (false for stale samples).
#[pyfunction]
fn ingest_telemetry(py: Python<'_>, payload: String) -> PyResult<Py<PyAny>> {
    let engine = engine()?;
    let outcome = py
        .allow_threads(|| engine.ingest_telemetry_json(&payload))
        .map_err(to_py_err)?;

    let dict = PyDict::new(py);
    dict.set_item("device_id", outcome.device_id())?;
    dict.set_item("stored", outcome.is_stored())?;
    if let IngestOutcome::Stale { stored_timestamp, .. } = &outcome {
        dict.set_item("stored_timestamp", stored_timestamp.to_rfc3339())?;
    }
    Ok(dict.into())
}

/// Reconciled trust state keyed by device id, as JSON.
#[pyfunction]
fn get_trust_state(py: Python<'_>) -> PyResult<String> {
    let engine = engine()?;
    let state = py.allow_threads(|| engine.get_trust_state());
    to_json(&state)
}

/// Counts and capped alert list, as JSON.
#[pyfunction]
fn get_trust_summary(py: Python<'_>) -> PyResult<String> {
    let engine = engine()?;
    let summary = py.allow_threads(|| engine.trust_summary());
    to_json(&summary)
}

/// Python module definition
#[pymodule]
fn devtrust_core(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(open_engine, m)?)?;
    m.add_function(wrap_pyfunction!(provision, m)?)?;
    m.add_function(wrap_pyfunction!(redeliver, m)?)?;
    m.add_function(wrap_pyfunction!(revoke, m)?)?;
    m.add_function(wrap_pyfunction!(scan, m)?)?;
    m.add_function(wrap_pyfunction!(ingest_telemetry, m)?)?;
    m.add_function(wrap_pyfunction!(get_trust_state, m)?)?;
    m.add_function(wrap_pyfunction!(get_trust_summary, m)?)?;
    Ok(())
}
