//! Engine settings.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::issuance::IssuanceSettings;

const ENV_PREFIX: &str = "DEVTRUST_";

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration value for {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InputValidation
    }

    pub fn reason_code(&self) -> &'static str {
        "INVALID_CONFIG"
    }
}

/// Everything the engine needs to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Root for identities, telemetry, discovery ledger, trust state and CA.
    pub state_dir: PathBuf,
    pub mtls_port: u16,
    pub probe_timeout_secs: u64,
    pub scan_timeout_secs: u64,
    pub signing_timeout_secs: u64,
    pub delivery_timeout_secs: u64,
    pub validity_days: u32,
    pub probe_workers: usize,
    /// Ports tried by the liveness sweep.
    pub sweep_ports: Vec<u16>,
    /// Addresses never probed. Empty means "this host's outbound IPv4".
    pub exclude_addresses: Vec<IpAddr>,
    /// Outbox for signed certificates; delivery is skipped when unset.
    pub delivery_dir: Option<PathBuf>,
    /// CN of the certificate the scanner presents to devices.
    pub client_common_name: String,
    pub strict_reprovisioning: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("devtrust-state"),
            mtls_port: 443,
            probe_timeout_secs: 3,
            scan_timeout_secs: 120,
            signing_timeout_secs: 30,
            delivery_timeout_secs: 30,
            validity_days: 365,
            probe_workers: 32,
            sweep_ports: vec![22, 80, 443, 8443],
            exclude_addresses: Vec::new(),
            delivery_dir: None,
            client_common_name: "devtrust-scanner".to_string(),
            strict_reprovisioning: false,
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `state_dir`.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.merge_with_env()?;
        config.validate()?;
        log::info!(
            "CONFIG_LOADED path={} state_dir={}",
            path.display(),
            config.state_dir.display()
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `DEVTRUST_<FIELD>` overrides for the scalar settings.
    pub fn merge_with_env(&mut self) -> anyhow::Result<()> {
        self.merge_with_vars(std::env::vars())
    }

    fn merge_with_vars<I>(&mut self, vars: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let parsed = match field.to_ascii_lowercase().as_str() {
                "state_dir" => {
                    self.state_dir = PathBuf::from(&value);
                    true
                }
                "delivery_dir" => {
                    self.delivery_dir = Some(PathBuf::from(&value));
                    true
                }
                "client_common_name" => {
                    self.client_common_name = value.clone();
                    true
                }
                "mtls_port" => set_parsed(&mut self.mtls_port, &key, &value)?,
                "probe_timeout_secs" => set_parsed(&mut self.probe_timeout_secs, &key, &value)?,
                "scan_timeout_secs" => set_parsed(&mut self.scan_timeout_secs, &key, &value)?,
                "signing_timeout_secs" => set_parsed(&mut self.signing_timeout_secs, &key, &value)?,
                "delivery_timeout_secs" => {
                    set_parsed(&mut self.delivery_timeout_secs, &key, &value)?
                }
                "validity_days" => set_parsed(&mut self.validity_days, &key, &value)?,
                "probe_workers" => set_parsed(&mut self.probe_workers, &key, &value)?,
                "strict_reprovisioning" => {
                    set_parsed(&mut self.strict_reprovisioning, &key, &value)?
                }
                _ => false,
            };
            if parsed {
                log::debug!("CONFIG_ENV_OVERRIDE key={}", key);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::new("state_dir", "must not be empty"));
        }
        if self.mtls_port == 0 {
            return Err(ConfigError::new("mtls_port", "must be non-zero"));
        }
        for (field, value) in [
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("scan_timeout_secs", self.scan_timeout_secs),
            ("signing_timeout_secs", self.signing_timeout_secs),
            ("delivery_timeout_secs", self.delivery_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::new(field, "must be at least one second"));
            }
        }
        if self.validity_days == 0 {
            return Err(ConfigError::new("validity_days", "must be at least one day"));
        }
        if self.probe_workers == 0 {
            return Err(ConfigError::new("probe_workers", "must be at least 1"));
        }
        if self.sweep_ports.is_empty() || self.sweep_ports.contains(&0) {
            return Err(ConfigError::new("sweep_ports", "must list non-zero ports"));
        }
        if self.client_common_name.trim().is_empty() {
            return Err(ConfigError::new("client_common_name", "must not be empty"));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn issuance_settings(&self) -> IssuanceSettings {
        IssuanceSettings {
            validity_days: self.validity_days,
            signing_timeout: Duration::from_secs(self.signing_timeout_secs),
            delivery_timeout: Duration::from_secs(self.delivery_timeout_secs),
            strict_reprovisioning: self.strict_reprovisioning,
        }
    }

    pub fn identities_dir(&self) -> PathBuf {
        self.state_dir.join("identities")
    }

    pub fn telemetry_dir(&self) -> PathBuf {
        self.state_dir.join("telemetry")
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.state_dir.join("ca")
    }

    pub fn discovery_ledger_path(&self) -> PathBuf {
        self.state_dir.join("discovery.json")
    }

    pub fn trust_state_path(&self) -> PathBuf {
        self.state_dir.join("trust_state.json")
    }
}

fn set_parsed<T>(slot: &mut T, key: &str, value: &str) -> anyhow::Result<bool>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    *slot = value
        .parse()
        .with_context(|| format!("environment override {}={}", key, value))?;
    Ok(true)
}
