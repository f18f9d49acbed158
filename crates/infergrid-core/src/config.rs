//! infergrid.toml configuration model.
//!
//! Every section is optional in the file; missing keys take the defaults
//! below. Durations are kept as strings in the file format and parsed on
//! access (see [`crate::duration`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::{DurationParseError, parse_duration};

/// Environment variable that overrides `server.admin_token`.
pub const ADMIN_TOKEN_ENV: &str = "INFERGRID_ADMIN_TOKEN";
/// Environment variable that overrides `vault.master_secret`.
pub const MASTER_SECRET_ENV: &str = "INFERGRID_MASTER_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: {source}")]
    Duration {
        field: &'static str,
        #[source]
        source: DurationParseError,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub server: ServerConfig,
    pub health: HealthSettings,
    pub safety: SafetySettings,
    pub reconciler: ReconcilerSettings,
    pub vault: VaultSettings,
    pub admission: AdmissionSettings,
    pub provisioner: ProvisionerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Shared secret expected in the `X-Admin-Token` header. An empty token
    /// rejects every admin call.
    pub admin_token: String,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            admin_token: String::new(),
            data_dir: PathBuf::from("./infergrid-data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    pub heartbeat_interval: String,
    pub staleness_threshold: String,
    pub probe_path: String,
    pub probe_timeout: String,
    pub probe_interval: String,
    pub sweep_interval: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: "10s".to_string(),
            staleness_threshold: "5m".to_string(),
            probe_path: "/health".to_string(),
            probe_timeout: "2s".to_string(),
            probe_interval: "15s".to_string(),
            sweep_interval: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetySettings {
    /// Number of agreeing signals required to declare a node safe or unsafe.
    pub quorum: usize,
    /// How long a Degraded node may wait for consensus to clear.
    pub observation_window: String,
    /// A signal older than this counts as unavailable.
    pub signal_freshness: String,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            quorum: 2,
            observation_window: "5m".to_string(),
            signal_freshness: "2m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcilerSettings {
    pub interval: String,
    pub max_retries: u32,
    pub base_backoff: String,
    pub max_backoff: String,
    pub drain_timeout: String,
    /// A node stuck in Booting longer than this is failed.
    pub boot_timeout: String,
    /// How long a Terminated or Failed node's launch log stays readable.
    pub log_retention: String,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            max_retries: 5,
            base_backoff: "1s".to_string(),
            max_backoff: "60s".to_string(),
            drain_timeout: "2m".to_string(),
            boot_timeout: "15m".to_string(),
            log_retention: "1h".to_string(),
        }
    }
}

/// A key that is no longer used for encryption but must still decrypt
/// records sealed under it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetiredKey {
    pub key_id: String,
    pub master_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VaultSettings {
    pub master_secret: String,
    pub key_id: String,
    pub salt: String,
    pub iterations: u32,
    pub retired_keys: Vec<RetiredKey>,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            master_secret: String::new(),
            key_id: "v1".to_string(),
            salt: "infergrid-credential-vault".to_string(),
            iterations: 100_000,
            retired_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdmissionSettings {
    /// Value of the `retry-after` header on admission-denied responses.
    pub retry_after_secs: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self { retry_after_secs: 1 }
    }
}

/// External provisioning backend. An empty endpoint disables launches;
/// nodes can still join through registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisionerSettings {
    /// Base URL, e.g. `http://provisioner.internal:9000`.
    pub endpoint: String,
    pub timeout: String,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: "30s".to_string(),
        }
    }
}

fn field(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|source| ConfigError::Duration { field: name, source })
}

impl ControlPlaneConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: ControlPlaneConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ADMIN_TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.server.admin_token = token;
        }
        if let Some(secret) = lookup(MASTER_SECRET_ENV).filter(|v| !v.is_empty()) {
            self.vault.master_secret = secret;
        }
    }

    /// Check every duration string and the numeric policy bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.health;
        field("health.heartbeat_interval", &h.heartbeat_interval)?;
        field("health.staleness_threshold", &h.staleness_threshold)?;
        field("health.probe_timeout", &h.probe_timeout)?;
        field("health.probe_interval", &h.probe_interval)?;
        field("health.sweep_interval", &h.sweep_interval)?;
        field("safety.observation_window", &self.safety.observation_window)?;
        field("safety.signal_freshness", &self.safety.signal_freshness)?;
        let r = &self.reconciler;
        field("reconciler.interval", &r.interval)?;
        field("reconciler.base_backoff", &r.base_backoff)?;
        field("reconciler.max_backoff", &r.max_backoff)?;
        field("reconciler.drain_timeout", &r.drain_timeout)?;
        field("reconciler.boot_timeout", &r.boot_timeout)?;
        field("reconciler.log_retention", &r.log_retention)?;
        field("provisioner.timeout", &self.provisioner.timeout)?;

        if !(2..=3).contains(&self.safety.quorum) {
            return Err(ConfigError::Invalid(format!(
                "safety.quorum must be a majority of the 3 signals (2 or 3), got {}",
                self.safety.quorum
            )));
        }
        if self.vault.iterations == 0 {
            return Err(ConfigError::Invalid(
                "vault.iterations must be positive".to_string(),
            ));
        }
        if self.vault.key_id.is_empty() {
            return Err(ConfigError::Invalid("vault.key_id must not be empty".to_string()));
        }
        Ok(())
    }
}

macro_rules! duration_accessors {
    ($ty:ty { $($name:ident => $default:literal),* $(,)? }) => {
        impl $ty {
            $(
                pub fn $name(&self) -> Duration {
                    parse_duration(&self.$name).unwrap_or(Duration::from_millis($default))
                }
            )*
        }
    };
}

// Accessors fall back to the built-in default; `validate` rejects bad input
// before it gets this far.
duration_accessors!(HealthSettings {
    heartbeat_interval => 10_000,
    staleness_threshold => 300_000,
    probe_timeout => 2_000,
    probe_interval => 15_000,
    sweep_interval => 30_000,
});

duration_accessors!(SafetySettings {
    observation_window => 300_000,
    signal_freshness => 120_000,
});

duration_accessors!(ReconcilerSettings {
    interval => 30_000,
    base_backoff => 1_000,
    max_backoff => 60_000,
    drain_timeout => 120_000,
    boot_timeout => 900_000,
    log_retention => 3_600_000,
});

duration_accessors!(ProvisionerSettings {
    timeout => 30_000,
});
