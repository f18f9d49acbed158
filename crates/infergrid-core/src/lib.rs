//! infergrid-core: configuration shared by every InferGrid crate.

pub mod config;
pub mod duration;

pub use config::{
    AdmissionSettings, ConfigError, ControlPlaneConfig, HealthSettings, ProvisionerSettings,
    ReconcilerSettings, RetiredKey, SafetySettings, ServerConfig, VaultSettings,
};
pub use duration::{DurationParseError, parse_duration};
