use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk configuration. Every field is optional; unset values fall back to
/// the built-in defaults when the component configs are resolved.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default, skip_serializing_if = "BackendSettings::is_empty")]
    pub backend: BackendSettings,
    #[serde(default, skip_serializing_if = "RequestSettings::is_empty")]
    pub requests: RequestSettings,
    #[serde(default, skip_serializing_if = "HealthSettings::is_empty")]
    pub health: HealthSettings,
    #[serde(default, skip_serializing_if = "RecoverySettings::is_empty")]
    pub recovery: RecoverySettings,
    #[serde(default, skip_serializing_if = "ErrorSettings::is_empty")]
    pub errors: ErrorSettings,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct BackendSettings {
    /// Base URL of the chat backend, e.g. "http://localhost:8000"
    pub base_url: Option<String>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct RequestSettings {
    pub default_timeout_secs: Option<u64>,
    pub chat_timeout_secs: Option<u64>,
    pub health_timeout_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub max_high: Option<usize>,
    pub max_normal: Option<usize>,
    pub max_low: Option<usize>,
    pub history_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct HealthSettings {
    /// Probes answered slower than this are reported as slow
    pub slow_threshold_ms: Option<u64>,
    pub connected_interval_secs: Option<u64>,
    pub slow_interval_secs: Option<u64>,
    pub stable_slow_interval_secs: Option<u64>,
    pub disconnected_interval_secs: Option<u64>,
    pub max_jitter_ms: Option<u64>,
    pub history_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct RecoverySettings {
    /// Consecutive failures that open an operation's circuit
    pub failure_threshold: Option<u32>,
    pub open_secs: Option<u64>,
    pub offline_grace_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct ErrorSettings {
    pub capacity: Option<usize>,
    /// JSON-lines file mirroring every reported error
    pub log_file: Option<PathBuf>,
}

impl BackendSettings {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl RequestSettings {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl HealthSettings {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl RecoverySettings {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl ErrorSettings {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
