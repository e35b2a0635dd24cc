use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Connected,
    Slow,
    Disconnected,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Connected => "connected",
            HealthStatus::Slow => "slow",
            HealthStatus::Disconnected => "disconnected",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// The backend answered, even if slowly.
    pub fn is_reachable(&self) -> bool {
        matches!(self, HealthStatus::Connected | HealthStatus::Slow)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current view of backend reachability.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ConnectionStatus {
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_latency: Option<Duration>,
    pub total_errors: u64,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub new: HealthStatus,
    pub old: HealthStatus,
}

/// One completed check, kept in the monitor's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub at: DateTime<Utc>,
    pub status: HealthStatus,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct HealthStats {
    pub checks: usize,
    pub successes: usize,
    pub success_rate: Option<f64>,
    pub average_latency: Option<Duration>,
}

impl HealthStats {
    pub(crate) fn from_history<'a>(history: impl Iterator<Item = &'a HealthCheck>) -> Self {
        let mut stats = HealthStats::default();
        let mut latency_total = Duration::ZERO;
        let mut latency_samples = 0u32;
        for check in history {
            stats.checks += 1;
            if check.status.is_reachable() {
                stats.successes += 1;
            }
            if let Some(latency) = check.latency {
                latency_total += latency;
                latency_samples += 1;
            }
        }
        if stats.checks > 0 {
            stats.success_rate = Some(stats.successes as f64 / stats.checks as f64);
        }
        if latency_samples > 0 {
            stats.average_latency = Some(latency_total / latency_samples);
        }
        stats
    }
}
