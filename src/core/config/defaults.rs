use std::time::Duration;

use crate::core::config::data::Config;
use crate::core::errors::ReporterConfig;
use crate::core::health::HealthConfig;
use crate::core::recovery::{BreakerConfig, RecoveryConfig};
use crate::core::requests::{ConcurrencyLimits, RequestConfig};
use crate::utils::url::normalize_base_url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const BASE_URL_ENV: &str = "PALAVER_BASE_URL";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn secs(value: Option<u64>, fallback: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(fallback)
}

fn millis(value: Option<u64>, fallback: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(fallback)
}

impl Config {
    /// Backend URL from `PALAVER_BASE_URL`, then the config file, then the
    /// built-in default.
    pub fn base_url(&self) -> String {
        self.base_url_with_env(std::env::var(BASE_URL_ENV).ok())
    }

    pub(crate) fn base_url_with_env(&self, env_value: Option<String>) -> String {
        let chosen = env_value
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.backend.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        normalize_base_url(&chosen)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.backend.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn request_config(&self) -> RequestConfig {
        let defaults = RequestConfig::default();
        let settings = &self.requests;
        let limits = ConcurrencyLimits {
            max_concurrent: settings
                .max_concurrent
                .unwrap_or(defaults.limits.max_concurrent)
                .max(1),
            high: settings.max_high.unwrap_or(defaults.limits.high).max(1),
            normal: settings.max_normal.unwrap_or(defaults.limits.normal).max(1),
            low: settings.max_low.unwrap_or(defaults.limits.low).max(1),
        };
        RequestConfig {
            default_timeout: secs(settings.default_timeout_secs, defaults.default_timeout),
            chat_timeout: secs(settings.chat_timeout_secs, defaults.chat_timeout),
            health_timeout: secs(settings.health_timeout_secs, defaults.health_timeout),
            limits,
            history_capacity: settings
                .history_size
                .unwrap_or(defaults.history_capacity)
                .max(1),
        }
    }

    pub fn health_config(&self, base_url: &str) -> HealthConfig {
        let defaults = HealthConfig::new(base_url);
        let settings = &self.health;
        HealthConfig {
            probe_timeout: secs(self.requests.health_timeout_secs, defaults.probe_timeout),
            slow_threshold: millis(settings.slow_threshold_ms, defaults.slow_threshold),
            connected_interval: secs(settings.connected_interval_secs, defaults.connected_interval),
            slow_interval: secs(settings.slow_interval_secs, defaults.slow_interval),
            stable_slow_interval: secs(
                settings.stable_slow_interval_secs,
                defaults.stable_slow_interval,
            ),
            disconnected_interval: secs(
                settings.disconnected_interval_secs,
                defaults.disconnected_interval,
            ),
            max_jitter: millis(settings.max_jitter_ms, defaults.max_jitter),
            history_capacity: settings
                .history_size
                .unwrap_or(defaults.history_capacity)
                .max(1),
            ..defaults
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        let defaults = RecoveryConfig::default();
        let settings = &self.recovery;
        RecoveryConfig {
            breaker: BreakerConfig {
                failure_threshold: settings
                    .failure_threshold
                    .unwrap_or(defaults.breaker.failure_threshold)
                    .max(1),
                open_duration: secs(settings.open_secs, defaults.breaker.open_duration),
            },
            offline_grace: secs(settings.offline_grace_secs, defaults.offline_grace),
        }
    }

    pub fn reporter_config(&self) -> ReporterConfig {
        ReporterConfig {
            capacity: self
                .errors
                .capacity
                .unwrap_or(ReporterConfig::default().capacity),
        }
    }
}
