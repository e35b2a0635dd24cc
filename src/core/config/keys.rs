use std::path::PathBuf;
use std::str::FromStr;

use crate::core::config::data::{path_display, Config};
use crate::core::config::io::ConfigError;
use crate::utils::url::is_http_url;

/// Every key accepted by `palaver config set`, in display order.
pub const KEYS: &[&str] = &[
    "backend.base_url",
    "backend.connect_timeout_secs",
    "requests.default_timeout_secs",
    "requests.chat_timeout_secs",
    "requests.health_timeout_secs",
    "requests.max_concurrent",
    "requests.max_high",
    "requests.max_normal",
    "requests.max_low",
    "requests.history_size",
    "health.slow_threshold_ms",
    "health.connected_interval_secs",
    "health.slow_interval_secs",
    "health.stable_slow_interval_secs",
    "health.disconnected_interval_secs",
    "health.max_jitter_ms",
    "health.history_size",
    "recovery.failure_threshold",
    "recovery.open_secs",
    "recovery.offline_grace_secs",
    "errors.capacity",
    "errors.log_file",
];

enum Slot<'a> {
    Url(&'a mut Option<String>),
    Path(&'a mut Option<PathBuf>),
    U64(&'a mut Option<u64>),
    U32(&'a mut Option<u32>),
    Count(&'a mut Option<usize>),
}

impl Slot<'_> {
    fn display(&self) -> Option<String> {
        match self {
            Slot::Url(value) => value.as_ref().cloned(),
            Slot::Path(value) => value.as_ref().map(path_display),
            Slot::U64(value) => value.map(|v| v.to_string()),
            Slot::U32(value) => value.map(|v| v.to_string()),
            Slot::Count(value) => value.map(|v| v.to_string()),
        }
    }

    fn set(self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let raw = raw.trim();
        match self {
            Slot::Url(slot) => {
                if !is_http_url(raw) {
                    return Err(invalid(key, raw, "expected an http:// or https:// URL"));
                }
                *slot = Some(raw.to_string());
            }
            Slot::Path(slot) => {
                if raw.is_empty() {
                    return Err(invalid(key, raw, "expected a file path"));
                }
                *slot = Some(PathBuf::from(raw));
            }
            Slot::U64(slot) => *slot = Some(parse_number(key, raw)?),
            Slot::U32(slot) => *slot = Some(parse_number(key, raw)?),
            Slot::Count(slot) => {
                let count: usize = parse_number(key, raw)?;
                if count == 0 {
                    return Err(invalid(key, raw, "must be at least 1"));
                }
                *slot = Some(count);
            }
        }
        Ok(())
    }

    fn clear(self) {
        match self {
            Slot::Url(slot) => *slot = None,
            Slot::Path(slot) => *slot = None,
            Slot::U64(slot) => *slot = None,
            Slot::U32(slot) => *slot = None,
            Slot::Count(slot) => *slot = None,
        }
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| invalid(key, raw, "expected a non-negative whole number"))
}

impl Config {
    fn slot(&mut self, key: &str) -> Result<Slot<'_>, ConfigError> {
        let slot = match key {
            "backend.base_url" => Slot::Url(&mut self.backend.base_url),
            "backend.connect_timeout_secs" => Slot::U64(&mut self.backend.connect_timeout_secs),
            "requests.default_timeout_secs" => Slot::U64(&mut self.requests.default_timeout_secs),
            "requests.chat_timeout_secs" => Slot::U64(&mut self.requests.chat_timeout_secs),
            "requests.health_timeout_secs" => Slot::U64(&mut self.requests.health_timeout_secs),
            "requests.max_concurrent" => Slot::Count(&mut self.requests.max_concurrent),
            "requests.max_high" => Slot::Count(&mut self.requests.max_high),
            "requests.max_normal" => Slot::Count(&mut self.requests.max_normal),
            "requests.max_low" => Slot::Count(&mut self.requests.max_low),
            "requests.history_size" => Slot::Count(&mut self.requests.history_size),
            "health.slow_threshold_ms" => Slot::U64(&mut self.health.slow_threshold_ms),
            "health.connected_interval_secs" => {
                Slot::U64(&mut self.health.connected_interval_secs)
            }
            "health.slow_interval_secs" => Slot::U64(&mut self.health.slow_interval_secs),
            "health.stable_slow_interval_secs" => {
                Slot::U64(&mut self.health.stable_slow_interval_secs)
            }
            "health.disconnected_interval_secs" => {
                Slot::U64(&mut self.health.disconnected_interval_secs)
            }
            "health.max_jitter_ms" => Slot::U64(&mut self.health.max_jitter_ms),
            "health.history_size" => Slot::Count(&mut self.health.history_size),
            "recovery.failure_threshold" => Slot::U32(&mut self.recovery.failure_threshold),
            "recovery.open_secs" => Slot::U64(&mut self.recovery.open_secs),
            "recovery.offline_grace_secs" => Slot::U64(&mut self.recovery.offline_grace_secs),
            "errors.capacity" => Slot::Count(&mut self.errors.capacity),
            "errors.log_file" => Slot::Path(&mut self.errors.log_file),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        };
        Ok(slot)
    }

    /// Current value of `key` as written in the file, `None` when unset.
    pub fn get_value(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let mut scratch = self.clone();
        let value = scratch.slot(key)?.display();
        Ok(value)
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.slot(key)?.set(key, value)
    }

    pub fn unset_value(&mut self, key: &str) -> Result<(), ConfigError> {
        self.slot(key)?.clear();
        Ok(())
    }
}
