//! Diagnostic log setup for the binary.
//!
//! Verbosity comes from `PALAVER_LOG` using `tracing-subscriber` filter
//! syntax (`debug`, `palaver::core::health=trace`, ...). Output goes to
//! stderr unless a log file is given.

use std::error::Error;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PALAVER_LOG";
const DEFAULT_FILTER: &str = "warn";

/// Builds the filter from a raw directive string, falling back to `warn`
/// when it is missing or does not parse.
pub fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

pub fn init_logging(log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let directives = std::env::var(LOG_ENV).ok();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(directives.as_deref()))
        .with_target(true);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|err| -> Box<dyn Error> { err })?;
        }
        None => builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| -> Box<dyn Error> { err })?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_blank_directives_default_to_warn() {
        assert_eq!(env_filter(None).to_string(), "warn");
        assert_eq!(env_filter(Some("  ")).to_string(), "warn");
    }

    #[test]
    fn valid_directives_are_kept() {
        let filter = env_filter(Some("palaver::core::health=debug"));
        assert!(filter.to_string().contains("palaver::core::health=debug"));
    }

    #[test]
    fn unparseable_directives_fall_back() {
        assert_eq!(env_filter(Some("palaver=loudest")).to_string(), "warn");
    }
}
