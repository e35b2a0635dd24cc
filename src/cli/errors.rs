//! Error statistics, from the backend or from the local error log file.

use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::Path;

use crate::api::BackendErrorStats;
use crate::core::config::data::path_display;
use crate::core::config::Config;
use crate::core::errors::{ErrorCategory, ErrorLogEntry, Severity};
use crate::core::services::Services;

const LOCAL_RECENT: usize = 10;

pub async fn run_errors(
    config: &Config,
    recent: Option<usize>,
    local: bool,
) -> Result<(), Box<dyn Error>> {
    if local {
        let Some(path) = config.errors.log_file.as_deref() else {
            return Err("no local error log configured; set errors.log_file first".into());
        };
        let (entries, skipped) = read_log(path)?;
        println!("Local error log: {}", path_display(path));
        for line in local_report(&entries, recent.unwrap_or(LOCAL_RECENT)) {
            println!("{line}");
        }
        if skipped > 0 {
            eprintln!("⚠️  Skipped {skipped} unreadable lines");
        }
        return Ok(());
    }

    let services = Services::from_config(config)?;
    let stats = services.chat.fetch_backend_error_stats().await;
    let recent_errors = match (recent, &stats) {
        (Some(limit), Ok(_)) => Some(services.chat.fetch_recent_backend_errors(limit).await),
        _ => None,
    };
    services.shutdown();

    let stats = stats.map_err(|err| err.user_message())?;
    for line in stats_report(&stats) {
        println!("{line}");
    }
    if let Some(recent_errors) = recent_errors {
        let recent_errors = recent_errors.map_err(|err| err.user_message())?;
        println!("Recent errors:");
        for record in &recent_errors {
            println!("  {}", describe_backend_error(record));
        }
    }
    Ok(())
}

pub(crate) fn read_log(path: &Path) -> Result<(Vec<ErrorLogEntry>, usize), Box<dyn Error>> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("could not read {}: {err}", path_display(path)))?;
    let mut entries = Vec::new();
    let mut skipped = 0;
    for line in contents.lines().filter(|line| !line.trim().is_empty()) {
        match serde_json::from_str::<ErrorLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(_) => skipped += 1,
        }
    }
    Ok((entries, skipped))
}

pub(crate) fn local_report(entries: &[ErrorLogEntry], recent: usize) -> Vec<String> {
    let mut by_category: BTreeMap<ErrorCategory, usize> = BTreeMap::new();
    let mut by_severity: BTreeMap<Severity, usize> = BTreeMap::new();
    for entry in entries {
        *by_category.entry(entry.category).or_default() += 1;
        *by_severity.entry(entry.severity).or_default() += 1;
    }

    let mut lines = vec![format!("Total errors: {}", entries.len())];
    lines.extend(
        by_category
            .iter()
            .map(|(category, count)| format!("  {category}: {count}")),
    );
    if !by_severity.is_empty() {
        let severities: Vec<String> = by_severity
            .iter()
            .map(|(severity, count)| format!("{severity} {count}"))
            .collect();
        lines.push(format!("By severity: {}", severities.join(", ")));
    }
    let skip = entries.len().saturating_sub(recent);
    for entry in &entries[skip..] {
        lines.push(format!(
            "  [{}] {} {}: {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.severity,
            entry.category,
            entry.message
        ));
    }
    lines
}

pub(crate) fn stats_report(stats: &BackendErrorStats) -> Vec<String> {
    let mut lines = vec![format!("Backend errors: {}", stats.total_errors)];
    lines.extend(
        stats
            .errors_by_category
            .iter()
            .map(|(category, count)| format!("  {category}: {count}")),
    );
    if !stats.errors_by_severity.is_empty() {
        let severities: Vec<String> = stats
            .errors_by_severity
            .iter()
            .map(|(severity, count)| format!("{severity} {count}"))
            .collect();
        lines.push(format!("By severity: {}", severities.join(", ")));
    }
    lines
}

/// One-line rendering of a backend error record. Records are free-form
/// JSON; the usual keys are used when present.
pub(crate) fn describe_backend_error(record: &Value) -> String {
    let field = |key: &str| record.get(key).and_then(Value::as_str);
    let message = field("message")
        .or_else(|| field("error"))
        .map(str::to_string)
        .unwrap_or_else(|| record.to_string());
    match (field("timestamp"), field("category")) {
        (Some(at), Some(category)) => format!("[{at}] {category}: {message}"),
        (Some(at), None) => format!("[{at}] {message}"),
        (None, Some(category)) => format!("{category}: {message}"),
        (None, None) => message,
    }
}
