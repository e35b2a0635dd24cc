//! Health probing commands and the shared status report.

use chrono::Local;
use std::error::Error;
use tokio::sync::mpsc;

use crate::core::config::Config;
use crate::core::health::{ConnectionStatus, HealthStatus, StatusChange};
use crate::core::recovery::{BreakerSnapshot, CircuitState, OfflineChange};
use crate::core::requests::RequestStats;
use crate::core::services::Services;

pub async fn run_health(config: &Config) -> Result<(), Box<dyn Error>> {
    let services = Services::from_config(config)?;
    let reachable = services.health.force_check().await;
    let status = services.health.status();

    println!("Backend: {}", services.base_url);
    println!("Status: {}", status_label(status.status));
    if let Some(latency) = status.last_latency {
        println!("Latency: {} ms", latency.as_millis());
    }

    if !reachable {
        services.shutdown();
        return Err(format!("backend at {} is unreachable", services.base_url).into());
    }

    match services.chat.check_health().await {
        Ok(health) => println!("Reported: {} (version {})", health.status, health.version),
        Err(err) => eprintln!("⚠️  Backend answered but its health document was unusable: {err}"),
    }
    services.shutdown();
    Ok(())
}

enum WatchEvent {
    Status(StatusChange),
    Offline(OfflineChange),
}

pub async fn run_watch(config: &Config, changes: Option<usize>) -> Result<(), Box<dyn Error>> {
    let services = Services::from_config(config)?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let status_tx = tx.clone();
    let _status = services.health.subscribe(move |change| {
        let _ = status_tx.send(WatchEvent::Status(*change));
    });
    let _offline = services.recovery.subscribe(move |change| {
        let _ = tx.send(WatchEvent::Offline(*change));
    });

    services.start();
    println!("Watching {} (Ctrl+C to stop)", services.base_url);

    let mut seen = 0usize;
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(event) = event else { break };
        let stamp = Local::now().format("%H:%M:%S");
        match event {
            WatchEvent::Status(change) => {
                println!("[{stamp}] {}", change_line(&change, &services.health.status()));
                seen += 1;
                if changes.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            WatchEvent::Offline(change) => println!("[{stamp}] {}", offline_line(&change)),
        }
    }

    services.shutdown();
    Ok(())
}

pub(crate) fn status_label(status: HealthStatus) -> String {
    let icon = match status {
        HealthStatus::Connected => "🟢",
        HealthStatus::Slow => "🟡",
        HealthStatus::Disconnected => "🔴",
        HealthStatus::Unknown => "⚪",
    };
    format!("{icon} {status}")
}

pub(crate) fn change_line(change: &StatusChange, current: &ConnectionStatus) -> String {
    let mut line = format!("{} → {}", change.old, status_label(change.new));
    match change.new {
        HealthStatus::Connected | HealthStatus::Slow => {
            if let Some(latency) = current.last_latency {
                line.push_str(&format!(" ({} ms)", latency.as_millis()));
            }
        }
        HealthStatus::Disconnected => {
            line.push_str(&format!(
                " ({} consecutive failures)",
                current.consecutive_errors
            ));
        }
        HealthStatus::Unknown => {}
    }
    line
}

pub(crate) fn offline_line(change: &OfflineChange) -> String {
    if change.offline {
        format!(
            "📴 Offline mode on; degradation level {}",
            change.degradation_level
        )
    } else {
        format!(
            "📶 Back online; degradation level {}",
            change.degradation_level
        )
    }
}

/// Multi-line report used by the chat `/status` command.
pub(crate) fn status_report(
    status: &ConnectionStatus,
    degradation_level: u8,
    offline: bool,
    breakers: &[BreakerSnapshot],
    requests: &RequestStats,
) -> Vec<String> {
    let mut lines = vec![format!("Backend: {}", status_label(status.status))];
    if let Some(latency) = status.last_latency {
        lines.push(format!("Last latency: {} ms", latency.as_millis()));
    }
    if status.consecutive_errors > 0 {
        lines.push(format!(
            "Failed checks: {} in a row, {} total",
            status.consecutive_errors, status.total_errors
        ));
    }
    lines.push(format!(
        "Degradation level: {degradation_level}{}",
        if offline { " (offline)" } else { "" }
    ));
    for breaker in breakers
        .iter()
        .filter(|breaker| breaker.state != CircuitState::Closed)
    {
        lines.push(format!(
            "Circuit {}: {} after {} failures",
            breaker.operation, breaker.state, breaker.failures
        ));
    }
    let rate = requests
        .success_rate()
        .map(|rate| format!("{:.0}%", rate * 100.0))
        .unwrap_or_else(|| "n/a".to_string());
    lines.push(format!(
        "Requests: {} sent, {} deduplicated, success rate {rate}",
        requests.total, requests.deduplicated
    ));
    lines
}
