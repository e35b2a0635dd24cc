//! Backend liveness monitor.
//!
//! A background task probes `GET {base}/api/health` through the request
//! manager and derives a [`HealthStatus`] from the outcome and latency. The
//! polling interval adapts to the current status, and a platform
//! connectivity transition triggers an immediate check. Checks never
//! overlap: the loop and [`HealthMonitor::force_check`] share one lock.

pub mod status;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use status::{ConnectionStatus, HealthCheck, HealthStats, HealthStatus, StatusChange};

use crate::core::clock::Clock;
use crate::core::connectivity::ConnectivitySignal;
use crate::core::lock;
use crate::core::observers::{Observers, Subscription};
use crate::core::requests::{RequestManager, RequestOptions};
use crate::core::transport::RequestSpec;
use crate::utils::random::jitter;
use crate::utils::url::join_path;

pub const HEALTH_PATH: &str = "/api/health";

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub base_url: String,
    pub probe_timeout: Duration,
    pub slow_threshold: Duration,
    pub connected_interval: Duration,
    pub slow_interval: Duration,
    pub stable_slow_interval: Duration,
    pub disconnected_interval: Duration,
    pub max_jitter: Duration,
    pub history_capacity: usize,
}

impl HealthConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            probe_timeout: Duration::from_secs(5),
            slow_threshold: Duration::from_secs(3),
            connected_interval: Duration::from_secs(30),
            slow_interval: Duration::from_secs(30),
            stable_slow_interval: Duration::from_secs(60),
            disconnected_interval: Duration::from_secs(5),
            max_jitter: Duration::from_secs(1),
            history_capacity: 50,
        }
    }

    /// Base delay before the next tick, before jitter.
    pub fn interval_for(&self, current: HealthStatus, previous: HealthStatus) -> Duration {
        match current {
            HealthStatus::Disconnected | HealthStatus::Unknown => self.disconnected_interval,
            HealthStatus::Connected => self.connected_interval,
            HealthStatus::Slow if previous == HealthStatus::Slow => self.stable_slow_interval,
            HealthStatus::Slow => self.slow_interval,
        }
    }
}

#[derive(Default)]
struct MonitorState {
    current: ConnectionStatus,
    previous: HealthStatus,
    history: VecDeque<HealthCheck>,
}

struct Running {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct MonitorInner {
    requests: RequestManager,
    connectivity: ConnectivitySignal,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
    state: Mutex<MonitorState>,
    observers: Observers<StatusChange>,
    tick: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    running: Arc<Mutex<Option<Running>>>,
}

enum Probe {
    Offline,
    Answered(Duration),
    Failed(String),
}

impl HealthMonitor {
    pub fn new(
        requests: RequestManager,
        connectivity: ConnectivitySignal,
        clock: Arc<dyn Clock>,
        config: HealthConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                requests,
                connectivity,
                clock,
                config,
                state: Mutex::new(MonitorState::default()),
                observers: Observers::new(),
                tick: tokio::sync::Mutex::new(()),
            }),
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Starts the polling loop. Calling it while already running is a no-op.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }
        let stop = CancellationToken::new();
        let task = tokio::spawn(poll_loop(Arc::clone(&self.inner), stop.clone()));
        *running = Some(Running { stop, task });
        info!(base_url = %self.inner.config.base_url, "health monitor started");
    }

    /// Stops the loop. A check already in progress is abandoned.
    pub fn stop(&self) {
        if let Some(running) = lock(&self.running).take() {
            running.stop.cancel();
            running.task.abort();
            info!("health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Runs a check right away, after any check already in progress.
    /// Returns whether the backend is reachable.
    pub async fn force_check(&self) -> bool {
        self.inner.check().await.is_reachable()
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).current.clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(callback)
    }

    pub fn history(&self) -> Vec<HealthCheck> {
        lock(&self.inner.state).history.iter().cloned().collect()
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats::from_history(lock(&self.inner.state).history.iter())
    }

    pub fn connectivity(&self) -> &ConnectivitySignal {
        &self.inner.connectivity
    }
}

impl MonitorInner {
    async fn check(&self) -> HealthStatus {
        let _tick = self.tick.lock().await;
        let probe = self.probe().await;
        self.record(probe)
    }

    async fn probe(&self) -> Probe {
        if !self.connectivity.is_online() {
            return Probe::Offline;
        }

        let url = join_path(&self.config.base_url, HEALTH_PATH);
        let started = Instant::now();
        let outcome = self
            .requests
            .execute(
                RequestSpec::get(url),
                RequestOptions::health().with_timeout(self.config.probe_timeout),
            )
            .await;
        match outcome {
            Ok(_) => Probe::Answered(started.elapsed()),
            Err(err) => Probe::Failed(err.to_string()),
        }
    }

    fn record(&self, probe: Probe) -> HealthStatus {
        let now = self.clock.now();
        let change = {
            let mut state = lock(&self.state);
            let old = state.current.status;

            let (status, latency, error) = match probe {
                Probe::Offline => (
                    HealthStatus::Disconnected,
                    None,
                    Some("platform reports no connectivity".to_string()),
                ),
                Probe::Answered(latency) => {
                    state.current.consecutive_errors = 0;
                    let status = if latency >= self.config.slow_threshold {
                        HealthStatus::Slow
                    } else {
                        HealthStatus::Connected
                    };
                    (status, Some(latency), None)
                }
                Probe::Failed(error) => {
                    state.current.total_errors += 1;
                    state.current.consecutive_errors += 1;
                    (HealthStatus::Disconnected, None, Some(error))
                }
            };

            if let Some(error) = &error {
                debug!(%status, consecutive = state.current.consecutive_errors, error = %error, "health check failed");
            }

            state.previous = old;
            state.current.status = status;
            state.current.last_check = Some(now);
            if latency.is_some() {
                state.current.last_latency = latency;
            }

            let capacity = self.config.history_capacity.max(1);
            while state.history.len() >= capacity {
                state.history.pop_front();
            }
            state.history.push_back(HealthCheck {
                at: now,
                status,
                latency,
                error,
            });

            (old != status).then_some(StatusChange { new: status, old })
        };

        let Some(change) = change else {
            return lock(&self.state).current.status;
        };
        if change.new.is_reachable() {
            info!(from = %change.old, to = %change.new, "backend status changed");
        } else {
            warn!(from = %change.old, to = %change.new, "backend status changed");
        }
        self.observers.notify(&change);
        change.new
    }

    fn next_delay(&self) -> Duration {
        let (current, previous) = {
            let state = lock(&self.state);
            (state.current.status, state.previous)
        };
        self.config
            .interval_for(current, previous)
            .saturating_add(jitter(self.config.max_jitter))
    }
}

async fn poll_loop(inner: Arc<MonitorInner>, stop: CancellationToken) {
    let mut connectivity = inner.connectivity.watch();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = inner.check() => {}
        }

        let delay = inner.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "next health check scheduled");
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Ok(()) = connectivity.changed() => {
                debug!("connectivity transition; checking now");
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
