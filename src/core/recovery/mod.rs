//! Recovery around logical operations.
//!
//! [`RecoveryService::execute_with_recovery`] decides whether an operation
//! may run at all (degradation gate, circuit breaker, offline mode), retries
//! it with a policy picked from the last failure, and falls back to a cached
//! or explicit value when it still fails.

pub mod cache;
pub mod circuit_breaker;
pub mod degradation;
pub mod retry;

#[cfg(test)]
mod tests;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use cache::ResultCache;
pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakers, CircuitState};
pub use degradation::{FeatureGate, MAX_LEVEL, OFFLINE_LEVEL};
pub use retry::{Backoff, RetryPolicy};

use crate::core::clock::Clock;
use crate::core::connectivity::ConnectivitySignal;
use crate::core::errors::{Classify, FailureClass, FailureSignal};
use crate::core::health::{HealthMonitor, HealthStatus};
use crate::core::lock;
use crate::core::observers::{Observers, Subscription};
use crate::core::transport::TransportErrorCode;
use crate::utils::random::unit_fraction;

#[derive(Debug, Error)]
pub enum RecoveryError<E> {
    #[error("{error}")]
    Failed {
        #[source]
        error: E,
        attempts: u32,
    },
    #[error("{operation} is temporarily disabled after repeated failures")]
    CircuitOpen { operation: String },
    #[error("{feature} is unavailable at degradation level {level}")]
    FeatureUnavailable { feature: String, level: u8 },
    #[error("offline and no cached result for {operation}")]
    Offline { operation: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> RecoveryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RecoveryError::Cancelled)
    }

    /// The underlying failure, when the operation actually ran.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            RecoveryError::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl<E: Classify> Classify for RecoveryError<E> {
    fn signal(&self) -> FailureSignal {
        match self {
            RecoveryError::Failed { error, .. } => error.signal(),
            RecoveryError::Offline { .. } => FailureSignal::Transport(TransportErrorCode::Other),
            RecoveryError::CircuitOpen { .. } | RecoveryError::FeatureUnavailable { .. } => {
                FailureSignal::Other
            }
            RecoveryError::Cancelled => FailureSignal::Cancelled,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            RecoveryError::Failed { error, .. } => error.is_retryable(),
            RecoveryError::CircuitOpen { .. } | RecoveryError::Offline { .. } => true,
            RecoveryError::FeatureUnavailable { .. } | RecoveryError::Cancelled => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.operation_error().and_then(|error| error.retry_after())
    }
}

/// Per-call knobs for [`RecoveryService::execute_with_recovery`].
pub struct RecoveryOptions<T> {
    pub cache_key: Option<String>,
    pub cache_ttl: Duration,
    pub fallback: Option<T>,
    pub retry: Option<RetryPolicy>,
    pub max_retries: Option<u32>,
    pub cancel: Option<CancellationToken>,
    pub feature: Option<String>,
}

impl<T> Default for RecoveryOptions<T> {
    fn default() -> Self {
        Self {
            cache_key: None,
            cache_ttl: Duration::from_secs(300),
            fallback: None,
            retry: None,
            max_retries: None,
            cancel: None,
            feature: None,
        }
    }
}

impl<T> RecoveryOptions<T> {
    pub fn cached(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.cache_key = Some(key.into());
        self.cache_ttl = ttl;
        self
    }

    pub fn with_fallback(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn gated_by(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }
}

impl<T> fmt::Debug for RecoveryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOptions")
            .field("cache_key", &self.cache_key)
            .field("cache_ttl", &self.cache_ttl)
            .field("has_fallback", &self.fallback.is_some())
            .field("retry", &self.retry)
            .field("max_retries", &self.max_retries)
            .field("feature", &self.feature)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub breaker: BreakerConfig,
    pub offline_grace: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            offline_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineChange {
    pub offline: bool,
    pub degradation_level: u8,
}

#[derive(Default)]
struct RecoveryState {
    offline: bool,
    level: u8,
    level_before_offline: Option<u8>,
    pending_exit: Option<CancellationToken>,
}

struct RecoveryInner {
    config: RecoveryConfig,
    breakers: CircuitBreakers,
    cache: ResultCache,
    state: Mutex<RecoveryState>,
    observers: Observers<OfflineChange>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct RecoveryService {
    inner: Arc<RecoveryInner>,
}

impl RecoveryService {
    pub fn new(config: RecoveryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RecoveryInner {
                breakers: CircuitBreakers::new(config.breaker, clock),
                config,
                cache: ResultCache::new(),
                state: Mutex::new(RecoveryState::default()),
                observers: Observers::new(),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Runs `operation` under the recovery rules. The closure receives the
    /// attempt number, starting at 0.
    pub async fn execute_with_recovery<T, E, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
        options: RecoveryOptions<T>,
    ) -> Result<T, RecoveryError<E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Classify + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let inner = &self.inner;

        if let Some(feature) = options.feature.as_deref() {
            let level = self.degradation_level();
            if !degradation::is_available(feature, level) {
                debug!(operation = operation_name, feature, level, "feature gated off");
                return Err(RecoveryError::FeatureUnavailable {
                    feature: feature.to_string(),
                    level,
                });
            }
        }

        let cancel = options.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(RecoveryError::Cancelled);
        }

        let Some(permit) = inner.breakers.admit(operation_name) else {
            debug!(operation = operation_name, "rejected by open circuit");
            return Err(RecoveryError::CircuitOpen {
                operation: operation_name.to_string(),
            });
        };

        if self.is_offline() {
            drop(permit);
            return match self.serve_stale(operation_name, &options) {
                Some(value) => Ok(value),
                None => Err(RecoveryError::Offline {
                    operation: operation_name.to_string(),
                }),
            };
        }

        let mut backoff = Backoff::new();
        let mut retries = 0u32;
        let error = loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
                outcome = operation(retries) => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    permit.succeed();
                    if let Some(key) = &options.cache_key {
                        inner.cache.insert(key.clone(), value.clone(), options.cache_ttl);
                    }
                    if retries > 0 {
                        info!(operation = operation_name, retries, "operation recovered");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let class = error.failure_class();
            if class == FailureClass::Cancelled {
                return Err(RecoveryError::Cancelled);
            }

            let policy = options.retry.unwrap_or_else(|| RetryPolicy::for_class(class));
            let max_retries = options.max_retries.unwrap_or(policy.max_retries);
            if retries >= max_retries {
                break error;
            }

            let delay = backoff.next_delay(&policy, retries, error.retry_after(), unit_fraction());
            debug!(
                operation = operation_name,
                attempt = retries + 1,
                ?class,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after failure"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            retries += 1;
        };

        permit.fail();
        let attempts = retries + 1;
        warn!(operation = operation_name, attempts, error = %error, "operation failed");

        match self.serve_stale(operation_name, &options) {
            Some(value) => Ok(value),
            None => Err(RecoveryError::Failed { error, attempts }),
        }
    }

    fn serve_stale<T>(&self, operation_name: &str, options: &RecoveryOptions<T>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Some(key) = &options.cache_key {
            if let Some(value) = self.inner.cache.get::<T>(key) {
                info!(operation = operation_name, key = %key, "serving cached result");
                return Some(value);
            }
        }
        let fallback = options.fallback.clone();
        if fallback.is_some() {
            info!(operation = operation_name, "serving fallback value");
        }
        fallback
    }

    pub fn is_feature_available(&self, feature: &str) -> bool {
        degradation::is_available(feature, self.degradation_level())
    }

    pub fn degradation_level(&self) -> u8 {
        lock(&self.inner.state).level
    }

    /// Sets the level, clamped to `0..=MAX_LEVEL`. Returns the applied level.
    pub fn set_degradation_level(&self, level: i32) -> u8 {
        let level = degradation::clamp_level(level);
        let mut state = lock(&self.inner.state);
        if state.level != level {
            info!(from = state.level, to = level, "degradation level changed");
        }
        state.level = level;
        level
    }

    pub fn is_offline(&self) -> bool {
        lock(&self.inner.state).offline
    }

    /// Feeds a reachability observation. Loss enters offline mode at once;
    /// restoration leaves it only after the grace period without another
    /// loss.
    pub fn report_connectivity(&self, online: bool) {
        if online {
            self.schedule_exit();
        } else {
            self.enter_offline();
        }
    }

    fn enter_offline(&self) {
        let change = {
            let mut state = lock(&self.inner.state);
            if let Some(pending) = state.pending_exit.take() {
                pending.cancel();
            }
            if state.offline {
                return;
            }
            state.offline = true;
            state.level_before_offline = Some(state.level);
            state.level = state.level.max(OFFLINE_LEVEL);
            OfflineChange {
                offline: true,
                degradation_level: state.level,
            }
        };
        warn!(level = change.degradation_level, "entering offline mode");
        self.inner.observers.notify(&change);
    }

    fn schedule_exit(&self) {
        let token = {
            let mut state = lock(&self.inner.state);
            if !state.offline || state.pending_exit.is_some() {
                return;
            }
            let token = CancellationToken::new();
            state.pending_exit = Some(token.clone());
            token
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.exit_offline(&token);
            return;
        };
        let service = self.clone();
        let grace = self.inner.config.offline_grace;
        debug!(grace_ms = grace.as_millis() as u64, "connectivity restored; waiting out grace period");
        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => service.exit_offline(&token),
            }
        });
    }

    fn exit_offline(&self, token: &CancellationToken) {
        let change = {
            let mut state = lock(&self.inner.state);
            if token.is_cancelled() || !state.offline {
                return;
            }
            state.pending_exit = None;
            state.offline = false;
            if let Some(level) = state.level_before_offline.take() {
                state.level = level;
            }
            OfflineChange {
                offline: false,
                degradation_level: state.level,
            }
        };
        info!(level = change.degradation_level, "leaving offline mode");
        self.inner.observers.notify(&change);
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OfflineChange) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(callback)
    }

    /// Follows the monitor's status changes.
    pub fn attach(&self, monitor: &HealthMonitor) -> Subscription {
        let service = self.clone();
        monitor.subscribe(move |change| match change.new {
            HealthStatus::Disconnected => service.report_connectivity(false),
            HealthStatus::Connected | HealthStatus::Slow => service.report_connectivity(true),
            HealthStatus::Unknown => {}
        })
    }

    /// Follows platform connectivity transitions until [`Self::shutdown`].
    pub fn watch_connectivity(&self, signal: &ConnectivitySignal) {
        if !signal.is_online() {
            self.report_connectivity(false);
        }
        let mut changes = signal.watch();
        let service = self.clone();
        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let online = *changes.borrow_and_update();
                service.report_connectivity(online);
            }
        });
        lock(&self.inner.watchers).push(task);
    }

    /// Clears the cache and every breaker and resets degradation to 0.
    pub fn refresh(&self) {
        self.inner.cache.clear();
        self.inner.breakers.reset_all();
        let mut state = lock(&self.inner.state);
        state.level = 0;
        if state.offline {
            state.level_before_offline = Some(0);
        }
        info!("recovery state refreshed");
    }

    pub fn circuit_state(&self, operation: &str) -> CircuitState {
        self.inner.breakers.state(operation)
    }

    pub fn circuit_states(&self) -> Vec<BreakerSnapshot> {
        self.inner.breakers.snapshot()
    }

    pub fn reset_circuit(&self, operation: &str) {
        self.inner.breakers.reset(operation);
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn shutdown(&self) {
        for task in lock(&self.inner.watchers).drain(..) {
            task.abort();
        }
        if let Some(pending) = lock(&self.inner.state).pending_exit.take() {
            pending.cancel();
        }
    }
}
