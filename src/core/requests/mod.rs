//! Request manager: the single gateway between the core and the transport.
//!
//! Every outbound call goes through [`RequestManager::execute`], which
//!
//! - attaches identical concurrent calls (same method, URL and body) to one
//!   in-flight transport call,
//! - admits requests against global and per-priority concurrency limits,
//! - bounds each request with its own timer, independent of the transport,
//! - tracks active requests, a capped history and running statistics.
//!
//! Transport and timeout failures come back as [`RequestError`] values; the
//! manager never panics on them.

pub mod admission;
pub mod record;


use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub use admission::ConcurrencyLimits;
pub use record::{Priority, RequestId, RequestRecord, RequestStats, RequestStatus};

use crate::api::ErrorEnvelope;
use crate::core::clock::{deadline_after, Clock};
use crate::core::errors::{Classify, FailureSignal};
use crate::core::lock;
use crate::core::transport::{RequestSpec, Transport, TransportError, TransportResponse};
use crate::utils::url::is_http_url;
use admission::Admission;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    InvalidSpec(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server responded with {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("request timed out after {}s", .after.as_secs_f32())]
    Timeout { after: Duration },
    #[error("request cancelled")]
    Cancelled,
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("request task failed: {0}")]
    Aborted(String),
}

impl RequestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled)
    }
}

impl Classify for RequestError {
    fn signal(&self) -> FailureSignal {
        match self {
            RequestError::InvalidSpec(_) | RequestError::Aborted(_) => FailureSignal::Internal,
            RequestError::Transport(err) => FailureSignal::Transport(err.code),
            RequestError::Status { status, .. } => FailureSignal::HttpStatus(*status),
            RequestError::Timeout { .. } => FailureSignal::Timeout,
            RequestError::Cancelled => FailureSignal::Cancelled,
            RequestError::Decode(_) => FailureSignal::Other,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RequestError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type RequestOutcome = Result<TransportResponse, RequestError>;

/// Which default timeout applies when the caller does not set one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationClass {
    Health,
    Chat,
    #[default]
    Default,
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub class: OperationClass,
    pub timeout: Option<Duration>,
    pub priority: Priority,
    pub cancel: Option<CancellationToken>,
    /// Attempt number assigned by the caller's retry loop; recorded as the
    /// request's retry count.
    pub attempt: u32,
    /// Runs outside the concurrency limits, so time spent behind other
    /// requests never counts against it. Used for health checks.
    pub skip_admission: bool,
}

impl RequestOptions {
    pub fn chat() -> Self {
        Self {
            class: OperationClass::Chat,
            priority: Priority::High,
            ..Self::default()
        }
    }

    pub fn health() -> Self {
        Self {
            class: OperationClass::Health,
            priority: Priority::Low,
            skip_admission: true,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub default_timeout: Duration,
    pub chat_timeout: Duration,
    pub health_timeout: Duration,
    pub limits: ConcurrencyLimits,
    pub history_capacity: usize,
}

impl RequestConfig {
    fn timeout_for(&self, options: &RequestOptions) -> Duration {
        options.timeout.unwrap_or(match options.class {
            OperationClass::Health => self.health_timeout,
            OperationClass::Chat => self.chat_timeout,
            OperationClass::Default => self.default_timeout,
        })
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            chat_timeout: Duration::from_secs(45),
            health_timeout: Duration::from_secs(5),
            limits: ConcurrencyLimits::default(),
            history_capacity: 100,
        }
    }
}

/// Dedup key: method, URL and body. Headers are deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(spec: &RequestSpec) -> Self {
        Self(format!(
            "{} {}\n{}",
            spec.method,
            spec.url,
            spec.body.as_deref().unwrap_or_default()
        ))
    }
}

type SharedOutcome = Shared<BoxFuture<'static, RequestOutcome>>;

struct InFlight {
    id: RequestId,
    outcome: SharedOutcome,
    callers: usize,
}

struct ActiveRequest {
    record: RequestRecord,
    cancel: CancellationToken,
    started: Instant,
}

#[derive(Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    timed_out: u64,
    cancelled: u64,
    deduplicated: u64,
    timed_samples: u64,
    average_response_time: Duration,
}

struct ManagerState {
    next_id: u64,
    active: HashMap<RequestId, ActiveRequest>,
    in_flight: HashMap<Fingerprint, InFlight>,
    admission: Admission,
    history: VecDeque<RequestRecord>,
    counters: Counters,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: RequestConfig,
    state: Mutex<ManagerState>,
}

#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<ManagerInner>,
}

impl RequestManager {
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, config: RequestConfig) -> Self {
        let admission = Admission::new(config.limits);
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                clock,
                state: Mutex::new(ManagerState {
                    next_id: 1,
                    active: HashMap::new(),
                    in_flight: HashMap::new(),
                    admission,
                    history: VecDeque::new(),
                    counters: Counters::default(),
                }),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RequestConfig {
        &self.inner.config
    }

    /// Runs `spec` through the transport, or attaches to an identical request
    /// already in flight.
    ///
    /// A caller whose own token fires stops waiting with
    /// [`RequestError::Cancelled`]; the shared request is only cancelled once
    /// every attached caller has given up.
    pub async fn execute(&self, spec: RequestSpec, options: RequestOptions) -> RequestOutcome {
        validate(&spec)?;
        let fingerprint = Fingerprint::of(&spec);

        let (id, outcome) = {
            let mut state = lock(&self.inner.state);
            match state.in_flight.get_mut(&fingerprint) {
                Some(in_flight) => {
                    debug!(request = %in_flight.id, url = %spec.url, "attaching to in-flight request");
                    in_flight.callers += 1;
                    let attached = (in_flight.id, in_flight.outcome.clone());
                    state.counters.deduplicated += 1;
                    attached
                }
                None => self.start(&mut state, fingerprint.clone(), spec, &options),
            }
        };

        let Some(token) = options.cancel else {
            return outcome.await;
        };
        tokio::select! {
            biased;
            outcome = outcome => outcome,
            _ = token.cancelled() => {
                self.detach(&fingerprint, id);
                Err(RequestError::Cancelled)
            }
        }
    }

    fn start(
        &self,
        state: &mut ManagerState,
        fingerprint: Fingerprint,
        spec: RequestSpec,
        options: &RequestOptions,
    ) -> (RequestId, SharedOutcome) {
        let id = RequestId(state.next_id);
        state.next_id += 1;

        let cancel = CancellationToken::new();
        let timeout = self.inner.config.timeout_for(options);
        let record = RequestRecord::new(
            id,
            &spec,
            options.priority,
            timeout,
            self.inner.clock.now(),
            options.attempt,
        );
        debug!(request = %id, method = %spec.method, url = %spec.url, priority = ?options.priority, "starting request");

        state.active.insert(
            id,
            ActiveRequest {
                record,
                cancel: cancel.clone(),
                started: Instant::now(),
            },
        );
        state.counters.total += 1;

        let admission = (!options.skip_admission).then_some(options.priority);
        let task = tokio::spawn(run_request(
            Arc::clone(&self.inner),
            id,
            spec,
            admission,
            timeout,
            cancel,
        ));
        let inner = Arc::downgrade(&self.inner);
        let outcome = task
            .map(move |joined| match joined {
                Ok(outcome) => outcome,
                Err(err) => abandon(&inner, id, err),
            })
            .boxed()
            .shared();

        state.in_flight.insert(
            fingerprint,
            InFlight {
                id,
                outcome: outcome.clone(),
                callers: 1,
            },
        );
        (id, outcome)
    }

    /// One caller stopped waiting. The last one out cancels the request.
    fn detach(&self, fingerprint: &Fingerprint, id: RequestId) {
        let mut state = lock(&self.inner.state);
        let abandoned = match state.in_flight.get_mut(fingerprint) {
            Some(in_flight) if in_flight.id == id => {
                in_flight.callers = in_flight.callers.saturating_sub(1);
                in_flight.callers == 0
            }
            _ => false,
        };
        if abandoned {
            debug!(request = %id, "all callers gone, cancelling request");
            self.inner.settle(&mut state, id, &Err(RequestError::Cancelled));
        }
    }

    /// Cancels one active request. Every caller attached to it settles with
    /// [`RequestError::Cancelled`].
    pub fn cancel(&self, id: RequestId) -> bool {
        let mut state = lock(&self.inner.state);
        let cancelled = self.inner.settle(&mut state, id, &Err(RequestError::Cancelled));
        if cancelled {
            debug!(request = %id, "request cancelled");
        }
        cancelled
    }

    /// Cancels everything in flight or queued, e.g. when the view goes away.
    pub fn cancel_all(&self) -> usize {
        let mut state = lock(&self.inner.state);
        let ids: Vec<RequestId> = state.active.keys().copied().collect();
        let count = ids
            .into_iter()
            .filter(|id| self.inner.settle(&mut state, *id, &Err(RequestError::Cancelled)))
            .count();
        if count > 0 {
            debug!(count, "cancelled all active requests");
        }
        count
    }

    pub fn active(&self) -> Vec<RequestRecord> {
        let state = lock(&self.inner.state);
        let mut records: Vec<_> = state.active.values().map(|a| a.record.clone()).collect();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Completed requests, oldest first.
    pub fn history(&self) -> Vec<RequestRecord> {
        lock(&self.inner.state).history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        lock(&self.inner.state).history.clear();
    }

    pub fn stats(&self) -> RequestStats {
        let state = lock(&self.inner.state);
        let counters = &state.counters;
        RequestStats {
            total: counters.total,
            successful: counters.successful,
            failed: counters.failed,
            timed_out: counters.timed_out,
            cancelled: counters.cancelled,
            deduplicated: counters.deduplicated,
            active: state.active.len(),
            queued: state.admission.queued(),
            average_response_time: counters.average_response_time,
        }
    }
}

impl ManagerInner {
    /// Moves an active request to history. Returns `false` if it had already
    /// been settled (for example cancelled while the transport was running).
    fn settle(&self, state: &mut ManagerState, id: RequestId, outcome: &RequestOutcome) -> bool {
        let Some(active) = state.active.remove(&id) else {
            return false;
        };
        state.in_flight.retain(|_, in_flight| in_flight.id != id);

        let ActiveRequest {
            mut record,
            cancel,
            started,
        } = active;
        let elapsed = started.elapsed();

        record.completed_at = Some(self.clock.now());
        record.duration = Some(elapsed);
        record.status = match outcome {
            Ok(_) => RequestStatus::Success,
            Err(RequestError::Timeout { .. }) => RequestStatus::Timeout,
            Err(RequestError::Cancelled) => RequestStatus::Cancelled,
            Err(_) => RequestStatus::Error,
        };
        match outcome {
            Ok(response) => record.http_status = Some(response.status),
            Err(err) => {
                if let RequestError::Status { status, .. } = err {
                    record.http_status = Some(*status);
                }
                record.error = Some(err.to_string());
            }
        }

        let counters = &mut state.counters;
        match record.status {
            RequestStatus::Success => counters.successful += 1,
            RequestStatus::Error => counters.failed += 1,
            RequestStatus::Timeout => counters.timed_out += 1,
            RequestStatus::Cancelled => counters.cancelled += 1,
            RequestStatus::Pending => {}
        }
        if matches!(record.status, RequestStatus::Success | RequestStatus::Error) {
            counters.timed_samples += 1;
            let n = counters.timed_samples as f64;
            let average = counters.average_response_time.as_secs_f64();
            let updated = average + (elapsed.as_secs_f64() - average) / n;
            counters.average_response_time = Duration::from_secs_f64(updated.max(0.0));
        }

        if record.status != RequestStatus::Success {
            debug!(request = %id, status = %record.status, error = ?record.error, "request finished");
        }

        let capacity = self.config.history_capacity.max(1);
        while state.history.len() >= capacity {
            state.history.pop_front();
        }
        state.history.push_back(record);

        // Wakes the task (and through it the transport) if it is still running.
        cancel.cancel();
        true
    }
}

/// The request task died before settling, which only happens if the
/// transport panicked. Settles the request so it leaves active tracking and
/// the dedup map.
fn abandon(inner: &Weak<ManagerInner>, id: RequestId, err: JoinError) -> RequestOutcome {
    error!(request = %id, error = %err, "request task failed");
    let outcome = Err(RequestError::Aborted(err.to_string()));
    let Some(inner) = inner.upgrade() else {
        return outcome;
    };
    let mut state = lock(&inner.state);
    if inner.settle(&mut state, id, &outcome) {
        outcome
    } else {
        Err(RequestError::Cancelled)
    }
}

/// `admission` is `None` for requests that skip the concurrency limits.
async fn run_request(
    inner: Arc<ManagerInner>,
    id: RequestId,
    spec: RequestSpec,
    admission: Option<Priority>,
    timeout: Duration,
    cancel: CancellationToken,
) -> RequestOutcome {
    let deadline = deadline_after(timeout);

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RequestError::Cancelled),
        _ = tokio::time::sleep_until(deadline) => {
            cancel.cancel();
            Err(RequestError::Timeout { after: timeout })
        }
        result = admit_and_send(&inner, id, &spec, admission, &cancel) => result,
    };

    let mut state = lock(&inner.state);
    if !inner.settle(&mut state, id, &outcome) {
        // Already settled by an explicit cancel.
        return Err(RequestError::Cancelled);
    }
    outcome
}

async fn admit_and_send(
    inner: &Arc<ManagerInner>,
    id: RequestId,
    spec: &RequestSpec,
    admission: Option<Priority>,
    cancel: &CancellationToken,
) -> RequestOutcome {
    let _slot = match admission {
        Some(priority) => Some(acquire_slot(inner, id, priority).await),
        None => None,
    };

    match inner.transport.send(spec, cancel).await {
        Ok(response) if response.is_success() => Ok(response),
        Ok(response) => Err(status_error(&response)),
        Err(err) => {
            warn!(request = %id, url = %spec.url, error = %err, "transport failure");
            Err(RequestError::Transport(err))
        }
    }
}

/// Holds an admission slot (or a place in the queue) and gives it back on
/// drop, whichever way the request ends.
struct SlotGuard {
    inner: Arc<ManagerInner>,
    id: RequestId,
    priority: Priority,
    queued: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        if self.queued && state.admission.remove_waiter(self.id, self.priority) {
            return;
        }
        state.admission.release(self.priority);
    }
}

async fn acquire_slot(inner: &Arc<ManagerInner>, id: RequestId, priority: Priority) -> SlotGuard {
    let admitted = {
        let mut state = lock(&inner.state);
        if state.admission.try_admit(priority) {
            None
        } else {
            debug!(request = %id, priority = ?priority, "request queued");
            Some(state.admission.enqueue(id, priority))
        }
    };

    let mut guard = SlotGuard {
        inner: Arc::clone(inner),
        id,
        priority,
        queued: admitted.is_some(),
    };
    if let Some(rx) = admitted {
        // The sender only disappears once we were promoted or removed; either
        // way the guard knows how to clean up.
        let _ = rx.await;
        guard.queued = false;
    }
    guard
}

fn validate(spec: &RequestSpec) -> Result<(), RequestError> {
    let url = spec.url.trim();
    if url.is_empty() {
        return Err(RequestError::InvalidSpec("URL is empty".to_string()));
    }
    if !is_http_url(url) {
        return Err(RequestError::InvalidSpec(format!(
            "unsupported URL scheme in {url}"
        )));
    }
    if spec.body.is_some() && !spec.method.allows_body() {
        return Err(RequestError::InvalidSpec(format!(
            "{} requests cannot carry a body",
            spec.method
        )));
    }
    Ok(())
}

fn status_error(response: &TransportResponse) -> RequestError {
    let retry_after = response
        .header("retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    RequestError::Status {
        status: response.status,
        message: error_summary(&response.body).unwrap_or_else(|| format!("HTTP {}", response.status)),
        retry_after,
    }
}

/// Pulls a one-line message out of a backend error body.
pub(crate) fn error_summary(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let summary = if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(trimmed) {
        Some(envelope.error.message)
    } else {
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => value
                .pointer("/detail/message")
                .and_then(|v| v.as_str())
                .map(str::to_owned)
                .or_else(|| {
                    ["error", "detail", "message"]
                        .iter()
                        .find_map(|key| value.get(*key).and_then(|v| v.as_str()).map(str::to_owned))
                }),
            Err(_) => Some(trimmed.chars().take(200).collect()),
        }
    }?;

    let collapsed = summary.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}
