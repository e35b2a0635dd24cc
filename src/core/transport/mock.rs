//! Scripted transport for unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{RequestSpec, Transport, TransportError, TransportErrorCode, TransportResponse};
use crate::core::lock;

type Responder =
    dyn Fn(&RequestSpec, usize) -> Result<TransportResponse, TransportError> + Send + Sync;

/// Answers each call with `responder(spec, call_index)` after an optional
/// simulated latency, honouring cancellation while it waits.
pub struct MockTransport {
    responder: Box<Responder>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
    seen: Mutex<Vec<RequestSpec>>,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&RequestSpec, usize) -> Result<TransportResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            latency: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn ok(body: &'static str) -> Arc<Self> {
        Self::new(move |_, _| Ok(TransportResponse::new(200, body)))
    }

    pub fn status(status: u16, body: &'static str) -> Arc<Self> {
        Self::new(move |_, _| Ok(TransportResponse::new(status, body)))
    }

    pub fn failing(code: TransportErrorCode) -> Arc<Self> {
        Self::new(move |_, _| Err(TransportError::new(code, "scripted failure")))
    }

    pub fn with_latency(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        *lock(&self.latency) = latency;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<RequestSpec> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        spec: &RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.seen).push(spec.clone());

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TransportError::new(TransportErrorCode::Other, "cancelled"));
                }
                _ = tokio::time::sleep(latency) => {}
            }
        }

        (self.responder)(spec, index)
    }
}
