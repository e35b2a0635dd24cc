//! Logical operations the user interface issues against the backend.
//!
//! Each call runs through the [`RecoveryService`] (gate, breaker, retries,
//! cache) and then the [`RequestManager`]. Failures that reach the caller
//! are recorded by the [`ErrorReporter`] first.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{
    BackendErrorStats, ChatRequest, ChatResponse, HealthResponse, CHAT_PATH, ERROR_STATS_PATH,
    MAX_MESSAGE_CHARS, RECENT_ERRORS_PATH,
};
use crate::core::errors::{Classify, ErrorContext, ErrorReporter, FailureSignal};
use crate::core::health::HEALTH_PATH;
use crate::core::recovery::{RecoveryError, RecoveryOptions, RecoveryService};
use crate::core::requests::{RequestError, RequestManager, RequestOptions};
use crate::core::transport::RequestSpec;
use crate::utils::url::join_path;

const STATS_CACHE_KEY: &str = "backend_error_stats";
const STATS_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("message is {length} characters long; the limit is {max}")]
    MessageTooLong { length: usize, max: usize },
    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Request(#[from] RecoveryError<RequestError>),
}

impl ChatError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Request(err) if err.is_cancelled())
    }

    /// Text suitable for showing to the person at the keyboard.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::EmptyMessage | ChatError::MessageTooLong { .. } => self.to_string(),
            ChatError::Request(RecoveryError::CircuitOpen { .. })
            | ChatError::Request(RecoveryError::FeatureUnavailable { .. })
            | ChatError::Request(RecoveryError::Offline { .. }) => self.to_string(),
            _ => self.category().user_message().to_string(),
        }
    }
}

impl Classify for ChatError {
    fn signal(&self) -> FailureSignal {
        match self {
            ChatError::EmptyMessage | ChatError::MessageTooLong { .. } => {
                FailureSignal::InvalidInput
            }
            ChatError::Encode(_) => FailureSignal::Internal,
            ChatError::Request(err) => err.signal(),
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            ChatError::Request(err) => err.is_retryable(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ChatError::Request(err) => err.retry_after(),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    requests: RequestManager,
    recovery: RecoveryService,
    reporter: ErrorReporter,
}

impl ChatClient {
    pub fn new(
        base_url: impl Into<String>,
        requests: RequestManager,
        recovery: RecoveryService,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            requests,
            recovery,
            reporter,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends one chat turn. Passing `conversation_id` continues an existing
    /// conversation; the backend starts a new one otherwise.
    pub async fn send_message(
        &self,
        message: &str,
        conversation_id: Option<&str>,
        cancel: Option<CancellationToken>,
    ) -> Result<ChatResponse, ChatError> {
        let mut context = ErrorContext::new()
            .with("operation", "chat")
            .with("message_length", message.chars().count() as u64);
        if let Some(id) = conversation_id {
            context.insert("conversation_id", id);
        }

        if let Err(err) = validate_message(message) {
            self.reporter.report(&err, context);
            return Err(err);
        }

        let payload = ChatRequest {
            message: message.to_string(),
            conversation_id: conversation_id.map(str::to_string),
        };
        let spec = RequestSpec::post_json(join_path(&self.base_url, CHAT_PATH), &payload)?;

        let mut options = RecoveryOptions::default().gated_by("send_message");
        if let Some(token) = &cancel {
            options = options.with_cancel(token.clone());
        }

        let result = self
            .recovery
            .execute_with_recovery(
                "chat",
                move |attempt| {
                    let request = RequestOptions::chat().with_attempt(attempt);
                    self.fetch_json::<ChatResponse>(spec.clone(), with_token(request, &cancel))
                },
                options,
            )
            .await;

        self.finish(result, context)
    }

    /// Asks the backend for its own health document.
    pub async fn check_health(&self) -> Result<HealthResponse, ChatError> {
        let spec = RequestSpec::get(join_path(&self.base_url, HEALTH_PATH));
        let result = self
            .recovery
            .execute_with_recovery(
                "health",
                move |_| self.fetch_json::<HealthResponse>(spec.clone(), RequestOptions::health()),
                RecoveryOptions::default()
                    .gated_by("health_check")
                    .with_max_retries(0),
            )
            .await;

        self.finish(result, ErrorContext::new().with("operation", "health"))
    }

    /// Backend error counters. A recent copy is cached and served when the
    /// backend cannot be reached.
    pub async fn fetch_backend_error_stats(&self) -> Result<BackendErrorStats, ChatError> {
        let spec = RequestSpec::get(join_path(&self.base_url, ERROR_STATS_PATH));
        let result = self
            .recovery
            .execute_with_recovery(
                "error_stats",
                move |_| self.fetch_json::<BackendErrorStats>(spec.clone(), RequestOptions::default()),
                RecoveryOptions::default()
                    .gated_by("error_stats")
                    .cached(STATS_CACHE_KEY, STATS_CACHE_TTL),
            )
            .await;

        self.finish(result, ErrorContext::new().with("operation", "error_stats"))
    }

    /// The backend's most recent error records, newest last.
    pub async fn fetch_recent_backend_errors(&self, limit: usize) -> Result<Vec<Value>, ChatError> {
        let url = format!(
            "{}?limit={limit}",
            join_path(&self.base_url, RECENT_ERRORS_PATH)
        );
        let spec = RequestSpec::get(url);
        let result = self
            .recovery
            .execute_with_recovery(
                "recent_errors",
                move |_| self.fetch_json::<Vec<Value>>(spec.clone(), RequestOptions::default()),
                RecoveryOptions::default().gated_by("error_stats"),
            )
            .await;

        self.finish(
            result,
            ErrorContext::new()
                .with("operation", "recent_errors")
                .with("limit", limit as u64),
        )
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        spec: RequestSpec,
        options: RequestOptions,
    ) -> Result<T, RequestError> {
        let response = self.requests.execute(spec, options).await?;
        response
            .json::<T>()
            .map_err(|err| RequestError::Decode(err.to_string()))
    }

    fn finish<T>(
        &self,
        result: Result<T, RecoveryError<RequestError>>,
        mut context: ErrorContext,
    ) -> Result<T, ChatError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.is_cancelled() {
            debug!(?context, "operation cancelled by caller");
            return Err(err.into());
        }
        if let RecoveryError::Failed { attempts, .. } = &err {
            context.insert("attempts", u64::from(*attempts));
        }
        self.reporter.report(&err, context);
        Err(err.into())
    }
}

fn with_token(options: RequestOptions, cancel: &Option<CancellationToken>) -> RequestOptions {
    match cancel {
        Some(token) => options.with_cancel(token.clone()),
        None => options,
    }
}

pub fn validate_message(message: &str) -> Result<(), ChatError> {
    if message.trim().is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    let length = message.chars().count();
    if length > MAX_MESSAGE_CHARS {
        return Err(ChatError::MessageTooLong {
            length,
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(())
}
