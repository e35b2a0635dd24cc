//! Failure taxonomy shared by the reporter and the retry layer.
//!
//! Every failure the core sees is reduced to a [`FailureSignal`]. From the
//! signal we derive the logged [`ErrorCategory`], a starting [`Severity`] and
//! the [`FailureClass`] that selects a retry policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::core::transport::TransportErrorCode;

/// Raw failure signal, as close to the source as possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureSignal {
    Transport(TransportErrorCode),
    HttpStatus(u16),
    Timeout,
    Cancelled,
    InvalidInput,
    Render,
    Internal,
    Other,
}

/// Implemented by error types the core knows how to classify.
pub trait Classify {
    fn signal(&self) -> FailureSignal;

    fn category(&self) -> ErrorCategory {
        self.signal().category()
    }

    fn failure_class(&self) -> FailureClass {
        self.signal().failure_class()
    }

    fn is_retryable(&self) -> bool {
        self.failure_class().is_retryable()
    }

    /// Server-requested wait before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Api,
    Runtime,
    Render,
    Timeout,
    Proxy,
    UserInput,
    System,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Network,
        ErrorCategory::Api,
        ErrorCategory::Runtime,
        ErrorCategory::Render,
        ErrorCategory::Timeout,
        ErrorCategory::Proxy,
        ErrorCategory::UserInput,
        ErrorCategory::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Api => "api",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Render => "render",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Proxy => "proxy",
            ErrorCategory::UserInput => "user_input",
            ErrorCategory::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(value))
    }

    /// Message suitable for showing to the person at the keyboard.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::Network => {
                "Unable to reach the chat service. Check your connection and try again."
            }
            ErrorCategory::Api => "The chat service is experiencing issues. Please try again later.",
            ErrorCategory::Timeout => {
                "The request took too long, possibly because of slow external services. \
                 Please try again later or try a simpler query."
            }
            ErrorCategory::Proxy => {
                "The connection to the chat service was interrupted. Please try again later."
            }
            ErrorCategory::UserInput => "Please check your message and try again.",
            ErrorCategory::Render => "Something went wrong while displaying the conversation.",
            ErrorCategory::Runtime | ErrorCategory::System => {
                "An unexpected error occurred. Please try again later."
            }
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ]
        .into_iter()
        .find(|severity| severity.as_str().eq_ignore_ascii_case(value))
    }

    pub fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse class used to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Timeout,
    Server,
    RateLimit,
    Client,
    Network,
    Cancelled,
    Fatal,
    Unknown,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureClass::Client | FailureClass::Cancelled | FailureClass::Fatal
        )
    }
}

impl FailureSignal {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FailureSignal::Transport(TransportErrorCode::Timeout) | FailureSignal::Timeout => {
                ErrorCategory::Timeout
            }
            FailureSignal::Transport(TransportErrorCode::Proxy) => ErrorCategory::Proxy,
            FailureSignal::Transport(_) => ErrorCategory::Network,
            // Bad gateway is produced by the proxy in front of the backend.
            FailureSignal::HttpStatus(502) => ErrorCategory::Proxy,
            FailureSignal::HttpStatus(_) => ErrorCategory::Api,
            FailureSignal::InvalidInput => ErrorCategory::UserInput,
            FailureSignal::Render => ErrorCategory::Render,
            FailureSignal::Internal => ErrorCategory::System,
            FailureSignal::Cancelled | FailureSignal::Other => ErrorCategory::Runtime,
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            FailureSignal::Transport(TransportErrorCode::Timeout) | FailureSignal::Timeout => {
                FailureClass::Timeout
            }
            FailureSignal::Transport(_) => FailureClass::Network,
            FailureSignal::HttpStatus(408) => FailureClass::Timeout,
            FailureSignal::HttpStatus(429) => FailureClass::RateLimit,
            FailureSignal::HttpStatus(status) if *status >= 500 => FailureClass::Server,
            FailureSignal::HttpStatus(status) if *status >= 400 => FailureClass::Client,
            FailureSignal::HttpStatus(_) => FailureClass::Unknown,
            FailureSignal::InvalidInput => FailureClass::Client,
            FailureSignal::Cancelled => FailureClass::Cancelled,
            FailureSignal::Render | FailureSignal::Internal => FailureClass::Fatal,
            FailureSignal::Other => FailureClass::Unknown,
        }
    }

    /// Severity of an isolated occurrence, before repetition is considered.
    pub fn base_severity(&self) -> Severity {
        match self {
            FailureSignal::HttpStatus(status) if *status >= 500 => Severity::High,
            FailureSignal::HttpStatus(429) => Severity::Medium,
            FailureSignal::HttpStatus(_) => Severity::Low,
            _ => match self.category() {
                ErrorCategory::Network | ErrorCategory::UserInput => Severity::Low,
                ErrorCategory::Timeout
                | ErrorCategory::Api
                | ErrorCategory::Proxy
                | ErrorCategory::Runtime => Severity::Medium,
                ErrorCategory::Render | ErrorCategory::System => Severity::High,
            },
        }
    }
}
