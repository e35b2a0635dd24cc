use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::classify::{ErrorCategory, Severity};

/// Free-form context attached to a report (endpoint, conversation id, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorContext(BTreeMap<String, Value>);

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reproducibility {
    Always,
    Sometimes,
    Once,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFeedback {
    /// 1 (useless) through 5 (very helpful).
    pub rating: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub reproducibility: Reproducibility,
}

impl UserFeedback {
    pub fn new(rating: u8, reproducibility: Reproducibility) -> Self {
        Self {
            rating,
            comment: None,
            category: None,
            reproducibility,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        (1..=5).contains(&self.rating)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: Uuid,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub category: ErrorCategory,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "ErrorContext::is_empty")]
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<UserFeedback>,
}

impl ErrorLogEntry {
    pub fn user_message(&self) -> &'static str {
        self.category.user_message()
    }
}

/// Criteria for [`ErrorReporter::query`](super::ErrorReporter::query). Unset
/// fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ErrorFilter {
    pub category: Option<ErrorCategory>,
    pub min_severity: Option<Severity>,
    pub resolved: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl ErrorFilter {
    pub fn matches(&self, entry: &ErrorLogEntry) -> bool {
        if self.category.is_some_and(|category| entry.category != category) {
            return false;
        }
        if self.min_severity.is_some_and(|min| entry.severity < min) {
            return false;
        }
        if self.resolved.is_some_and(|resolved| entry.resolved != resolved) {
            return false;
        }
        if self.since.is_some_and(|since| entry.timestamp < since) {
            return false;
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            if !entry.message.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// Point-in-time aggregate over the error log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total: usize,
    pub last_hour: usize,
    pub last_day: usize,
    pub unresolved: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}
