//! Error classification and the bounded error log.
//!
//! [`ErrorReporter`] turns failures into [`ErrorLogEntry`] values, keeps the
//! most recent ones in memory (oldest evicted first), and optionally mirrors
//! them to a [`LogSink`]. Window counts are always derived from entry
//! timestamps so they cannot drift from the log contents.

pub mod classify;
pub mod entry;
pub mod sink;


use chrono::Duration as ChronoDuration;
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use classify::{Classify, ErrorCategory, FailureClass, FailureSignal, Severity};
pub use entry::{ErrorContext, ErrorFilter, ErrorLogEntry, ErrorSummary, Reproducibility, UserFeedback};
pub use sink::{JsonLinesSink, LogSink};

use crate::core::clock::Clock;
use crate::core::lock;

/// Same-category reports inside this window count as repetition.
const REPETITION_WINDOW_MINUTES: i64 = 5;
const ESCALATE_AFTER: usize = 3;
const CRITICAL_AFTER: usize = 10;

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub capacity: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

struct ReporterInner {
    capacity: usize,
    clock: Arc<dyn Clock>,
    sink: Option<Box<dyn LogSink>>,
    entries: Mutex<VecDeque<ErrorLogEntry>>,
}

#[derive(Clone)]
pub struct ErrorReporter {
    inner: Arc<ReporterInner>,
}

impl ErrorReporter {
    pub fn new(config: ReporterConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, None)
    }

    pub fn with_sink(config: ReporterConfig, clock: Arc<dyn Clock>, sink: Box<dyn LogSink>) -> Self {
        Self::build(config, clock, Some(sink))
    }

    fn build(config: ReporterConfig, clock: Arc<dyn Clock>, sink: Option<Box<dyn LogSink>>) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                capacity: config.capacity.max(1),
                clock,
                sink,
                entries: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Classifies and records `error`. The source chain becomes the entry's
    /// stack.
    pub fn report<E>(&self, error: &E, context: ErrorContext) -> ErrorLogEntry
    where
        E: Classify + StdError,
    {
        let stack = source_chain(error);
        self.record(error.signal(), error.to_string(), stack, context)
    }

    /// Records a failure that has no error value, such as a render failure
    /// reported by the UI.
    pub fn report_message(
        &self,
        signal: FailureSignal,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> ErrorLogEntry {
        self.record(signal, message.into(), None, context)
    }

    fn record(
        &self,
        signal: FailureSignal,
        message: String,
        stack: Option<String>,
        context: ErrorContext,
    ) -> ErrorLogEntry {
        let now = self.inner.clock.now();
        let category = signal.category();

        let entry = {
            let mut entries = lock(&self.inner.entries);
            let window_start = now - ChronoDuration::minutes(REPETITION_WINDOW_MINUTES);
            let recent_same = entries
                .iter()
                .filter(|entry| entry.category == category && entry.timestamp >= window_start)
                .count();

            let entry = ErrorLogEntry {
                id: Uuid::new_v4(),
                message,
                stack,
                category,
                severity: escalate(signal.base_severity(), recent_same + 1),
                context,
                timestamp: now,
                resolved: false,
                feedback: None,
            };

            while entries.len() >= self.inner.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
            entry
        };

        emit(&entry);
        if let Some(sink) = &self.inner.sink {
            mirror(sink.as_ref(), &entry);
        }
        entry
    }

    /// Entries matching `filter`, newest first.
    pub fn query(&self, filter: &ErrorFilter) -> Vec<ErrorLogEntry> {
        let entries = lock(&self.inner.entries);
        let matching = entries.iter().rev().filter(|entry| filter.matches(entry)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<ErrorLogEntry> {
        lock(&self.inner.entries)
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    /// Attaches feedback to an entry. Returns `false` for an unknown id or a
    /// rating outside 1..=5.
    pub fn attach_feedback(&self, id: Uuid, feedback: UserFeedback) -> bool {
        if !feedback.is_valid() {
            return false;
        }
        let mut entries = lock(&self.inner.entries);
        match entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.feedback = Some(feedback);
                true
            }
            None => false,
        }
    }

    pub fn resolve(&self, id: Uuid) -> bool {
        let mut entries = lock(&self.inner.entries);
        match entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.resolved = true;
                true
            }
            None => false,
        }
    }

    pub fn summary(&self) -> ErrorSummary {
        let now = self.inner.clock.now();
        let hour_ago = now - ChronoDuration::hours(1);
        let day_ago = now - ChronoDuration::days(1);

        let entries = lock(&self.inner.entries);
        let mut summary = ErrorSummary {
            total: entries.len(),
            ..ErrorSummary::default()
        };
        for entry in entries.iter() {
            if entry.timestamp >= hour_ago {
                summary.last_hour += 1;
            }
            if entry.timestamp >= day_ago {
                summary.last_day += 1;
            }
            if !entry.resolved {
                summary.unresolved += 1;
            }
            *summary.by_category.entry(entry.category).or_default() += 1;
            *summary.by_severity.entry(entry.severity).or_default() += 1;
        }
        summary
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn clear(&self) {
        lock(&self.inner.entries).clear();
    }
}

fn escalate(base: Severity, occurrences: usize) -> Severity {
    if occurrences >= CRITICAL_AFTER {
        Severity::Critical
    } else if occurrences >= ESCALATE_AFTER {
        base.escalate()
    } else {
        base
    }
}

fn source_chain(error: &dyn StdError) -> Option<String> {
    let mut causes = Vec::new();
    let mut current = error.source();
    while let Some(cause) = current {
        causes.push(format!("caused by: {cause}"));
        current = cause.source();
    }
    if causes.is_empty() {
        None
    } else {
        Some(causes.join("\n"))
    }
}

/// Writes `entry` to the sink. On a multi-threaded runtime the write is moved
/// off the async worker with `block_in_place`; elsewhere it runs inline.
/// Failures are logged and swallowed.
fn mirror(sink: &dyn LogSink, entry: &ErrorLogEntry) {
    let write = || sink.write(entry);
    let result = match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(write)
        }
        _ => write(),
    };
    if let Err(err) = result {
        warn!(error = %err, "failed to mirror error entry to log sink");
    }
}

fn emit(entry: &ErrorLogEntry) {
    let id = entry.id.to_string();
    match entry.severity {
        Severity::Critical | Severity::High => error!(
            error_id = %id,
            category = %entry.category,
            severity = %entry.severity,
            "{}",
            entry.message
        ),
        Severity::Medium => warn!(
            error_id = %id,
            category = %entry.category,
            severity = %entry.severity,
            "{}",
            entry.message
        ),
        Severity::Low => info!(
            error_id = %id,
            category = %entry.category,
            severity = %entry.severity,
            "{}",
            entry.message
        ),
    }
}
