use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::core::transport::{Method, RequestSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Drain order for queued requests.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
            RequestStatus::Timeout => "timeout",
            RequestStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Lifecycle record of one transport-level request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub id: RequestId,
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub priority: Priority,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub status: RequestStatus,
    pub retry_count: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub http_status: Option<u16>,
    pub duration: Option<Duration>,
}

impl RequestRecord {
    pub(crate) fn new(
        id: RequestId,
        spec: &RequestSpec,
        priority: Priority,
        timeout: Duration,
        created_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        Self {
            id,
            method: spec.method,
            url: spec.url.clone(),
            headers: spec.headers.clone(),
            body: spec.body.clone(),
            priority,
            timeout,
            created_at,
            status: RequestStatus::Pending,
            retry_count,
            completed_at: None,
            error: None,
            http_status: None,
            duration: None,
        }
    }
}

/// Snapshot of the request manager's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub deduplicated: u64,
    pub active: usize,
    pub queued: usize,
    #[serde(with = "millis")]
    pub average_response_time: Duration,
}

impl RequestStats {
    pub fn success_rate(&self) -> Option<f64> {
        let settled = self.successful + self.failed + self.timed_out;
        (settled > 0).then(|| self.successful as f64 / settled as f64)
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
