//! Backend wire payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const CHAT_PATH: &str = "/api/chat";
pub const ERROR_STATS_PATH: &str = "/api/errors/stats";
pub const RECENT_ERRORS_PATH: &str = "/api/errors/recent";

/// Longest message the backend accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub response: String,
    pub conversation_id: String,
    #[serde(default)]
    pub mcp_tools_used: Vec<String>,
    pub timestamp: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: f64,
    pub version: String,
}

/// Counters the backend keeps about its own failures.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct BackendErrorStats {
    #[serde(default)]
    pub total_errors: u64,
    #[serde(default)]
    pub errors_by_category: BTreeMap<String, u64>,
    #[serde(default)]
    pub errors_by_severity: BTreeMap<String, u64>,
    #[serde(default)]
    pub recent_errors: Vec<Value>,
}

/// `{"error": {"code", "message", "error_id"}}` as produced by the backend's
/// exception handlers.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<Value>,
    pub message: String,
    #[serde(default)]
    pub error_id: Option<String>,
}
