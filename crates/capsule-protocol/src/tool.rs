//! Tool types: calls, outcomes, and audited results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CallId, RunId};
use crate::policy::PolicyDecision;

/// One proposed tool invocation, as recorded in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: CallId,
    pub run_id: RunId,
    pub step_index: u32,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// What happened when a tool executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { output: serde_json::Value },
    Failure { error: String },
}

/// Audited status of a call: executed successfully, blocked by policy, or
/// failed inside the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Denied,
    Error,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "denied" => Some(Self::Denied),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// The audited result paired with every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: CallId,
    pub run_id: RunId,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub decision: PolicyDecision,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub input_hash: String,
    pub output_hash: String,
}
