//! The planner abstraction for agent mode.
//!
//! The agent loop must not know whether a proposal came from a language
//! model, a script, or a human — everything flows through `propose_next`.
//! Prompting, retries, and JSON repair all live inside planner
//! implementations; the loop only sees a raw response and, when parsing
//! succeeded, a structured proposal.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use capsule_protocol::CallStatus;

/// What the loop hands the planner each iteration.
#[derive(Debug, Clone, Serialize)]
pub struct PlannerState {
    pub task: String,
    pub tool_schemas: Value,
    pub policy_summary: String,
    pub history: Vec<HistoryItem>,
    pub iteration: u32,
}

/// One compact line of loop history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub iteration: u32,
    pub summary: String,
}

/// Feedback about the previous step, handed back to the planner.
#[derive(Debug, Clone)]
pub struct StepFeedback {
    pub tool_name: String,
    pub status: CallStatus,
    pub summary: String,
}

/// A parsed planner output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Proposal {
    ToolCall {
        tool: String,
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Raw planner bytes plus the parse outcome. `proposal: None` means the
/// output could not be parsed — the loop records it anyway.
#[derive(Debug, Clone)]
pub struct PlannerResponse {
    pub raw_response: String,
    pub proposal: Option<Proposal>,
}

impl PlannerResponse {
    pub fn parsed(proposal: Proposal) -> Self {
        let raw_response =
            serde_json::to_string(&proposal).unwrap_or_else(|_| "<unserializable>".to_string());
        Self {
            raw_response,
            proposal: Some(proposal),
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn propose_next(
        &self,
        state: &PlannerState,
        last_result: Option<&StepFeedback>,
    ) -> anyhow::Result<PlannerResponse>;
}

/// A deterministic planner that replays a fixed list of proposals, then
/// reports done. Used by tests and by the CLI when agent mode runs
/// without a language model.
pub struct ScriptedPlanner {
    proposals: Vec<Proposal>,
    cursor: Mutex<usize>,
}

impl ScriptedPlanner {
    pub fn new(proposals: Vec<Proposal>) -> Self {
        Self {
            proposals,
            cursor: Mutex::new(0),
        }
    }

    /// Load a JSON array of proposals from disk.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let proposals: Vec<Proposal> = serde_json::from_slice(&bytes)?;
        Ok(Self::new(proposals))
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn propose_next(
        &self,
        _state: &PlannerState,
        _last_result: Option<&StepFeedback>,
    ) -> anyhow::Result<PlannerResponse> {
        let mut cursor = self.cursor.lock();
        let proposal = match self.proposals.get(*cursor) {
            Some(proposal) => proposal.clone(),
            None => Proposal::Done {
                final_output: None,
                reason: Some("script exhausted".to_string()),
            },
        };
        *cursor += 1;
        Ok(PlannerResponse::parsed(proposal))
    }
}
