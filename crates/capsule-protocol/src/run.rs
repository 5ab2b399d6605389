//! Run lifecycle records and planner proposal logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ProposalId, RunId};

/// How a run was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Run,
    Replay,
    Agent,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Replay => "replay",
            Self::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run" => Some(Self::Run),
            "replay" => Some(Self::Replay),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// Lifecycle state of a run. Transitions are monotonic:
/// `pending → running → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving to `next` respects the monotonic lifecycle.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

/// Per-run step counters, updated as the orchestrator advances.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepCounters {
    pub total_steps: u32,
    pub completed_steps: u32,
    pub denied_steps: u32,
    pub failed_steps: u32,
}

/// One row of the `runs` table: everything needed for standalone replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub plan_hash: String,
    pub policy_hash: String,
    pub plan_json: String,
    pub policy_json: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub counters: StepCounters,
}

/// What kind of proposal a planner produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    ToolCall,
    Done,
}

impl ProposalType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool_call" => Some(Self::ToolCall),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// One logged planner output. `raw_response` preserves the planner's bytes
/// even when parsing failed, so the audit trail covers malformed output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerProposal {
    pub id: ProposalId,
    pub run_id: RunId,
    pub iteration: u32,
    pub proposal_type: ProposalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub raw_response: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_transitions_are_monotonic() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn mode_and_status_round_trip_through_str() {
        for mode in [RunMode::Run, RunMode::Replay, RunMode::Agent] {
            assert_eq!(RunMode::parse(mode.as_str()), Some(mode));
        }
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
