//! Orchestration: plan runs, agent loops, replay, and reporting.
//!
//! Both orchestrators drive the same per-step pipeline — stage the call,
//! evaluate policy, execute on allow, record call and result atomically —
//! strictly in sequence. Ordering and causality are total within a run:
//! every result is audit-recorded before the next step starts, and in
//! agent mode fed back to the planner.

use thiserror::Error;

use capsule_protocol::PlanError;
use capsule_store::StoreError;

mod exec;

pub mod agent;
pub mod plan_runner;
pub mod planner;
pub mod replay;
pub mod report;

pub use agent::{AgentConfig, AgentOutcome, AgentRunner, AgentStatus};
pub use plan_runner::{PlanOutcome, PlanRunner, PlanRunnerConfig};
pub use planner::{
    HistoryItem, Planner, PlannerResponse, PlannerState, Proposal, ScriptedPlanner, StepFeedback,
};
pub use replay::{ReplayEngine, ReplayError, ReplayOutcome};
pub use report::build_report;

/// Orchestrator failures that reach the CLI boundary. Policy denials and
/// tool errors never appear here — they are recorded as results.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunnerError {
    pub fn code(&self) -> u16 {
        match self {
            Self::Plan(err) => err.code(),
            Self::Store(err) => err.code(),
        }
    }
}
