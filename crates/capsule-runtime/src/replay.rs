//! Deterministic replay from stored artifacts.
//!
//! Replay never touches the tool registry or the policy engine: outputs
//! and statuses come straight from the origin rows, and the recomputed
//! hashes must match the origin's bit for bit.

use std::collections::HashMap;
use std::sync::Arc;

use capsule_protocol::{
    CallStatus, Plan, Policy, RunId, RunMode, RunStatus, StepCounters, canon,
};
use capsule_store::{AuditStore, StoreError};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

/// Replay failures. Fatal for the replay operation.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("origin run {0} not found")]
    MissingOrigin(RunId),
    #[error("plan hash mismatch: recorded {recorded}, recomputed {recomputed}")]
    PlanHashMismatch { recorded: String, recomputed: String },
    #[error("step {step_index}: input hash mismatch (origin {origin}, replay {replay})")]
    InputHashMismatch {
        step_index: u32,
        origin: String,
        replay: String,
    },
    #[error("step {step_index}: output hash mismatch (origin {origin}, replay {replay})")]
    OutputHashMismatch {
        step_index: u32,
        origin: String,
        replay: String,
    },
    #[error("stored {what} is corrupt: {message}")]
    CorruptArtifact { what: &'static str, message: String },
    #[error(transparent)]
    Store(StoreError),
}

impl ReplayError {
    /// Stable numeric error code (4xxx; storage failures keep 5xxx).
    pub fn code(&self) -> u16 {
        match self {
            Self::MissingOrigin(_) => 4001,
            Self::PlanHashMismatch { .. } => 4002,
            Self::InputHashMismatch { .. } => 4003,
            Self::OutputHashMismatch { .. } => 4004,
            Self::CorruptArtifact { .. } => 4005,
            Self::Store(err) => err.code(),
        }
    }
}

impl From<StoreError> for ReplayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunNotFound(run_id) => Self::MissingOrigin(run_id),
            other => Self::Store(other),
        }
    }
}

#[derive(Debug)]
pub struct ReplayOutcome {
    pub origin_run_id: RunId,
    pub replay_run_id: RunId,
    pub counters: StepCounters,
}

pub struct ReplayEngine {
    store: Arc<AuditStore>,
}

impl ReplayEngine {
    pub fn new(store: Arc<AuditStore>) -> Self {
        Self { store }
    }

    /// Reproduce an origin run as a new `mode=replay` run. With `verify`
    /// set, the stored plan hash is recomputed from the stored plan text
    /// first.
    #[instrument(skip(self), fields(origin = %origin_run_id))]
    pub fn replay(
        &self,
        origin_run_id: &RunId,
        verify: bool,
    ) -> Result<ReplayOutcome, ReplayError> {
        let origin = self.store.get_run(origin_run_id)?;

        if verify {
            let recomputed = canon::sha256_hex(origin.plan_json.as_bytes());
            if recomputed != origin.plan_hash {
                return Err(ReplayError::PlanHashMismatch {
                    recorded: origin.plan_hash,
                    recomputed,
                });
            }
        }

        let plan: Plan =
            serde_json::from_str(&origin.plan_json).map_err(|err| ReplayError::CorruptArtifact {
                what: "plan_json",
                message: err.to_string(),
            })?;
        let policy: Policy = serde_json::from_str(&origin.policy_json).map_err(|err| {
            ReplayError::CorruptArtifact {
                what: "policy_json",
                message: err.to_string(),
            }
        })?;

        let origin_calls = self.store.calls_for_run(origin_run_id)?;
        let origin_results: HashMap<_, _> = self
            .store
            .results_for_run(origin_run_id)?
            .into_iter()
            .map(|result| (result.call_id.clone(), result))
            .collect();

        let replay_run = self.store.create_run(&plan, &policy, RunMode::Replay)?;
        let mut counters = StepCounters {
            total_steps: origin_calls.len() as u32,
            ..StepCounters::default()
        };
        self.store
            .update_run_status(&replay_run.run_id, RunStatus::Running, &counters)?;

        let result = self.drive(&origin_calls, &origin_results, &replay_run.run_id, &mut counters);
        match result {
            Ok(()) => {
                self.store
                    .update_run_status(&replay_run.run_id, RunStatus::Completed, &counters)?;
                info!(replay = %replay_run.run_id, steps = counters.total_steps, "replay completed");
                Ok(ReplayOutcome {
                    origin_run_id: origin_run_id.clone(),
                    replay_run_id: replay_run.run_id,
                    counters,
                })
            }
            Err(err) => {
                let _ = self
                    .store
                    .update_run_status(&replay_run.run_id, RunStatus::Failed, &counters);
                Err(err)
            }
        }
    }

    fn drive(
        &self,
        origin_calls: &[capsule_protocol::ToolCall],
        origin_results: &HashMap<capsule_protocol::CallId, capsule_protocol::ToolResult>,
        replay_run_id: &RunId,
        counters: &mut StepCounters,
    ) -> Result<(), ReplayError> {
        for origin_call in origin_calls {
            let origin_result = origin_results.get(&origin_call.call_id).ok_or_else(|| {
                ReplayError::CorruptArtifact {
                    what: "tool_results",
                    message: format!("call {} has no result row", origin_call.call_id),
                }
            })?;

            let replay_call = self.store.record_call(
                replay_run_id,
                origin_call.step_index,
                &origin_call.tool_name,
                &origin_call.args,
            )?;
            let now = Utc::now();
            let replayed = self.store.record_result(
                &replay_call.call_id,
                origin_result.status,
                origin_result.output.clone(),
                origin_result.error.clone(),
                origin_result.decision.clone(),
                now,
                now,
            )?;

            if replayed.input_hash != origin_result.input_hash {
                return Err(ReplayError::InputHashMismatch {
                    step_index: origin_call.step_index,
                    origin: origin_result.input_hash.clone(),
                    replay: replayed.input_hash,
                });
            }
            if replayed.output_hash != origin_result.output_hash {
                return Err(ReplayError::OutputHashMismatch {
                    step_index: origin_call.step_index,
                    origin: origin_result.output_hash.clone(),
                    replay: replayed.output_hash,
                });
            }

            match replayed.status {
                CallStatus::Success => counters.completed_steps += 1,
                CallStatus::Denied => counters.denied_steps += 1,
                CallStatus::Error => counters.failed_steps += 1,
            }
        }
        Ok(())
    }
}
