//! The shared per-step pipeline: stage the call, check the deadline,
//! evaluate policy, execute on allow, record atomically.

use std::sync::Arc;
use std::time::Instant;

use capsule_policy::{PolicyEngine, ToolCounters, Verdict};
use capsule_protocol::{CallStatus, PolicyDecision, RunId, ToolOutcome, ToolResult};
use capsule_store::{AuditStore, StoreError};
use capsule_tools::{ToolContext, ToolRegistry};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

pub(crate) struct StepExecutor {
    pub store: Arc<AuditStore>,
    pub registry: Arc<ToolRegistry>,
    pub engine: Arc<PolicyEngine>,
}

impl StepExecutor {
    /// Run one step to a recorded result. Counters are bumped only for
    /// calls that actually execute; denied calls never count against the
    /// quota.
    pub async fn run_step(
        &self,
        run_id: &RunId,
        step_index: u32,
        tool_name: &str,
        args: &Value,
        counters: &mut ToolCounters,
        deadline: Option<Instant>,
    ) -> Result<ToolResult, StoreError> {
        let call = self.store.record_call(run_id, step_index, tool_name, args)?;

        // The deadline is observed between steps; an in-flight tool is
        // never interrupted, the next proposed call is denied instead.
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            let now = Utc::now();
            warn!(run_id = %run_id, step_index, "global deadline exceeded");
            return self.store.record_result(
                &call.call_id,
                CallStatus::Denied,
                None,
                None,
                PolicyDecision::deny("global deadline exceeded", "global.timeout"),
                now,
                now,
            );
        }

        let verdict = match self.engine.evaluate(tool_name, args, counters).await {
            Ok(verdict) => verdict,
            Err(err) => Verdict::plain(PolicyDecision::deny(
                format!("policy evaluation failed: {err}"),
                "policy.eval_error",
            )),
        };

        if !verdict.decision.allowed {
            debug!(run_id = %run_id, step_index, tool = tool_name, reason = %verdict.decision.reason, "call denied");
            let now = Utc::now();
            return self.store.record_result(
                &call.call_id,
                CallStatus::Denied,
                None,
                None,
                verdict.decision,
                now,
                now,
            );
        }

        let Some(tool) = self.registry.get(tool_name) else {
            let now = Utc::now();
            return self.store.record_result(
                &call.call_id,
                CallStatus::Error,
                None,
                Some(format!("tool {tool_name} is not registered")),
                verdict.decision,
                now,
                now,
            );
        };

        *counters.entry(tool_name.to_string()).or_insert(0) += 1;

        let ctx = ToolContext {
            run_id: run_id.clone(),
            working_dir: self.engine.working_dir().to_path_buf(),
            policy: self.engine.policy().clone(),
            engine: self.engine.clone(),
            pinned: verdict.pinned.clone(),
        };

        let started_at = Utc::now();
        let outcome = tool.execute(args, &ctx).await;
        let ended_at = Utc::now();

        let (status, output, error) = match outcome {
            Ok(ToolOutcome::Success { output }) => (CallStatus::Success, Some(output), None),
            Ok(ToolOutcome::Failure { error }) => (CallStatus::Error, None, Some(error)),
            Err(err) => (CallStatus::Error, None, Some(err.to_string())),
        };
        debug!(run_id = %run_id, step_index, tool = tool_name, status = status.as_str(), "step finished");

        self.store.record_result(
            &call.call_id,
            status,
            output,
            error,
            verdict.decision,
            started_at,
            ended_at,
        )
    }
}
