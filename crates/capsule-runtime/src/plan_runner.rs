//! Linear plan execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use capsule_policy::{PolicyEngine, ToolCounters};
use capsule_protocol::{CallStatus, Plan, RunId, RunMode, RunStatus, StepCounters, ToolResult};
use capsule_store::AuditStore;
use capsule_tools::ToolRegistry;
use tracing::{info, instrument};

use crate::RunnerError;
use crate::exec::StepExecutor;

#[derive(Debug, Clone)]
pub struct PlanRunnerConfig {
    /// Halt after the first non-success step. Denied steps halt the plan
    /// but do not fail the run.
    pub fail_fast: bool,
}

impl Default for PlanRunnerConfig {
    fn default() -> Self {
        Self { fail_fast: true }
    }
}

#[derive(Debug)]
pub struct PlanOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub counters: StepCounters,
    pub results: Vec<ToolResult>,
}

pub struct PlanRunner {
    executor: StepExecutor,
    config: PlanRunnerConfig,
}

impl PlanRunner {
    pub fn new(
        store: Arc<AuditStore>,
        registry: Arc<ToolRegistry>,
        engine: Arc<PolicyEngine>,
    ) -> Self {
        Self {
            executor: StepExecutor {
                store,
                registry,
                engine,
            },
            config: PlanRunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PlanRunnerConfig) -> Self {
        self.config = config;
        self
    }

    #[instrument(skip(self, plan), fields(steps = plan.steps.len()))]
    pub async fn run(&self, plan: &Plan) -> Result<PlanOutcome, RunnerError> {
        plan.validate()?;

        let store = &self.executor.store;
        let run = store.create_run(plan, self.executor.engine.policy(), RunMode::Run)?;
        let mut counters = StepCounters {
            total_steps: plan.steps.len() as u32,
            ..StepCounters::default()
        };
        store.update_run_status(&run.run_id, RunStatus::Running, &counters)?;

        let deadline = Instant::now()
            + Duration::from_secs(u64::from(self.executor.engine.policy().global_timeout_seconds));

        let outcome = self
            .drive(&run.run_id, plan, &mut counters, deadline)
            .await;

        match outcome {
            Ok(results) => {
                store.update_run_status(&run.run_id, RunStatus::Completed, &counters)?;
                info!(run_id = %run.run_id, completed = counters.completed_steps,
                      denied = counters.denied_steps, failed = counters.failed_steps, "run completed");
                Ok(PlanOutcome {
                    run_id: run.run_id,
                    status: RunStatus::Completed,
                    counters,
                    results,
                })
            }
            Err(err) => {
                let _ = store.update_run_status(&run.run_id, RunStatus::Failed, &counters);
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        run_id: &RunId,
        plan: &Plan,
        counters: &mut StepCounters,
        deadline: Instant,
    ) -> Result<Vec<ToolResult>, RunnerError> {
        let mut tool_counters = ToolCounters::new();
        let mut results = Vec::new();

        for (index, step) in plan.steps.iter().enumerate() {
            let result = self
                .executor
                .run_step(
                    run_id,
                    index as u32,
                    &step.tool,
                    &step.args,
                    &mut tool_counters,
                    Some(deadline),
                )
                .await?;

            match result.status {
                CallStatus::Success => counters.completed_steps += 1,
                CallStatus::Denied => counters.denied_steps += 1,
                CallStatus::Error => counters.failed_steps += 1,
            }

            let deadline_hit = result.decision.rule_hit.as_deref() == Some("global.timeout");
            let halt = self.config.fail_fast && result.status != CallStatus::Success;
            results.push(result);
            if halt || deadline_hit {
                break;
            }
        }

        Ok(results)
    }
}
