//! The agent orchestrator: propose → evaluate → execute → learn.
//!
//! Every planner output is logged raw before anything else happens to it.
//! Denied calls feed their reason back into history and the loop
//! continues; the loop only terminates on Done, repetition, the iteration
//! cap, the global deadline, or an internal error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use capsule_policy::{PolicyEngine, ToolCounters};
use capsule_protocol::{
    CallStatus, Plan, ProposalType, RunId, RunMode, RunStatus, StepCounters, ToolResult, canon,
};
use capsule_store::AuditStore;
use capsule_tools::ToolRegistry;
use regex::Regex;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::RunnerError;
use crate::exec::StepExecutor;
use crate::planner::{HistoryItem, Planner, PlannerState, Proposal, StepFeedback};

const OUTPUT_EXCERPT_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub max_history_items: usize,
    /// Cap on the serialized history handed to the planner; oldest items
    /// are dropped first.
    pub max_history_chars: usize,
    pub repetition_threshold: usize,
    pub iteration_timeout_seconds: Option<u32>,
    /// Compare paths named in the final answer against the set of files
    /// actually accessed, and warn about inventions.
    pub validate_final_paths: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_history_items: 10,
            max_history_chars: 8000,
            repetition_threshold: 3,
            iteration_timeout_seconds: None,
            validate_final_paths: false,
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Completed,
    MaxIterations,
    RepetitionDetected,
    Timeout,
    Error,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::MaxIterations => "max_iterations",
            Self::RepetitionDetected => "repetition_detected",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

#[derive(Debug)]
pub struct AgentOutcome {
    pub run_id: RunId,
    pub status: AgentStatus,
    pub final_output: Option<String>,
    pub iterations: u32,
    pub counters: StepCounters,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

pub struct AgentRunner {
    executor: StepExecutor,
    config: AgentConfig,
}

impl AgentRunner {
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
            config: AgentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    #[instrument(skip(self, planner), fields(task = task))]
    pub async fn run(&self, task: &str, planner: &dyn Planner) -> Result<AgentOutcome, RunnerError> {
        let store = &self.executor.store;
        let engine = &self.executor.engine;

        // Agent runs have no plan; an empty one keeps the run record (and
        // replay) uniform.
        let plan = Plan {
            version: "1".to_string(),
            name: Some(task.to_string()),
            description: None,
            steps: vec![],
        };
        let run = store.create_run(&plan, engine.policy(), RunMode::Agent)?;
        let mut counters = StepCounters::default();
        store.update_run_status(&run.run_id, RunStatus::Running, &counters)?;

        let deadline =
            Instant::now() + Duration::from_secs(u64::from(engine.policy().global_timeout_seconds));

        let mut loop_state = LoopState::default();
        let mut status = AgentStatus::MaxIterations;
        let mut final_output = None;
        let mut error = None;

        let mut iteration = 0;
        while iteration < self.config.max_iterations {
            if Instant::now() >= deadline {
                warn!(run_id = %run.run_id, iteration, "global deadline exceeded");
                status = AgentStatus::Timeout;
                break;
            }

            let state = PlannerState {
                task: task.to_string(),
                tool_schemas: self.executor.registry.schemas(),
                policy_summary: engine.policy().summary(),
                history: self.truncated_history(&loop_state.history),
                iteration,
            };

            let response = match self
                .watchdog(planner.propose_next(&state, loop_state.last_feedback.as_ref()))
                .await
            {
                Some(Ok(response)) => response,
                Some(Err(err)) => {
                    status = AgentStatus::Error;
                    error = Some(format!("planner failed: {err}"));
                    break;
                }
                None => {
                    status = AgentStatus::Timeout;
                    break;
                }
            };

            self.log_proposal(&run.run_id, iteration, &response)?;

            let Some(proposal) = response.proposal else {
                loop_state.note(iteration, "planner output could not be parsed".to_string());
                loop_state.last_feedback = Some(StepFeedback {
                    tool_name: String::new(),
                    status: CallStatus::Error,
                    summary: "previous output could not be parsed; respond with a valid proposal"
                        .to_string(),
                });
                iteration += 1;
                continue;
            };

            match proposal {
                Proposal::Done {
                    final_output: output,
                    ..
                } => {
                    status = AgentStatus::Completed;
                    final_output = output;
                    iteration += 1;
                    break;
                }
                Proposal::ToolCall { tool, args, .. } => {
                    if loop_state.repeats(&tool, &args) >= self.config.repetition_threshold {
                        warn!(run_id = %run.run_id, tool, "repetition detected");
                        status = AgentStatus::RepetitionDetected;
                        break;
                    }

                    let step = self
                        .watchdog(self.executor.run_step(
                            &run.run_id,
                            iteration,
                            &tool,
                            &args,
                            &mut loop_state.tool_counters,
                            Some(deadline),
                        ))
                        .await;
                    let result = match step {
                        Some(result) => result?,
                        None => {
                            status = AgentStatus::Timeout;
                            break;
                        }
                    };

                    match result.status {
                        CallStatus::Success => counters.completed_steps += 1,
                        CallStatus::Denied => counters.denied_steps += 1,
                        CallStatus::Error => counters.failed_steps += 1,
                    }
                    counters.total_steps += 1;
                    loop_state.absorb(iteration, &tool, &args, &result);
                    iteration += 1;
                }
            }
        }

        let mut warnings = Vec::new();
        if self.config.validate_final_paths
            && let Some(answer) = &final_output
        {
            warnings = invented_paths(answer, &loop_state.accessed_paths);
        }

        let run_status = if status == AgentStatus::Completed {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        store.update_run_status(&run.run_id, run_status, &counters)?;
        info!(run_id = %run.run_id, status = status.as_str(), iterations = iteration, "agent loop finished");

        Ok(AgentOutcome {
            run_id: run.run_id,
            status,
            final_output,
            iterations: iteration,
            counters,
            warnings,
            error,
        })
    }

    fn log_proposal(
        &self,
        run_id: &RunId,
        iteration: u32,
        response: &crate::planner::PlannerResponse,
    ) -> Result<(), RunnerError> {
        let (proposal_type, tool_name, args_json, reasoning) = match &response.proposal {
            Some(Proposal::ToolCall {
                tool,
                args,
                reasoning,
            }) => (
                ProposalType::ToolCall,
                Some(tool.clone()),
                Some(canon::to_canonical_json(args)),
                reasoning.clone(),
            ),
            Some(Proposal::Done { reason, .. }) => {
                (ProposalType::Done, None, None, reason.clone())
            }
            None => (ProposalType::ToolCall, None, None, None),
        };
        self.executor.store.record_planner_proposal(
            run_id,
            iteration,
            proposal_type,
            tool_name.as_deref(),
            args_json.as_deref(),
            reasoning.as_deref(),
            &response.raw_response,
        )?;
        Ok(())
    }

    fn truncated_history(&self, history: &[HistoryItem]) -> Vec<HistoryItem> {
        let mut kept: Vec<HistoryItem> = history
            .iter()
            .rev()
            .take(self.config.max_history_items)
            .cloned()
            .collect();
        kept.reverse();

        let mut chars: usize = kept.iter().map(|item| item.summary.len()).sum();
        while chars > self.config.max_history_chars && kept.len() > 1 {
            let dropped = kept.remove(0);
            chars -= dropped.summary.len();
        }
        kept
    }

    async fn watchdog<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        match self.config.iteration_timeout_seconds {
            None => Some(fut.await),
            Some(seconds) => {
                tokio::time::timeout(Duration::from_secs(u64::from(seconds.max(1))), fut)
                    .await
                    .ok()
            }
        }
    }
}

#[derive(Default)]
struct LoopState {
    history: Vec<HistoryItem>,
    tool_counters: ToolCounters,
    recent: Vec<(String, String)>,
    accessed_paths: HashSet<String>,
    last_feedback: Option<StepFeedback>,
}

impl LoopState {
    fn note(&mut self, iteration: u32, summary: String) {
        self.history.push(HistoryItem { iteration, summary });
    }

    /// How many consecutive trailing proposals (including this one) share
    /// the same tool and canonical args.
    fn repeats(&mut self, tool: &str, args: &Value) -> usize {
        let key = (tool.to_string(), canon::to_canonical_json(args));
        self.recent.push(key.clone());
        self.recent
            .iter()
            .rev()
            .take_while(|entry| **entry == key)
            .count()
    }

    fn absorb(&mut self, iteration: u32, tool: &str, args: &Value, result: &ToolResult) {
        let summary = match result.status {
            CallStatus::Denied => format!("{tool} denied: {}", result.decision.reason),
            CallStatus::Error => format!(
                "{tool} input={} error: {}",
                &result.input_hash[..8],
                excerpt(result.error.as_deref().unwrap_or("unknown"))
            ),
            CallStatus::Success => {
                if tool.starts_with("fs.")
                    && let Some(path) = args.get("path").and_then(Value::as_str)
                {
                    self.accessed_paths.insert(normalize_path(path));
                }
                let rendered = result
                    .output
                    .as_ref()
                    .map(|output| canon::to_canonical_json(output))
                    .unwrap_or_default();
                format!(
                    "{tool} input={} success: {}",
                    &result.input_hash[..8],
                    excerpt(&rendered)
                )
            }
        };
        self.last_feedback = Some(StepFeedback {
            tool_name: tool.to_string(),
            status: result.status,
            summary: summary.clone(),
        });
        self.note(iteration, summary);
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= OUTPUT_EXCERPT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(OUTPUT_EXCERPT_CHARS).collect();
    format!("{cut}…")
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}

/// Paths named in the final answer that no fs call ever touched.
fn invented_paths(answer: &str, accessed: &HashSet<String>) -> Vec<String> {
    let Ok(pattern) = Regex::new(r"[A-Za-z0-9_.~-]*(?:/[A-Za-z0-9_.~-]+)+") else {
        return Vec::new();
    };
    let mut warnings = Vec::new();
    let mut seen = HashSet::new();
    for token in pattern.find_iter(answer) {
        let token = normalize_path(token.as_str().trim_start_matches('/'));
        if token.is_empty() || !seen.insert(token.clone()) {
            continue;
        }
        let known = accessed
            .iter()
            .any(|path| path == &token || path.ends_with(&token) || token.ends_with(path.as_str()));
        if !known {
            warnings.push(format!(
                "final answer references {token:?}, which was never accessed"
            ));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{PlannerResponse, ScriptedPlanner};
    use async_trait::async_trait;
    use capsule_protocol::Policy;
    use serde_json::json;
    use std::path::Path;

    const AGENT_POLICY: &str = r#"
boundary: deny_by_default
tools:
  fs.read:
    allow_paths: ["./**"]
  fs.write:
    allow_paths: ["./**"]
"#;

    fn runner(policy_yaml: &str, dir: &Path) -> (Arc<AuditStore>, AgentRunner) {
        let policy: Arc<Policy> = Arc::new(serde_yaml::from_str(policy_yaml).unwrap());
        let store = Arc::new(AuditStore::open_in_memory().unwrap());
        let registry = Arc::new(ToolRegistry::with_builtin_tools());
        let engine = Arc::new(PolicyEngine::with_system_resolver(policy, dir));
        (store.clone(), AgentRunner::new(store, registry, engine))
    }

    fn read_then_done(path: &str) -> ScriptedPlanner {
        ScriptedPlanner::new(vec![
            Proposal::ToolCall {
                tool: "fs.read".to_string(),
                args: json!({ "path": path }),
                reasoning: Some("inspect the file".to_string()),
            },
            Proposal::Done {
                final_output: Some(format!("read {path}")),
                reason: None,
            },
        ])
    }

    #[tokio::test]
    async fn loop_executes_and_completes_on_done() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let (store, runner) = runner(AGENT_POLICY, dir.path());

        let outcome = runner
            .run("read the notes", &read_then_done("./notes.txt"))
            .await
            .unwrap();

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.counters.completed_steps, 1);
        assert_eq!(outcome.final_output.as_deref(), Some("read ./notes.txt"));

        let run = store.get_run(&outcome.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.mode, RunMode::Agent);

        let proposals = store.proposals_for_run(&outcome.run_id).unwrap();
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].proposal_type, ProposalType::ToolCall);
        assert_eq!(proposals[1].proposal_type, ProposalType::Done);
    }

    #[tokio::test]
    async fn denied_call_feeds_back_and_loop_continues() {
        let dir = tempfile::tempdir().unwrap();
        let (store, runner) = runner(AGENT_POLICY, dir.path());

        let outcome = runner
            .run("read the secrets", &read_then_done("./.env"))
            .await
            .unwrap();

        // The deny did not stop the loop; the scripted Done completed it.
        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.counters.denied_steps, 1);

        let results = store.results_for_run(&outcome.run_id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CallStatus::Denied);
    }

    #[tokio::test]
    async fn repetition_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let (_, runner) = runner(AGENT_POLICY, dir.path());

        let same = Proposal::ToolCall {
            tool: "fs.read".to_string(),
            args: json!({"path": "./a.txt"}),
            reasoning: None,
        };
        let planner = ScriptedPlanner::new(vec![same.clone(); 8]);

        let outcome = runner.run("spin", &planner).await.unwrap();
        assert_eq!(outcome.status, AgentStatus::RepetitionDetected);
        // Two executions happened before the third identical proposal
        // tripped the detector.
        assert_eq!(outcome.counters.completed_steps, 2);
    }

    #[tokio::test]
    async fn iteration_cap_terminates_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let (_, runner) = runner(AGENT_POLICY, dir.path());
        let runner = runner.with_config(AgentConfig {
            max_iterations: 4,
            ..AgentConfig::default()
        });

        // Alternating proposals never trip the repetition detector.
        let planner = ScriptedPlanner::new(
            (0..8)
                .map(|i| Proposal::ToolCall {
                    tool: "fs.read".to_string(),
                    args: json!({"path": if i % 2 == 0 { "./a.txt" } else { "./b.txt" }}),
                    reasoning: None,
                })
                .collect(),
        );

        let outcome = runner.run("wander", &planner).await.unwrap();
        assert_eq!(outcome.status, AgentStatus::MaxIterations);
        assert_eq!(outcome.iterations, 4);
    }

    struct GarbagePlanner {
        fallback: ScriptedPlanner,
        sent_garbage: parking_lot::Mutex<bool>,
    }

    #[async_trait]
    impl Planner for GarbagePlanner {
        async fn propose_next(
            &self,
            state: &PlannerState,
            last: Option<&StepFeedback>,
        ) -> anyhow::Result<PlannerResponse> {
            let already_sent = {
                let mut sent = self.sent_garbage.lock();
                let was_sent = *sent;
                *sent = true;
                was_sent
            };
            if !already_sent {
                return Ok(PlannerResponse {
                    raw_response: "I think I should {{{".to_string(),
                    proposal: None,
                });
            }
            self.fallback.propose_next(state, last).await
        }
    }

    #[tokio::test]
    async fn unparseable_output_is_logged_and_loop_continues() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let (store, runner) = runner(AGENT_POLICY, dir.path());

        let planner = GarbagePlanner {
            fallback: read_then_done("./notes.txt"),
            sent_garbage: parking_lot::Mutex::new(false),
        };

        let outcome = runner.run("recover", &planner).await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Completed);

        let proposals = store.proposals_for_run(&outcome.run_id).unwrap();
        assert_eq!(proposals.len(), 3);
        assert_eq!(proposals[0].raw_response, "I think I should {{{");
        assert!(proposals[0].tool_name.is_none());
    }

    #[tokio::test]
    async fn invented_paths_in_final_answer_are_warned_about() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real.txt"), "data").unwrap();
        let (_, runner) = runner(AGENT_POLICY, dir.path());
        let runner = runner.with_config(AgentConfig {
            validate_final_paths: true,
            ..AgentConfig::default()
        });

        let planner = ScriptedPlanner::new(vec![
            Proposal::ToolCall {
                tool: "fs.read".to_string(),
                args: json!({"path": "./real.txt"}),
                reasoning: None,
            },
            Proposal::Done {
                final_output: Some(
                    "I checked ./real.txt and also src/imaginary.rs for you".to_string(),
                ),
                reason: None,
            },
        ]);

        let outcome = runner.run("audit", &planner).await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("imaginary.rs"));
    }

    #[test]
    fn history_truncation_drops_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let (_, runner) = runner(AGENT_POLICY, dir.path());
        let runner = runner.with_config(AgentConfig {
            max_history_items: 3,
            max_history_chars: 40,
            ..AgentConfig::default()
        });

        let history: Vec<HistoryItem> = (0..6)
            .map(|i| HistoryItem {
                iteration: i,
                summary: format!("entry number {i} with padding"),
            })
            .collect();
        let kept = runner.truncated_history(&history);
        assert!(kept.len() < 3 || kept.iter().map(|h| h.summary.len()).sum::<usize>() <= 40);
        // Whatever survives is the newest tail.
        assert_eq!(kept.last().unwrap().iteration, 5);
    }
}
