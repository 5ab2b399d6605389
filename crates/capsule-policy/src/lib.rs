//! Deny-by-default policy engine.
//!
//! Given a proposed `(tool_name, args)` the engine returns a [`Verdict`]:
//! the decision recorded in the audit log plus, for network calls, the
//! resolved address set the tool must pin its connection to. Evaluation is
//! fail-closed — every internal failure surfaces as a denial or as a
//! [`PolicyEvalError`] the orchestrator converts into one, never as an
//! allow.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use capsule_protocol::{Policy, PolicyDecision, ToolPolicy};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

pub mod net;
pub mod paths;
pub mod shell;

pub use net::{PinnedHost, Resolver, SystemResolver};

/// Executed-call counters for the current run, keyed by tool name. Only
/// calls that actually ran (success or error) are counted.
pub type ToolCounters = HashMap<String, u32>;

/// Failures inside evaluation itself, as opposed to rule denials. The
/// orchestrator records these as denied results with reason
/// `"policy evaluation failed: …"`.
#[derive(Debug, Error)]
pub enum PolicyEvalError {
    #[error("invalid glob pattern {pattern:?}: {message}")]
    BadPattern { pattern: String, message: String },
    #[error("policy evaluation failed: {0}")]
    Internal(String),
}

/// Decision plus the execution-side material that goes with it.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub decision: PolicyDecision,
    /// Resolved addresses for `http.get` when private-IP filtering ran.
    /// The tool must connect to exactly these addresses, not re-resolve.
    pub pinned: Option<PinnedHost>,
}

impl Verdict {
    pub fn plain(decision: PolicyDecision) -> Self {
        Self {
            decision,
            pinned: None,
        }
    }

    pub fn pinned(decision: PolicyDecision, pinned: PinnedHost) -> Self {
        Self {
            decision,
            pinned: Some(pinned),
        }
    }
}

/// The policy engine. Read-only at run time; no locking required.
pub struct PolicyEngine {
    policy: Arc<Policy>,
    working_dir: PathBuf,
    resolver: Arc<dyn Resolver>,
}

impl PolicyEngine {
    pub fn new(policy: Arc<Policy>, working_dir: impl Into<PathBuf>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            policy,
            working_dir: working_dir.into(),
            resolver,
        }
    }

    pub fn with_system_resolver(policy: Arc<Policy>, working_dir: impl Into<PathBuf>) -> Self {
        Self::new(policy, working_dir, Arc::new(SystemResolver))
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Evaluate one proposed call. Quota is checked before any rule; a
    /// tool absent from the policy denies under the boundary rule.
    pub async fn evaluate(
        &self,
        tool_name: &str,
        args: &Value,
        counters: &ToolCounters,
    ) -> Result<Verdict, PolicyEvalError> {
        let Some(tool_policy) = self.policy.for_tool(tool_name) else {
            debug!(tool = tool_name, "tool not listed in policy");
            return Ok(Verdict::plain(PolicyDecision::deny(
                format!("tool {tool_name} is not listed in policy"),
                "boundary.deny_by_default",
            )));
        };

        let executed = counters.get(tool_name).copied().unwrap_or(0);
        if executed >= self.policy.max_calls_per_tool {
            return Ok(Verdict::plain(PolicyDecision::deny(
                format!(
                    "quota exceeded: {tool_name} already executed {executed} of {} allowed calls",
                    self.policy.max_calls_per_tool
                ),
                "global.max_calls_per_tool",
            )));
        }

        match (tool_name, tool_policy) {
            ("fs.read", ToolPolicy::Fs(rules)) => Ok(Verdict::plain(paths::evaluate(
                rules,
                &self.working_dir,
                args,
                paths::Access::Read,
            )?)),
            ("fs.write", ToolPolicy::Fs(rules)) => Ok(Verdict::plain(paths::evaluate(
                rules,
                &self.working_dir,
                args,
                paths::Access::Write,
            )?)),
            ("http.get", ToolPolicy::Http(rules)) => {
                net::evaluate(rules, args, self.resolver.as_ref()).await
            }
            ("shell.run", ToolPolicy::Shell(rules)) => {
                Ok(Verdict::plain(shell::evaluate(rules, args)))
            }
            (other, _) => Ok(Verdict::plain(PolicyDecision::deny(
                format!("policy variant does not match tool {other}"),
                "boundary.deny_by_default",
            ))),
        }
    }

    /// Re-check a redirect target against the network rules. Redirects are
    /// not new calls, so quota is not charged.
    pub async fn evaluate_redirect(&self, url: &str) -> Result<Verdict, PolicyEvalError> {
        match self.policy.for_tool("http.get") {
            Some(ToolPolicy::Http(rules)) => {
                net::evaluate(rules, &json!({ "url": url }), self.resolver.as_ref()).await
            }
            _ => Ok(Verdict::plain(PolicyDecision::deny(
                "http.get is not listed in policy",
                "boundary.deny_by_default",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_protocol::policy::{FsPolicy, ShellPolicy, ToolPolicies};
    use capsule_protocol::{Boundary, Policy};

    fn policy_with(tools: Vec<(&str, ToolPolicy)>) -> Arc<Policy> {
        let mut map = ToolPolicies::default();
        for (name, tool_policy) in tools {
            map.0.insert(name.to_string(), tool_policy);
        }
        Arc::new(Policy {
            boundary: Boundary::DenyByDefault,
            global_timeout_seconds: 60,
            max_calls_per_tool: 2,
            tools: map,
        })
    }

    fn engine(policy: Arc<Policy>, dir: &Path) -> PolicyEngine {
        PolicyEngine::with_system_resolver(policy, dir)
    }

    #[tokio::test]
    async fn unlisted_tool_is_denied_for_any_args() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(policy_with(vec![]), dir.path());
        for args in [json!({}), json!({"path": "./x"}), json!({"cmd": ["ls"]})] {
            let verdict = engine
                .evaluate("fs.read", &args, &ToolCounters::new())
                .await
                .unwrap();
            assert!(!verdict.decision.allowed);
            assert_eq!(
                verdict.decision.rule_hit.as_deref(),
                Some("boundary.deny_by_default")
            );
        }
    }

    #[tokio::test]
    async fn quota_denies_before_rules() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            policy_with(vec![(
                "shell.run",
                ToolPolicy::Shell(ShellPolicy {
                    allow_executables: vec!["echo".to_string()],
                    deny_tokens: vec![],
                    timeout_seconds: 5,
                    max_output_bytes: 1024,
                }),
            )]),
            dir.path(),
        );
        let mut counters = ToolCounters::new();
        counters.insert("shell.run".to_string(), 2);
        let verdict = engine
            .evaluate("shell.run", &json!({"cmd": ["echo", "hi"]}), &counters)
            .await
            .unwrap();
        assert!(!verdict.decision.allowed);
        assert!(verdict.decision.reason.contains("quota exceeded"));
        assert_eq!(
            verdict.decision.rule_hit.as_deref(),
            Some("global.max_calls_per_tool")
        );
    }

    #[tokio::test]
    async fn mismatched_variant_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        // A policy map wired up wrong (fs rules under shell.run) must deny.
        let engine = engine(
            policy_with(vec![(
                "shell.run",
                ToolPolicy::Fs(FsPolicy {
                    allow_paths: vec!["./**".to_string()],
                    deny_paths: vec![],
                    max_size_bytes: 1024,
                    allow_hidden: false,
                }),
            )]),
            dir.path(),
        );
        let verdict = engine
            .evaluate("shell.run", &json!({"cmd": ["echo"]}), &ToolCounters::new())
            .await
            .unwrap();
        assert!(!verdict.decision.allowed);
    }

    #[tokio::test]
    async fn redirect_evaluation_requires_http_policy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(policy_with(vec![]), dir.path());
        let verdict = engine
            .evaluate_redirect("https://example.com/next")
            .await
            .unwrap();
        assert!(!verdict.decision.allowed);
    }
}
