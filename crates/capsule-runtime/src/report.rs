//! Canonical report assembly. JSON only — console rendering is someone
//! else's job.

use std::collections::HashMap;

use capsule_protocol::{RunId, RunMode};
use capsule_store::{AuditStore, StoreError};
use serde_json::{Value, json};

/// Assemble the full report dict for a run: metadata, per-step rows with
/// decisions and hashes, counters, and (for agent runs) the proposal log.
pub fn build_report(store: &AuditStore, run_id: &RunId) -> Result<Value, StoreError> {
    let run = store.get_run(run_id)?;
    let calls = store.calls_for_run(run_id)?;
    let results: HashMap<_, _> = store
        .results_for_run(run_id)?
        .into_iter()
        .map(|result| (result.call_id.clone(), result))
        .collect();

    let steps: Vec<Value> = calls
        .iter()
        .map(|call| {
            let mut step = json!({
                "step_index": call.step_index,
                "call_id": call.call_id.as_str(),
                "tool": call.tool_name,
                "args": call.args,
                "created_at": call.created_at.to_rfc3339(),
            });
            if let Some(result) = results.get(&call.call_id) {
                step["status"] = json!(result.status.as_str());
                step["decision"] = json!({
                    "allowed": result.decision.allowed,
                    "reason": result.decision.reason,
                    "rule_hit": result.decision.rule_hit,
                });
                step["input_hash"] = json!(result.input_hash);
                step["output_hash"] = json!(result.output_hash);
                step["started_at"] = json!(result.started_at.to_rfc3339());
                step["ended_at"] = json!(result.ended_at.to_rfc3339());
                if let Some(output) = &result.output {
                    step["output"] = output.clone();
                }
                if let Some(error) = &result.error {
                    step["error"] = json!(error);
                }
            }
            step
        })
        .collect();

    let mut report = json!({
        "run": {
            "run_id": run.run_id.as_str(),
            "mode": run.mode.as_str(),
            "status": run.status.as_str(),
            "created_at": run.created_at.to_rfc3339(),
            "completed_at": run.completed_at.map(|at| at.to_rfc3339()),
            "plan_hash": run.plan_hash,
            "policy_hash": run.policy_hash,
        },
        "summary": {
            "total_steps": run.counters.total_steps,
            "completed_steps": run.counters.completed_steps,
            "denied_steps": run.counters.denied_steps,
            "failed_steps": run.counters.failed_steps,
        },
        "steps": steps,
    });

    if run.mode == RunMode::Agent {
        let proposals: Vec<Value> = store
            .proposals_for_run(run_id)?
            .iter()
            .map(|proposal| {
                json!({
                    "iteration": proposal.iteration,
                    "proposal_type": proposal.proposal_type.as_str(),
                    "tool_name": proposal.tool_name,
                    "reasoning": proposal.reasoning,
                    "raw_response": proposal.raw_response,
                })
            })
            .collect();
        report["proposals"] = json!(proposals);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_protocol::{
        CallStatus, Plan, PlanStep, Policy, PolicyDecision, RunMode, canon,
    };
    use chrono::Utc;
    use serde_json::json;

    fn seeded_store() -> (AuditStore, RunId) {
        let store = AuditStore::open_in_memory().unwrap();
        let plan = Plan {
            version: "1".to_string(),
            name: None,
            description: None,
            steps: vec![PlanStep {
                tool: "fs.read".to_string(),
                args: json!({"path": "./a.txt"}),
                name: None,
            }],
        };
        let policy: Policy = serde_yaml::from_str(
            "boundary: deny_by_default\ntools:\n  fs.read:\n    allow_paths: [\"./**\"]\n",
        )
        .unwrap();
        let run = store.create_run(&plan, &policy, RunMode::Run).unwrap();

        let call = store
            .record_call(&run.run_id, 0, "fs.read", &json!({"path": "./a.txt"}))
            .unwrap();
        let now = Utc::now();
        store
            .record_result(
                &call.call_id,
                CallStatus::Success,
                Some(json!({"content": "hi", "size_bytes": 2})),
                None,
                PolicyDecision::allow("all filesystem rules passed", "fs.allow_paths"),
                now,
                now,
            )
            .unwrap();
        (store, run.run_id)
    }

    #[test]
    fn report_contains_run_steps_and_summary() {
        let (store, run_id) = seeded_store();
        let report = build_report(&store, &run_id).unwrap();

        assert_eq!(report["run"]["run_id"], run_id.as_str());
        assert_eq!(report["run"]["mode"], "run");
        assert_eq!(report["summary"]["total_steps"], 1);
        assert_eq!(report["steps"][0]["tool"], "fs.read");
        assert_eq!(report["steps"][0]["status"], "success");
        assert_eq!(report["steps"][0]["decision"]["allowed"], true);
        assert!(report.get("proposals").is_none());
    }

    #[test]
    fn report_serializes_canonically() {
        let (store, run_id) = seeded_store();
        let a = canon::to_canonical_json(&build_report(&store, &run_id).unwrap());
        let b = canon::to_canonical_json(&build_report(&store, &run_id).unwrap());
        assert_eq!(a, b);
    }
}
