//! Append-only audit store over SQLite.
//!
//! One writer per database file, any number of snapshot readers. A call
//! and its result reach the database in a single transaction: `record_call`
//! stages the call in memory and `record_result` persists both rows
//! atomically, so a reader never observes a call without a result and
//! every call has exactly one.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;

use capsule_protocol::{
    CallId, CallStatus, Plan, PlannerProposal, Policy, PolicyDecision, ProposalId, ProposalType,
    RunId, RunMode, RunRecord, RunStatus, StepCounters, ToolCall, ToolResult, canon,
};

const SCHEMA_VERSION: i64 = 1;
const RUN_ID_ATTEMPTS: usize = 16;

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        plan_hash TEXT NOT NULL,
        policy_hash TEXT NOT NULL,
        plan_json TEXT NOT NULL,
        policy_json TEXT NOT NULL,
        mode TEXT NOT NULL,
        status TEXT NOT NULL,
        total_steps INTEGER NOT NULL DEFAULT 0,
        completed_steps INTEGER NOT NULL DEFAULT 0,
        denied_steps INTEGER NOT NULL DEFAULT 0,
        failed_steps INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS tool_calls (
        call_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        step_index INTEGER NOT NULL,
        tool_name TEXT NOT NULL,
        args_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tool_results (
        call_id TEXT PRIMARY KEY REFERENCES tool_calls(call_id),
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        status TEXT NOT NULL,
        output_json TEXT,
        error TEXT,
        decision_json TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT NOT NULL,
        input_hash TEXT NOT NULL,
        output_hash TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS planner_proposals (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        iteration INTEGER NOT NULL,
        proposal_type TEXT NOT NULL,
        tool_name TEXT,
        args_json TEXT,
        reasoning TEXT,
        raw_response TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tool_calls_run ON tool_calls(run_id, step_index);
    CREATE INDEX IF NOT EXISTS idx_tool_results_run ON tool_results(run_id);
    CREATE INDEX IF NOT EXISTS idx_proposals_run ON planner_proposals(run_id, iteration);
";

/// Storage failures. Fatal — these propagate to the CLI boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    #[error("call {0} was never staged")]
    CallNotStaged(CallId),
    #[error("run {run_id}: illegal status transition {from:?} -> {to:?}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("database schema version {found} is newer than supported {supported}")]
    SchemaMismatch { found: i64, supported: i64 },
    #[error("could not generate a unique run id after {RUN_ID_ATTEMPTS} attempts")]
    IdExhausted,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Stable numeric error code (5xxx range).
    pub fn code(&self) -> u16 {
        match self {
            Self::Sqlite(_) => 5001,
            Self::Serialize(_) => 5002,
            Self::SchemaMismatch { .. } => 5003,
            Self::RunNotFound(_) => 5004,
            Self::CallNotStaged(_) => 5005,
            Self::InvalidTransition { .. } => 5006,
            Self::IdExhausted => 5007,
            Self::Corrupt(_) => 5008,
        }
    }
}

/// Outcome of recomputing every stored hash for a run.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub ok: bool,
    pub mismatches: Vec<String>,
}

/// The audit store handle. Single writer, snapshot readers.
pub struct AuditStore {
    conn: Mutex<Connection>,
    staged: Mutex<HashMap<CallId, ToolCall>>,
}

impl AuditStore {
    /// Open or create the audit database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .map_err(|err| StoreError::Corrupt(format!("cannot create {parent:?}: {err}")))?;
        }
        Self::initialize(Connection::open(path)?)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        let found: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| {
                row.get(0)
            })
            .optional()?;
        match found {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(value) => {
                let found: i64 = value
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("schema_version {value:?}")))?;
                if found > SCHEMA_VERSION {
                    return Err(StoreError::SchemaMismatch {
                        found,
                        supported: SCHEMA_VERSION,
                    });
                }
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            staged: Mutex::new(HashMap::new()),
        })
    }

    /// Create a run in state `pending`. The plan and policy are stored as
    /// canonical JSON text, verbatim, so the run can be replayed with no
    /// other inputs.
    pub fn create_run(
        &self,
        plan: &Plan,
        policy: &Policy,
        mode: RunMode,
    ) -> Result<RunRecord, StoreError> {
        let plan_json = canon::to_canonical_json(&serde_json::to_value(plan)?);
        let policy_json = canon::to_canonical_json(&serde_json::to_value(policy)?);
        let plan_hash = canon::sha256_hex(plan_json.as_bytes());
        let policy_hash = canon::sha256_hex(policy_json.as_bytes());
        let created_at = Utc::now();

        let conn = self.conn.lock();
        let run_id = Self::unique_run_id(&conn)?;
        conn.execute(
            "INSERT INTO runs (run_id, created_at, plan_hash, policy_hash, plan_json, policy_json, mode, status, total_steps)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_id.as_str(),
                created_at.to_rfc3339(),
                plan_hash,
                policy_hash,
                plan_json,
                policy_json,
                mode.as_str(),
                RunStatus::Pending.as_str(),
                plan.steps.len() as i64,
            ],
        )?;
        debug!(run_id = %run_id, mode = mode.as_str(), "run created");

        Ok(RunRecord {
            run_id,
            created_at,
            completed_at: None,
            plan_hash,
            policy_hash,
            plan_json,
            policy_json,
            mode,
            status: RunStatus::Pending,
            counters: StepCounters {
                total_steps: plan.steps.len() as u32,
                ..StepCounters::default()
            },
        })
    }

    fn unique_run_id(conn: &Connection) -> Result<RunId, StoreError> {
        for _ in 0..RUN_ID_ATTEMPTS {
            let candidate = RunId::generate();
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM runs WHERE run_id = ?1",
                    params![candidate.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(candidate);
            }
        }
        Err(StoreError::IdExhausted)
    }

    /// Stage a call. The row reaches SQLite together with its result in
    /// `record_result`; ids and timestamps are generated here so tools
    /// never mint their own.
    pub fn record_call(
        &self,
        run_id: &RunId,
        step_index: u32,
        tool_name: &str,
        args: &serde_json::Value,
    ) -> Result<ToolCall, StoreError> {
        let call = ToolCall {
            call_id: CallId::generate(),
            run_id: run_id.clone(),
            step_index,
            tool_name: tool_name.to_string(),
            args: args.clone(),
            created_at: Utc::now(),
        };
        self.staged.lock().insert(call.call_id.clone(), call.clone());
        Ok(call)
    }

    /// Persist the staged call and its result in one transaction. Hashes
    /// are computed here: input over the staged args, output over the
    /// recorded output (JSON `null` when absent).
    #[allow(clippy::too_many_arguments)]
    pub fn record_result(
        &self,
        call_id: &CallId,
        status: CallStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
        decision: PolicyDecision,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<ToolResult, StoreError> {
        let call = self
            .staged
            .lock()
            .remove(call_id)
            .ok_or_else(|| StoreError::CallNotStaged(call_id.clone()))?;

        let input_hash = canon::hash_value(&call.args);
        let output_hash = canon::hash_value(output.as_ref().unwrap_or(&serde_json::Value::Null));
        let output_json = output
            .as_ref()
            .map(|value| canon::to_canonical_json(value));
        let decision_json = serde_json::to_string(&decision)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tool_calls (call_id, run_id, step_index, tool_name, args_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                call.call_id.as_str(),
                call.run_id.as_str(),
                call.step_index,
                call.tool_name,
                canon::to_canonical_json(&call.args),
                call.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO tool_results (call_id, run_id, status, output_json, error, decision_json, started_at, ended_at, input_hash, output_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                call.call_id.as_str(),
                call.run_id.as_str(),
                status.as_str(),
                output_json,
                error,
                decision_json,
                started_at.to_rfc3339(),
                ended_at.to_rfc3339(),
                input_hash,
                output_hash,
            ],
        )?;
        tx.commit()?;
        debug!(call_id = %call.call_id, status = status.as_str(), "call and result recorded");

        Ok(ToolResult {
            call_id: call.call_id,
            run_id: call.run_id,
            status,
            output,
            error,
            decision,
            started_at,
            ended_at,
            input_hash,
            output_hash,
        })
    }

    /// Advance a run's status (monotonic) and refresh its counters.
    /// Re-asserting the current status is allowed so counters can be
    /// updated mid-run.
    pub fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        counters: &StepCounters,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| StoreError::RunNotFound(run_id.clone()))?;
        let current = RunStatus::parse(&current)
            .ok_or_else(|| StoreError::Corrupt(format!("run status {current:?}")))?;

        if current != status && !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                run_id: run_id.clone(),
                from: current,
                to: status,
            });
        }

        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        tx.execute(
            "UPDATE runs SET status = ?1, completed_at = COALESCE(?2, completed_at),
                 total_steps = ?3, completed_steps = ?4, denied_steps = ?5, failed_steps = ?6
             WHERE run_id = ?7",
            params![
                status.as_str(),
                completed_at,
                counters.total_steps,
                counters.completed_steps,
                counters.denied_steps,
                counters.failed_steps,
                run_id.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Log one planner output, raw bytes included.
    #[allow(clippy::too_many_arguments)]
    pub fn record_planner_proposal(
        &self,
        run_id: &RunId,
        iteration: u32,
        proposal_type: ProposalType,
        tool_name: Option<&str>,
        args_json: Option<&str>,
        reasoning: Option<&str>,
        raw_response: &str,
    ) -> Result<PlannerProposal, StoreError> {
        let proposal = PlannerProposal {
            id: ProposalId::generate(),
            run_id: run_id.clone(),
            iteration,
            proposal_type,
            tool_name: tool_name.map(str::to_string),
            args_json: args_json.map(str::to_string),
            reasoning: reasoning.map(str::to_string),
            raw_response: raw_response.to_string(),
            created_at: Utc::now(),
        };
        self.conn.lock().execute(
            "INSERT INTO planner_proposals (id, run_id, iteration, proposal_type, tool_name, args_json, reasoning, raw_response, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                proposal.id.as_str(),
                proposal.run_id.as_str(),
                proposal.iteration,
                proposal.proposal_type.as_str(),
                proposal.tool_name,
                proposal.args_json,
                proposal.reasoning,
                proposal.raw_response,
                proposal.created_at.to_rfc3339(),
            ],
        )?;
        Ok(proposal)
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<RunRecord, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT run_id, created_at, completed_at, plan_hash, policy_hash, plan_json, policy_json,
                    mode, status, total_steps, completed_steps, denied_steps, failed_steps
             FROM runs WHERE run_id = ?1",
            params![run_id.as_str()],
            run_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::RunNotFound(run_id.clone()))?
        .try_into()
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, created_at, completed_at, plan_hash, policy_hash, plan_json, policy_json,
                    mode, status, total_steps, completed_steps, denied_steps, failed_steps
             FROM runs ORDER BY created_at DESC, run_id",
        )?;
        let rows = stmt.query_map([], run_from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.try_into()?);
        }
        Ok(runs)
    }

    pub fn calls_for_run(&self, run_id: &RunId) -> Result<Vec<ToolCall>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT call_id, run_id, step_index, tool_name, args_json, created_at
             FROM tool_calls WHERE run_id = ?1 ORDER BY step_index",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut calls = Vec::new();
        for row in rows {
            let (call_id, run_id, step_index, tool_name, args_json, created_at) = row?;
            calls.push(ToolCall {
                call_id: CallId::from_string(call_id),
                run_id: RunId::from_string(run_id),
                step_index,
                tool_name,
                args: serde_json::from_str(&args_json)?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(calls)
    }

    pub fn results_for_run(&self, run_id: &RunId) -> Result<Vec<ToolResult>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT r.call_id, r.run_id, r.status, r.output_json, r.error, r.decision_json,
                    r.started_at, r.ended_at, r.input_hash, r.output_hash
             FROM tool_results r
             JOIN tool_calls c ON c.call_id = r.call_id
             WHERE r.run_id = ?1 ORDER BY c.step_index",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (call_id, run_id, status, output_json, error, decision_json, started, ended, input_hash, output_hash) = row?;
            let status = CallStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("result status {status:?}")))?;
            results.push(ToolResult {
                call_id: CallId::from_string(call_id),
                run_id: RunId::from_string(run_id),
                status,
                output: output_json.map(|json| serde_json::from_str(&json)).transpose()?,
                error,
                decision: serde_json::from_str(&decision_json)?,
                started_at: parse_timestamp(&started)?,
                ended_at: parse_timestamp(&ended)?,
                input_hash,
                output_hash,
            });
        }
        Ok(results)
    }

    pub fn proposals_for_run(&self, run_id: &RunId) -> Result<Vec<PlannerProposal>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, iteration, proposal_type, tool_name, args_json, reasoning, raw_response, created_at
             FROM planner_proposals WHERE run_id = ?1 ORDER BY iteration",
        )?;
        let rows = stmt.query_map(params![run_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        let mut proposals = Vec::new();
        for row in rows {
            let (id, run_id, iteration, proposal_type, tool_name, args_json, reasoning, raw_response, created_at) = row?;
            let proposal_type = ProposalType::parse(&proposal_type)
                .ok_or_else(|| StoreError::Corrupt(format!("proposal type {proposal_type:?}")))?;
            proposals.push(PlannerProposal {
                id: ProposalId::from_string(id),
                run_id: RunId::from_string(run_id),
                iteration,
                proposal_type,
                tool_name,
                args_json,
                reasoning,
                raw_response,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(proposals)
    }

    /// Recompute every hash for a run and compare against the stored
    /// values. A clean report is the tamper-evidence guarantee.
    pub fn verify_run(&self, run_id: &RunId) -> Result<VerifyReport, StoreError> {
        let run = self.get_run(run_id)?;
        let mut mismatches = Vec::new();

        if canon::sha256_hex(run.plan_json.as_bytes()) != run.plan_hash {
            mismatches.push(format!("run {run_id}: plan_hash does not match plan_json"));
        }
        if canon::sha256_hex(run.policy_json.as_bytes()) != run.policy_hash {
            mismatches.push(format!("run {run_id}: policy_hash does not match policy_json"));
        }

        let calls: HashMap<CallId, ToolCall> = self
            .calls_for_run(run_id)?
            .into_iter()
            .map(|call| (call.call_id.clone(), call))
            .collect();
        for result in self.results_for_run(run_id)? {
            match calls.get(&result.call_id) {
                None => mismatches.push(format!("result {} has no call row", result.call_id)),
                Some(call) => {
                    if canon::hash_value(&call.args) != result.input_hash {
                        mismatches.push(format!("call {}: input_hash mismatch", call.call_id));
                    }
                }
            }
            let recomputed = canon::hash_value(
                result.output.as_ref().unwrap_or(&serde_json::Value::Null),
            );
            if recomputed != result.output_hash {
                mismatches.push(format!("call {}: output_hash mismatch", result.call_id));
            }
        }

        Ok(VerifyReport {
            ok: mismatches.is_empty(),
            mismatches,
        })
    }
}

struct RawRun {
    run_id: String,
    created_at: String,
    completed_at: Option<String>,
    plan_hash: String,
    policy_hash: String,
    plan_json: String,
    policy_json: String,
    mode: String,
    status: String,
    counters: StepCounters,
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run_id: row.get(0)?,
        created_at: row.get(1)?,
        completed_at: row.get(2)?,
        plan_hash: row.get(3)?,
        policy_hash: row.get(4)?,
        plan_json: row.get(5)?,
        policy_json: row.get(6)?,
        mode: row.get(7)?,
        status: row.get(8)?,
        counters: StepCounters {
            total_steps: row.get(9)?,
            completed_steps: row.get(10)?,
            denied_steps: row.get(11)?,
            failed_steps: row.get(12)?,
        },
    })
}

impl TryFrom<RawRun> for RunRecord {
    type Error = StoreError;

    fn try_from(raw: RawRun) -> Result<Self, StoreError> {
        Ok(RunRecord {
            run_id: RunId::from_string(raw.run_id),
            created_at: parse_timestamp(&raw.created_at)?,
            completed_at: raw
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            plan_hash: raw.plan_hash,
            policy_hash: raw.policy_hash,
            plan_json: raw.plan_json,
            policy_json: raw.policy_json,
            mode: RunMode::parse(&raw.mode)
                .ok_or_else(|| StoreError::Corrupt(format!("run mode {:?}", raw.mode)))?,
            status: RunStatus::parse(&raw.status)
                .ok_or_else(|| StoreError::Corrupt(format!("run status {:?}", raw.status)))?,
            counters: raw.counters,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp {value:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_protocol::{Plan, PlanStep};
    use serde_json::json;

    fn sample_plan() -> Plan {
        Plan {
            version: "1".to_string(),
            name: None,
            description: None,
            steps: vec![PlanStep {
                tool: "fs.read".to_string(),
                args: json!({"path": "./README.md"}),
                name: None,
            }],
        }
    }

    fn sample_policy() -> Policy {
        serde_yaml::from_str(
            "boundary: deny_by_default\ntools:\n  fs.read:\n    allow_paths: [\"./**\"]\n",
        )
        .unwrap()
    }

    fn allow_decision() -> PolicyDecision {
        PolicyDecision::allow("all filesystem rules passed", "fs.allow_paths")
    }

    #[test]
    fn create_and_get_run() {
        let store = AuditStore::open_in_memory().unwrap();
        let run = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
            .unwrap();
        assert_eq!(run.run_id.as_str().len(), 8);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.counters.total_steps, 1);

        let loaded = store.get_run(&run.run_id).unwrap();
        assert_eq!(loaded.plan_hash, run.plan_hash);
        assert_eq!(loaded.plan_json, run.plan_json);
        assert_eq!(loaded.mode, RunMode::Run);
    }

    #[test]
    fn missing_run_is_an_error() {
        let store = AuditStore::open_in_memory().unwrap();
        let err = store.get_run(&RunId::from_string("deadbeef")).unwrap_err();
        assert_eq!(err.code(), 5004);
    }

    #[test]
    fn staged_call_is_invisible_until_its_result_lands() {
        let store = AuditStore::open_in_memory().unwrap();
        let run = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
            .unwrap();

        let call = store
            .record_call(&run.run_id, 0, "fs.read", &json!({"path": "./README.md"}))
            .unwrap();
        assert!(store.calls_for_run(&run.run_id).unwrap().is_empty());

        let now = Utc::now();
        store
            .record_result(
                &call.call_id,
                CallStatus::Success,
                Some(json!({"size_bytes": 5})),
                None,
                allow_decision(),
                now,
                now,
            )
            .unwrap();

        let calls = store.calls_for_run(&run.run_id).unwrap();
        let results = store.results_for_run(&run.run_id).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].call_id, call.call_id);
    }

    #[test]
    fn each_call_gets_exactly_one_result() {
        let store = AuditStore::open_in_memory().unwrap();
        let run = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
            .unwrap();
        let call = store
            .record_call(&run.run_id, 0, "fs.read", &json!({"path": "./x"}))
            .unwrap();
        let now = Utc::now();
        store
            .record_result(&call.call_id, CallStatus::Success, None, None, allow_decision(), now, now)
            .unwrap();

        // A second result for the same call has nothing staged to attach to.
        let err = store
            .record_result(&call.call_id, CallStatus::Error, None, None, allow_decision(), now, now)
            .unwrap_err();
        assert_eq!(err.code(), 5005);
        assert_eq!(store.results_for_run(&run.run_id).unwrap().len(), 1);
    }

    #[test]
    fn stored_hashes_verify_clean() {
        let store = AuditStore::open_in_memory().unwrap();
        let run = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
            .unwrap();
        let args = json!({"path": "./README.md", "encoding": "utf-8"});
        let output = json!({"content": "hello", "size_bytes": 5});
        let call = store.record_call(&run.run_id, 0, "fs.read", &args).unwrap();
        let now = Utc::now();
        let result = store
            .record_result(
                &call.call_id,
                CallStatus::Success,
                Some(output.clone()),
                None,
                allow_decision(),
                now,
                now,
            )
            .unwrap();

        assert_eq!(result.input_hash, canon::hash_value(&args));
        assert_eq!(result.output_hash, canon::hash_value(&output));

        let report = store.verify_run(&run.run_id).unwrap();
        assert!(report.ok, "{:?}", report.mismatches);
    }

    #[test]
    fn absent_output_hashes_as_null() {
        let store = AuditStore::open_in_memory().unwrap();
        let run = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
            .unwrap();
        let call = store
            .record_call(&run.run_id, 0, "fs.read", &json!({"path": "./x"}))
            .unwrap();
        let now = Utc::now();
        let result = store
            .record_result(
                &call.call_id,
                CallStatus::Denied,
                None,
                None,
                PolicyDecision::deny("no allow pattern", "fs.allow_paths"),
                now,
                now,
            )
            .unwrap();
        assert_eq!(result.output_hash, canon::hash_value(&serde_json::Value::Null));
    }

    #[test]
    fn run_status_transitions_are_enforced() {
        let store = AuditStore::open_in_memory().unwrap();
        let run = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
            .unwrap();
        let counters = StepCounters::default();

        store
            .update_run_status(&run.run_id, RunStatus::Running, &counters)
            .unwrap();
        // Re-asserting the current status refreshes counters.
        store
            .update_run_status(&run.run_id, RunStatus::Running, &counters)
            .unwrap();
        store
            .update_run_status(&run.run_id, RunStatus::Completed, &counters)
            .unwrap();

        let err = store
            .update_run_status(&run.run_id, RunStatus::Running, &counters)
            .unwrap_err();
        assert_eq!(err.code(), 5006);

        let loaded = store.get_run(&run.run_id).unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn skipping_running_is_rejected() {
        let store = AuditStore::open_in_memory().unwrap();
        let run = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
            .unwrap();
        let err = store
            .update_run_status(&run.run_id, RunStatus::Completed, &StepCounters::default())
            .unwrap_err();
        assert_eq!(err.code(), 5006);
    }

    #[test]
    fn planner_proposals_preserve_raw_response() {
        let store = AuditStore::open_in_memory().unwrap();
        let run = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Agent)
            .unwrap();

        store
            .record_planner_proposal(
                &run.run_id,
                0,
                ProposalType::ToolCall,
                Some("fs.read"),
                Some(r#"{"path":"./x"}"#),
                Some("inspect the file"),
                r#"{"tool": "fs.read", "args": {"path": "./x"}}"#,
            )
            .unwrap();
        store
            .record_planner_proposal(
                &run.run_id,
                1,
                ProposalType::Done,
                None,
                None,
                None,
                "garbage {{{ not json",
            )
            .unwrap();

        let proposals = store.proposals_for_run(&run.run_id).unwrap();
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].tool_name.as_deref(), Some("fs.read"));
        assert_eq!(proposals[1].raw_response, "garbage {{{ not json");
    }

    #[test]
    fn verify_detects_tampering() {
        let store = AuditStore::open_in_memory().unwrap();
        let run = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
            .unwrap();
        let call = store
            .record_call(&run.run_id, 0, "fs.read", &json!({"path": "./x"}))
            .unwrap();
        let now = Utc::now();
        store
            .record_result(
                &call.call_id,
                CallStatus::Success,
                Some(json!({"content": "hello"})),
                None,
                allow_decision(),
                now,
                now,
            )
            .unwrap();

        // Reach under the API and change the recorded output.
        store.conn.lock().execute(
            "UPDATE tool_results SET output_json = '{\"content\":\"evil\"}' WHERE call_id = ?1",
            params![call.call_id.as_str()],
        )
        .unwrap();

        let report = store.verify_run(&run.run_id).unwrap();
        assert!(!report.ok);
        assert!(report.mismatches[0].contains("output_hash"));
    }

    #[test]
    fn list_runs_returns_newest_first() {
        let store = AuditStore::open_in_memory().unwrap();
        let first = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store
            .create_run(&sample_plan(), &sample_policy(), RunMode::Replay)
            .unwrap();

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second.run_id);
        assert_eq!(runs[1].run_id, first.run_id);
    }

    #[test]
    fn reopening_a_database_file_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capsule.db");
        let run_id = {
            let store = AuditStore::open(&path).unwrap();
            store
                .create_run(&sample_plan(), &sample_policy(), RunMode::Run)
                .unwrap()
                .run_id
        };
        let store = AuditStore::open(&path).unwrap();
        assert!(store.get_run(&run_id).is_ok());
    }
}
