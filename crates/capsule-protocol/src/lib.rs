//! # capsule-protocol — Canonical Capsule Protocol
//!
//! This crate defines the shared record shapes and the canonical
//! serialization rules that the policy engine, tool registry, audit store,
//! and orchestrators all depend on.
//!
//! It is intentionally dependency-light (no runtime deps like tokio,
//! rusqlite, or reqwest) so it can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (RunId, CallId, ProposalId)
//! - [`canon`] — Canonical JSON serialization and SHA-256 hashing
//! - [`plan`] — Plan, PlanStep, and plan validation
//! - [`policy`] — Policy, per-tool policy variants, PolicyDecision
//! - [`tool`] — ToolCall, ToolOutcome, ToolResult
//! - [`run`] — RunRecord, run lifecycle, planner proposals

pub mod canon;
pub mod ids;
pub mod plan;
pub mod policy;
pub mod run;
pub mod tool;

// Re-export the most commonly used types at the crate root.
pub use canon::{hash_serializable, hash_value, sha256_hex, to_canonical_json};
pub use ids::{CallId, ProposalId, RunId};
pub use plan::{Plan, PlanError, PlanStep};
pub use policy::{
    Boundary, FsPolicy, HttpPolicy, Policy, PolicyDecision, ShellPolicy, ToolPolicy,
};
pub use run::{
    PlannerProposal, ProposalType, RunMode, RunRecord, RunStatus, StepCounters,
};
pub use tool::{CallStatus, ToolCall, ToolOutcome, ToolResult};
