//! Plan types: an ordered sequence of tool invocations.
//!
//! Plans are immutable once created; their canonical-JSON hash is the
//! replay key. Validation happens before run creation — a malformed plan
//! never reaches the store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canon;

/// A single step of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanStep {
    pub tool: String,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An ordered, versioned sequence of tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<PlanStep>,
}

/// Plan validation failures. Fatal before run creation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan version must not be empty")]
    EmptyVersion,
    #[error("plan has no steps")]
    NoSteps,
    #[error("step {index}: {message}")]
    InvalidStep { index: usize, message: String },
}

impl PlanError {
    /// Stable numeric error code (3xxx range).
    pub fn code(&self) -> u16 {
        match self {
            Self::EmptyVersion => 3001,
            Self::NoSteps => 3002,
            Self::InvalidStep { .. } => 3003,
        }
    }
}

impl Plan {
    /// Validate shape invariants: non-empty version, at least one step,
    /// dotted tool names, object-shaped args.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.version.trim().is_empty() {
            return Err(PlanError::EmptyVersion);
        }
        if self.steps.is_empty() {
            return Err(PlanError::NoSteps);
        }
        for (index, step) in self.steps.iter().enumerate() {
            if !step.tool.contains('.') {
                return Err(PlanError::InvalidStep {
                    index,
                    message: format!("tool name {:?} is not a dotted name", step.tool),
                });
            }
            if !step.args.is_object() {
                return Err(PlanError::InvalidStep {
                    index,
                    message: "args must be a JSON object".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Canonical-JSON hash of the plan. This is the replay key.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        canon::hash_serializable(self)
    }
}
