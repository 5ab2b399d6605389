//! Typed ID wrappers for the Capsule runtime.
//!
//! IDs are opaque String wrappers (serde-transparent). New ids are short
//! opaque tokens — 8 lowercase hex chars drawn from a UUIDv4 — which keeps
//! log lines and CLI arguments readable. Uniqueness within a database file
//! is the store's responsibility (it retries on collision).

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new short random id (8 lowercase hex chars).
            pub fn generate() -> Self {
                Self(short_hex_id())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for a run (one plan or agent execution).
    RunId
);
typed_id!(
    /// Unique identifier for a single tool call within a run.
    CallId
);
typed_id!(
    /// Unique identifier for a logged planner proposal.
    ProposalId
);

fn short_hex_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..8].to_string()
}
