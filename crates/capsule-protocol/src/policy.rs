//! Policy types: the deny-by-default boundary, per-tool rule variants,
//! and the decision record the engine produces.
//!
//! Policies are frozen after loading. The per-tool variant is selected by
//! tool name during deserialization, so a policy naming an unknown tool
//! fails at load — in YAML and JSON alike — rather than at evaluation.

use indexmap::IndexMap;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::canon;

/// The outer security stance. Only deny-by-default exists in this version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    DenyByDefault,
}

/// Rules for `fs.read` / `fs.write`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsPolicy {
    pub allow_paths: Vec<String>,
    #[serde(default)]
    pub deny_paths: Vec<String>,
    #[serde(default = "FsPolicy::default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default)]
    pub allow_hidden: bool,
}

impl FsPolicy {
    fn default_max_size_bytes() -> u64 {
        10 * 1024 * 1024
    }
}

/// Rules for `http.get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpPolicy {
    pub allow_domains: Vec<String>,
    #[serde(default = "HttpPolicy::default_deny_private_ips")]
    pub deny_private_ips: bool,
    #[serde(default = "HttpPolicy::default_max_response_bytes")]
    pub max_response_bytes: u64,
    #[serde(default = "HttpPolicy::default_timeout_seconds")]
    pub timeout_seconds: u32,
}

impl HttpPolicy {
    fn default_deny_private_ips() -> bool {
        true
    }

    fn default_max_response_bytes() -> u64 {
        5 * 1024 * 1024
    }

    fn default_timeout_seconds() -> u32 {
        30
    }
}

/// Rules for `shell.run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellPolicy {
    pub allow_executables: Vec<String>,
    #[serde(default)]
    pub deny_tokens: Vec<String>,
    #[serde(default = "ShellPolicy::default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default = "ShellPolicy::default_max_output_bytes")]
    pub max_output_bytes: u64,
}

impl ShellPolicy {
    fn default_timeout_seconds() -> u32 {
        30
    }

    fn default_max_output_bytes() -> u64 {
        64 * 1024
    }
}

/// Per-tool rule variant. The discriminant is the tool name the variant is
/// registered under, not a serialized tag.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolPolicy {
    Fs(FsPolicy),
    Http(HttpPolicy),
    Shell(ShellPolicy),
}

impl ToolPolicy {
    pub fn as_fs(&self) -> Option<&FsPolicy> {
        match self {
            Self::Fs(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_http(&self) -> Option<&HttpPolicy> {
        match self {
            Self::Http(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_shell(&self) -> Option<&ShellPolicy> {
        match self {
            Self::Shell(p) => Some(p),
            _ => None,
        }
    }
}

/// Ordered map of tool name to rules. Deserialization dispatches on the
/// tool name and rejects names it does not recognize.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ToolPolicies(pub IndexMap<String, ToolPolicy>);

impl ToolPolicies {
    pub fn get(&self, tool_name: &str) -> Option<&ToolPolicy> {
        self.0.get(tool_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ToolPolicy)> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for ToolPolicies {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ToolPoliciesVisitor;

        impl<'de> Visitor<'de> for ToolPoliciesVisitor {
            type Value = ToolPolicies;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of tool name to tool policy")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut tools = IndexMap::new();
                while let Some(tool_name) = access.next_key::<String>()? {
                    let policy = match tool_name.as_str() {
                        "fs.read" | "fs.write" => {
                            ToolPolicy::Fs(access.next_value::<FsPolicy>()?)
                        }
                        "http.get" => ToolPolicy::Http(access.next_value::<HttpPolicy>()?),
                        "shell.run" => ToolPolicy::Shell(access.next_value::<ShellPolicy>()?),
                        other => {
                            return Err(de::Error::custom(format!(
                                "unknown tool in policy: {other}"
                            )));
                        }
                    };
                    if tools.insert(tool_name.clone(), policy).is_some() {
                        return Err(de::Error::custom(format!(
                            "duplicate tool in policy: {tool_name}"
                        )));
                    }
                }
                Ok(ToolPolicies(tools))
            }
        }

        deserializer.deserialize_map(ToolPoliciesVisitor)
    }
}

/// The full policy document. Frozen after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub boundary: Boundary,
    #[serde(default = "Policy::default_global_timeout_seconds")]
    pub global_timeout_seconds: u32,
    #[serde(default = "Policy::default_max_calls_per_tool")]
    pub max_calls_per_tool: u32,
    #[serde(default)]
    pub tools: ToolPolicies,
}

impl Policy {
    fn default_global_timeout_seconds() -> u32 {
        120
    }

    fn default_max_calls_per_tool() -> u32 {
        16
    }

    pub fn for_tool(&self, tool_name: &str) -> Option<&ToolPolicy> {
        self.tools.get(tool_name)
    }

    /// Canonical-JSON hash of the policy.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        canon::hash_serializable(self)
    }

    /// One-line-per-tool digest handed to planners so they can propose
    /// calls the policy will not immediately reject.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "boundary: deny_by_default; global_timeout_seconds: {}; max_calls_per_tool: {}",
            self.global_timeout_seconds, self.max_calls_per_tool
        )];
        for (tool, policy) in self.tools.iter() {
            let detail = match policy {
                ToolPolicy::Fs(p) => format!(
                    "allow_paths={:?} deny_paths={:?} max_size_bytes={} allow_hidden={}",
                    p.allow_paths, p.deny_paths, p.max_size_bytes, p.allow_hidden
                ),
                ToolPolicy::Http(p) => format!(
                    "allow_domains={:?} deny_private_ips={} max_response_bytes={}",
                    p.allow_domains, p.deny_private_ips, p.max_response_bytes
                ),
                ToolPolicy::Shell(p) => format!(
                    "allow_executables={:?} deny_tokens={:?}",
                    p.allow_executables, p.deny_tokens
                ),
            };
            lines.push(format!("{tool}: {detail}"));
        }
        lines.join("\n")
    }
}

/// The outcome of evaluating one proposed call against the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_hit: Option<String>,
}

impl PolicyDecision {
    pub fn allow(reason: impl Into<String>, rule_hit: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            rule_hit: Some(rule_hit.into()),
        }
    }

    pub fn deny(reason: impl Into<String>, rule_hit: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            rule_hit: Some(rule_hit.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY_YAML: &str = r#"
boundary: deny_by_default
global_timeout_seconds: 60
max_calls_per_tool: 4
tools:
  fs.read:
    allow_paths: ["./**"]
    max_size_bytes: 1048576
  http.get:
    allow_domains: ["*.example.com"]
    deny_private_ips: true
  shell.run:
    allow_executables: [echo]
    deny_tokens: ["rm -rf"]
"#;

    #[test]
    fn policy_yaml_loads_with_variant_per_tool() {
        let policy: Policy = serde_yaml::from_str(POLICY_YAML).unwrap();
        assert_eq!(policy.boundary, Boundary::DenyByDefault);
        assert!(policy.for_tool("fs.read").unwrap().as_fs().is_some());
        assert!(policy.for_tool("http.get").unwrap().as_http().is_some());
        assert!(policy.for_tool("shell.run").unwrap().as_shell().is_some());
        assert!(policy.for_tool("fs.write").is_none());
    }

    #[test]
    fn unknown_tool_name_rejected_at_load() {
        let yaml = "boundary: deny_by_default\ntools:\n  fs.chmod:\n    allow_paths: []\n";
        let err = serde_yaml::from_str::<Policy>(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }

    #[test]
    fn unknown_top_level_key_rejected_at_load() {
        let yaml = "boundary: deny_by_default\nextra: 1\n";
        assert!(serde_yaml::from_str::<Policy>(yaml).is_err());
    }

    #[test]
    fn unknown_rule_field_rejected_at_load() {
        let yaml =
            "boundary: deny_by_default\ntools:\n  fs.read:\n    allow_paths: []\n    chmod: true\n";
        assert!(serde_yaml::from_str::<Policy>(yaml).is_err());
    }

    #[test]
    fn defaults_fill_missing_limits() {
        let yaml = "boundary: deny_by_default\ntools:\n  fs.read:\n    allow_paths: [\"./**\"]\n";
        let policy: Policy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.global_timeout_seconds, 120);
        assert_eq!(policy.max_calls_per_tool, 16);
        let fs = policy.for_tool("fs.read").unwrap().as_fs().unwrap();
        assert_eq!(fs.max_size_bytes, 10 * 1024 * 1024);
        assert!(!fs.allow_hidden);
    }

    #[test]
    fn policy_hash_is_stable() {
        let a: Policy = serde_yaml::from_str(POLICY_YAML).unwrap();
        let b: Policy = serde_yaml::from_str(POLICY_YAML).unwrap();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn summary_names_every_tool() {
        let policy: Policy = serde_yaml::from_str(POLICY_YAML).unwrap();
        let summary = policy.summary();
        assert!(summary.contains("fs.read"));
        assert!(summary.contains("shell.run"));
        assert!(summary.contains("deny_by_default"));
    }

    #[test]
    fn decision_constructors() {
        let deny = PolicyDecision::deny("no allow pattern", "fs.allow_paths");
        assert!(!deny.allowed);
        assert_eq!(deny.rule_hit.as_deref(), Some("fs.allow_paths"));
        let allow = PolicyDecision::allow("all checks passed", "fs.allow_paths");
        assert!(allow.allowed);
    }
}
