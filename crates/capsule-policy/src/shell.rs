//! Shell rules: executable allow-list and deny-token scanning.
//!
//! `cmd` must be an argv array — a plain string would imply shell
//! interpretation, which never happens anywhere in Capsule.

use std::path::Path;

use capsule_protocol::PolicyDecision;
use capsule_protocol::policy::ShellPolicy;
use serde_json::Value;

pub(crate) fn evaluate(rules: &ShellPolicy, args: &Value) -> PolicyDecision {
    let Some(cmd) = args.get("cmd").and_then(Value::as_array) else {
        return PolicyDecision::deny(
            "cmd argument is missing or not an array of strings",
            "shell.cmd",
        );
    };

    let mut argv = Vec::with_capacity(cmd.len());
    for item in cmd {
        match item.as_str() {
            Some(s) => argv.push(s),
            None => {
                return PolicyDecision::deny(
                    "cmd array contains a non-string element",
                    "shell.cmd",
                );
            }
        }
    }

    let Some(first) = argv.first() else {
        return PolicyDecision::deny("cmd array is empty", "shell.cmd");
    };

    let exe = Path::new(first)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| (*first).to_string());

    if !rules.allow_executables.iter().any(|allowed| *allowed == exe) {
        return PolicyDecision::deny(
            format!("executable {exe:?} is not in allow_executables"),
            "shell.allow_executables",
        );
    }

    for token in &rules.deny_tokens {
        if let Some(argument) = argv.iter().find(|argument| argument.contains(token.as_str())) {
            return PolicyDecision::deny(
                format!("argument {argument:?} contains denied token {token:?}"),
                "shell.deny_tokens",
            );
        }
    }

    PolicyDecision::allow("all shell rules passed", "shell.allow_executables")
}
