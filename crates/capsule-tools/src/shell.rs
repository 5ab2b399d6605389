//! The `shell.run` tool.
//!
//! The argv array is spawned directly — no shell interpreter, ever. The
//! child starts from an empty environment (only explicitly passed
//! variables survive), `cwd` must stay inside the working directory, and
//! on timeout the child gets SIGTERM, a grace period, then SIGKILL.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use capsule_protocol::ToolOutcome;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::{Tool, ToolContext, ToolError};

const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellRunArgs {
    cmd: Vec<String>,
    cwd: Option<String>,
    env: Option<BTreeMap<String, String>>,
}

pub struct ShellRunTool;

#[async_trait]
impl Tool for ShellRunTool {
    fn name(&self) -> &'static str {
        "shell.run"
    }

    fn description(&self) -> &'static str {
        "Run an argv array as a subprocess with a clean environment and bounded output"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "cmd": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1,
                    "description": "Executable and arguments; never interpreted by a shell"
                },
                "cwd": { "type": "string", "description": "Working directory, inside the workspace" },
                "env": {
                    "type": "object",
                    "additionalProperties": { "type": "string" },
                    "description": "Environment variables; nothing else is inherited"
                }
            },
            "required": ["cmd"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let args: ShellRunArgs = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(err) => {
                return Ok(ToolOutcome::Failure {
                    error: format!("invalid arguments: {err}"),
                });
            }
        };
        if args.cmd.is_empty() {
            return Ok(ToolOutcome::Failure {
                error: "cmd must not be empty".to_string(),
            });
        }

        let rules = ctx.policy.for_tool("shell.run").and_then(|p| p.as_shell());
        let timeout_seconds = rules.map(|r| r.timeout_seconds).unwrap_or(30);
        let max_output_bytes = rules.map(|r| r.max_output_bytes as usize).unwrap_or(64 * 1024);

        let cwd = match &args.cwd {
            None => ctx.working_dir.clone(),
            Some(cwd) => {
                let joined = ctx.working_dir.join(cwd);
                let canonical_root = ctx.working_dir.canonicalize()?;
                match joined.canonicalize() {
                    Ok(canonical) if canonical.starts_with(&canonical_root) => canonical,
                    Ok(_) => {
                        return Ok(ToolOutcome::Failure {
                            error: format!("cwd {cwd:?} escapes the working directory"),
                        });
                    }
                    Err(err) => {
                        return Ok(ToolOutcome::Failure {
                            error: format!("cwd {cwd:?} cannot be resolved: {err}"),
                        });
                    }
                }
            }
        };

        let started_at = Utc::now();

        let mut command = Command::new(&args.cmd[0]);
        command
            .args(&args.cmd[1..])
            .current_dir(&cwd)
            .env_clear()
            .envs(args.env.unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_all(stdout_pipe));
        let stderr_task = tokio::spawn(read_all(stderr_pipe));

        let limit = Duration::from_secs(u64::from(timeout_seconds.max(1)));
        let (exit_code, timed_out) = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => (status?.code().unwrap_or(-1), false),
            Err(_) => {
                warn!(cmd = %args.cmd[0], timeout_seconds, "subprocess timed out");
                (stop_child(&mut child, pid).await, true)
            }
        };

        let stdout_bytes = join_read(stdout_task).await?;
        let stderr_bytes = join_read(stderr_task).await?;
        let ended_at = Utc::now();

        let output = json!({
            "exit_code": exit_code,
            "stdout": truncate(stdout_bytes, max_output_bytes),
            "stderr": truncate(stderr_bytes, max_output_bytes),
            "duration_ms": (ended_at - started_at).num_milliseconds(),
            "timed_out": timed_out,
        });
        debug!(cmd = %args.cmd[0], exit_code, timed_out, "subprocess finished");

        if timed_out {
            return Ok(ToolOutcome::Failure {
                error: format!("timeout after {timeout_seconds} seconds"),
            });
        }
        Ok(ToolOutcome::Success { output })
    }
}

/// SIGTERM, a grace period, then SIGKILL. Returns the exit code if the
/// child reported one.
async fn stop_child(child: &mut Child, pid: Option<u32>) -> i32 {
    send_sigterm(pid);
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        _ => {
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            }
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_sigterm(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: kill(2) takes only a pid and a signal number; no memory
        // is shared with the callee. A stale pid makes it a no-op error.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}

async fn read_all(
    pipe: Option<impl tokio::io::AsyncRead + Unpin>,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

async fn join_read(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<Vec<u8>, ToolError> {
    match task.await {
        Ok(result) => Ok(result?),
        Err(err) => Err(ToolError::Io(std::io::Error::other(err))),
    }
}

fn truncate(mut output: Vec<u8>, max_output_bytes: usize) -> String {
    if output.len() > max_output_bytes {
        output.truncate(max_output_bytes);
    }
    String::from_utf8_lossy(&output).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{context, policy_with};
    use capsule_protocol::ToolPolicy;
    use capsule_protocol::policy::ShellPolicy;

    fn shell_policy(timeout_seconds: u32, max_output_bytes: u64) -> ToolPolicy {
        ToolPolicy::Shell(ShellPolicy {
            allow_executables: vec!["echo".to_string(), "sh".to_string(), "cat".to_string()],
            deny_tokens: vec![],
            timeout_seconds,
            max_output_bytes,
        })
    }

    #[tokio::test]
    async fn echo_captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), policy_with(vec![("shell.run", shell_policy(5, 1024))]));

        let outcome = ShellRunTool
            .execute(&json!({"cmd": ["echo", "hello capsule"]}), &ctx)
            .await
            .unwrap();
        let ToolOutcome::Success { output } = outcome else {
            panic!("expected success");
        };
        assert_eq!(output["exit_code"], 0);
        assert_eq!(output["stdout"], "hello capsule\n");
        assert_eq!(output["timed_out"], false);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), policy_with(vec![("shell.run", shell_policy(5, 1024))]));

        let outcome = ShellRunTool
            .execute(&json!({"cmd": ["sh", "-c", "exit 3"]}), &ctx)
            .await
            .unwrap();
        let ToolOutcome::Success { output } = outcome else {
            panic!("expected success");
        };
        assert_eq!(output["exit_code"], 3);
    }

    #[tokio::test]
    async fn output_is_truncated_to_policy_limit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), policy_with(vec![("shell.run", shell_policy(5, 8))]));

        let outcome = ShellRunTool
            .execute(&json!({"cmd": ["echo", "0123456789abcdef"]}), &ctx)
            .await
            .unwrap();
        let ToolOutcome::Success { output } = outcome else {
            panic!("expected success");
        };
        assert_eq!(output["stdout"].as_str().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), policy_with(vec![("shell.run", shell_policy(1, 1024))]));

        let started = std::time::Instant::now();
        let outcome = ShellRunTool
            .execute(&json!({"cmd": ["sh", "-c", "sleep 30"]}), &ctx)
            .await
            .unwrap();
        let ToolOutcome::Failure { error } = outcome else {
            panic!("expected timeout failure");
        };
        assert!(error.contains("timeout"));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn environment_is_not_inherited() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), policy_with(vec![("shell.run", shell_policy(5, 1024))]));

        // The variable is only visible when passed explicitly; nothing
        // comes in from the parent environment.
        let outcome = ShellRunTool
            .execute(
                &json!({"cmd": ["sh", "-c", "echo cap_${CAPSULE_TEST_MARKER}_end"], "env": {}}),
                &ctx,
            )
            .await
            .unwrap();
        let ToolOutcome::Success { output } = outcome else {
            panic!("expected success");
        };
        assert_eq!(output["stdout"], "cap__end\n");

        let outcome = ShellRunTool
            .execute(
                &json!({
                    "cmd": ["sh", "-c", "echo cap_${CAPSULE_TEST_MARKER}_end"],
                    "env": {"CAPSULE_TEST_MARKER": "visible"}
                }),
                &ctx,
            )
            .await
            .unwrap();
        let ToolOutcome::Success { output } = outcome else {
            panic!("expected success");
        };
        assert_eq!(output["stdout"], "cap_visible_end\n");
    }

    #[tokio::test]
    async fn cwd_outside_working_dir_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), policy_with(vec![("shell.run", shell_policy(5, 1024))]));

        let outcome = ShellRunTool
            .execute(&json!({"cmd": ["echo", "hi"], "cwd": "/"}), &ctx)
            .await
            .unwrap();
        let ToolOutcome::Failure { error } = outcome else {
            panic!("expected failure");
        };
        assert!(error.contains("escapes"), "{error}");
    }

    #[tokio::test]
    async fn cwd_inside_working_dir_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/marker.txt"), "found").unwrap();
        let ctx = context(dir.path(), policy_with(vec![("shell.run", shell_policy(5, 1024))]));

        let outcome = ShellRunTool
            .execute(&json!({"cmd": ["cat", "marker.txt"], "cwd": "sub"}), &ctx)
            .await
            .unwrap();
        let ToolOutcome::Success { output } = outcome else {
            panic!("expected success");
        };
        assert_eq!(output["stdout"], "found");
    }
}
