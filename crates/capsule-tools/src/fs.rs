//! Filesystem tools: `fs.read` and `fs.write`.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use capsule_policy::paths;
use capsule_protocol::ToolOutcome;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::{Tool, ToolContext, ToolError};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FsReadArgs {
    path: String,
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FsWriteArgs {
    path: String,
    content: String,
    encoding: Option<String>,
    #[serde(default)]
    append: bool,
}

fn bad_args(err: impl std::fmt::Display) -> ToolOutcome {
    ToolOutcome::Failure {
        error: format!("invalid arguments: {err}"),
    }
}

/// Read a file from the workspace, with a pre-open size check against the
/// policy's `max_size_bytes`.
pub struct FsReadTool;

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &'static str {
        "fs.read"
    }

    fn description(&self) -> &'static str {
        "Read a file from the workspace as text, falling back to base64 for binary content"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "path": { "type": "string", "description": "Path relative to the working directory" },
                "encoding": { "type": "string", "enum": ["utf-8", "binary"], "description": "Decoding mode (default: utf-8)" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let args: FsReadArgs = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(err) => return Ok(bad_args(err)),
        };

        let max_size_bytes = ctx
            .policy
            .for_tool("fs.read")
            .and_then(|p| p.as_fs())
            .map(|p| p.max_size_bytes)
            .unwrap_or(u64::MAX);

        let absolute = ctx.working_dir.join(&args.path);
        let metadata = tokio::fs::metadata(&absolute).await?;
        if metadata.len() > max_size_bytes {
            return Ok(ToolOutcome::Failure {
                error: format!(
                    "file size {} exceeds max_size_bytes {max_size_bytes}",
                    metadata.len()
                ),
            });
        }

        let bytes = tokio::fs::read(&absolute).await?;
        let size_bytes = bytes.len();

        let encoding = args.encoding.as_deref().unwrap_or("utf-8");
        let (content, encoding) = match encoding {
            "binary" => (BASE64.encode(&bytes), "binary"),
            "utf-8" => match String::from_utf8(bytes) {
                Ok(text) => (text, "utf-8"),
                Err(err) => (BASE64.encode(err.as_bytes()), "binary"),
            },
            other => {
                return Ok(ToolOutcome::Failure {
                    error: format!("unsupported encoding {other:?}"),
                });
            }
        };

        debug!(path = %args.path, size_bytes, encoding, "file read");
        Ok(ToolOutcome::Success {
            output: json!({
                "content": content,
                "size_bytes": size_bytes,
                "encoding": encoding,
            }),
        })
    }
}

/// Write a file into the workspace. Missing parent directories are created
/// only when the target passes the policy's allow-list matcher.
pub struct FsWriteTool;

#[async_trait]
impl Tool for FsWriteTool {
    fn name(&self) -> &'static str {
        "fs.write"
    }

    fn description(&self) -> &'static str {
        "Write text (or base64 binary) content to a file in the workspace"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "path": { "type": "string", "description": "Path relative to the working directory" },
                "content": { "type": "string", "description": "Content to write; base64 when encoding is binary" },
                "encoding": { "type": "string", "enum": ["utf-8", "binary"], "description": "Content encoding (default: utf-8)" },
                "append": { "type": "boolean", "default": false, "description": "Append instead of truncating" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let args: FsWriteArgs = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(err) => return Ok(bad_args(err)),
        };

        let bytes = match args.encoding.as_deref().unwrap_or("utf-8") {
            "utf-8" => args.content.clone().into_bytes(),
            "binary" => match BASE64.decode(args.content.as_bytes()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    return Ok(ToolOutcome::Failure {
                        error: format!("content is not valid base64: {err}"),
                    });
                }
            },
            other => {
                return Ok(ToolOutcome::Failure {
                    error: format!("unsupported encoding {other:?}"),
                });
            }
        };

        let absolute = ctx.working_dir.join(&args.path);
        if let Some(parent) = absolute.parent()
            && !parent.exists()
        {
            let allowed = ctx
                .policy
                .for_tool("fs.write")
                .and_then(|p| p.as_fs())
                .is_some_and(|rules| {
                    paths::write_target_allowed(rules, &ctx.working_dir, &args.path)
                });
            if !allowed {
                return Ok(ToolOutcome::Failure {
                    error: format!(
                        "parent directory of {:?} does not exist and is not allow-listed",
                        args.path
                    ),
                });
            }
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes_written = bytes.len();
        if args.append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&absolute)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
        } else {
            tokio::fs::write(&absolute, &bytes).await?;
        }

        debug!(path = %args.path, bytes_written, append = args.append, "file written");
        Ok(ToolOutcome::Success {
            output: json!({
                "bytes_written": bytes_written,
                "path": args.path,
            }),
        })
    }
}
