//! The `http.get` tool.
//!
//! Auto-redirects are disabled: every hop is inspected here so that a
//! cross-host redirect goes back through the policy engine and an
//! https→http downgrade is refused. When the policy pinned the host, the
//! client is told to connect to exactly those addresses — the Host header
//! and TLS SNI stay on the original hostname.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use capsule_policy::PinnedHost;
use capsule_protocol::ToolOutcome;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use crate::{Tool, ToolContext, ToolError};

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpGetArgs {
    url: String,
    headers: Option<BTreeMap<String, String>>,
}

pub struct HttpGetTool;

#[async_trait]
impl Tool for HttpGetTool {
    fn name(&self) -> &'static str {
        "http.get"
    }

    fn description(&self) -> &'static str {
        "Fetch a URL over http/https, with policy-pinned addresses and capped response size"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "url": { "type": "string", "description": "The URL to fetch" },
                "headers": {
                    "type": "object",
                    "additionalProperties": { "type": "string" },
                    "description": "Extra request headers"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let args: HttpGetArgs = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(err) => {
                return Ok(ToolOutcome::Failure {
                    error: format!("invalid arguments: {err}"),
                });
            }
        };

        let Some(rules) = ctx.policy.for_tool("http.get").and_then(|p| p.as_http()) else {
            return Ok(ToolOutcome::Failure {
                error: "no http.get policy is configured".to_string(),
            });
        };

        let mut current = match Url::parse(&args.url) {
            Ok(url) => url,
            Err(err) => {
                return Ok(ToolOutcome::Failure {
                    error: format!("cannot parse url {:?}: {err}", args.url),
                });
            }
        };
        let mut pinned = ctx.pinned.clone();

        for _hop in 0..=MAX_REDIRECTS {
            let response = match send(&current, &args.headers, pinned.as_ref(), rules.timeout_seconds).await {
                Ok(response) => response,
                Err(err) if err.is_timeout() => return Err(ToolError::Timeout),
                Err(err) => return Err(ToolError::Http(err.to_string())),
            };

            if response.status().is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                else {
                    return Ok(ToolOutcome::Failure {
                        error: format!("redirect from {current} carries no Location header"),
                    });
                };
                let next = match current.join(location) {
                    Ok(next) => next,
                    Err(err) => {
                        return Ok(ToolOutcome::Failure {
                            error: format!("cannot resolve redirect target {location:?}: {err}"),
                        });
                    }
                };

                if current.scheme() == "https" && next.scheme() == "http" {
                    return Ok(ToolOutcome::Failure {
                        error: format!("redirect to {next} denied: https to http downgrade"),
                    });
                }

                // A new host must pass the policy again; same-host hops
                // keep the existing pin.
                if next.host_str() != current.host_str() {
                    let verdict = match ctx.engine.evaluate_redirect(next.as_str()).await {
                        Ok(verdict) => verdict,
                        Err(err) => {
                            return Ok(ToolOutcome::Failure {
                                error: format!("policy evaluation failed on redirect: {err}"),
                            });
                        }
                    };
                    if !verdict.decision.allowed {
                        return Ok(ToolOutcome::Failure {
                            error: format!(
                                "redirect to {next} denied: {}",
                                verdict.decision.reason
                            ),
                        });
                    }
                    pinned = verdict.pinned;
                }

                debug!(from = %current, to = %next, "following redirect");
                current = next;
                continue;
            }

            let status = response.status().as_u16();
            let headers: BTreeMap<String, String> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();

            let mut response = response;
            let mut body = Vec::new();
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(err) if err.is_timeout() => return Err(ToolError::Timeout),
                    Err(err) => return Err(ToolError::Http(err.to_string())),
                };
                if (body.len() + chunk.len()) as u64 > rules.max_response_bytes {
                    return Ok(ToolOutcome::Failure {
                        error: format!(
                            "response exceeds max_response_bytes {}",
                            rules.max_response_bytes
                        ),
                    });
                }
                body.extend_from_slice(&chunk);
            }

            let bytes_read = body.len();
            debug!(url = %current, status, bytes_read, "fetch complete");
            return Ok(ToolOutcome::Success {
                output: json!({
                    "status": status,
                    "headers": headers,
                    "body": String::from_utf8_lossy(&body).into_owned(),
                    "bytes_read": bytes_read,
                }),
            });
        }

        Ok(ToolOutcome::Failure {
            error: format!("too many redirects (limit {MAX_REDIRECTS})"),
        })
    }
}

async fn send(
    url: &Url,
    headers: &Option<BTreeMap<String, String>>,
    pinned: Option<&PinnedHost>,
    timeout_seconds: u32,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(u64::from(timeout_seconds.max(1))));

    // resolve_to_addrs only applies to domains; an IP-literal url already
    // is its own pin.
    if let Some(pin) = pinned
        && let Some(domain) = url.domain()
        && domain == pin.host
    {
        builder = builder.resolve_to_addrs(domain, &pin.addrs);
    }

    let client = builder.build()?;
    let mut request = client.get(url.clone());
    if let Some(headers) = headers {
        for (name, value) in headers {
            request = request.header(name, value);
        }
    }
    request.send().await
}
