//! Code-agent subprocess backend
//!
//! Spawns the configured agent binary per invocation, stdin null, stdout
//! and stderr captured. In streaming mode stdout is newline-delimited JSON
//! events; the terminal `result` event carries the answer, session id, API
//! duration, and cost. Captured output is capped at 100 MB; past the cap
//! the stream keeps draining so the child can flush and exit.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::BackendConfig;

use super::{Backend, BackendError, ChunkHandler, Invocation, InvokeOptions};

/// Cap on captured stdout
const MAX_OUTPUT_BYTES: usize = 100 * 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated at 100MB]";

/// Backend that shells out to a code-agent CLI
pub struct ProcessBackend {
    command: String,
    default_model: Option<String>,
    /// Global cap on concurrent agent processes
    semaphore: Arc<Semaphore>,
}

impl ProcessBackend {
    pub fn new(command: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            command: command.into(),
            default_model: None,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            command: config.command.clone(),
            default_model: if config.model.is_empty() {
                None
            } else {
                Some(config.model.clone())
            },
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls.max(1) as usize)),
        }
    }

    fn build_args(&self, options: &InvokeOptions) -> Vec<String> {
        let mut args = vec!["-p".to_string(), options.prompt.clone()];

        if options.stream {
            args.push("--output-format".to_string());
            args.push("stream-json".to_string());
            args.push("--verbose".to_string());
        } else {
            args.push("--output-format".to_string());
            args.push("json".to_string());
        }

        if let Some(model) = options.model.as_ref().or(self.default_model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(session_id) = &options.session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }

        if options.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }

        if options.disable_mcp {
            args.push("--strict-mcp-config".to_string());
        } else if let Some(servers) = &options.mcp_servers {
            for server in servers {
                args.push("--mcp-config".to_string());
                args.push(server.clone());
            }
        }

        args
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn invoke(&self, options: InvokeOptions, on_chunk: Option<ChunkHandler>) -> Result<Invocation, BackendError> {
        // Wait for a slot before spawning; the permit releases on every
        // exit path when it drops
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Cancelled)?;

        let args = self.build_args(&options);
        debug!(command = %self.command, stream = options.stream, "ProcessBackend::invoke: spawning");

        let mut command = Command::new(&self.command);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }

        let started = Instant::now();
        let mut child = command.spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let timeout = Duration::from_millis(options.timeout_ms);
        let mut cancel = options.cancel.clone();

        let consume = consume_stdout(stdout, options.stream, on_chunk);
        tokio::pin!(consume);

        let parsed = tokio::select! {
            parsed = &mut consume => parsed,
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_ms = options.timeout_ms, "ProcessBackend::invoke: timed out, killing child");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(BackendError::Timeout(timeout));
            }
            _ = wait_cancelled(&mut cancel) => {
                debug!("ProcessBackend::invoke: cancelled, killing child");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(BackendError::Cancelled);
            }
        };

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(timeout.saturating_sub(started.elapsed())) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(BackendError::Timeout(timeout));
            }
        };

        let stderr_output = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let message = if stderr_output.trim().is_empty() {
                format!("agent process exited with {:?}", status.code())
            } else {
                stderr_output.trim().to_string()
            };
            return Err(BackendError::Process {
                exit_code: status.code(),
                message,
            });
        }

        let duration_ms = started.elapsed().as_millis() as u64;

        Ok(Invocation {
            prompt: options.prompt,
            response: parsed.response,
            session_id: parsed.session_id,
            duration_ms,
            duration_api_ms: parsed.duration_api_ms,
            cost_usd: parsed.cost_usd,
        })
    }

    async fn check_available(&self) -> bool {
        let result = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match tokio::time::timeout(Duration::from_secs(10), result).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }
}

/// Resolve only when the cancel signal flips to true; pends forever when
/// no cancel channel was provided
async fn wait_cancelled(cancel: &mut Option<tokio::sync::watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            if *rx.borrow() {
                return;
            }
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
            // Sender dropped without cancelling: never resolve
            std::future::pending::<()>().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// What stdout parsing yields
#[derive(Debug, Default)]
struct ParsedOutput {
    response: String,
    session_id: Option<String>,
    duration_api_ms: Option<u64>,
    cost_usd: Option<f64>,
}

/// Drain stdout, parsing the agent's event stream
async fn consume_stdout(
    stdout: tokio::process::ChildStdout,
    stream: bool,
    on_chunk: Option<ChunkHandler>,
) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();
    let mut reader = BufReader::new(stdout);
    let mut raw = String::new();
    let mut captured_bytes = 0usize;
    let mut truncated = false;
    let mut line = String::new();

    loop {
        line.clear();
        let read = match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "consume_stdout: read error");
                break;
            }
        };

        captured_bytes += read;
        if captured_bytes > MAX_OUTPUT_BYTES {
            if !truncated {
                truncated = true;
                raw.push_str(TRUNCATION_MARKER);
                warn!("consume_stdout: output cap reached, draining without capture");
            }
            // Keep consuming so the child can flush and exit
            continue;
        }

        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }

        let event: Value = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(_) => {
                // Not an event line; keep it as raw output
                raw.push_str(trimmed);
                raw.push('\n');
                continue;
            }
        };

        match event.get("type").and_then(Value::as_str) {
            Some("stream_event") => {
                if let Some(text) = event
                    .get("event")
                    .and_then(|e| e.get("delta"))
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    && let Some(on_chunk) = &on_chunk
                {
                    on_chunk(text);
                }
            }
            Some("assistant") => {
                // Complete turn; used as the response when no terminal
                // result event arrives
                if let Some(text) = assistant_text(&event) {
                    raw = text;
                }
            }
            Some("user") => {
                // Tool results flow back as user events; nothing to capture
            }
            Some("result") => {
                if let Some(result) = event.get("result").and_then(Value::as_str) {
                    parsed.response = result.to_string();
                }
                parsed.session_id = event
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string());
                parsed.duration_api_ms = event.get("duration_api_ms").and_then(Value::as_u64);
                parsed.cost_usd = event.get("total_cost_usd").and_then(Value::as_f64);
            }
            _ => {
                if !stream {
                    // Non-streaming single JSON document
                    if let Some(result) = event.get("result").and_then(Value::as_str) {
                        parsed.response = result.to_string();
                        parsed.session_id = event
                            .get("session_id")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string());
                        parsed.duration_api_ms = event.get("duration_api_ms").and_then(Value::as_u64);
                        parsed.cost_usd = event.get("total_cost_usd").and_then(Value::as_f64);
                    }
                }
            }
        }
    }

    if parsed.response.is_empty() {
        parsed.response = raw.trim_end().to_string();
    }
    parsed
}

/// Pull the concatenated text blocks out of an assistant event
fn assistant_text(event: &Value) -> Option<String> {
    let content = event.get("message")?.get("content")?.as_array()?;
    let text: String = content
        .iter()
        .filter_map(|block| {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                block.get("text").and_then(Value::as_str)
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() { None } else { Some(text) }
}
