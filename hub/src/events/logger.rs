//! Per-task event logging
//!
//! Mirrors every lifecycle event into the task's log files: a structured
//! line in `events.jsonl` and a human-readable line in `execution.log`
//! (`ISO-ts LEVEL [scope] message`).

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::warn;

use hubstore::{DataDir, append_jsonl};

use super::bus::{EventBus, Listener};
use super::types::{Event, EventLogEntry};

/// Writes lifecycle events into the owning task's log directory
#[derive(Clone)]
pub struct TaskEventLogger {
    data: DataDir,
}

impl TaskEventLogger {
    pub fn new(data: DataDir) -> Self {
        Self { data }
    }

    /// Append one event to both log files
    pub fn write(&self, event: &Event) -> eyre::Result<()> {
        let task_id = event.task_id();

        append_jsonl(self.data.events_log_file(task_id), &EventLogEntry::now(event.clone()))?;
        self.write_execution_line(task_id, event.log_level(), event.event_type(), &event.log_line())?;
        Ok(())
    }

    /// Append a human-readable execution log line
    pub fn write_execution_line(&self, task_id: &str, level: &str, scope: &str, message: &str) -> eyre::Result<()> {
        let path = self.data.execution_log_file(task_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{} {} [{}] {}", ts, level, scope, message)?;
        Ok(())
    }

    /// Listener for registration on the event bus
    pub fn listener(&self) -> Listener {
        let logger = self.clone();
        Arc::new(move |event| {
            let logger = logger.clone();
            Box::pin(async move {
                if let Err(e) = logger.write(&event) {
                    warn!(error = %e, "TaskEventLogger: write failed");
                }
                Ok(())
            })
        })
    }

    /// Register on a bus under the standard name
    pub async fn register(&self, bus: &EventBus) {
        bus.on("task-event-logger", self.listener()).await;
    }
}

/// Append a structured conversation entry plus its readable twin
///
/// Conversations with the backend are recorded separately from lifecycle
/// events so transcripts survive even when the instance is rewritten.
pub fn record_conversation(
    data: &DataDir,
    task_id: &str,
    role: &str,
    node_id: Option<&str>,
    content: &str,
) -> eyre::Result<()> {
    #[derive(serde::Serialize)]
    #[serde(rename_all = "camelCase")]
    struct ConversationEntry<'a> {
        ts: chrono::DateTime<Utc>,
        role: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<&'a str>,
        content: &'a str,
    }

    append_jsonl(
        data.conversation_jsonl_file(task_id),
        &ConversationEntry {
            ts: Utc::now(),
            role,
            node_id,
            content,
        },
    )?;

    let path = data.conversation_log_file(task_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "=== {} [{}] {}", ts, role, node_id.unwrap_or("-"))?;
    writeln!(file, "{}", content.trim_end())?;
    writeln!(file)?;
    Ok(())
}
