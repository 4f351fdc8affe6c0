//! Lifecycle event types
//!
//! Events form a closed sum serialized into `events.jsonl` with their
//! wire names (`workflow:started`, `node:completed`, ...). Subscribers
//! re-register on process start; nothing about a subscription persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every lifecycle event the hub emits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    #[serde(rename = "workflow:started")]
    WorkflowStarted {
        task_id: String,
        instance_id: String,
        workflow_id: String,
    },

    #[serde(rename = "workflow:progress")]
    WorkflowProgress {
        task_id: String,
        instance_id: String,
        settled_nodes: usize,
        total_nodes: usize,
    },

    #[serde(rename = "node:started")]
    NodeStarted {
        task_id: String,
        instance_id: String,
        node_id: String,
        node_type: String,
        attempt: u32,
    },

    #[serde(rename = "node:completed")]
    NodeCompleted {
        task_id: String,
        instance_id: String,
        node_id: String,
        node_type: String,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
    },

    #[serde(rename = "node:failed")]
    NodeFailed {
        task_id: String,
        instance_id: String,
        node_id: String,
        error: String,
        attempt: u32,
        will_retry: bool,
    },

    #[serde(rename = "node:skipped")]
    NodeSkipped {
        task_id: String,
        instance_id: String,
        node_id: String,
    },

    #[serde(rename = "approval:requested")]
    ApprovalRequested {
        task_id: String,
        instance_id: String,
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },

    #[serde(rename = "workflow:completed")]
    WorkflowCompleted { task_id: String, instance_id: String },

    #[serde(rename = "workflow:failed")]
    WorkflowFailed {
        task_id: String,
        instance_id: String,
        error: String,
    },

    #[serde(rename = "task:completed")]
    TaskCompleted {
        task_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl Event {
    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow:started",
            Self::WorkflowProgress { .. } => "workflow:progress",
            Self::NodeStarted { .. } => "node:started",
            Self::NodeCompleted { .. } => "node:completed",
            Self::NodeFailed { .. } => "node:failed",
            Self::NodeSkipped { .. } => "node:skipped",
            Self::ApprovalRequested { .. } => "approval:requested",
            Self::WorkflowCompleted { .. } => "workflow:completed",
            Self::WorkflowFailed { .. } => "workflow:failed",
            Self::TaskCompleted { .. } => "task:completed",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { task_id, .. }
            | Self::WorkflowProgress { task_id, .. }
            | Self::NodeStarted { task_id, .. }
            | Self::NodeCompleted { task_id, .. }
            | Self::NodeFailed { task_id, .. }
            | Self::NodeSkipped { task_id, .. }
            | Self::ApprovalRequested { task_id, .. }
            | Self::WorkflowCompleted { task_id, .. }
            | Self::WorkflowFailed { task_id, .. }
            | Self::TaskCompleted { task_id, .. } => task_id,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::NodeSkipped { node_id, .. }
            | Self::ApprovalRequested { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Events that end a workflow or task
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. } | Self::TaskCompleted { .. }
        )
    }

    /// One human-readable line for `execution.log`
    pub fn log_line(&self) -> String {
        match self {
            Self::WorkflowStarted { instance_id, .. } => {
                format!("workflow started instance={}", instance_id)
            }
            Self::WorkflowProgress {
                settled_nodes,
                total_nodes,
                ..
            } => format!("progress {}/{} nodes settled", settled_nodes, total_nodes),
            Self::NodeStarted {
                node_id,
                node_type,
                attempt,
                ..
            } => format!("node {} ({}) started attempt={}", node_id, node_type, attempt),
            Self::NodeCompleted {
                node_id, duration_ms, ..
            } => format!("node {} completed in {}ms", node_id, duration_ms),
            Self::NodeFailed {
                node_id,
                error,
                will_retry,
                ..
            } => format!("node {} failed (retry={}): {}", node_id, will_retry, error),
            Self::NodeSkipped { node_id, .. } => format!("node {} skipped", node_id),
            Self::ApprovalRequested { node_id, .. } => {
                format!("node {} waiting for approval", node_id)
            }
            Self::WorkflowCompleted { instance_id, .. } => {
                format!("workflow completed instance={}", instance_id)
            }
            Self::WorkflowFailed { error, .. } => format!("workflow failed: {}", error),
            Self::TaskCompleted { status, .. } => format!("task finished status={}", status),
        }
    }

    /// Log level for the human-readable line
    pub fn log_level(&self) -> &'static str {
        match self {
            Self::NodeFailed { .. } | Self::WorkflowFailed { .. } => "ERROR",
            Self::NodeSkipped { .. } => "DEBUG",
            _ => "INFO",
        }
    }
}

/// One line of `events.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub ts: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: Event,
}

impl EventLogEntry {
    pub fn now(payload: Event) -> Self {
        Self {
            ts: Utc::now(),
            payload,
        }
    }
}
