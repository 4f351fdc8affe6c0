//! Task - the user-visible unit of work
//!
//! A task owns one workflow, one instance, and at most one live runner
//! process at a time. Status transitions are validated here; everything
//! else that mutates a task goes through its owning runner.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hubstore::now_ms;

use super::id::generate_id;
use super::priority::Priority;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, runner not yet started
    #[default]
    Pending,
    /// Runner is generating the workflow
    Planning,
    /// Workflow instance is executing
    Developing,
    /// Final review/report phase
    Reviewing,
    /// Execution suspended by an external caller
    Paused,
    /// Blocked on a human approval node
    Waiting,
    /// Terminal: finished successfully
    Completed,
    /// Terminal: failed with retries exhausted
    Failed,
    /// Terminal: cancelled by user
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States in which a runner process should exist (or be resumable)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Planning | Self::Developing | Self::Reviewing | Self::Waiting
        )
    }

    /// Check a transition against the authoritative state machine
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == next {
            return false;
        }
        match (*self, next) {
            // Any non-terminal state may fail or be cancelled
            (from, Failed | Cancelled) if !from.is_terminal() => true,
            (Pending, Planning) => true,
            // Resume of an already-planned task skips the planning phase
            (Pending, Developing) => true,
            (Planning, Developing) => true,
            (Developing, Paused) | (Paused, Developing) => true,
            (Developing, Waiting) | (Waiting, Developing) => true,
            (Waiting, Paused) | (Paused, Waiting) => true,
            (Developing, Reviewing) => true,
            (Reviewing, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Developing => "developing",
            Self::Reviewing => "reviewing",
            Self::Paused => "paused",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "developing" => Ok(Self::Developing),
            "reviewing" => Ok(Self::Reviewing),
            "paused" => Ok(Self::Paused),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Where a task came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Cli,
    Chat { chat_id: String },
    Webhook { origin: String },
    Schedule,
}

/// A user-visible unit of work
///
/// Persisted as `task.json` with camelCase keys; external tools read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier (immutable)
    pub id: String,

    /// Short human title
    pub title: String,

    /// Free-form description handed to the planner
    pub description: String,

    pub priority: Priority,

    pub status: TaskStatus,

    /// Optional assignee label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Cron expression for recurring scheduling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_cron: Option<String>,

    /// Times this task has been restarted after failure
    pub retry_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<TaskSource>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Final output summary, set when the task reaches a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Why the task was paused, if it is
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,

    /// Terminal error, if the task failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Create a new pending task with a generated id
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: generate_id("task", &title),
            title,
            description: description.into(),
            priority: Priority::default(),
            status: TaskStatus::Pending,
            assignee: None,
            schedule_cron: None,
            retry_count: 0,
            source: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            output: None,
            pause_reason: None,
            error: None,
        }
    }

    /// Create with a fixed id (tests and resume paths)
    pub fn with_id(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let mut task = Self::new(title, description);
        task.id = id.into();
        task
    }

    /// Apply a status transition, updating `updated_at`
    ///
    /// Returns an error message on an invalid transition; the caller maps
    /// it to a user error.
    pub fn transition_to(&mut self, next: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!("Invalid task transition: {} -> {}", self.status, next));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Force a status without validation (crash recovery only)
    pub fn set_status_unchecked(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Runner process record, `process.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub pid: u32,
    /// Unix ms when the runner started
    pub started_at: i64,
    /// Mirror of the task status at last write
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessRecord {
    pub fn for_current_process(status: &TaskStatus) -> Self {
        Self {
            pid: std::process::id(),
            started_at: now_ms(),
            status: status.to_string(),
            last_heartbeat: Some(now_ms()),
            error: None,
        }
    }

    /// Whether the recorded PID is a live process
    pub fn is_alive(&self) -> bool {
        self.pid != 0 && hubstore::lock::process_alive(self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("Fix login", "The login page 500s");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.retry_count, 0);
        assert!(task.id.contains("-task-"));
        assert!(task.created_at <= task.updated_at);
    }

    #[test]
    fn test_valid_transition_chain() {
        let mut task = Task::new("t", "d");
        task.transition_to(TaskStatus::Planning).unwrap();
        task.transition_to(TaskStatus::Developing).unwrap();
        task.transition_to(TaskStatus::Paused).unwrap();
        task.transition_to(TaskStatus::Developing).unwrap();
        task.transition_to(TaskStatus::Waiting).unwrap();
        task.transition_to(TaskStatus::Developing).unwrap();
        task.transition_to(TaskStatus::Reviewing).unwrap();
        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut task = Task::new("t", "d");
        assert!(task.transition_to(TaskStatus::Completed).is_err());
        assert!(task.transition_to(TaskStatus::Reviewing).is_err());

        task.transition_to(TaskStatus::Planning).unwrap();
        assert!(task.transition_to(TaskStatus::Paused).is_err());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut task = Task::new("t", "d");
        task.transition_to(TaskStatus::Cancelled).unwrap();
        assert!(task.transition_to(TaskStatus::Planning).is_err());
        assert!(task.transition_to(TaskStatus::Failed).is_err());
    }

    #[test]
    fn test_any_active_state_can_fail() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Planning,
            TaskStatus::Developing,
            TaskStatus::Paused,
            TaskStatus::Waiting,
            TaskStatus::Reviewing,
        ] {
            assert!(status.can_transition_to(TaskStatus::Failed), "{} -> failed", status);
            assert!(status.can_transition_to(TaskStatus::Cancelled), "{} -> cancelled", status);
        }
    }

    #[test]
    fn test_task_serde_roundtrip() {
        let mut task = Task::new("Round trip", "desc");
        task.metadata
            .insert("key".to_string(), serde_json::json!({"nested": true}));
        task.schedule_cron = Some("0 0 * * * *".to_string());

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.schedule_cron, task.schedule_cron);
        assert_eq!(back.metadata["key"]["nested"], serde_json::json!(true));
    }

    #[test]
    fn test_process_record_alive() {
        let record = ProcessRecord::for_current_process(&TaskStatus::Developing);
        assert!(record.is_alive());

        let dead = ProcessRecord {
            pid: 4194999,
            ..Default::default()
        };
        assert!(!dead.is_alive());
    }
}
