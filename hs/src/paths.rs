//! Data directory layout
//!
//! The layout is stable: other tools read these paths directly.
//!
//! ```text
//! <data-dir>/
//!   queue.json               # global job queue
//!   queue.json.lock          # queue lock (holder PID)
//!   sessions.json            # chat sessions
//!   daemon.pid               # daemon process id
//!   logs/agenthub.log        # daemon/CLI tracing output
//!   tasks/<taskId>/
//!     task.json workflow.json instance.json process.json stats.json
//!     logs/{execution.log, events.jsonl, conversation.log, conversation.jsonl}
//!     outputs/result.md
//!   memories/<memoryId>.json
//!   failure-kb/<id>.json
//! ```

use std::path::{Path, PathBuf};

use crate::StoreError;

/// Root of the on-disk layout; cheap to clone and pass around
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Wrap an existing or to-be-created data directory root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the top-level directories
    pub fn ensure(&self) -> Result<(), StoreError> {
        for dir in [
            self.root.clone(),
            self.tasks_dir(),
            self.memories_dir(),
            self.failure_kb_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // === Global files ===

    pub fn queue_file(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    pub fn queue_lock_file(&self) -> PathBuf {
        self.root.join("queue.json.lock")
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn daemon_log_file(&self) -> PathBuf {
        self.logs_dir().join("agenthub.log")
    }

    // === Per-task files ===

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id)
    }

    pub fn task_file(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("task.json")
    }

    pub fn workflow_file(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("workflow.json")
    }

    pub fn instance_file(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("instance.json")
    }

    pub fn process_file(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("process.json")
    }

    pub fn stats_file(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("stats.json")
    }

    pub fn task_logs_dir(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("logs")
    }

    pub fn execution_log_file(&self, task_id: &str) -> PathBuf {
        self.task_logs_dir(task_id).join("execution.log")
    }

    pub fn events_log_file(&self, task_id: &str) -> PathBuf {
        self.task_logs_dir(task_id).join("events.jsonl")
    }

    pub fn conversation_log_file(&self, task_id: &str) -> PathBuf {
        self.task_logs_dir(task_id).join("conversation.log")
    }

    pub fn conversation_jsonl_file(&self, task_id: &str) -> PathBuf {
        self.task_logs_dir(task_id).join("conversation.jsonl")
    }

    pub fn task_outputs_dir(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("outputs")
    }

    pub fn result_file(&self, task_id: &str) -> PathBuf {
        self.task_outputs_dir(task_id).join("result.md")
    }

    /// List task ids by directory name, sorted for determinism
    pub fn list_task_ids(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(self.tasks_dir()) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .collect();
        ids.sort();
        ids
    }

    // === Memory / failure KB ===

    pub fn memories_dir(&self) -> PathBuf {
        self.root.join("memories")
    }

    pub fn memory_file(&self, memory_id: &str) -> PathBuf {
        self.memories_dir().join(format!("{}.json", memory_id))
    }

    pub fn failure_kb_dir(&self) -> PathBuf {
        self.root.join("failure-kb")
    }

    pub fn failure_file(&self, id: &str) -> PathBuf {
        self.failure_kb_dir().join(format!("{}.json", id))
    }
}
