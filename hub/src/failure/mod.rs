//! Failure knowledge base
//!
//! Permanent node failures are recorded under `failure-kb/` keyed by a
//! normalized message pattern. The planner feeds the most frequent recent
//! entries back into planning prompts as known pitfalls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use hubstore::{DataDir, list_files_with_suffix, read_json_opt, write_json_atomic};

use crate::domain::generate_id;

/// One recorded failure pattern, `failure-kb/<id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub id: String,

    /// Retry category the failure classified into
    pub category: String,

    /// Normalized pattern used for dedup
    pub pattern: String,

    /// Last full message observed
    pub message: String,

    pub task_id: String,

    pub node_id: String,

    pub count: u32,

    pub first_seen_at: DateTime<Utc>,

    pub last_seen_at: DateTime<Utc>,
}

/// Failure KB over one data directory
#[derive(Debug, Clone)]
pub struct FailureKb {
    data: DataDir,
}

impl FailureKb {
    pub fn new(data: DataDir) -> Self {
        Self { data }
    }

    /// Record a failure, merging with an existing record when the
    /// normalized pattern matches
    pub fn record(&self, task_id: &str, node_id: &str, category: &str, message: &str) -> eyre::Result<String> {
        let pattern = normalize_pattern(message);
        let now = Utc::now();

        if let Some(mut existing) = self.find_by_pattern(&pattern) {
            existing.count += 1;
            existing.last_seen_at = now;
            existing.message = message.to_string();
            existing.task_id = task_id.to_string();
            existing.node_id = node_id.to_string();
            write_json_atomic(self.data.failure_file(&existing.id), &existing)?;
            debug!(failure_id = %existing.id, count = existing.count, "FailureKb::record: merged");
            return Ok(existing.id);
        }

        let record = FailureRecord {
            id: generate_id("fail", &pattern),
            category: category.to_string(),
            pattern,
            message: message.to_string(),
            task_id: task_id.to_string(),
            node_id: node_id.to_string(),
            count: 1,
            first_seen_at: now,
            last_seen_at: now,
        };
        write_json_atomic(self.data.failure_file(&record.id), &record)?;
        debug!(failure_id = %record.id, "FailureKb::record: created");
        Ok(record.id)
    }

    pub fn load_all(&self) -> Vec<FailureRecord> {
        list_files_with_suffix(self.data.failure_kb_dir(), ".json")
            .into_iter()
            .filter_map(read_json_opt::<FailureRecord>)
            .collect()
    }

    fn find_by_pattern(&self, pattern: &str) -> Option<FailureRecord> {
        self.load_all().into_iter().find(|r| r.pattern == pattern)
    }

    /// Most frequent failure patterns, rendered for the planning prompt
    pub fn top_lessons(&self, limit: usize) -> Vec<String> {
        let mut records = self.load_all();
        records.sort_by(|a, b| b.count.cmp(&a.count).then(b.last_seen_at.cmp(&a.last_seen_at)));
        records
            .into_iter()
            .take(limit)
            .map(|r| format!("seen {}x ({}): {}", r.count, r.category, r.pattern))
            .collect()
    }
}

/// Normalize a message into a dedup pattern: lowercase, digits collapsed,
/// capped length
fn normalize_pattern(message: &str) -> String {
    let mut out = String::with_capacity(120);
    let mut last_was_digit = false;
    for c in message.to_lowercase().chars() {
        if out.chars().count() >= 120 {
            break;
        }
        if c.is_ascii_digit() {
            if !last_was_digit {
                out.push('#');
            }
            last_was_digit = true;
        } else {
            last_was_digit = false;
            out.push(c);
        }
    }
    out.trim().to_string()
}
