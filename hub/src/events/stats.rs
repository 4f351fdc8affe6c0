//! Workflow execution statistics
//!
//! An in-process aggregator keeps a current `WorkflowExecutionStats` per
//! instance, updated on every node event, and persists it to `stats.json`
//! on a 1 s debounce plus immediately on terminal events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use hubstore::{DataDir, write_json_atomic};

use super::bus::{EventBus, Listener};
use super::types::Event;

const PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);

/// Per-node stats row
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub status: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Snapshot persisted as `stats.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionStats {
    pub instance_id: String,
    pub started_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
    pub retries: usize,
    pub total_duration_ms: u64,
    pub total_cost_usd: f64,
    pub nodes: HashMap<String, NodeStats>,
    pub updated_at: i64,
}

struct AggregatorInner {
    stats: WorkflowExecutionStats,
    last_persist: Option<Instant>,
    dirty: bool,
}

/// Aggregates node events for one task and persists the snapshot
#[derive(Clone)]
pub struct StatsAggregator {
    data: DataDir,
    task_id: String,
    inner: Arc<Mutex<AggregatorInner>>,
}

impl StatsAggregator {
    pub fn new(data: DataDir, task_id: impl Into<String>) -> Self {
        Self {
            data,
            task_id: task_id.into(),
            inner: Arc::new(Mutex::new(AggregatorInner {
                stats: WorkflowExecutionStats::default(),
                last_persist: None,
                dirty: false,
            })),
        }
    }

    /// Fold one event into the stats; persists debounced, immediately on
    /// terminal events
    pub fn apply(&self, event: &Event) {
        if event.task_id() != self.task_id {
            return;
        }

        let force_persist = event.is_terminal();
        {
            let mut inner = self.inner.lock().expect("stats aggregator poisoned");
            let stats = &mut inner.stats;

            match event {
                Event::WorkflowStarted { instance_id, .. } => {
                    stats.instance_id = instance_id.clone();
                }
                Event::NodeStarted { node_id, attempt, .. } => {
                    stats.started_nodes += 1;
                    if *attempt > 1 {
                        stats.retries += 1;
                    }
                    let row = stats.nodes.entry(node_id.clone()).or_default();
                    row.status = "running".to_string();
                    row.attempts = *attempt;
                }
                Event::NodeCompleted {
                    node_id,
                    duration_ms,
                    cost_usd,
                    ..
                } => {
                    stats.completed_nodes += 1;
                    stats.total_duration_ms += duration_ms;
                    if let Some(cost) = cost_usd {
                        stats.total_cost_usd += cost;
                    }
                    let row = stats.nodes.entry(node_id.clone()).or_default();
                    row.status = "done".to_string();
                    row.duration_ms = Some(*duration_ms);
                    row.cost_usd = *cost_usd;
                }
                Event::NodeFailed {
                    node_id, will_retry, ..
                } => {
                    if !will_retry {
                        stats.failed_nodes += 1;
                    }
                    let row = stats.nodes.entry(node_id.clone()).or_default();
                    row.status = if *will_retry { "retrying" } else { "failed" }.to_string();
                }
                Event::NodeSkipped { node_id, .. } => {
                    stats.skipped_nodes += 1;
                    let row = stats.nodes.entry(node_id.clone()).or_default();
                    row.status = "skipped".to_string();
                }
                _ => {}
            }

            stats.updated_at = hubstore::now_ms();
            inner.dirty = true;

            let due = match inner.last_persist {
                Some(last) => last.elapsed() >= PERSIST_DEBOUNCE,
                None => true,
            };
            if !(force_persist || due) {
                return;
            }
            inner.last_persist = Some(Instant::now());
            inner.dirty = false;
        }

        self.persist();
    }

    /// Write the snapshot now
    pub fn persist(&self) {
        let stats = self.inner.lock().expect("stats aggregator poisoned").stats.clone();
        if let Err(e) = write_json_atomic(self.data.stats_file(&self.task_id), &stats) {
            warn!(error = %e, task_id = %self.task_id, "StatsAggregator: persist failed");
        }
    }

    /// Flush any unpersisted changes (runner shutdown path)
    pub fn flush(&self) {
        let dirty = {
            let mut inner = self.inner.lock().expect("stats aggregator poisoned");
            let dirty = inner.dirty;
            inner.dirty = false;
            inner.last_persist = Some(Instant::now());
            dirty
        };
        if dirty {
            self.persist();
        }
    }

    pub fn snapshot(&self) -> WorkflowExecutionStats {
        self.inner.lock().expect("stats aggregator poisoned").stats.clone()
    }

    pub fn listener(&self) -> Listener {
        let aggregator = self.clone();
        Arc::new(move |event| {
            let aggregator = aggregator.clone();
            Box::pin(async move {
                aggregator.apply(&event);
                Ok(())
            })
        })
    }

    pub async fn register(&self, bus: &EventBus) {
        bus.on("stats-aggregator", self.listener()).await;
    }
}
