//! Workflow instance - the runtime state of one execution
//!
//! The instance is the coordination substrate between the runner, the
//! worker, and external callers: every node transition is persisted
//! atomically so observers re-derive state from disk.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::Workflow;
use crate::domain::generate_id;

/// Node runtime status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet eligible
    #[default]
    Pending,
    /// Dependencies satisfied, job enqueued
    Ready,
    /// A worker is executing it
    Running,
    /// Blocked on human approval or an external wakeup
    Waiting,
    /// Finished successfully
    Done,
    /// Finished with retries exhausted
    Failed,
    /// Pruned by a false edge condition
    Skipped,
}

impl NodeStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Per-node runtime state
///
/// `attempts` here is the canonical retry count; the queued job only
/// carries a copy for log lines.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub status: NodeStatus,

    pub attempts: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Runtime state of one workflow execution, `instance.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,

    pub workflow_id: String,

    pub status: InstanceStatus,

    /// Covers exactly the workflow's node ids
    pub node_states: HashMap<String, NodeState>,

    /// Mutable variable scope
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    /// Node id -> produced value
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,

    /// Loop node id -> completed iteration count
    #[serde(default)]
    pub loop_counts: HashMap<String, u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowInstance {
    /// Create a fresh instance for a workflow: every node pending, the
    /// workflow's initial variables copied in
    pub fn for_workflow(workflow: &Workflow) -> Self {
        let node_states = workflow
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::default()))
            .collect();

        Self {
            id: generate_id("inst", &workflow.name),
            workflow_id: workflow.id.clone(),
            status: InstanceStatus::Pending,
            node_states,
            variables: workflow.variables.clone(),
            outputs: HashMap::new(),
            loop_counts: HashMap::new(),
            started_at: None,
            completed_at: None,
            paused_at: None,
            pause_reason: None,
            error: None,
        }
    }

    pub fn node_state(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.node_states.get(node_id).map(|s| s.status).unwrap_or_default()
    }

    /// Nodes currently in `running`
    pub fn running_nodes(&self) -> Vec<&str> {
        self.node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Running)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn has_running_nodes(&self) -> bool {
        self.node_states.values().any(|s| s.status == NodeStatus::Running)
    }

    pub fn has_failed_nodes(&self) -> bool {
        self.node_states.values().any(|s| s.status == NodeStatus::Failed)
    }

    /// Mark a node running and stamp `started_at`
    pub fn mark_node_running(&mut self, node_id: &str) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::Running;
            state.attempts += 1;
            state.started_at = Some(Utc::now());
            state.error = None;
        }
    }

    /// Mark a node done with its result, stamping duration
    pub fn mark_node_done(&mut self, node_id: &str, result: Option<serde_json::Value>) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            let now = Utc::now();
            state.status = NodeStatus::Done;
            state.completed_at = Some(now);
            state.duration_ms = state
                .started_at
                .map(|s| (now - s).num_milliseconds().max(0) as u64);
            state.result = result;
        }
    }

    pub fn mark_node_failed(&mut self, node_id: &str, error: impl Into<String>) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            let now = Utc::now();
            state.status = NodeStatus::Failed;
            state.completed_at = Some(now);
            state.duration_ms = state
                .started_at
                .map(|s| (now - s).num_milliseconds().max(0) as u64);
            state.error = Some(error.into());
        }
    }

    /// Rewind a failed node for another attempt
    pub fn rewind_node_for_retry(&mut self, node_id: &str) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::Ready;
            state.completed_at = None;
            state.duration_ms = None;
        }
    }

    pub fn mark_node_waiting(&mut self, node_id: &str) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::Waiting;
        }
    }

    pub fn mark_node_skipped(&mut self, node_id: &str) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            state.status = NodeStatus::Skipped;
            state.completed_at = Some(Utc::now());
        }
    }

    /// Counts per status; the sum always equals the node count
    pub fn status_counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for state in self.node_states.values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Edge, Node, NodeKind};

    fn two_node_workflow() -> Workflow {
        Workflow {
            id: "wf-1".to_string(),
            name: "test".to_string(),
            variables: HashMap::from([("seed".to_string(), serde_json::json!(1))]),
            nodes: vec![
                Node {
                    id: "start".to_string(),
                    name: "Start".to_string(),
                    kind: NodeKind::Start,
                },
                Node {
                    id: "end".to_string(),
                    name: "End".to_string(),
                    kind: NodeKind::End,
                },
            ],
            edges: vec![Edge::new("start", "end")],
            ..Default::default()
        }
    }

    #[test]
    fn test_for_workflow_covers_all_nodes() {
        let wf = two_node_workflow();
        let instance = WorkflowInstance::for_workflow(&wf);

        assert_eq!(instance.node_states.len(), 2);
        assert_eq!(instance.node_status("start"), NodeStatus::Pending);
        assert_eq!(instance.variables["seed"], serde_json::json!(1));
        assert_eq!(instance.workflow_id, "wf-1");
    }

    #[test]
    fn test_node_lifecycle_stamps() {
        let wf = two_node_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);

        instance.mark_node_running("start");
        assert_eq!(instance.node_status("start"), NodeStatus::Running);
        assert_eq!(instance.node_state("start").unwrap().attempts, 1);
        assert!(instance.node_state("start").unwrap().started_at.is_some());

        instance.mark_node_done("start", Some(serde_json::json!({"_raw": "ok"})));
        let state = instance.node_state("start").unwrap();
        assert_eq!(state.status, NodeStatus::Done);
        assert!(state.completed_at.is_some());
        assert!(state.duration_ms.is_some());
    }

    #[test]
    fn test_retry_rewind_preserves_attempts() {
        let wf = two_node_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);

        instance.mark_node_running("start");
        instance.mark_node_failed("start", "boom");
        assert_eq!(instance.node_status("start"), NodeStatus::Failed);

        instance.rewind_node_for_retry("start");
        assert_eq!(instance.node_status("start"), NodeStatus::Ready);
        assert_eq!(instance.node_state("start").unwrap().attempts, 1);

        instance.mark_node_running("start");
        assert_eq!(instance.node_state("start").unwrap().attempts, 2);
    }

    #[test]
    fn test_status_counts_sum_to_node_count() {
        let wf = two_node_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.mark_node_running("start");

        let counts = instance.status_counts();
        let total: usize = counts.values().sum();
        assert_eq!(total, wf.nodes.len());
    }

    #[test]
    fn test_instance_serde_roundtrip() {
        let wf = two_node_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.mark_node_running("start");
        instance.mark_node_done("start", Some(serde_json::json!({"_raw": "text"})));
        instance.outputs.insert("start".to_string(), serde_json::json!({"_raw": "text"}));

        let json = serde_json::to_string(&instance).unwrap();
        let back: WorkflowInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(
            serde_json::to_value(&instance).unwrap(),
            serde_json::to_value(&back).unwrap()
        );
    }

    #[test]
    fn test_running_nodes_listing() {
        let wf = two_node_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        assert!(!instance.has_running_nodes());

        instance.mark_node_running("end");
        assert_eq!(instance.running_nodes(), vec!["end"]);
    }
}
