//! Workflow graph value types
//!
//! A workflow is authored once (parsed from the planner's JSON) and never
//! mutated afterwards. Node types form a closed sum; the engine dispatches
//! exhaustively over `NodeKind`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A directed workflow of nodes and edges, `workflow.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,

    /// Owning task
    #[serde(default)]
    pub task_id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Initial variable bindings copied into every new instance
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Default for Workflow {
    fn default() -> Self {
        Self {
            id: String::new(),
            task_id: String::new(),
            name: String::new(),
            description: String::new(),
            created_at: Utc::now(),
            variables: HashMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }
}

impl Workflow {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }

    pub fn end_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::End))
    }

    /// Edges arriving at `node_id`
    pub fn incoming(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == node_id)
    }

    /// Edges leaving `node_id`
    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == node_id)
    }
}

/// One step in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Closed sum of node types with their typed configs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    End,
    Task(TaskNodeConfig),
    Parallel,
    Join,
    Condition,
    Human(HumanNodeConfig),
    Delay(DelayNodeConfig),
    Schedule(ScheduleNodeConfig),
    Switch(SwitchNodeConfig),
    Assign(AssignNodeConfig),
    Script(ScriptNodeConfig),
    Loop(LoopNodeConfig),
    Foreach(ForeachNodeConfig),
}

impl NodeKind {
    /// Stable lowercase tag, matching the wire format
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task(_) => "task",
            Self::Parallel => "parallel",
            Self::Join => "join",
            Self::Condition => "condition",
            Self::Human(_) => "human",
            Self::Delay(_) => "delay",
            Self::Schedule(_) => "schedule",
            Self::Switch(_) => "switch",
            Self::Assign(_) => "assign",
            Self::Script(_) => "script",
            Self::Loop(_) => "loop",
            Self::Foreach(_) => "foreach",
        }
    }

    /// Marker nodes execute as no-ops; routing alone decides what follows
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            Self::Start | Self::End | Self::Parallel | Self::Join | Self::Condition
        )
    }
}

/// `task` node: one backend call under a persona
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskNodeConfig {
    /// Persona name resolved to a system prompt ("architect", "developer", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,

    /// Prompt template; `{{var}}` references resolve against the scope
    pub prompt: String,

    /// Instance variable to bind the text output to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,

    /// Continue the backend session from a prior task node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_from: Option<String>,

    /// Per-node attempt ceiling override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// `human` node: emit an approval request and wait
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HumanNodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Auto-approve after this many ms instead of waiting forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_approve_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DelayNodeConfig {
    pub delay_ms: u64,
}

/// Defer until a wall-clock instant (RFC3339)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleNodeConfig {
    pub at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SwitchNodeConfig {
    pub cases: Vec<SwitchCase>,

    /// Target when no case matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchCase {
    pub condition: String,
    pub target: String,
}

/// `assign` node: evaluate each expression, merge into instance variables
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssignNodeConfig {
    /// variable name -> expression
    pub assignments: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScriptNodeConfig {
    pub expression: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoopNodeConfig {
    /// Loop continues while this evaluates truthy
    pub condition: String,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForeachMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ForeachNodeConfig {
    /// Expression producing the collection
    pub items: String,

    #[serde(default = "default_item_var")]
    pub item_var: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,

    #[serde(default)]
    pub mode: ForeachMode,
}

fn default_item_var() -> String {
    "item".to_string()
}

/// A directed edge, optionally guarded by a condition expression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from: String,

    pub to: String,

    /// Expression guarding traversal; empty/absent means always
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Ceiling for traversals of a back-edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loops: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            max_loops: None,
            label: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Back-edges (loop/foreach repetition) carry a `maxLoops` ceiling
    pub fn is_loop_back(&self) -> bool {
        self.max_loops.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_workflow_json() -> &'static str {
        r#"{
            "id": "wf-1",
            "name": "sample",
            "variables": {"count": 0},
            "nodes": [
                {"id": "start", "type": "start", "name": "Start"},
                {"id": "build", "type": "task", "name": "Build", "persona": "developer",
                 "prompt": "Implement {{variables.feature}}", "outputVar": "buildResult"},
                {"id": "gate", "type": "human", "name": "Review gate"},
                {"id": "wait", "type": "delay", "delayMs": 5000},
                {"id": "each", "type": "foreach", "items": "variables.files", "itemVar": "file"},
                {"id": "again", "type": "loop", "condition": "loopCount < 3", "maxIterations": 3},
                {"id": "end", "type": "end"}
            ],
            "edges": [
                {"from": "start", "to": "build"},
                {"from": "build", "to": "gate", "condition": "len(outputs.build._raw) > 0"},
                {"from": "again", "to": "build", "maxLoops": 3},
                {"from": "gate", "to": "end"}
            ]
        }"#
    }

    #[test]
    fn test_parse_workflow_json() {
        let wf: Workflow = serde_json::from_str(sample_workflow_json()).unwrap();
        assert_eq!(wf.nodes.len(), 7);
        assert_eq!(wf.edges.len(), 4);
        assert!(wf.start_node().is_some());
        assert!(wf.end_node().is_some());

        match &wf.node("build").unwrap().kind {
            NodeKind::Task(config) => {
                assert_eq!(config.persona.as_deref(), Some("developer"));
                assert_eq!(config.output_var.as_deref(), Some("buildResult"));
            }
            other => panic!("expected task node, got {:?}", other),
        }

        match &wf.node("wait").unwrap().kind {
            NodeKind::Delay(config) => assert_eq!(config.delay_ms, 5000),
            other => panic!("expected delay node, got {:?}", other),
        }
    }

    #[test]
    fn test_serde_roundtrip_structural_equality() {
        let wf: Workflow = serde_json::from_str(sample_workflow_json()).unwrap();
        let json = serde_json::to_string(&wf).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();

        assert_eq!(serde_json::to_value(&wf).unwrap(), serde_json::to_value(&back).unwrap());
    }

    #[test]
    fn test_loop_back_edge_detection() {
        let wf: Workflow = serde_json::from_str(sample_workflow_json()).unwrap();
        let back_edges: Vec<_> = wf.edges.iter().filter(|e| e.is_loop_back()).collect();
        assert_eq!(back_edges.len(), 1);
        assert_eq!(back_edges[0].from, "again");
    }

    #[test]
    fn test_incoming_outgoing() {
        let wf: Workflow = serde_json::from_str(sample_workflow_json()).unwrap();
        assert_eq!(wf.incoming("build").count(), 2);
        assert_eq!(wf.outgoing("start").count(), 1);
    }

    #[test]
    fn test_foreach_defaults() {
        let json = r#"{"id": "n", "type": "foreach", "items": "variables.xs"}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        match node.kind {
            NodeKind::Foreach(config) => {
                assert_eq!(config.item_var, "item");
                assert_eq!(config.mode, ForeachMode::Sequential);
            }
            other => panic!("expected foreach, got {:?}", other),
        }
    }

    #[test]
    fn test_marker_nodes() {
        for json in [
            r#"{"id": "n", "type": "start"}"#,
            r#"{"id": "n", "type": "join"}"#,
            r#"{"id": "n", "type": "condition"}"#,
        ] {
            let node: Node = serde_json::from_str(json).unwrap();
            assert!(node.kind.is_marker());
        }
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let json = r#"{"id": "n", "type": "teleport"}"#;
        assert!(serde_json::from_str::<Node>(json).is_err());
    }
}
