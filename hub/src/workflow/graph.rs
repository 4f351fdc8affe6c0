//! Graph computations over a workflow instance
//!
//! The scheduler is driven entirely by `compute_ready`: a pure function of
//! (workflow, instance) that decides which pending nodes can run, which
//! were pruned by false edge conditions, and whether the instance has
//! reached a terminal shape. Routing after a node completes goes through
//! `compute_next`.

use std::collections::{HashMap, HashSet};

use serde_json::{Value, json};
use tracing::{debug, warn};

use super::expr;
use super::instance::{NodeStatus, WorkflowInstance};
use super::model::{NodeKind, Workflow};

/// Result of a readiness sweep
#[derive(Debug, Default, Clone)]
pub struct ReadySet {
    /// Nodes whose dependencies are satisfied and should be enqueued
    pub ready: Vec<String>,
    /// Nodes pruned because every live incoming path was skipped or guarded
    /// by a false condition
    pub skipped: Vec<String>,
}

/// A routing target produced after a node completes
#[derive(Debug, Clone, PartialEq)]
pub struct NextNode {
    pub id: String,
    /// Target was already settled (loop re-entry) and must be rewound to
    /// pending before enqueueing
    pub needs_reset: bool,
}

/// Build the expression scope for an instance, with optional loop-locals
/// (`item`, `index`, `total`) layered on top
pub fn build_scope(instance: &WorkflowInstance, locals: Option<&HashMap<String, Value>>) -> Value {
    let node_states: serde_json::Map<String, Value> = instance
        .node_states
        .iter()
        .map(|(id, state)| {
            (
                id.clone(),
                json!({
                    "status": state.status.to_string(),
                    "attempts": state.attempts,
                }),
            )
        })
        .collect();

    let mut scope = serde_json::Map::new();
    scope.insert("outputs".to_string(), json!(instance.outputs));
    scope.insert("variables".to_string(), json!(instance.variables));
    scope.insert("loopCounts".to_string(), json!(instance.loop_counts));
    scope.insert("nodeStates".to_string(), Value::Object(node_states));
    scope.insert("inputs".to_string(), json!({}));

    if let Some(locals) = locals {
        for (key, value) in locals {
            scope.insert(key.clone(), value.clone());
        }
    }

    Value::Object(scope)
}

/// Scope for expressions evaluated in the context of one node (exposes
/// that node's `loopCount`)
pub fn build_node_scope(
    instance: &WorkflowInstance,
    node_id: &str,
    locals: Option<&HashMap<String, Value>>,
) -> Value {
    let mut scope = build_scope(instance, locals);
    if let Value::Object(map) = &mut scope {
        let count = instance.loop_counts.get(node_id).copied().unwrap_or(0);
        map.insert("loopCount".to_string(), json!(count));
    }
    scope
}

/// Evaluate an edge condition; empty is always-true, an evaluation error
/// is logged and treated as false so a bad guard never wedges a workflow
fn edge_condition_truthy(condition: Option<&str>, scope: &Value) -> bool {
    match condition {
        None => true,
        Some(cond) => match expr::evaluate_condition(cond, scope) {
            Ok(truthy) => truthy,
            Err(e) => {
                warn!(condition = cond, error = %e, "edge condition failed to evaluate, treating as false");
                false
            }
        },
    }
}

/// How one incoming edge looks from its target's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeClass {
    /// Source not settled yet
    Blocked,
    /// Source finished and this edge fires
    Live,
    /// This path can never fire (skipped/failed source, false guard,
    /// or an iteration head that routed elsewhere for good)
    Dead,
    /// An iteration head is still looping; this exit edge may fire on a
    /// later pass
    Deferred,
}

/// Classify one incoming edge. Edges out of a done loop/foreach head fire
/// directionally: body edges while the head reports it is continuing,
/// exit edges once it reports done.
fn classify_edge(
    workflow: &Workflow,
    instance: &WorkflowInstance,
    statuses: &HashMap<String, NodeStatus>,
    edge: &super::model::Edge,
    scope: &Value,
) -> EdgeClass {
    let source_status = statuses.get(&edge.from).copied().unwrap_or_default();
    if !source_status.is_settled() {
        return EdgeClass::Blocked;
    }
    if source_status != NodeStatus::Done {
        return EdgeClass::Dead;
    }
    if !edge_condition_truthy(edge.condition.as_deref(), scope) {
        return EdgeClass::Dead;
    }

    let Some(source) = workflow.node(&edge.from) else {
        return EdgeClass::Live;
    };
    let Some(continuing) = iteration_continuing(instance, source) else {
        return EdgeClass::Live;
    };

    let (body, _) = iteration_targets(workflow, &edge.from);
    let is_body_edge = body.contains(&edge.to);
    match (continuing, is_body_edge) {
        (true, true) => EdgeClass::Live,
        (true, false) => EdgeClass::Deferred,
        (false, false) => EdgeClass::Live,
        (false, true) => EdgeClass::Dead,
    }
}

/// What a done iteration head last decided, from its recorded output.
/// `None` for non-iteration nodes or heads without output.
fn iteration_continuing(instance: &WorkflowInstance, node: &super::model::Node) -> Option<bool> {
    let output = instance.outputs.get(&node.id)?;
    match node.kind {
        NodeKind::Loop(_) => output.get("shouldContinue").and_then(Value::as_bool),
        NodeKind::Foreach(_) => output.get("done").and_then(Value::as_bool).map(|done| !done),
        _ => None,
    }
}

/// Compute the nodes that are ready to run and the nodes pruned by
/// condition evaluation. Skips cascade within a single call: a node
/// pruned here can settle its successors in the same sweep.
pub fn compute_ready(workflow: &Workflow, instance: &WorkflowInstance) -> ReadySet {
    let mut result = ReadySet::default();
    let mut statuses: HashMap<String, NodeStatus> = instance
        .node_states
        .iter()
        .map(|(id, state)| (id.clone(), state.status))
        .collect();
    let scope = build_scope(instance, None);

    loop {
        let mut changed = false;

        for node in &workflow.nodes {
            if statuses.get(&node.id).copied().unwrap_or_default() != NodeStatus::Pending {
                continue;
            }

            let incoming: Vec<_> = workflow.incoming(&node.id).filter(|e| !e.is_loop_back()).collect();

            // Only the start node runs without dependencies
            if incoming.is_empty() {
                if matches!(node.kind, NodeKind::Start) {
                    statuses.insert(node.id.clone(), NodeStatus::Ready);
                    result.ready.push(node.id.clone());
                    changed = true;
                }
                continue;
            }

            let classes: Vec<EdgeClass> = incoming
                .iter()
                .map(|e| classify_edge(workflow, instance, &statuses, e, &scope))
                .collect();

            if classes.contains(&EdgeClass::Blocked) || classes.contains(&EdgeClass::Deferred) {
                continue;
            }

            if classes.contains(&EdgeClass::Live) {
                statuses.insert(node.id.clone(), NodeStatus::Ready);
                result.ready.push(node.id.clone());
            } else {
                debug!(node_id = %node.id, "compute_ready: pruning node, no live incoming path");
                statuses.insert(node.id.clone(), NodeStatus::Skipped);
                result.skipped.push(node.id.clone());
            }
            changed = true;
        }

        if !changed {
            break;
        }
    }

    result
}

/// Terminal shape of an instance as seen by the completion wait loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceShape {
    /// `end` is done and nothing failed
    Completed,
    /// A node failed with retries exhausted
    Failed,
    /// No ready nodes remain, none running or waiting: the graph is wedged
    Stuck,
    /// Work remains
    InProgress,
}

pub fn instance_shape(workflow: &Workflow, instance: &WorkflowInstance) -> InstanceShape {
    if instance.has_failed_nodes() {
        return InstanceShape::Failed;
    }

    if let Some(end) = workflow.end_node()
        && instance.node_status(&end.id) == NodeStatus::Done
    {
        return InstanceShape::Completed;
    }

    let any_live = instance.node_states.values().any(|s| {
        matches!(
            s.status,
            NodeStatus::Ready | NodeStatus::Running | NodeStatus::Waiting
        )
    });
    if any_live {
        return InstanceShape::InProgress;
    }

    if compute_ready(workflow, instance).ready.is_empty() {
        InstanceShape::Stuck
    } else {
        InstanceShape::InProgress
    }
}

/// Route after `node_id` completed
///
/// Generic rule: each outgoing edge whose condition holds produces a
/// target. Back-edges honor their `maxLoops` ceiling and mark targets for
/// reset so a loop head can run again. Loop and foreach heads route
/// explicitly to their body or exit targets via `route_iteration`.
pub fn compute_next(workflow: &Workflow, instance: &WorkflowInstance, node_id: &str) -> Vec<NextNode> {
    let scope = build_node_scope(instance, node_id, None);
    let mut next = Vec::new();

    for edge in workflow.outgoing(node_id) {
        if edge.is_loop_back() {
            let target_count = instance.loop_counts.get(&edge.to).copied().unwrap_or(0);
            let ceiling = edge.max_loops.unwrap_or(u32::MAX);
            if target_count >= ceiling {
                debug!(from = node_id, to = %edge.to, ceiling, "compute_next: back-edge ceiling reached");
                continue;
            }
            if !edge_condition_truthy(edge.condition.as_deref(), &scope) {
                continue;
            }
            next.push(NextNode {
                id: edge.to.clone(),
                needs_reset: instance.node_status(&edge.to).is_settled(),
            });
            continue;
        }

        if !edge_condition_truthy(edge.condition.as_deref(), &scope) {
            continue;
        }
        // A settled target reached again (diamond merge) is not re-run
        if instance.node_status(&edge.to).is_settled() {
            continue;
        }
        next.push(NextNode {
            id: edge.to.clone(),
            needs_reset: false,
        });
    }

    next
}

/// Body targets of a loop/foreach head: outgoing targets from which the
/// head is reachable again (they sit on the cycle). Exit targets are the
/// rest.
pub fn iteration_targets(workflow: &Workflow, head_id: &str) -> (Vec<String>, Vec<String>) {
    let mut body = Vec::new();
    let mut exit = Vec::new();

    for edge in workflow.outgoing(head_id) {
        if reaches(workflow, &edge.to, head_id) {
            body.push(edge.to.clone());
        } else {
            exit.push(edge.to.clone());
        }
    }

    (body, exit)
}

/// The transitive body of a loop/foreach head: every node that lies on a
/// cycle through the head. Used to rewind a finished iteration or to skip
/// an unentered body.
pub fn loop_body_set(workflow: &Workflow, head_id: &str) -> HashSet<String> {
    let (body_targets, _) = iteration_targets(workflow, head_id);
    let mut set = HashSet::new();

    for target in body_targets {
        let mut stack = vec![target];
        while let Some(current) = stack.pop() {
            if current == head_id || set.contains(&current) {
                continue;
            }
            if !reaches(workflow, &current, head_id) {
                continue;
            }
            set.insert(current.clone());
            for edge in workflow.outgoing(&current) {
                stack.push(edge.to.clone());
            }
        }
    }

    set
}

/// Whether `to` is reachable from `from` following any edges
fn reaches(workflow: &Workflow, from: &str, to: &str) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![from.to_string()];

    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if !seen.insert(current.clone()) {
            continue;
        }
        for edge in workflow.outgoing(&current) {
            stack.push(edge.to.clone());
        }
    }

    false
}

/// Workflow structural validation errors, one string per finding
pub fn validate(workflow: &Workflow) -> Vec<String> {
    let mut errors = Vec::new();

    let starts = workflow
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .count();
    let ends = workflow.nodes.iter().filter(|n| matches!(n.kind, NodeKind::End)).count();
    if starts != 1 {
        errors.push(format!("workflow must contain exactly one start node, found {}", starts));
    }
    if ends != 1 {
        errors.push(format!("workflow must contain exactly one end node, found {}", ends));
    }

    let ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
    if ids.len() != workflow.nodes.len() {
        errors.push("duplicate node ids".to_string());
    }

    for edge in &workflow.edges {
        if !ids.contains(edge.from.as_str()) {
            errors.push(format!("edge references unknown source node: {}", edge.from));
        }
        if !ids.contains(edge.to.as_str()) {
            errors.push(format!("edge references unknown target node: {}", edge.to));
        }
        if let Some(cond) = &edge.condition
            && let Err(e) = expr::parse_check(cond)
        {
            errors.push(format!("edge {} -> {}: bad condition: {}", edge.from, edge.to, e));
        }
    }

    for node in &workflow.nodes {
        match &node.kind {
            NodeKind::Loop(config) => {
                if config.condition.trim().is_empty() {
                    errors.push(format!("loop node {} requires a condition", node.id));
                } else if let Err(e) = expr::parse_check(&config.condition) {
                    errors.push(format!("loop node {}: bad condition: {}", node.id, e));
                }
                if config.max_iterations == 0 {
                    errors.push(format!("loop node {} requires maxIterations > 0", node.id));
                }
            }
            NodeKind::Foreach(config) => {
                if config.items.trim().is_empty() {
                    errors.push(format!("foreach node {} requires an items expression", node.id));
                } else if let Err(e) = expr::parse_check(&config.items) {
                    errors.push(format!("foreach node {}: bad items expression: {}", node.id, e));
                }
            }
            NodeKind::Switch(config) => {
                for case in &config.cases {
                    if let Err(e) = expr::parse_check(&case.condition) {
                        errors.push(format!("switch node {}: bad case condition: {}", node.id, e));
                    }
                    if !ids.contains(case.target.as_str()) {
                        errors.push(format!("switch node {}: unknown target {}", node.id, case.target));
                    }
                }
            }
            NodeKind::Script(config) => {
                if let Err(e) = expr::parse_check(&config.expression) {
                    errors.push(format!("script node {}: bad expression: {}", node.id, e));
                }
            }
            NodeKind::Assign(config) => {
                for (var, expression) in &config.assignments {
                    if let Err(e) = expr::parse_check(expression) {
                        errors.push(format!("assign node {}: bad expression for {}: {}", node.id, var, e));
                    }
                }
            }
            _ => {}
        }

        // Every non-terminal node needs a way forward
        if !matches!(node.kind, NodeKind::End) && workflow.outgoing(&node.id).next().is_none() {
            errors.push(format!("node {} has no outgoing edge", node.id));
        }
    }

    // Reachability from start
    if let Some(start) = workflow.start_node() {
        let mut seen = HashSet::new();
        let mut stack = vec![start.id.clone()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for edge in workflow.outgoing(&current) {
                stack.push(edge.to.clone());
            }
        }
        for node in &workflow.nodes {
            if !seen.contains(&node.id) {
                errors.push(format!("node {} is unreachable from start", node.id));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{
        Edge, ForeachNodeConfig, LoopNodeConfig, Node, TaskNodeConfig,
    };

    fn node(id: &str, kind: NodeKind) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            kind,
        }
    }

    fn task_node(id: &str) -> Node {
        node(
            id,
            NodeKind::Task(TaskNodeConfig {
                prompt: format!("do {}", id),
                ..Default::default()
            }),
        )
    }

    fn linear_workflow() -> Workflow {
        Workflow {
            id: "wf".to_string(),
            name: "linear".to_string(),
            nodes: vec![
                node("start", NodeKind::Start),
                task_node("a"),
                task_node("b"),
                node("end", NodeKind::End),
            ],
            edges: vec![Edge::new("start", "a"), Edge::new("a", "b"), Edge::new("b", "end")],
            ..Default::default()
        }
    }

    #[test]
    fn test_only_start_ready_initially() {
        let wf = linear_workflow();
        let instance = WorkflowInstance::for_workflow(&wf);

        let ready = compute_ready(&wf, &instance);
        assert_eq!(ready.ready, vec!["start"]);
        assert!(ready.skipped.is_empty());
    }

    #[test]
    fn test_successor_ready_after_done() {
        let wf = linear_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.mark_node_running("start");
        instance.mark_node_done("start", None);

        let ready = compute_ready(&wf, &instance);
        assert_eq!(ready.ready, vec!["a"]);
    }

    #[test]
    fn test_condition_prunes_branch_and_cascades() {
        let mut wf = linear_workflow();
        // a -> b guarded by a false condition; b's skip must cascade:
        // end becomes reachable only through b, so end is skipped too
        wf.edges = vec![
            Edge::new("start", "a"),
            Edge::new("a", "b").with_condition("1 > 2"),
            Edge::new("b", "end"),
        ];
        let mut instance = WorkflowInstance::for_workflow(&wf);
        for id in ["start", "a"] {
            instance.mark_node_running(id);
            instance.mark_node_done(id, None);
        }

        let ready = compute_ready(&wf, &instance);
        assert!(ready.ready.is_empty());
        assert_eq!(ready.skipped, vec!["b", "end"]);
    }

    #[test]
    fn test_blank_condition_is_true() {
        let mut wf = linear_workflow();
        wf.edges[1].condition = Some("   ".to_string());
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.mark_node_running("start");
        instance.mark_node_done("start", None);

        let ready = compute_ready(&wf, &instance);
        assert_eq!(ready.ready, vec!["a"]);
    }

    fn fork_join_workflow() -> Workflow {
        Workflow {
            id: "wf".to_string(),
            name: "forkjoin".to_string(),
            nodes: vec![
                node("start", NodeKind::Start),
                node("fork", NodeKind::Parallel),
                task_node("left"),
                task_node("right"),
                node("merge", NodeKind::Join),
                node("end", NodeKind::End),
            ],
            edges: vec![
                Edge::new("start", "fork"),
                Edge::new("fork", "left"),
                Edge::new("fork", "right"),
                Edge::new("left", "merge"),
                Edge::new("right", "merge"),
                Edge::new("merge", "end"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_parallel_fans_out_both_branches() {
        let wf = fork_join_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        for id in ["start", "fork"] {
            instance.mark_node_running(id);
            instance.mark_node_done(id, None);
        }

        let mut ready = compute_ready(&wf, &instance).ready;
        ready.sort();
        assert_eq!(ready, vec!["left", "right"]);
    }

    #[test]
    fn test_join_waits_for_all_incoming() {
        let wf = fork_join_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        for id in ["start", "fork", "left"] {
            instance.mark_node_running(id);
            instance.mark_node_done(id, None);
        }
        instance.mark_node_running("right");

        // right still running: join must not be ready
        let ready = compute_ready(&wf, &instance);
        assert!(ready.ready.is_empty());

        instance.mark_node_done("right", None);
        let ready = compute_ready(&wf, &instance);
        assert_eq!(ready.ready, vec!["merge"]);
    }

    #[test]
    fn test_join_unblocks_when_one_branch_skipped() {
        let mut wf = fork_join_workflow();
        wf.edges[2].condition = Some("false".to_string()); // fork -> right pruned
        let mut instance = WorkflowInstance::for_workflow(&wf);
        for id in ["start", "fork"] {
            instance.mark_node_running(id);
            instance.mark_node_done(id, None);
        }

        let ready = compute_ready(&wf, &instance);
        assert_eq!(ready.ready, vec!["left"]);
        assert_eq!(ready.skipped, vec!["right"]);

        instance.mark_node_skipped("right");
        instance.mark_node_running("left");
        instance.mark_node_done("left", None);

        let ready = compute_ready(&wf, &instance);
        assert_eq!(ready.ready, vec!["merge"]);
    }

    #[test]
    fn test_compute_next_linear() {
        let wf = linear_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.mark_node_running("a");
        instance.mark_node_done("a", None);

        let next = compute_next(&wf, &instance, "a");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "b");
        assert!(!next[0].needs_reset);
    }

    fn loop_workflow() -> Workflow {
        Workflow {
            id: "wf".to_string(),
            name: "loop".to_string(),
            nodes: vec![
                node("start", NodeKind::Start),
                node(
                    "head",
                    NodeKind::Loop(LoopNodeConfig {
                        condition: "loopCount < 3".to_string(),
                        max_iterations: 3,
                    }),
                ),
                task_node("body"),
                node("end", NodeKind::End),
            ],
            edges: vec![
                Edge::new("start", "head"),
                Edge::new("head", "body"),
                Edge::new("head", "end"),
                Edge {
                    from: "body".to_string(),
                    to: "head".to_string(),
                    condition: None,
                    max_loops: Some(3),
                    label: None,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_iteration_targets_split_body_and_exit() {
        let wf = loop_workflow();
        let (body, exit) = iteration_targets(&wf, "head");
        assert_eq!(body, vec!["body"]);
        assert_eq!(exit, vec!["end"]);
    }

    #[test]
    fn test_back_edge_ceiling() {
        let wf = loop_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.loop_counts.insert("head".to_string(), 3);
        instance.mark_node_running("body");
        instance.mark_node_done("body", None);

        // Ceiling reached: the back-edge no longer routes
        let next = compute_next(&wf, &instance, "body");
        assert!(next.is_empty());
    }

    #[test]
    fn test_back_edge_resets_settled_head() {
        let wf = loop_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.loop_counts.insert("head".to_string(), 1);
        instance.mark_node_running("head");
        instance.mark_node_done("head", None);
        instance.mark_node_running("body");
        instance.mark_node_done("body", None);

        let next = compute_next(&wf, &instance, "body");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "head");
        assert!(next[0].needs_reset);
    }

    #[test]
    fn test_loop_body_set_transitive() {
        let mut wf = loop_workflow();
        // Extend the body: head -> body -> body2 -> head
        wf.nodes.push(task_node("body2"));
        wf.edges.retain(|e| !(e.from == "body" && e.to == "head"));
        wf.edges.push(Edge::new("body", "body2"));
        wf.edges.push(Edge {
            from: "body2".to_string(),
            to: "head".to_string(),
            condition: None,
            max_loops: Some(3),
            label: None,
        });

        let set = loop_body_set(&wf, "head");
        assert!(set.contains("body"));
        assert!(set.contains("body2"));
        assert!(!set.contains("end"));
        assert!(!set.contains("head"));
    }

    #[test]
    fn test_iterating_head_defers_exit_target() {
        let wf = loop_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.mark_node_running("start");
        instance.mark_node_done("start", None);
        instance.mark_node_running("head");
        instance.mark_node_done("head", None);
        instance
            .outputs
            .insert("head".to_string(), json!({"shouldContinue": true, "iteration": 0}));

        // While the head iterates, only the body readies; the exit edge
        // is deferred, not pruned
        let ready = compute_ready(&wf, &instance);
        assert_eq!(ready.ready, vec!["body"]);
        assert!(ready.skipped.is_empty());
    }

    #[test]
    fn test_finished_head_readies_exit_target() {
        let wf = loop_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.mark_node_running("start");
        instance.mark_node_done("start", None);
        instance.mark_node_running("head");
        instance.mark_node_done("head", None);
        instance
            .outputs
            .insert("head".to_string(), json!({"shouldContinue": false, "iteration": 3}));
        // Body finished during earlier iterations
        instance.mark_node_running("body");
        instance.mark_node_done("body", None);

        let ready = compute_ready(&wf, &instance);
        assert_eq!(ready.ready, vec!["end"]);
    }

    #[test]
    fn test_zero_iteration_loop_prunes_body() {
        let wf = loop_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.mark_node_running("start");
        instance.mark_node_done("start", None);
        instance.mark_node_running("head");
        instance.mark_node_done("head", None);
        instance
            .outputs
            .insert("head".to_string(), json!({"shouldContinue": false, "iteration": 0}));

        let ready = compute_ready(&wf, &instance);
        assert_eq!(ready.ready, vec!["end"]);
        assert_eq!(ready.skipped, vec!["body"]);
    }

    #[test]
    fn test_instance_shape_transitions() {
        let wf = linear_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        assert_eq!(instance_shape(&wf, &instance), InstanceShape::InProgress);

        for id in ["start", "a", "b", "end"] {
            instance.mark_node_running(id);
            instance.mark_node_done(id, None);
        }
        assert_eq!(instance_shape(&wf, &instance), InstanceShape::Completed);
    }

    #[test]
    fn test_instance_shape_failed() {
        let wf = linear_workflow();
        let mut instance = WorkflowInstance::for_workflow(&wf);
        instance.mark_node_running("start");
        instance.mark_node_failed("start", "boom");
        assert_eq!(instance_shape(&wf, &instance), InstanceShape::Failed);
    }

    #[test]
    fn test_validate_accepts_good_workflow() {
        assert!(validate(&linear_workflow()).is_empty());
        assert!(validate(&fork_join_workflow()).is_empty());
        assert!(validate(&loop_workflow()).is_empty());
    }

    #[test]
    fn test_validate_rejects_structural_problems() {
        let mut wf = linear_workflow();
        wf.edges.push(Edge::new("a", "ghost"));
        let errors = validate(&wf);
        assert!(errors.iter().any(|e| e.contains("ghost")));

        let mut wf = linear_workflow();
        wf.nodes.retain(|n| n.id != "start");
        wf.edges.retain(|e| e.from != "start");
        let errors = validate(&wf);
        assert!(errors.iter().any(|e| e.contains("exactly one start")));
    }

    #[test]
    fn test_validate_rejects_bad_condition() {
        let mut wf = linear_workflow();
        wf.edges[1].condition = Some("1 +* 2".to_string());
        let errors = validate(&wf);
        assert!(errors.iter().any(|e| e.contains("bad condition")));
    }

    #[test]
    fn test_validate_loop_requirements() {
        let mut wf = loop_workflow();
        if let NodeKind::Loop(config) = &mut wf.nodes[1].kind {
            config.condition = String::new();
        }
        let errors = validate(&wf);
        assert!(errors.iter().any(|e| e.contains("requires a condition")));
    }

    #[test]
    fn test_validate_foreach_requirements() {
        let wf = Workflow {
            id: "wf".to_string(),
            name: "fe".to_string(),
            nodes: vec![
                node("start", NodeKind::Start),
                node(
                    "each",
                    NodeKind::Foreach(ForeachNodeConfig {
                        items: String::new(),
                        ..Default::default()
                    }),
                ),
                node("end", NodeKind::End),
            ],
            edges: vec![Edge::new("start", "each"), Edge::new("each", "end")],
            ..Default::default()
        };
        let errors = validate(&wf);
        assert!(errors.iter().any(|e| e.contains("items expression")));
    }

    #[test]
    fn test_validate_unreachable_node() {
        let mut wf = linear_workflow();
        wf.nodes.push(task_node("island"));
        wf.edges.push(Edge::new("island", "end"));
        let errors = validate(&wf);
        assert!(errors.iter().any(|e| e.contains("unreachable")));
    }
}
