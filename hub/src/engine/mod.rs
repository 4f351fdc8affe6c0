//! Engine - node-type dispatch and instance mutation
//!
//! `execute_node` is the only place a node runs. The instance file is the
//! coordination substrate: the engine takes a short per-instance lock for
//! each read-modify-write (marking a node running, settling it) and keeps
//! backend calls outside the lock so task nodes run in parallel. Every
//! transition lands on disk via an atomic rename before anyone can observe
//! it.

mod persona;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use hubstore::{DataDir, read_json_opt, write_json_atomic};

use crate::backend::{Backend, ChunkHandler, InvokeOptions};
use crate::config::Config;
use crate::events::{Event, EventBus, record_conversation};
use crate::failure::FailureKb;
use crate::memory::MemoryEngine;
use crate::queue::Job;
use crate::worker::retry::RetryDecision;
use crate::workflow::graph::{self, InstanceShape};
use crate::workflow::instance::{InstanceStatus, NodeStatus, WorkflowInstance};
use crate::workflow::model::{
    AssignNodeConfig, DelayNodeConfig, ForeachNodeConfig, HumanNodeConfig, LoopNodeConfig, Node, NodeKind,
    ScheduleNodeConfig, ScriptNodeConfig, SwitchNodeConfig, TaskNodeConfig, Workflow,
};
use crate::workflow::{expr, model::SwitchCase};

pub use persona::persona_prompt;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: Option<String>,
    pub stream: bool,
    pub timeout_ms: u64,
    /// Fail the whole instance on the first exhausted node
    pub failfast: bool,
    /// Working directory handed to the agent subprocess
    pub agent_cwd: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: None,
            stream: true,
            timeout_ms: 30 * 60 * 1000,
            failfast: true,
            agent_cwd: None,
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: if config.backend.model.is_empty() {
                None
            } else {
                Some(config.backend.model.clone())
            },
            stream: config.backend.stream,
            timeout_ms: config.backend.timeout_ms,
            failfast: true,
            agent_cwd: None,
        }
    }
}

/// What the worker does next with a job
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// Node settled; enqueue these now-ready nodes
    Completed { next: Vec<String> },
    /// Re-enqueue the same node with this delay
    Deferred { delay_ms: u64 },
    /// Park the job until approval un-gates it
    Waiting,
    /// Hand the error to the retry classifier
    Failed {
        error: String,
        attempts: u32,
        node_max_attempts: Option<u32>,
    },
}

/// Effects a dispatch produces, applied at settle time on a fresh
/// instance snapshot
#[derive(Debug, Default)]
struct DispatchEffect {
    output: Option<Value>,
    variable_updates: HashMap<String, Value>,
    routing: Routing,
}

#[derive(Debug, Default)]
enum Routing {
    /// Generic: back-edge resets plus the readiness sweep
    #[default]
    Graph,
    /// Loop/foreach head decided to (re-)enter its body
    IterateBody { increment_count: bool },
    /// Loop/foreach head decided to exit to its non-body targets
    ExitIteration,
    /// Switch picked one target; prune the siblings it owns
    SwitchTo { target: String },
}

/// The node execution engine
pub struct Engine {
    data: DataDir,
    backend: Arc<dyn Backend>,
    bus: Arc<EventBus>,
    memory: Option<Arc<MemoryEngine>>,
    failure_kb: FailureKb,
    config: EngineConfig,
    /// Per-instance read-modify-write locks
    instance_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        data: DataDir,
        backend: Arc<dyn Backend>,
        bus: Arc<EventBus>,
        memory: Option<Arc<MemoryEngine>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            failure_kb: FailureKb::new(data.clone()),
            data,
            backend,
            bus,
            memory,
            config,
            instance_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn data(&self) -> &DataDir {
        &self.data
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    async fn instance_lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.instance_locks.lock().await;
        locks.entry(instance_id.to_string()).or_default().clone()
    }

    fn load_workflow(&self, task_id: &str) -> eyre::Result<Workflow> {
        read_json_opt(self.data.workflow_file(task_id))
            .ok_or_else(|| eyre::eyre!("workflow.json missing for task {}", task_id))
    }

    fn load_instance(&self, task_id: &str) -> eyre::Result<WorkflowInstance> {
        read_json_opt(self.data.instance_file(task_id))
            .ok_or_else(|| eyre::eyre!("instance.json missing for task {}", task_id))
    }

    fn persist_instance(&self, task_id: &str, instance: &WorkflowInstance) -> eyre::Result<()> {
        write_json_atomic(self.data.instance_file(task_id), instance)?;
        Ok(())
    }

    /// Execute one queued node job
    pub async fn execute_node(&self, job: &Job) -> eyre::Result<NodeOutcome> {
        let task_id = job.data.task_id.clone();
        let node_id = job.data.node_id.clone();
        let lock = self.instance_lock(&job.data.instance_id).await;

        let workflow = self.load_workflow(&task_id)?;
        let node = workflow
            .node(&node_id)
            .cloned()
            .ok_or_else(|| eyre::eyre!("node {} not in workflow", node_id))?;

        // Phase 1 (locked): observe state, mark running, persist
        let start_snapshot = {
            let _held = lock.lock().await;
            let mut instance = self.load_instance(&task_id)?;

            if instance.id != job.data.instance_id {
                debug!(%node_id, "execute_node: stale job for old instance, dropping");
                return Ok(NodeOutcome::Completed { next: Vec::new() });
            }

            // Already settled (externally approved human node, replayed
            // job): just route onward
            if instance.node_status(&node_id).is_settled() {
                let next = self.settle_sweep(&task_id, &workflow, &mut instance)?;
                self.persist_instance(&task_id, &instance)?;
                return Ok(NodeOutcome::Completed { next });
            }

            // Delay/schedule defer without occupying an attempt
            if let Some(delay_ms) = self.defer_wanted(&node, job) {
                instance.mark_node_waiting(&node_id);
                self.persist_instance(&task_id, &instance)?;
                debug!(%node_id, delay_ms, "execute_node: deferring");
                return Ok(NodeOutcome::Deferred { delay_ms });
            }

            // Human gate parks the job
            if let NodeKind::Human(config) = &node.kind {
                return self.handle_human_node(&task_id, &workflow, &mut instance, &node, config);
            }

            instance.mark_node_running(&node_id);
            if instance.status == InstanceStatus::Pending {
                instance.status = InstanceStatus::Running;
                instance.started_at = Some(Utc::now());
            }
            self.persist_instance(&task_id, &instance)?;
            instance
        };

        let attempts = start_snapshot.node_state(&node_id).map(|s| s.attempts).unwrap_or(1);
        self.bus.emit(Event::NodeStarted {
            task_id: task_id.clone(),
            instance_id: start_snapshot.id.clone(),
            node_id: node_id.clone(),
            node_type: node.kind.type_name().to_string(),
            attempt: attempts,
        });

        // Phase 2 (unlocked): dispatch, possibly a long backend call
        let dispatched = self.dispatch(&task_id, &start_snapshot, &node).await;

        let effect = match dispatched {
            Ok(effect) => effect,
            Err(error) => {
                return Ok(NodeOutcome::Failed {
                    error,
                    attempts,
                    node_max_attempts: node_max_attempts(&node),
                });
            }
        };

        // Phase 3 (locked): settle on a fresh snapshot
        let _held = lock.lock().await;
        let mut instance = self.load_instance(&task_id)?;

        if let Some(state) = instance.node_states.get(&node_id)
            && state.status != NodeStatus::Running
        {
            // Reset under our feet (crash-resume race); drop the result
            warn!(%node_id, status = %state.status, "execute_node: node no longer running at settle, dropping result");
            return Ok(NodeOutcome::Completed { next: Vec::new() });
        }

        for (var, value) in &effect.variable_updates {
            instance.variables.insert(var.clone(), value.clone());
        }
        if let Some(output) = &effect.output {
            instance.outputs.insert(node_id.clone(), output.clone());
        }
        instance.mark_node_done(&node_id, effect.output.clone());

        self.apply_routing(&workflow, &mut instance, &node, &effect.routing);

        let next = self.settle_sweep(&task_id, &workflow, &mut instance)?;
        self.persist_instance(&task_id, &instance)?;

        let duration_ms = instance
            .node_state(&node_id)
            .and_then(|s| s.duration_ms)
            .unwrap_or(0);
        let cost_usd = effect
            .output
            .as_ref()
            .and_then(|o| o.get("costUsd"))
            .and_then(Value::as_f64);
        self.bus.emit(Event::NodeCompleted {
            task_id: task_id.clone(),
            instance_id: instance.id.clone(),
            node_id: node_id.clone(),
            node_type: node.kind.type_name().to_string(),
            duration_ms,
            cost_usd,
        });

        self.emit_progress(&task_id, &instance);
        self.finalize_shape(&task_id, &workflow, &mut instance)?;

        Ok(NodeOutcome::Completed { next })
    }

    /// Apply a retry decision after the worker classified a failure
    pub async fn handle_failure(&self, job: &Job, error: &str, decision: &RetryDecision) -> eyre::Result<()> {
        let task_id = &job.data.task_id;
        let node_id = &job.data.node_id;
        let lock = self.instance_lock(&job.data.instance_id).await;
        let _held = lock.lock().await;

        let mut instance = self.load_instance(task_id)?;
        let attempts = instance.node_state(node_id).map(|s| s.attempts).unwrap_or(0);

        if decision.should_retry {
            instance.rewind_node_for_retry(node_id);
            self.persist_instance(task_id, &instance)?;
        } else {
            instance.mark_node_failed(node_id, error);
            if self.config.failfast {
                instance.status = InstanceStatus::Failed;
                instance.error = Some(error.to_string());
                instance.completed_at = Some(Utc::now());
            }
            self.persist_instance(task_id, &instance)?;

            if let Err(e) = self
                .failure_kb
                .record(task_id, node_id, &decision.category.to_string(), error)
            {
                warn!(error = %e, "handle_failure: failure KB record failed");
            }
        }

        self.bus.emit(Event::NodeFailed {
            task_id: task_id.clone(),
            instance_id: instance.id.clone(),
            node_id: node_id.clone(),
            error: error.to_string(),
            attempt: attempts,
            will_retry: decision.should_retry,
        });

        if !decision.should_retry && self.config.failfast {
            self.bus.emit(Event::WorkflowFailed {
                task_id: task_id.clone(),
                instance_id: instance.id.clone(),
                error: error.to_string(),
            });
        }

        Ok(())
    }

    // === Dispatch ===

    async fn dispatch(&self, task_id: &str, instance: &WorkflowInstance, node: &Node) -> Result<DispatchEffect, String> {
        match &node.kind {
            // Markers run as no-ops; the graph decides what follows
            NodeKind::Start | NodeKind::End | NodeKind::Parallel | NodeKind::Join | NodeKind::Condition => {
                Ok(DispatchEffect::default())
            }

            NodeKind::Task(config) => self.dispatch_task(task_id, instance, node, config).await,

            NodeKind::Delay(config) => Ok(self.dispatch_delay(config)),

            NodeKind::Schedule(config) => Ok(self.dispatch_schedule(config)),

            NodeKind::Switch(config) => self.dispatch_switch(instance, node, config),

            NodeKind::Assign(config) => self.dispatch_assign(instance, node, config),

            NodeKind::Script(config) => self.dispatch_script(instance, node, config),

            NodeKind::Loop(config) => self.dispatch_loop(instance, node, config),

            NodeKind::Foreach(config) => self.dispatch_foreach(instance, node, config),

            // Human nodes never reach dispatch
            NodeKind::Human(_) => Err("human node reached dispatch".to_string()),
        }
    }

    async fn dispatch_task(
        &self,
        task_id: &str,
        instance: &WorkflowInstance,
        node: &Node,
        config: &TaskNodeConfig,
    ) -> Result<DispatchEffect, String> {
        let scope = graph::build_node_scope(instance, &node.id, None);
        let rendered = render_template(&config.prompt, &scope);

        let mut prompt = String::new();
        prompt.push_str(persona_prompt(config.persona.as_deref()));
        prompt.push_str("\n\n");

        if let Some(memory) = &self.memory {
            let recalled = memory.recall_for_prompt(&rendered, 3);
            if !recalled.is_empty() {
                prompt.push_str("Relevant notes from previous work:\n");
                for line in recalled {
                    prompt.push_str("- ");
                    prompt.push_str(&line);
                    prompt.push('\n');
                }
                prompt.push('\n');
            }
        }
        prompt.push_str(&rendered);

        // Continue a prior node's agent session when configured
        let session_id = config.session_from.as_ref().and_then(|source| {
            instance
                .outputs
                .get(source)
                .and_then(|o| o.get("sessionId"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        });

        if let Err(e) = record_conversation(&self.data, task_id, "prompt", Some(&node.id), &prompt) {
            warn!(error = %e, "dispatch_task: conversation log failed");
        }

        let mut options = InvokeOptions::new(prompt);
        options.model = self.config.model.clone();
        options.stream = self.config.stream;
        options.timeout_ms = self.config.timeout_ms;
        options.session_id = session_id;
        options.cwd = self.config.agent_cwd.clone();

        let on_chunk: Option<ChunkHandler> = None;
        let invocation = self
            .backend
            .invoke(options, on_chunk)
            .await
            .map_err(|e| e.to_string())?;

        if let Err(e) = record_conversation(&self.data, task_id, "response", Some(&node.id), &invocation.response) {
            warn!(error = %e, "dispatch_task: conversation log failed");
        }

        let mut output = json!({ "_raw": invocation.response });
        if let Ok(Value::Object(parsed)) = serde_json::from_str::<Value>(&invocation.response) {
            for (key, value) in parsed {
                output[key] = value;
            }
        }
        if let Some(session_id) = &invocation.session_id {
            output["sessionId"] = json!(session_id);
        }
        if let Some(cost) = invocation.cost_usd {
            output["costUsd"] = json!(cost);
        }
        output["durationMs"] = json!(invocation.duration_ms);

        let mut effect = DispatchEffect {
            output: Some(output),
            ..Default::default()
        };
        if let Some(var) = &config.output_var {
            effect
                .variable_updates
                .insert(var.clone(), Value::String(invocation.response));
        }
        Ok(effect)
    }

    fn dispatch_delay(&self, config: &DelayNodeConfig) -> DispatchEffect {
        // Reaching dispatch means the delay already elapsed in the queue
        DispatchEffect {
            output: Some(json!({ "delayedMs": config.delay_ms })),
            ..Default::default()
        }
    }

    fn dispatch_schedule(&self, config: &ScheduleNodeConfig) -> DispatchEffect {
        DispatchEffect {
            output: Some(json!({ "scheduledAt": config.at })),
            ..Default::default()
        }
    }

    fn dispatch_switch(
        &self,
        instance: &WorkflowInstance,
        node: &Node,
        config: &SwitchNodeConfig,
    ) -> Result<DispatchEffect, String> {
        let scope = graph::build_node_scope(instance, &node.id, None);

        let matched: Option<&SwitchCase> = config.cases.iter().find(|case| {
            expr::evaluate_condition(&case.condition, &scope).unwrap_or_else(|e| {
                warn!(node_id = %node.id, error = %e, "switch case condition failed, treating as false");
                false
            })
        });

        let target = matched
            .map(|case| case.target.clone())
            .or_else(|| config.default.clone())
            .ok_or_else(|| format!("switch node {}: no case matched and no default", node.id))?;

        Ok(DispatchEffect {
            output: Some(json!({ "targetNode": target })),
            routing: Routing::SwitchTo { target },
            ..Default::default()
        })
    }

    fn dispatch_assign(
        &self,
        instance: &WorkflowInstance,
        node: &Node,
        config: &AssignNodeConfig,
    ) -> Result<DispatchEffect, String> {
        let scope = graph::build_node_scope(instance, &node.id, None);
        let mut effect = DispatchEffect::default();
        let mut assigned = serde_json::Map::new();

        for (var, expression) in &config.assignments {
            let value = expr::evaluate(expression, &scope)
                .map_err(|e| format!("assign node {}: {} = {}: {}", node.id, var, expression, e))?;
            assigned.insert(var.clone(), value.clone());
            effect.variable_updates.insert(var.clone(), value);
        }

        effect.output = Some(Value::Object(assigned));
        Ok(effect)
    }

    fn dispatch_script(
        &self,
        instance: &WorkflowInstance,
        node: &Node,
        config: &ScriptNodeConfig,
    ) -> Result<DispatchEffect, String> {
        let scope = graph::build_node_scope(instance, &node.id, None);
        let value = expr::evaluate(&config.expression, &scope)
            .map_err(|e| format!("script node {}: {}", node.id, e))?;

        let mut effect = DispatchEffect {
            output: Some(json!({ "_raw": value.clone(), "value": value.clone() })),
            ..Default::default()
        };
        if let Some(var) = &config.output_var {
            effect.variable_updates.insert(var.clone(), value);
        }
        Ok(effect)
    }

    fn dispatch_loop(
        &self,
        instance: &WorkflowInstance,
        node: &Node,
        config: &LoopNodeConfig,
    ) -> Result<DispatchEffect, String> {
        let count = instance.loop_counts.get(&node.id).copied().unwrap_or(0);
        let scope = graph::build_node_scope(instance, &node.id, None);

        let condition_holds = expr::evaluate_condition(&config.condition, &scope)
            .map_err(|e| format!("loop node {}: {}", node.id, e))?;
        let should_continue = condition_holds && count < config.max_iterations;

        debug!(node_id = %node.id, count, should_continue, "dispatch_loop");

        Ok(DispatchEffect {
            output: Some(json!({ "shouldContinue": should_continue, "iteration": count })),
            routing: if should_continue {
                Routing::IterateBody { increment_count: true }
            } else {
                Routing::ExitIteration
            },
            ..Default::default()
        })
    }

    fn dispatch_foreach(
        &self,
        instance: &WorkflowInstance,
        node: &Node,
        config: &ForeachNodeConfig,
    ) -> Result<DispatchEffect, String> {
        let index = instance.loop_counts.get(&node.id).copied().unwrap_or(0) as usize;
        let scope = graph::build_node_scope(instance, &node.id, None);

        let items = expr::evaluate(&config.items, &scope)
            .map_err(|e| format!("foreach node {}: {}", node.id, e))?;
        let items = match items {
            Value::Array(items) => items,
            Value::String(s) if s.is_empty() => Vec::new(),
            other => return Err(format!("foreach node {}: items is not a list: {}", node.id, other)),
        };
        let total = items.len();

        if index >= total {
            // Done (immediately so for an empty list)
            return Ok(DispatchEffect {
                output: Some(json!({ "total": total, "done": true })),
                routing: Routing::ExitIteration,
                ..Default::default()
            });
        }

        let item = items[index].clone();
        let mut effect = DispatchEffect {
            output: Some(json!({ "item": item, "index": index, "total": total, "done": false })),
            routing: Routing::IterateBody { increment_count: true },
            ..Default::default()
        };
        effect.variable_updates.insert(config.item_var.clone(), item);
        if let Some(index_var) = &config.index_var {
            effect.variable_updates.insert(index_var.clone(), json!(index));
        }
        Ok(effect)
    }

    // === Settling ===

    fn handle_human_node(
        &self,
        task_id: &str,
        workflow: &Workflow,
        instance: &mut WorkflowInstance,
        node: &Node,
        config: &HumanNodeConfig,
    ) -> eyre::Result<NodeOutcome> {
        // Auto-approve when configured and the wait has elapsed
        if let Some(auto_ms) = config.auto_approve_after_ms
            && instance.node_status(&node.id) == NodeStatus::Waiting
        {
            let waited_ms = instance
                .node_state(&node.id)
                .and_then(|s| s.started_at)
                .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            if waited_ms >= auto_ms {
                debug!(node_id = %node.id, "handle_human_node: auto-approving");
                instance.mark_node_done(&node.id, Some(json!({ "approved": "auto" })));
                let next = self.settle_sweep(task_id, workflow, instance)?;
                self.persist_instance(task_id, instance)?;
                return Ok(NodeOutcome::Completed { next });
            }
        }

        let first_request = instance.node_status(&node.id) != NodeStatus::Waiting;
        if first_request {
            // Stamp started_at so auto-approval has a reference point
            if let Some(state) = instance.node_states.get_mut(&node.id) {
                state.started_at = Some(Utc::now());
            }
            instance.mark_node_waiting(&node.id);
            self.persist_instance(task_id, instance)?;
        }

        self.bus.emit(Event::ApprovalRequested {
            task_id: task_id.to_string(),
            instance_id: instance.id.clone(),
            node_id: node.id.clone(),
            prompt: config.prompt.clone(),
        });

        Ok(NodeOutcome::Waiting)
    }

    /// Whether a delay/schedule node still has waiting to do. The job's
    /// own delay tells us whether it already sat out the wait.
    fn defer_wanted(&self, node: &Node, job: &Job) -> Option<u64> {
        match &node.kind {
            NodeKind::Delay(config) => {
                if job.delay_ms == 0 && config.delay_ms > 0 {
                    Some(config.delay_ms)
                } else {
                    None
                }
            }
            NodeKind::Schedule(config) => {
                let at = chrono::DateTime::parse_from_rfc3339(&config.at).ok()?;
                let remaining = (at.with_timezone(&Utc) - Utc::now()).num_milliseconds();
                if remaining > 0 { Some(remaining as u64) } else { None }
            }
            _ => None,
        }
    }

    fn apply_routing(&self, workflow: &Workflow, instance: &mut WorkflowInstance, node: &Node, routing: &Routing) {
        match routing {
            Routing::Graph => {
                // Back-edges may rewind a settled loop head
                for next in graph::compute_next(workflow, instance, &node.id) {
                    if next.needs_reset {
                        debug!(target = %next.id, "apply_routing: back-edge reset");
                        self.reset_node(instance, &next.id);
                    }
                }
            }
            Routing::IterateBody { increment_count } => {
                if *increment_count {
                    *instance.loop_counts.entry(node.id.clone()).or_insert(0) += 1;
                }
                // Rewind the whole body so a finished iteration can re-run
                for body_node in graph::loop_body_set(workflow, &node.id) {
                    if instance.node_status(&body_node).is_settled() {
                        self.reset_node(instance, &body_node);
                    }
                }
            }
            Routing::ExitIteration => {
                // An unentered body must not wake up once the head is done
                for body_node in graph::loop_body_set(workflow, &node.id) {
                    if instance.node_status(&body_node) == NodeStatus::Pending {
                        instance.mark_node_skipped(&body_node);
                        self.bus.emit(Event::NodeSkipped {
                            task_id: workflow.task_id.clone(),
                            instance_id: instance.id.clone(),
                            node_id: body_node,
                        });
                    }
                }
            }
            Routing::SwitchTo { target } => {
                // Prune unselected successors that only this switch feeds
                for edge in workflow.outgoing(&node.id) {
                    if edge.to == *target {
                        continue;
                    }
                    let exclusively_ours = workflow
                        .incoming(&edge.to)
                        .filter(|e| !e.is_loop_back())
                        .all(|e| e.from == node.id);
                    if exclusively_ours && instance.node_status(&edge.to) == NodeStatus::Pending {
                        instance.mark_node_skipped(&edge.to);
                        self.bus.emit(Event::NodeSkipped {
                            task_id: workflow.task_id.clone(),
                            instance_id: instance.id.clone(),
                            node_id: edge.to.clone(),
                        });
                    }
                }
            }
        }
    }

    fn reset_node(&self, instance: &mut WorkflowInstance, node_id: &str) {
        if let Some(state) = instance.node_states.get_mut(node_id) {
            state.status = NodeStatus::Pending;
            state.completed_at = None;
            state.duration_ms = None;
            state.error = None;
        }
    }

    /// Run the readiness sweep: mark pruned nodes skipped, promote ready
    /// nodes, and return the list to enqueue
    fn settle_sweep(
        &self,
        task_id: &str,
        workflow: &Workflow,
        instance: &mut WorkflowInstance,
    ) -> eyre::Result<Vec<String>> {
        let sweep = graph::compute_ready(workflow, instance);

        for node_id in &sweep.skipped {
            instance.mark_node_skipped(node_id);
            self.bus.emit(Event::NodeSkipped {
                task_id: task_id.to_string(),
                instance_id: instance.id.clone(),
                node_id: node_id.clone(),
            });
        }

        let mut next = Vec::new();
        for node_id in &sweep.ready {
            if let Some(state) = instance.node_states.get_mut(node_id) {
                state.status = NodeStatus::Ready;
            }
            next.push(node_id.clone());
        }

        Ok(next)
    }

    fn emit_progress(&self, task_id: &str, instance: &WorkflowInstance) {
        let settled = instance
            .node_states
            .values()
            .filter(|s| s.status.is_settled())
            .count();
        self.bus.emit(Event::WorkflowProgress {
            task_id: task_id.to_string(),
            instance_id: instance.id.clone(),
            settled_nodes: settled,
            total_nodes: instance.node_states.len(),
        });
    }

    /// Check for a terminal instance shape after a settle
    fn finalize_shape(&self, task_id: &str, workflow: &Workflow, instance: &mut WorkflowInstance) -> eyre::Result<()> {
        match graph::instance_shape(workflow, instance) {
            InstanceShape::Completed if instance.status != InstanceStatus::Completed => {
                instance.status = InstanceStatus::Completed;
                instance.completed_at = Some(Utc::now());
                self.persist_instance(task_id, instance)?;
                self.bus.emit(Event::WorkflowCompleted {
                    task_id: task_id.to_string(),
                    instance_id: instance.id.clone(),
                });
            }
            InstanceShape::Stuck if !instance.status.is_terminal() => {
                let error = "workflow stuck: no ready nodes remain".to_string();
                instance.status = InstanceStatus::Failed;
                instance.error = Some(error.clone());
                instance.completed_at = Some(Utc::now());
                self.persist_instance(task_id, instance)?;
                self.bus.emit(Event::WorkflowFailed {
                    task_id: task_id.to_string(),
                    instance_id: instance.id.clone(),
                    error,
                });
            }
            _ => {}
        }
        Ok(())
    }
}

/// Per-node retry ceiling override
fn node_max_attempts(node: &Node) -> Option<u32> {
    match &node.kind {
        NodeKind::Task(config) => config.max_attempts,
        _ => None,
    }
}

/// Replace `{{expr}}` placeholders with evaluated scope values
pub fn render_template(template: &str, scope: &Value) -> String {
    let placeholder = regex::Regex::new(r"\{\{([^}]+)\}\}").expect("static regex");
    placeholder
        .replace_all(template, |caps: &regex::Captures| {
            let expression = caps[1].trim();
            match expr::evaluate(expression, scope) {
                Ok(Value::String(s)) => s,
                Ok(value) => value.to_string(),
                Err(e) => {
                    warn!(expression, error = %e, "render_template: placeholder failed, leaving empty");
                    String::new()
                }
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::events::create_event_bus;
    use crate::queue::{Job, JobData, JobStatus};
    use crate::worker::retry;
    use crate::workflow::model::Edge;
    use tempfile::tempdir;

    fn node(id: &str, kind: NodeKind) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            kind,
        }
    }

    fn engine_with(
        temp: &tempfile::TempDir,
        backend: Arc<dyn Backend>,
        workflow: &Workflow,
    ) -> (Engine, WorkflowInstance) {
        let data = DataDir::new(temp.path());
        data.ensure().unwrap();

        write_json_atomic(data.workflow_file(&workflow.task_id), workflow).unwrap();
        let instance = WorkflowInstance::for_workflow(workflow);
        write_json_atomic(data.instance_file(&workflow.task_id), &instance).unwrap();

        let engine = Engine::new(
            data,
            backend,
            create_event_bus(),
            None,
            EngineConfig {
                stream: false,
                ..Default::default()
            },
        );
        (engine, instance)
    }

    fn job_for(workflow: &Workflow, instance: &WorkflowInstance, node_id: &str) -> Job {
        Job {
            id: format!("job-{}", node_id),
            data: JobData {
                task_id: workflow.task_id.clone(),
                workflow_id: workflow.id.clone(),
                instance_id: instance.id.clone(),
                node_id: node_id.to_string(),
                attempt: 1,
            },
            status: JobStatus::Active,
            priority: 5,
            delay_ms: 0,
            attempts: 1,
            max_attempts: 3,
            created_at: 0,
            process_at: 0,
            completed_at: None,
            error: None,
        }
    }

    fn linear_workflow() -> Workflow {
        Workflow {
            id: "wf-1".to_string(),
            task_id: "task-1".to_string(),
            name: "linear".to_string(),
            nodes: vec![
                node("start", NodeKind::Start),
                node(
                    "work",
                    NodeKind::Task(TaskNodeConfig {
                        prompt: "do the work".to_string(),
                        output_var: Some("workOut".to_string()),
                        ..Default::default()
                    }),
                ),
                node("end", NodeKind::End),
            ],
            edges: vec![Edge::new("start", "work"), Edge::new("work", "end")],
            ..Default::default()
        }
    }

    async fn drive_to_quiescence(engine: &Engine, workflow: &Workflow, instance: &WorkflowInstance) {
        let mut frontier = vec!["start".to_string()];
        let mut hops = 0;
        while let Some(node_id) = frontier.pop() {
            hops += 1;
            assert!(hops < 100, "workflow did not quiesce");
            match engine.execute_node(&job_for(workflow, instance, &node_id)).await.unwrap() {
                NodeOutcome::Completed { next } => frontier.extend(next),
                NodeOutcome::Deferred { .. } => frontier.push(node_id),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_linear_workflow_runs_to_completion() {
        let temp = tempdir().unwrap();
        let workflow = linear_workflow();
        let backend = Arc::new(ScriptedBackend::always("it is done"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        drive_to_quiescence(&engine, &workflow, &instance).await;

        let final_instance = engine.load_instance("task-1").unwrap();
        assert_eq!(final_instance.status, InstanceStatus::Completed);
        assert!(final_instance.completed_at.is_some());
        assert_eq!(final_instance.outputs["work"]["_raw"], json!("it is done"));
        assert_eq!(final_instance.variables["workOut"], json!("it is done"));

        // completedAt ordering follows execution order
        let order: Vec<_> = ["start", "work", "end"]
            .iter()
            .map(|id| final_instance.node_state(id).unwrap().completed_at.unwrap())
            .collect();
        assert!(order[0] <= order[1] && order[1] <= order[2]);
    }

    #[tokio::test]
    async fn test_task_failure_surfaces_for_classification() {
        let temp = tempdir().unwrap();
        let workflow = linear_workflow();
        let backend = Arc::new(ScriptedBackend::new(vec![Err(crate::backend::BackendError::Process {
            exit_code: Some(1),
            message: "401 Unauthorized".to_string(),
        })]));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        // start
        let NodeOutcome::Completed { next } = engine
            .execute_node(&job_for(&workflow, &instance, "start"))
            .await
            .unwrap()
        else {
            panic!("start failed");
        };
        assert_eq!(next, vec!["work"]);

        let outcome = engine
            .execute_node(&job_for(&workflow, &instance, "work"))
            .await
            .unwrap();
        let NodeOutcome::Failed { error, attempts, .. } = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(error.contains("401"));
        assert_eq!(attempts, 1);

        // Permanent: handle_failure fails the instance
        let decision = retry::should_retry(&error, attempts, None);
        assert!(!decision.should_retry);
        let job = job_for(&workflow, &instance, "work");
        engine.handle_failure(&job, &error, &decision).await.unwrap();

        let final_instance = engine.load_instance("task-1").unwrap();
        assert_eq!(final_instance.status, InstanceStatus::Failed);
        assert_eq!(final_instance.node_status("work"), NodeStatus::Failed);
        assert_eq!(final_instance.node_state("work").unwrap().attempts, 1);

        // The failure landed in the KB
        assert_eq!(engine.failure_kb.load_all().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_rewinds_node() {
        let temp = tempdir().unwrap();
        let workflow = linear_workflow();
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(crate::backend::BackendError::Process {
                exit_code: Some(1),
                message: "ECONNRESET".to_string(),
            }),
            Ok("recovered".to_string()),
        ]));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        engine
            .execute_node(&job_for(&workflow, &instance, "start"))
            .await
            .unwrap();

        let outcome = engine
            .execute_node(&job_for(&workflow, &instance, "work"))
            .await
            .unwrap();
        let NodeOutcome::Failed { error, attempts, .. } = outcome else {
            panic!("expected first attempt to fail");
        };

        let decision = retry::should_retry(&error, attempts, None);
        assert!(decision.should_retry);
        let job = job_for(&workflow, &instance, "work");
        engine.handle_failure(&job, &error, &decision).await.unwrap();

        let mid = engine.load_instance("task-1").unwrap();
        assert_eq!(mid.node_status("work"), NodeStatus::Ready);

        // Second attempt succeeds; canonical attempt count is 2
        let outcome = engine
            .execute_node(&job_for(&workflow, &instance, "work"))
            .await
            .unwrap();
        assert!(matches!(outcome, NodeOutcome::Completed { .. }));

        let final_instance = engine.load_instance("task-1").unwrap();
        assert_eq!(final_instance.node_state("work").unwrap().attempts, 2);
        assert_eq!(final_instance.node_status("work"), NodeStatus::Done);
    }

    #[tokio::test]
    async fn test_human_gate_parks_until_approved() {
        let temp = tempdir().unwrap();
        let workflow = Workflow {
            id: "wf-h".to_string(),
            task_id: "task-h".to_string(),
            name: "human".to_string(),
            nodes: vec![
                node("start", NodeKind::Start),
                node("gate", NodeKind::Human(HumanNodeConfig::default())),
                node(
                    "x",
                    NodeKind::Task(TaskNodeConfig {
                        prompt: "after approval".to_string(),
                        ..Default::default()
                    }),
                ),
                node("end", NodeKind::End),
            ],
            edges: vec![
                Edge::new("start", "gate"),
                Edge::new("gate", "x"),
                Edge::new("x", "end"),
            ],
            ..Default::default()
        };
        let backend = Arc::new(ScriptedBackend::always("ok"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);
        let bus = engine.bus.clone();
        let mut events = bus.subscribe();

        let NodeOutcome::Completed { next } = engine
            .execute_node(&job_for(&workflow, &instance, "start"))
            .await
            .unwrap()
        else {
            panic!()
        };
        assert_eq!(next, vec!["gate"]);

        let outcome = engine
            .execute_node(&job_for(&workflow, &instance, "gate"))
            .await
            .unwrap();
        assert!(matches!(outcome, NodeOutcome::Waiting));

        let mid = engine.load_instance("task-h").unwrap();
        assert_eq!(mid.node_status("gate"), NodeStatus::Waiting);
        assert_eq!(mid.node_status("x"), NodeStatus::Pending);

        // An approval event was emitted
        let mut saw_approval = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::ApprovalRequested { .. }) {
                saw_approval = true;
            }
        }
        assert!(saw_approval);

        // External approval marks the gate done; replaying the job routes on
        let mut approved = engine.load_instance("task-h").unwrap();
        approved.mark_node_done("gate", Some(json!({ "approved": true })));
        write_json_atomic(engine.data.instance_file("task-h"), &approved).unwrap();

        let NodeOutcome::Completed { next } = engine
            .execute_node(&job_for(&workflow, &instance, "gate"))
            .await
            .unwrap()
        else {
            panic!("expected completion after approval");
        };
        assert_eq!(next, vec!["x"]);
    }

    #[tokio::test]
    async fn test_delay_node_defers_then_completes() {
        let temp = tempdir().unwrap();
        let workflow = Workflow {
            id: "wf-d".to_string(),
            task_id: "task-d".to_string(),
            name: "delay".to_string(),
            nodes: vec![
                node("start", NodeKind::Start),
                node("wait", NodeKind::Delay(DelayNodeConfig { delay_ms: 5_000 })),
                node("end", NodeKind::End),
            ],
            edges: vec![Edge::new("start", "wait"), Edge::new("wait", "end")],
            ..Default::default()
        };
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        engine
            .execute_node(&job_for(&workflow, &instance, "start"))
            .await
            .unwrap();

        // First visit defers with the configured delay
        let outcome = engine
            .execute_node(&job_for(&workflow, &instance, "wait"))
            .await
            .unwrap();
        let NodeOutcome::Deferred { delay_ms } = outcome else {
            panic!("expected deferral, got {:?}", outcome);
        };
        assert_eq!(delay_ms, 5_000);
        assert_eq!(
            engine.load_instance("task-d").unwrap().node_status("wait"),
            NodeStatus::Waiting
        );

        // The delayed job comes back with delay_ms set: the wait is over
        let mut delayed_job = job_for(&workflow, &instance, "wait");
        delayed_job.delay_ms = 5_000;
        let outcome = engine.execute_node(&delayed_job).await.unwrap();
        let NodeOutcome::Completed { next } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(next, vec!["end"]);
    }

    #[tokio::test]
    async fn test_switch_prunes_unselected_branch() {
        let temp = tempdir().unwrap();
        let workflow = Workflow {
            id: "wf-s".to_string(),
            task_id: "task-s".to_string(),
            name: "switch".to_string(),
            variables: HashMap::from([("mode".to_string(), json!("fast"))]),
            nodes: vec![
                node("start", NodeKind::Start),
                node(
                    "pick",
                    NodeKind::Switch(SwitchNodeConfig {
                        cases: vec![
                            SwitchCase {
                                condition: "variables.mode == 'fast'".to_string(),
                                target: "fast".to_string(),
                            },
                            SwitchCase {
                                condition: "variables.mode == 'slow'".to_string(),
                                target: "slow".to_string(),
                            },
                        ],
                        default: None,
                    }),
                ),
                node(
                    "fast",
                    NodeKind::Script(ScriptNodeConfig {
                        expression: "'took fast path'".to_string(),
                        output_var: None,
                    }),
                ),
                node(
                    "slow",
                    NodeKind::Script(ScriptNodeConfig {
                        expression: "'took slow path'".to_string(),
                        output_var: None,
                    }),
                ),
                node("end", NodeKind::End),
            ],
            edges: vec![
                Edge::new("start", "pick"),
                Edge::new("pick", "fast"),
                Edge::new("pick", "slow"),
                Edge::new("fast", "end"),
                Edge::new("slow", "end"),
            ],
            ..Default::default()
        };
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        drive_to_quiescence(&engine, &workflow, &instance).await;

        let final_instance = engine.load_instance("task-s").unwrap();
        assert_eq!(final_instance.status, InstanceStatus::Completed);
        assert_eq!(final_instance.node_status("fast"), NodeStatus::Done);
        assert_eq!(final_instance.node_status("slow"), NodeStatus::Skipped);
        assert_eq!(final_instance.outputs["pick"]["targetNode"], json!("fast"));
    }

    #[tokio::test]
    async fn test_assign_and_script_update_variables() {
        let temp = tempdir().unwrap();
        let workflow = Workflow {
            id: "wf-a".to_string(),
            task_id: "task-a".to_string(),
            name: "assign".to_string(),
            variables: HashMap::from([("base".to_string(), json!(10))]),
            nodes: vec![
                node("start", NodeKind::Start),
                node(
                    "set",
                    NodeKind::Assign(AssignNodeConfig {
                        assignments: HashMap::from([("doubled".to_string(), "base * 2".to_string())]),
                    }),
                ),
                node(
                    "calc",
                    NodeKind::Script(ScriptNodeConfig {
                        expression: "doubled + 1".to_string(),
                        output_var: Some("final".to_string()),
                    }),
                ),
                node("end", NodeKind::End),
            ],
            edges: vec![
                Edge::new("start", "set"),
                Edge::new("set", "calc"),
                Edge::new("calc", "end"),
            ],
            ..Default::default()
        };
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        drive_to_quiescence(&engine, &workflow, &instance).await;

        let final_instance = engine.load_instance("task-a").unwrap();
        assert_eq!(final_instance.status, InstanceStatus::Completed);
        assert_eq!(final_instance.variables["doubled"], json!(20));
        assert_eq!(final_instance.variables["final"], json!(21));
    }

    fn loop_workflow(condition: &str) -> Workflow {
        Workflow {
            id: "wf-l".to_string(),
            task_id: "task-l".to_string(),
            name: "loop".to_string(),
            variables: HashMap::from([("n".to_string(), json!(0))]),
            nodes: vec![
                node("start", NodeKind::Start),
                node(
                    "head",
                    NodeKind::Loop(LoopNodeConfig {
                        condition: condition.to_string(),
                        max_iterations: 10,
                    }),
                ),
                node(
                    "bump",
                    NodeKind::Assign(AssignNodeConfig {
                        assignments: HashMap::from([("n".to_string(), "n + 1".to_string())]),
                    }),
                ),
                node("end", NodeKind::End),
            ],
            edges: vec![
                Edge::new("start", "head"),
                Edge::new("head", "bump"),
                Edge::new("head", "end"),
                Edge {
                    from: "bump".to_string(),
                    to: "head".to_string(),
                    condition: None,
                    max_loops: Some(10),
                    label: None,
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_loop_iterates_then_exits() {
        let temp = tempdir().unwrap();
        let workflow = loop_workflow("loopCount < 3");
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        drive_to_quiescence(&engine, &workflow, &instance).await;

        let final_instance = engine.load_instance("task-l").unwrap();
        assert_eq!(final_instance.status, InstanceStatus::Completed);
        assert_eq!(final_instance.variables["n"], json!(3));
        assert_eq!(final_instance.loop_counts["head"], 3);
    }

    #[tokio::test]
    async fn test_loop_with_false_condition_runs_zero_iterations() {
        let temp = tempdir().unwrap();
        let workflow = loop_workflow("1 > 2");
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        drive_to_quiescence(&engine, &workflow, &instance).await;

        let final_instance = engine.load_instance("task-l").unwrap();
        assert_eq!(final_instance.status, InstanceStatus::Completed);
        assert_eq!(final_instance.variables["n"], json!(0));
        assert_eq!(final_instance.node_status("bump"), NodeStatus::Skipped);
    }

    fn foreach_workflow(items: serde_json::Value) -> Workflow {
        Workflow {
            id: "wf-f".to_string(),
            task_id: "task-f".to_string(),
            name: "foreach".to_string(),
            variables: HashMap::from([
                ("files".to_string(), items),
                ("seen".to_string(), json!("")),
            ]),
            nodes: vec![
                node("start", NodeKind::Start),
                node(
                    "each",
                    NodeKind::Foreach(ForeachNodeConfig {
                        items: "variables.files".to_string(),
                        item_var: "file".to_string(),
                        index_var: Some("i".to_string()),
                        ..Default::default()
                    }),
                ),
                node(
                    "visit",
                    NodeKind::Assign(AssignNodeConfig {
                        assignments: HashMap::from([("seen".to_string(), "seen + file + ';'".to_string())]),
                    }),
                ),
                node("end", NodeKind::End),
            ],
            edges: vec![
                Edge::new("start", "each"),
                Edge::new("each", "visit"),
                Edge::new("each", "end"),
                Edge {
                    from: "visit".to_string(),
                    to: "each".to_string(),
                    condition: None,
                    max_loops: Some(100),
                    label: None,
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_foreach_visits_every_item_in_order() {
        let temp = tempdir().unwrap();
        let workflow = foreach_workflow(json!(["a.rs", "b.rs", "c.rs"]));
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        drive_to_quiescence(&engine, &workflow, &instance).await;

        let final_instance = engine.load_instance("task-f").unwrap();
        assert_eq!(final_instance.status, InstanceStatus::Completed);
        assert_eq!(final_instance.variables["seen"], json!("a.rs;b.rs;c.rs;"));
    }

    #[tokio::test]
    async fn test_foreach_over_empty_list_completes_immediately() {
        let temp = tempdir().unwrap();
        let workflow = foreach_workflow(json!([]));
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        drive_to_quiescence(&engine, &workflow, &instance).await;

        let final_instance = engine.load_instance("task-f").unwrap();
        assert_eq!(final_instance.status, InstanceStatus::Completed);
        assert_eq!(final_instance.variables["seen"], json!(""));
        // The body never ran
        assert_eq!(final_instance.node_status("visit"), NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_parallel_join_fan_out_and_merge() {
        let temp = tempdir().unwrap();
        let workflow = Workflow {
            id: "wf-p".to_string(),
            task_id: "task-p".to_string(),
            name: "parjoin".to_string(),
            nodes: vec![
                node("start", NodeKind::Start),
                node("fork", NodeKind::Parallel),
                node(
                    "left",
                    NodeKind::Script(ScriptNodeConfig {
                        expression: "'L'".to_string(),
                        output_var: None,
                    }),
                ),
                node(
                    "right",
                    NodeKind::Script(ScriptNodeConfig {
                        expression: "'R'".to_string(),
                        output_var: None,
                    }),
                ),
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
        };
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (engine, instance) = engine_with(&temp, backend, &workflow);

        // After fork completes both branches are ready at once
        engine
            .execute_node(&job_for(&workflow, &instance, "start"))
            .await
            .unwrap();
        let NodeOutcome::Completed { mut next } = engine
            .execute_node(&job_for(&workflow, &instance, "fork"))
            .await
            .unwrap()
        else {
            panic!()
        };
        next.sort();
        assert_eq!(next, vec!["left", "right"]);

        // Only once both settle does the join unblock
        let NodeOutcome::Completed { next } = engine
            .execute_node(&job_for(&workflow, &instance, "left"))
            .await
            .unwrap()
        else {
            panic!()
        };
        assert!(next.is_empty());

        let NodeOutcome::Completed { next } = engine
            .execute_node(&job_for(&workflow, &instance, "right"))
            .await
            .unwrap()
        else {
            panic!()
        };
        assert_eq!(next, vec!["merge"]);

        drive_rest(&engine, &workflow, &instance, next).await;
        let final_instance = engine.load_instance("task-p").unwrap();
        assert_eq!(final_instance.status, InstanceStatus::Completed);
    }

    async fn drive_rest(engine: &Engine, workflow: &Workflow, instance: &WorkflowInstance, seed: Vec<String>) {
        let mut frontier = seed;
        let mut hops = 0;
        while let Some(node_id) = frontier.pop() {
            hops += 1;
            assert!(hops < 100);
            if let NodeOutcome::Completed { next } = engine
                .execute_node(&job_for(workflow, instance, &node_id))
                .await
                .unwrap()
            {
                frontier.extend(next);
            }
        }
    }

    #[test]
    fn test_render_template() {
        let scope = json!({
            "variables": { "feature": "dark mode", "count": 2 },
            "outputs": { "scan": { "_raw": "3 findings" } }
        });

        assert_eq!(
            render_template("Implement {{variables.feature}} ({{count}} tries)", &scope),
            "Implement dark mode (2 tries)"
        );
        assert_eq!(
            render_template("Context: {{outputs.scan._raw}}", &scope),
            "Context: 3 findings"
        );
        // Missing references render empty, not broken
        assert_eq!(render_template("x{{outputs.none._raw}}y", &scope), "xy");
    }
}
