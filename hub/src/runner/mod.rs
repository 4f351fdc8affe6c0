//! Task runner - one detached process owns one task end to end
//!
//! The CLI spawns the runner detached and returns; the runner plans (if
//! no workflow exists yet), executes the instance through a worker, and
//! finalizes the task with a rendered report. Coordination with the
//! outside world happens through the task files: pause, resume, and
//! cancel are status flips on disk that the wait loop observes.

pub mod planner;
pub mod report;

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use hubstore::{DataDir, now_ms, read_json_opt, write_json_atomic};

use crate::backend::Backend;
use crate::config::Config;
use crate::domain::{ProcessRecord, Task, TaskStatus};
use crate::engine::{Engine, EngineConfig};
use crate::events::{Event, EventBus, StatsAggregator, TaskEventLogger, create_event_bus};
use crate::memory::{MemoryEngine, MemorySource, ReinforceSource};
use crate::notify::WebhookNotifier;
use crate::queue::{EnqueueOptions, JobData, JobQueue};
use crate::worker::{Worker, WorkerConfig, WorkerHandle};
use crate::workflow::graph;
use crate::workflow::instance::{InstanceStatus, NodeStatus, WorkflowInstance};
use crate::workflow::model::Workflow;

use planner::Planner;

/// A `running` node younger than this means a sibling runner is likely
/// still alive
pub const RECENT_NODE_ACTIVITY_THRESHOLD_MS: i64 = 60_000;

/// Runner-specific failures the CLI maps to exit codes
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("another runner appears to be active for this task")]
    ResumeConflict,

    #[error("task not found: {0}")]
    TaskNotFound(String),
}

/// The per-task runner
pub struct TaskRunner {
    data: DataDir,
    config: Config,
    backend: Arc<dyn Backend>,
    bus: Arc<EventBus>,
    queue: JobQueue,
    engine: Arc<Engine>,
    memory: Arc<MemoryEngine>,
}

impl TaskRunner {
    pub fn new(data: DataDir, config: Config, backend: Arc<dyn Backend>) -> Self {
        let bus = create_event_bus();
        let memory = Arc::new(MemoryEngine::new(data.clone(), config.memory.clone()));
        let engine = Arc::new(Engine::new(
            data.clone(),
            backend.clone(),
            bus.clone(),
            Some(memory.clone()),
            EngineConfig::from_config(&config),
        ));
        let queue = JobQueue::new(data.clone());

        Self {
            data,
            config,
            backend,
            bus,
            queue,
            engine,
            memory,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.worker.poll_interval_ms.max(10))
    }

    /// Run the task to a terminal status
    pub async fn run(&self, task_id: &str, resume: bool) -> eyre::Result<TaskStatus> {
        let mut task: Task = read_json_opt(self.data.task_file(task_id))
            .ok_or_else(|| RunnerError::TaskNotFound(task_id.to_string()))?;

        // Subscribers re-register on every process start
        TaskEventLogger::new(self.data.clone()).register(&self.bus).await;
        let stats = StatsAggregator::new(self.data.clone(), task_id);
        stats.register(&self.bus).await;
        if let Some(notifier) = WebhookNotifier::from_config(&self.config.notify) {
            notifier.register(&self.bus).await;
        }

        self.write_process_record(&task);
        info!(task_id, resume, "runner started");

        // === Plan phase ===
        let workflow = match read_json_opt::<Workflow>(self.data.workflow_file(task_id)) {
            Some(workflow) => workflow,
            None => {
                if resume {
                    return Err(eyre::eyre!("cannot resume task {}: no workflow.json", task_id));
                }
                match self.plan_phase(&mut task).await {
                    Ok(workflow) => workflow,
                    Err(e) => {
                        return self.finalize_planning_failure(&mut task, &stats, e).await;
                    }
                }
            }
        };

        // === Execute phase ===
        if matches!(task.status, TaskStatus::Pending | TaskStatus::Planning) {
            task.transition_to(TaskStatus::Developing)
                .map_err(|e| eyre::eyre!(e))?;
            self.save_task(&task)?;
            self.write_process_record(&task);
        }

        let instance = if resume {
            self.resume_instance(task_id).await?
        } else {
            self.create_instance(&task, &workflow)?
        };

        let final_instance = self.drive(&mut task, &workflow, instance.id.clone()).await?;

        // === Finalize ===
        self.finalize(&mut task, &workflow, &final_instance, &stats).await
    }

    async fn plan_phase(&self, task: &mut Task) -> eyre::Result<Workflow> {
        task.transition_to(TaskStatus::Planning).map_err(|e| eyre::eyre!(e))?;
        self.save_task(task)?;
        self.write_process_record(task);

        let planner = Planner::new(
            self.data.clone(),
            self.backend.clone(),
            Some(self.memory.clone()),
            &self.config,
        );

        let workflow = planner.plan(task).await?;
        write_json_atomic(self.data.workflow_file(&task.id), &workflow)?;
        info!(task_id = %task.id, workflow_id = %workflow.id, "plan phase complete");

        if let Some(title) = planner.improve_title(task).await {
            debug!(task_id = %task.id, %title, "adopting generated title");
            task.title = title;
            task.touch();
            self.save_task(task)?;
        }

        Ok(workflow)
    }

    fn create_instance(&self, task: &Task, workflow: &Workflow) -> eyre::Result<WorkflowInstance> {
        let mut instance = WorkflowInstance::for_workflow(workflow);
        instance.status = InstanceStatus::Running;
        instance.started_at = Some(Utc::now());

        // The start node is ready by construction
        if let Some(start) = workflow.start_node()
            && let Some(state) = instance.node_states.get_mut(&start.id)
        {
            state.status = NodeStatus::Ready;
        }
        write_json_atomic(self.data.instance_file(&task.id), &instance)?;

        self.bus.emit(Event::WorkflowStarted {
            task_id: task.id.clone(),
            instance_id: instance.id.clone(),
            workflow_id: workflow.id.clone(),
        });

        if let Some(start) = workflow.start_node() {
            self.enqueue_node(task, workflow, &instance, &start.id)?;
        }
        Ok(instance)
    }

    /// Resume protocol: guard against a live sibling, rewind interrupted
    /// nodes, recompute readiness, enqueue
    async fn resume_instance(&self, task_id: &str) -> eyre::Result<WorkflowInstance> {
        let workflow: Workflow = read_json_opt(self.data.workflow_file(task_id))
            .ok_or_else(|| eyre::eyre!("workflow.json missing for task {}", task_id))?;
        let mut instance: WorkflowInstance = read_json_opt(self.data.instance_file(task_id))
            .ok_or_else(|| eyre::eyre!("instance.json missing for task {}", task_id))?;

        // A running node with fresh activity means the previous runner may
        // still be alive; back off once, then raise a resume conflict
        for attempt in 0..2 {
            let recent_activity = instance.node_states.values().any(|state| {
                state.status == NodeStatus::Running
                    && state
                        .started_at
                        .map(|s| (Utc::now() - s).num_milliseconds() < RECENT_NODE_ACTIVITY_THRESHOLD_MS)
                        .unwrap_or(false)
            });
            if !recent_activity {
                break;
            }
            if attempt == 1 {
                return Err(RunnerError::ResumeConflict.into());
            }
            debug!(task_id, "resume: recent node activity, backing off 5s");
            tokio::time::sleep(Duration::from_secs(5)).await;
            instance = read_json_opt(self.data.instance_file(task_id))
                .ok_or_else(|| eyre::eyre!("instance.json disappeared during resume"))?;
        }

        // Interrupted nodes rewind to pending; their outputs are gone
        let interrupted: Vec<String> = instance.running_nodes().iter().map(|s| s.to_string()).collect();
        for node_id in &interrupted {
            info!(task_id, node_id = %node_id, "resume: rewinding interrupted node");
            if let Some(state) = instance.node_states.get_mut(node_id) {
                state.status = NodeStatus::Pending;
                state.completed_at = None;
                state.duration_ms = None;
            }
        }

        instance.status = InstanceStatus::Running;
        instance.error = None;
        instance.completed_at = None;

        // Recompute readiness; nodes that were already Ready re-enqueue
        // too, in case their job died with the previous process
        let sweep = graph::compute_ready(&workflow, &instance);
        for node_id in &sweep.skipped {
            instance.mark_node_skipped(node_id);
        }

        let mut to_enqueue: Vec<String> = instance
            .node_states
            .iter()
            .filter(|(_, state)| state.status == NodeStatus::Ready)
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in &sweep.ready {
            if let Some(state) = instance.node_states.get_mut(node_id) {
                state.status = NodeStatus::Ready;
            }
            if !to_enqueue.contains(node_id) {
                to_enqueue.push(node_id.clone());
            }
        }
        write_json_atomic(self.data.instance_file(task_id), &instance)?;

        let task: Task = read_json_opt(self.data.task_file(task_id))
            .ok_or_else(|| RunnerError::TaskNotFound(task_id.to_string()))?;
        for node_id in &to_enqueue {
            self.enqueue_node(&task, &workflow, &instance, node_id)?;
        }

        info!(
            task_id,
            rewound = interrupted.len(),
            enqueued = to_enqueue.len(),
            "resume complete"
        );
        Ok(instance)
    }

    fn enqueue_node(&self, task: &Task, workflow: &Workflow, instance: &WorkflowInstance, node_id: &str) -> eyre::Result<()> {
        self.queue.enqueue(
            JobData {
                task_id: task.id.clone(),
                workflow_id: workflow.id.clone(),
                instance_id: instance.id.clone(),
                node_id: node_id.to_string(),
                attempt: 1,
            },
            EnqueueOptions {
                priority: task.priority.queue_weight(),
                delay_ms: 0,
                max_attempts: self.config.tasks.max_retries.max(1),
            },
        )?;
        Ok(())
    }

    fn spawn_worker(&self, instance_id: &str) -> WorkerHandle {
        Worker::new(
            self.queue.clone(),
            self.engine.clone(),
            instance_id,
            WorkerConfig {
                concurrency: self.config.worker.concurrency.max(1),
                poll_interval: self.poll_interval(),
            },
        )
        .spawn()
    }

    /// Completion wait loop: reload the instance every poll, observe
    /// pause/cancel flips on the task file, surface human waits
    async fn drive(&self, task: &mut Task, workflow: &Workflow, instance_id: String) -> eyre::Result<WorkflowInstance> {
        let mut worker: Option<WorkerHandle> = Some(self.spawn_worker(&instance_id));

        let final_instance = loop {
            tokio::time::sleep(self.poll_interval()).await;
            self.heartbeat(task);

            let instance: WorkflowInstance = read_json_opt(self.data.instance_file(&task.id))
                .ok_or_else(|| eyre::eyre!("instance.json disappeared for task {}", task.id))?;
            if instance.status.is_terminal() {
                break instance;
            }

            let on_disk: Task = read_json_opt(self.data.task_file(&task.id))
                .ok_or_else(|| RunnerError::TaskNotFound(task.id.clone()))?;

            match on_disk.status {
                TaskStatus::Cancelled => {
                    info!(task_id = %task.id, "cancel observed, stopping");
                    if let Some(handle) = worker.take() {
                        handle.stop().await;
                    }
                    self.queue.remove_by_instance(&instance_id)?;

                    let mut cancelled = instance;
                    cancelled.status = InstanceStatus::Cancelled;
                    cancelled.completed_at = Some(Utc::now());
                    write_json_atomic(self.data.instance_file(&task.id), &cancelled)?;
                    *task = on_disk;
                    break cancelled;
                }
                TaskStatus::Paused => {
                    info!(task_id = %task.id, "pause observed, stopping worker");
                    if let Some(handle) = worker.take() {
                        handle.stop().await;
                    }
                    // Wait for unpause (or cancel) on the task file
                    loop {
                        tokio::time::sleep(self.poll_interval()).await;
                        self.heartbeat(task);
                        let current: Task = read_json_opt(self.data.task_file(&task.id))
                            .ok_or_else(|| RunnerError::TaskNotFound(task.id.clone()))?;
                        match current.status {
                            TaskStatus::Paused => continue,
                            TaskStatus::Cancelled => break,
                            _ => {
                                info!(task_id = %task.id, "unpause observed, restarting worker");
                                *task = current;
                                worker = Some(self.spawn_worker(&instance_id));
                                break;
                            }
                        }
                    }
                }
                _ => {
                    *task = on_disk;
                    self.surface_waiting(task, workflow, &instance)?;
                }
            }
        };

        if let Some(handle) = worker.take() {
            handle.stop().await;
        }
        Ok(final_instance)
    }

    /// Reflect a human-gated instance in the task status. Delay and
    /// schedule nodes also sit in `waiting`, but only human gates flip
    /// the task.
    fn surface_waiting(&self, task: &mut Task, workflow: &Workflow, instance: &WorkflowInstance) -> eyre::Result<()> {
        let gated = instance.node_states.iter().any(|(node_id, state)| {
            state.status == NodeStatus::Waiting
                && workflow
                    .node(node_id)
                    .map(|n| matches!(n.kind, crate::workflow::model::NodeKind::Human(_)))
                    .unwrap_or(false)
        });
        let active = instance.node_states.values().any(|s| {
            matches!(s.status, NodeStatus::Running | NodeStatus::Ready)
        });

        let target = if gated && !active {
            TaskStatus::Waiting
        } else if task.status == TaskStatus::Waiting && (!gated || active) {
            TaskStatus::Developing
        } else {
            return Ok(());
        };

        if task.status != target && task.status.can_transition_to(target) {
            debug!(task_id = %task.id, from = %task.status, to = %target, "surfacing gate status");
            task.transition_to(target).map_err(|e| eyre::eyre!(e))?;
            self.save_task(task)?;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        task: &mut Task,
        workflow: &Workflow,
        instance: &WorkflowInstance,
        stats: &StatsAggregator,
    ) -> eyre::Result<TaskStatus> {
        let summary = report::save_result(&self.data, task, workflow, instance)
            .map(|_| report::summary_text(instance))
            .unwrap_or_else(|e| {
                warn!(error = %e, "finalize: report rendering failed");
                format!("finished with status {}", instance.status)
            });

        let terminal = match instance.status {
            InstanceStatus::Completed => TaskStatus::Completed,
            InstanceStatus::Cancelled => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        };

        if terminal == TaskStatus::Completed && task.status == TaskStatus::Developing {
            // Brief reviewing hop so observers see the full lifecycle
            let _ = task.transition_to(TaskStatus::Reviewing);
            self.save_task(task)?;
        }

        task.output = Some(summary.clone());
        if terminal == TaskStatus::Failed {
            task.error = instance.error.clone();
        }
        if task.status != terminal {
            if task.status.can_transition_to(terminal) {
                task.transition_to(terminal).map_err(|e| eyre::eyre!(e))?;
            } else {
                task.set_status_unchecked(terminal);
            }
        }
        self.save_task(task)?;
        self.write_process_record(task);

        // Outcomes feed the memory engine so planning improves over time
        let reinforcement = match terminal {
            TaskStatus::Completed => Some(ReinforceSource::TaskSuccess),
            TaskStatus::Failed => Some(ReinforceSource::TaskFailure),
            _ => None,
        };
        if let Some(source) = reinforcement {
            for hit in self.memory.associative_retrieve(&task.description, 3) {
                let _ = self.memory.reinforce(&hit.entry.id, source);
            }
            if terminal == TaskStatus::Completed {
                let lesson = format!("Task '{}' completed: {}", task.title, truncate(&summary, 200));
                let _ = self.memory.remember(
                    &lesson,
                    crate::memory::MemoryCategory::Lesson,
                    MemorySource::task(&task.id),
                    0.6,
                );
            }
        }

        stats.flush();

        // Awaited so notifications flush before the process exits
        self.bus
            .emit_sync(Event::TaskCompleted {
                task_id: task.id.clone(),
                status: terminal.to_string(),
                summary: Some(truncate(&summary, 500)),
            })
            .await;

        info!(task_id = %task.id, status = %terminal, "runner finished");
        Ok(terminal)
    }

    async fn finalize_planning_failure(
        &self,
        task: &mut Task,
        stats: &StatsAggregator,
        error: eyre::Report,
    ) -> eyre::Result<TaskStatus> {
        warn!(task_id = %task.id, error = %error, "planning failed");
        task.error = Some(format!("planning failed: {}", error));
        task.output = None;
        if task.status.can_transition_to(TaskStatus::Failed) {
            let _ = task.transition_to(TaskStatus::Failed);
        } else {
            task.set_status_unchecked(TaskStatus::Failed);
        }
        self.save_task(task)?;
        self.write_process_record(task);
        stats.flush();

        self.bus
            .emit_sync(Event::TaskCompleted {
                task_id: task.id.clone(),
                status: TaskStatus::Failed.to_string(),
                summary: task.error.clone(),
            })
            .await;
        Ok(TaskStatus::Failed)
    }

    fn save_task(&self, task: &Task) -> eyre::Result<()> {
        write_json_atomic(self.data.task_file(&task.id), task)?;
        Ok(())
    }

    fn write_process_record(&self, task: &Task) {
        let record = ProcessRecord::for_current_process(&task.status);
        if let Err(e) = write_json_atomic(self.data.process_file(&task.id), &record) {
            warn!(error = %e, "process record write failed");
        }
    }

    fn heartbeat(&self, task: &Task) {
        let mut record: ProcessRecord =
            read_json_opt(self.data.process_file(&task.id)).unwrap_or_else(|| ProcessRecord::for_current_process(&task.status));
        record.last_heartbeat = Some(now_ms());
        record.status = task.status.to_string();
        if let Err(e) = write_json_atomic(self.data.process_file(&task.id), &record) {
            debug!(error = %e, "heartbeat write failed");
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Spawn a detached runner process for a task and record its PID
///
/// The parent returns immediately; the runner owns the task from here.
pub fn spawn_detached_runner(data: &DataDir, task_id: &str, resume: bool) -> eyre::Result<u32> {
    let exe = std::env::current_exe()?;

    let mut command = Command::new(&exe);
    command
        .arg("run-task")
        .arg(task_id)
        .arg("--data-dir")
        .arg(data.root())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if resume {
        command.arg("--resume");
    }

    let child = command.spawn()?;
    let pid = child.id();

    let record = ProcessRecord {
        pid,
        started_at: now_ms(),
        status: if resume { "resuming" } else { "starting" }.to_string(),
        last_heartbeat: None,
        error: None,
    };
    write_json_atomic(data.process_file(task_id), &record)?;

    info!(task_id, pid, "spawned detached runner");
    Ok(pid)
}

/// Re-export used by the daemon's orphan sweep
pub fn runner_alive(data: &DataDir, task_id: &str) -> bool {
    read_json_opt::<ProcessRecord>(data.process_file(task_id))
        .map(|record| record.is_alive())
        .unwrap_or(false)
}
