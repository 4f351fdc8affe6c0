//! Worker - the dequeue loop driving node execution
//!
//! Each task runner owns one worker bound to one instance. Every poll
//! tick promotes delayed jobs, claims eligible jobs up to the concurrency
//! cap, and hands them to the engine. Failures flow through the retry
//! classifier; retryable ones re-enqueue delayed, exhausted ones fail the
//! node and (under failfast) the instance.

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::engine::{Engine, NodeOutcome};
use crate::queue::{EnqueueOptions, JobData, JobQueue};

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent node executions
    pub concurrency: usize,
    /// Poll interval between queue sweeps
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// The worker loop, bound to one instance
pub struct Worker {
    queue: JobQueue,
    engine: Arc<Engine>,
    instance_id: String,
    config: WorkerConfig,
}

/// Handle for stopping a spawned worker
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for in-flight nodes to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "worker task join failed");
        }
    }
}

impl Worker {
    pub fn new(queue: JobQueue, engine: Arc<Engine>, instance_id: impl Into<String>, config: WorkerConfig) -> Self {
        Self {
            queue,
            engine,
            instance_id: instance_id.into(),
            config,
        }
    }

    /// Spawn the poll loop as a background task
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(rx));
        WorkerHandle { shutdown, handle }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(instance_id = %self.instance_id, "worker started");
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.queue.promote_delayed() {
                warn!(error = %e, "worker: promote_delayed failed");
            }

            while in_flight.len() < self.config.concurrency {
                match self.queue.dequeue_for_instance(&self.instance_id) {
                    Ok(Some(job)) => {
                        debug!(job_id = %job.id, node_id = %job.data.node_id, "worker: claimed job");
                        let engine = self.engine.clone();
                        let queue = self.queue.clone();
                        in_flight.spawn(async move {
                            process_job(engine, queue, job).await;
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "worker: dequeue failed");
                        break;
                    }
                }
            }

            // Reap finished executions without blocking the poll cadence
            while in_flight.try_join_next().is_some() {}

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        // Running nodes finish before the worker stops (pause semantics)
        while in_flight.join_next().await.is_some() {}
        debug!(instance_id = %self.instance_id, "worker stopped");
    }
}

/// Execute one claimed job and apply its outcome to the queue
async fn process_job(engine: Arc<Engine>, queue: JobQueue, job: crate::queue::Job) {
    let outcome = match engine.execute_node(&job).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Infrastructure failure (store I/O, missing files): the job
            // fails in place and crash-resume picks the node back up
            warn!(job_id = %job.id, error = %e, "process_job: engine error");
            let _ = queue.mark_failed(&job.id, &e.to_string());
            return;
        }
    };

    match outcome {
        NodeOutcome::Completed { next } => {
            if let Err(e) = queue.mark_completed(&job.id) {
                warn!(job_id = %job.id, error = %e, "process_job: mark_completed failed");
            }
            for node_id in next {
                let data = JobData {
                    node_id,
                    attempt: 1,
                    ..job.data.clone()
                };
                if let Err(e) = queue.enqueue(
                    data,
                    EnqueueOptions {
                        priority: job.priority,
                        delay_ms: 0,
                        max_attempts: job.max_attempts,
                    },
                ) {
                    warn!(error = %e, "process_job: enqueue next failed");
                }
            }
        }

        NodeOutcome::Deferred { delay_ms } => {
            debug!(job_id = %job.id, delay_ms, "process_job: deferring job");
            // Re-enqueue replaces this job's open slot
            if let Err(e) = queue.enqueue(
                job.data.clone(),
                EnqueueOptions {
                    priority: job.priority,
                    delay_ms,
                    max_attempts: job.max_attempts,
                },
            ) {
                warn!(error = %e, "process_job: defer enqueue failed");
            }
        }

        NodeOutcome::Waiting => {
            if let Err(e) = queue.mark_human_waiting(&job.id) {
                warn!(job_id = %job.id, error = %e, "process_job: mark_human_waiting failed");
            }
        }

        NodeOutcome::Failed {
            error,
            attempts,
            node_max_attempts,
        } => {
            let decision = retry::should_retry(&error, attempts, node_max_attempts);
            debug!(job_id = %job.id, reason = %decision.reason, "process_job: classified failure");

            if let Err(e) = engine.handle_failure(&job, &error, &decision).await {
                warn!(job_id = %job.id, error = %e, "process_job: handle_failure failed");
            }

            if decision.should_retry {
                let data = JobData {
                    attempt: decision.next_attempt,
                    ..job.data.clone()
                };
                if let Err(e) = queue.enqueue(
                    data,
                    EnqueueOptions {
                        priority: job.priority,
                        delay_ms: decision.delay_ms,
                        max_attempts: job.max_attempts,
                    },
                ) {
                    warn!(error = %e, "process_job: retry enqueue failed");
                }
            } else {
                let _ = queue.mark_failed(&job.id, &error);
                // Failfast: nothing else of this instance should run
                match queue.remove_open_by_instance(&job.data.instance_id) {
                    Ok(removed) if removed > 0 => {
                        debug!(removed, "process_job: cleared open jobs after permanent failure");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "process_job: cleanup failed"),
                }
            }
        }
    }
}
