//! Durable job queue
//!
//! One process-wide queue at `queue.json`, mutated only under
//! `queue.json.lock`. Every operation is read-modify-write inside the held
//! lock; nothing is cached across releases, so concurrent runners always
//! see each other's updates.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use hubstore::{DataDir, FileLock, StoreError, now_ms, read_json_or_default, write_json_atomic};

use crate::domain::generate_id;

/// Errors from queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// The durable file or its lock failed underneath the queue
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },
}

/// What a job executes: one node of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub task_id: String,
    pub workflow_id: String,
    pub instance_id: String,
    pub node_id: String,
    /// Attempt number carried for log lines; the node state owns the
    /// canonical count
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    HumanWaiting,
}

impl JobStatus {
    /// Statuses that still occupy the (instance, node) slot
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active | Self::Delayed | Self::HumanWaiting)
    }
}

/// A queued node execution
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,

    pub data: JobData,

    pub status: JobStatus,

    /// Higher dequeues first
    pub priority: i32,

    pub delay_ms: u64,

    pub attempts: u32,

    pub max_attempts: u32,

    /// Unix ms
    pub created_at: i64,

    /// Wall time at which the job becomes eligible
    pub process_at: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `queue.json` schema
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueFile {
    pub jobs: Vec<Job>,
    pub updated_at: i64,
}

/// Options for enqueueing
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            delay_ms: 0,
            max_attempts: 3,
        }
    }
}

/// Handle on the shared on-disk queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    data: DataDir,
    lock: FileLock,
}

impl JobQueue {
    pub fn new(data: DataDir) -> Self {
        let lock = FileLock::new(data.queue_lock_file());
        Self { data, lock }
    }

    /// Run `f` over the queue file under the cross-process lock
    fn with_queue<T>(&self, f: impl FnOnce(&mut QueueFile) -> T) -> Result<T, QueueError> {
        let guard = self.lock.acquire()?;
        let mut queue: QueueFile = read_json_or_default(self.data.queue_file());
        let result = f(&mut queue);
        queue.updated_at = now_ms();
        write_json_atomic(self.data.queue_file(), &queue)?;
        drop(guard);
        Ok(result)
    }

    /// Enqueue a node job
    ///
    /// An open job for the same (instance, node) is replaced; this is how
    /// retries re-enqueue without violating the single-slot invariant.
    pub fn enqueue(&self, data: JobData, options: EnqueueOptions) -> Result<String, QueueError> {
        let id = generate_id("job", &data.node_id);
        let job_id = id.clone();

        self.with_queue(move |queue| {
            let replaced = queue.jobs.iter().position(|j| {
                j.status.is_open() && j.data.instance_id == data.instance_id && j.data.node_id == data.node_id
            });
            if let Some(index) = replaced {
                debug!(
                    old_job_id = %queue.jobs[index].id,
                    node_id = %data.node_id,
                    "enqueue: replacing open job for node"
                );
                queue.jobs.remove(index);
            }

            let now = now_ms();
            let status = if options.delay_ms > 0 {
                JobStatus::Delayed
            } else {
                JobStatus::Waiting
            };
            queue.jobs.push(Job {
                id,
                attempts: data.attempt,
                data,
                status,
                priority: options.priority,
                delay_ms: options.delay_ms,
                max_attempts: options.max_attempts,
                created_at: now,
                process_at: now + options.delay_ms as i64,
                completed_at: None,
                error: None,
            });
        })?;

        Ok(job_id)
    }

    /// Claim the best eligible job: highest priority, oldest first.
    /// Claiming marks it active inside the same lock hold.
    pub fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        self.dequeue_filtered(|_| true)
    }

    /// Claim the best eligible job belonging to one instance
    pub fn dequeue_for_instance(&self, instance_id: &str) -> Result<Option<Job>, QueueError> {
        self.dequeue_filtered(|job| job.data.instance_id == instance_id)
    }

    fn dequeue_filtered(&self, eligible: impl Fn(&Job) -> bool) -> Result<Option<Job>, QueueError> {
        self.with_queue(|queue| {
            let now = now_ms();
            let best = queue
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, j)| j.status == JobStatus::Waiting && j.process_at <= now && eligible(j))
                .max_by(|(_, a), (_, b)| {
                    a.priority
                        .cmp(&b.priority)
                        .then(b.created_at.cmp(&a.created_at))
                })
                .map(|(i, _)| i);

            best.map(|index| {
                let job = &mut queue.jobs[index];
                job.status = JobStatus::Active;
                job.clone()
            })
        })
    }

    pub fn mark_active(&self, job_id: &str) -> Result<(), QueueError> {
        self.set_status(job_id, JobStatus::Active, None)
    }

    pub fn mark_completed(&self, job_id: &str) -> Result<(), QueueError> {
        self.set_status(job_id, JobStatus::Completed, None)
    }

    pub fn mark_failed(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        self.set_status(job_id, JobStatus::Failed, Some(error.to_string()))
    }

    /// Park a job behind a human approval gate
    pub fn mark_human_waiting(&self, job_id: &str) -> Result<(), QueueError> {
        self.set_status(job_id, JobStatus::HumanWaiting, None)
    }

    fn set_status(&self, job_id: &str, status: JobStatus, error: Option<String>) -> Result<(), QueueError> {
        self.with_queue(|queue| {
            match queue.jobs.iter_mut().find(|j| j.id == job_id) {
                Some(job) => {
                    job.status = status;
                    if matches!(status, JobStatus::Completed | JobStatus::Failed) {
                        job.completed_at = Some(now_ms());
                    }
                    job.error = error;
                    Ok(())
                }
                None => Err(QueueError::JobNotFound {
                    job_id: job_id.to_string(),
                }),
            }
        })?
    }

    /// Sweep delayed jobs whose time has come back to waiting
    pub fn promote_delayed(&self) -> Result<usize, QueueError> {
        self.with_queue(|queue| {
            let now = now_ms();
            let mut promoted = 0;
            for job in &mut queue.jobs {
                if job.status == JobStatus::Delayed && job.process_at <= now {
                    job.status = JobStatus::Waiting;
                    promoted += 1;
                }
            }
            if promoted > 0 {
                debug!(promoted, "promote_delayed: promoted jobs");
            }
            promoted
        })
    }

    /// Un-gate every human-waiting job of an instance
    pub fn resume_waiting_for_instance(&self, instance_id: &str) -> Result<usize, QueueError> {
        self.with_queue(|queue| {
            let mut resumed = 0;
            for job in &mut queue.jobs {
                if job.status == JobStatus::HumanWaiting && job.data.instance_id == instance_id {
                    job.status = JobStatus::Waiting;
                    resumed += 1;
                }
            }
            resumed
        })
    }

    pub fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, QueueError> {
        self.with_queue(|queue| queue.jobs.iter().filter(|j| j.status == status).cloned().collect())
    }

    pub fn list_for_instance(&self, instance_id: &str) -> Result<Vec<Job>, QueueError> {
        self.with_queue(|queue| {
            queue
                .jobs
                .iter()
                .filter(|j| j.data.instance_id == instance_id)
                .cloned()
                .collect()
        })
    }

    /// Drop every job of an instance (cancel / failfast cleanup)
    pub fn remove_by_instance(&self, instance_id: &str) -> Result<usize, QueueError> {
        self.with_queue(|queue| {
            let before = queue.jobs.len();
            queue.jobs.retain(|j| j.data.instance_id != instance_id);
            before - queue.jobs.len()
        })
    }

    /// Drop not-yet-active jobs of an instance (failfast keeps the active
    /// one so its worker can observe the failure)
    pub fn remove_open_by_instance(&self, instance_id: &str) -> Result<usize, QueueError> {
        self.with_queue(|queue| {
            let before = queue.jobs.len();
            queue.jobs.retain(|j| {
                !(j.data.instance_id == instance_id
                    && matches!(j.status, JobStatus::Waiting | JobStatus::Delayed | JobStatus::HumanWaiting))
            });
            before - queue.jobs.len()
        })
    }
}
