//! AgentHub - durable task orchestrator for LLM code agents
//!
//! AgentHub turns a free-form task description into a durable, resumable
//! workflow of steps and drives each step to completion by delegating it
//! to a code-agent subprocess. State lives in files: a crash-safe store,
//! an on-disk job queue under a cross-process lock, and one detached
//! runner process per task that makes progress across restarts.
//!
//! # Modules
//!
//! - [`backend`] - uniform interface to the code-agent subprocess
//! - [`workflow`] - graph model, runtime instance, expression language
//! - [`queue`] - durable priority+FIFO job queue
//! - [`worker`] - dequeue loop and retry classification
//! - [`engine`] - node-type dispatch and instance mutation
//! - [`runner`] - per-task detached process lifecycle
//! - [`events`] - in-process pub/sub, event logs, stats
//! - [`session`] - per-chat conversation sessions
//! - [`memory`] - forgetting/associative memory engine
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod backend;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod engine;
pub mod events;
pub mod failure;
pub mod memory;
pub mod notify;
pub mod queue;
pub mod runner;
pub mod session;
pub mod worker;
pub mod workflow;

// Re-export commonly used types
pub use backend::{Backend, BackendError, InvokeOptions, Invocation, ProcessBackend, create_backend};
pub use config::{BackendConfig, Config, NotifyConfig, SessionsConfig};
pub use daemon::DaemonManager;
pub use domain::{Priority, ProcessRecord, Task, TaskSource, TaskStatus};
pub use engine::{Engine, EngineConfig, NodeOutcome};
pub use events::{Event, EventBus, StatsAggregator, TaskEventLogger, WorkflowExecutionStats, create_event_bus};
pub use failure::{FailureKb, FailureRecord};
pub use memory::{MemoryCategory, MemoryEngine, MemoryEntry, MemorySource, ReinforceSource};
pub use queue::{EnqueueOptions, Job, JobData, JobQueue, JobStatus, QueueError};
pub use runner::{RunnerError, TaskRunner, spawn_detached_runner};
pub use session::{ChatSession, SessionManager};
pub use worker::{Worker, WorkerConfig, WorkerHandle, retry};
pub use workflow::{
    Edge, InstanceStatus, Node, NodeKind, NodeState, NodeStatus, Workflow, WorkflowInstance,
};
