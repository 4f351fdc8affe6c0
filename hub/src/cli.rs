//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// AgentHub - durable task orchestrator for LLM code agents
#[derive(Parser)]
#[command(
    name = "ah",
    about = "Turn free-form task descriptions into durable agent workflows",
    version,
    after_help = "Logs are written to <data-dir>/logs/agenthub.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory override
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Create a task from a description and start its runner
    Create {
        /// What should be done
        description: String,

        /// Explicit title (defaults to a description excerpt)
        #[arg(long)]
        title: Option<String>,

        /// Priority: low, medium, high
        #[arg(long)]
        priority: Option<String>,

        /// Cron schedule (sec min hour dom mon dow [year])
        #[arg(long, value_name = "CRON")]
        schedule: Option<String>,

        /// Create the task without starting a runner
        #[arg(long)]
        no_run: bool,
    },

    /// Inspect and control tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Control the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Curate the memory engine
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },

    /// Internal: run a task's runner in this process (used by spawn)
    #[command(hide = true)]
    RunTask {
        task_id: String,

        /// Resume an interrupted run instead of planning fresh
        #[arg(long)]
        resume: bool,
    },

    /// Internal: run as the daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,
}

/// Task subcommands
#[derive(Subcommand)]
pub enum TaskCommand {
    /// List tasks
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one task
    Get {
        id: String,

        /// Emit raw JSON
        #[arg(long)]
        json: bool,

        /// Include workflow and instance detail
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show a task's execution log
    Logs {
        id: String,

        /// Follow new output (like tail -f)
        #[arg(short, long)]
        follow: bool,
    },

    /// Cancel a task
    Stop { id: String },

    /// Pause a running task
    Pause {
        id: String,

        /// Why the task is being paused
        #[arg(long)]
        reason: Option<String>,
    },

    /// Resume a paused or interrupted task
    Resume { id: String },

    /// Approve a waiting human gate
    Approve {
        id: String,

        /// Specific node to approve (defaults to every waiting gate)
        #[arg(long)]
        node: Option<String>,
    },
}

/// Daemon subcommands
#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon in the background
    Start {
        /// Don't fork; run in the foreground
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,
}

/// Memory subcommands
#[derive(Subcommand)]
pub enum MemoryCommand {
    /// Store a fact
    Add {
        content: String,

        /// pattern, lesson, preference, pitfall, tool
        #[arg(long, default_value = "lesson")]
        category: String,

        /// Confidence in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        confidence: f64,
    },

    /// List entries
    List {
        /// Include archived entries
        #[arg(long)]
        all: bool,
    },

    /// Associative search
    Search {
        query: String,

        #[arg(short = 'n', long, default_value_t = 5)]
        limit: usize,
    },

    /// Reinforce an entry
    Reinforce { id: String },

    /// Run the forgetting sweep
    Cleanup,
}
