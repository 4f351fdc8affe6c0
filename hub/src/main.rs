//! AgentHub CLI entry point
//!
//! Exit codes: 0 success, 1 generic failure, 2 bad arguments (clap),
//! 3 not found, 4 resume conflict.

use std::io::{Read, Seek, SeekFrom};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::Context;
use tracing::debug;

use agenthub::cli::{Cli, Command, DaemonCommand, MemoryCommand, TaskCommand};
use agenthub::config::Config;
use agenthub::daemon::{self, DaemonManager};
use agenthub::domain::{Priority, Task, TaskSource, TaskStatus};
use agenthub::memory::{MemoryCategory, MemoryEngine, MemorySource, ReinforceSource};
use agenthub::queue::JobQueue;
use agenthub::runner::{RunnerError, TaskRunner, runner_alive, spawn_detached_runner};
use agenthub::workflow::instance::{InstanceStatus, NodeStatus, WorkflowInstance};
use agenthub::workflow::model::Workflow;
use agenthub::create_backend;
use hubstore::{DataDir, read_json_opt, write_json_atomic};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_RESUME_CONFLICT: i32 = 4;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let mut config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red(), e);
            return EXIT_USAGE;
        }
    };
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = Some(data_dir.clone());
    }

    let data = DataDir::new(config.data_dir());
    if let Err(e) = data.ensure() {
        eprintln!("{} cannot create data directory: {}", "error:".red(), e);
        return EXIT_FAILURE;
    }

    if let Err(e) = setup_logging(&data, cli.verbose) {
        eprintln!("{} logging setup failed: {:#}", "error:".red(), e);
    }

    let result = dispatch(cli, config, data).await;
    match result {
        Ok(code) => code,
        Err(e) => {
            if let Some(runner_error) = e.downcast_ref::<RunnerError>() {
                eprintln!("{} {}", "error:".red(), runner_error);
                return match runner_error {
                    RunnerError::ResumeConflict => EXIT_RESUME_CONFLICT,
                    RunnerError::TaskNotFound(_) => EXIT_NOT_FOUND,
                };
            }
            eprintln!("{} {:#}", "error:".red(), e);
            EXIT_FAILURE
        }
    }
}

fn setup_logging(data: &DataDir, verbose: bool) -> eyre::Result<()> {
    std::fs::create_dir_all(data.logs_dir())?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(data.daemon_log_file())
        .context("Failed to open log file")?;

    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
    Ok(())
}

async fn dispatch(cli: Cli, config: Config, data: DataDir) -> eyre::Result<i32> {
    match cli.command {
        Command::Create {
            description,
            title,
            priority,
            schedule,
            no_run,
        } => create_task(&config, &data, description, title, priority, schedule, no_run),

        Command::Task { command } => task_command(&config, &data, command).await,

        Command::Daemon { command } => daemon_command(&config, &data, command).await,

        Command::Memory { command } => memory_command(&config, &data, command),

        Command::RunTask { task_id, resume } => {
            let backend = create_backend(&config.backend);
            let runner = TaskRunner::new(data, config, backend);
            let status = runner.run(&task_id, resume).await?;
            debug!(%task_id, %status, "run-task finished");
            Ok(EXIT_OK)
        }

        Command::RunDaemon => {
            daemon::run_daemon(data, config).await?;
            Ok(EXIT_OK)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_task(
    config: &Config,
    data: &DataDir,
    description: String,
    title: Option<String>,
    priority: Option<String>,
    schedule: Option<String>,
    no_run: bool,
) -> eyre::Result<i32> {
    let priority = match priority {
        Some(raw) => match Priority::from_str(&raw) {
            Ok(priority) => priority,
            Err(e) => {
                eprintln!("{} {}", "error:".red(), e);
                return Ok(EXIT_USAGE);
            }
        },
        None => config.tasks.default_priority,
    };

    if let Some(expr) = &schedule
        && let Err(e) = cron::Schedule::from_str(expr)
    {
        eprintln!("{} invalid cron expression: {}", "error:".red(), e);
        return Ok(EXIT_USAGE);
    }

    let title = title.unwrap_or_else(|| excerpt(&description, 60));
    let mut task = Task::new(title, description);
    task.priority = priority;
    task.schedule_cron = schedule;
    task.source = Some(TaskSource::Cli);

    write_json_atomic(data.task_file(&task.id), &task)?;
    println!("{}", task.id);

    if no_run {
        println!("{} created without a runner (use `ah task resume {}` to start)", "note:".yellow(), task.id);
    } else {
        let pid = spawn_detached_runner(data, &task.id, false)?;
        println!("{} runner started (pid {})", "ok:".green(), pid);
    }
    Ok(EXIT_OK)
}

async fn task_command(config: &Config, data: &DataDir, command: TaskCommand) -> eyre::Result<i32> {
    match command {
        TaskCommand::List { status } => {
            let filter = match status.as_deref().map(TaskStatus::from_str).transpose() {
                Ok(filter) => filter,
                Err(e) => {
                    eprintln!("{} {}", "error:".red(), e);
                    return Ok(EXIT_USAGE);
                }
            };

            for task_id in data.list_task_ids() {
                let Some(task) = read_json_opt::<Task>(data.task_file(&task_id)) else {
                    continue;
                };
                if let Some(wanted) = filter
                    && task.status != wanted
                {
                    continue;
                }
                println!(
                    "{}  {}  {}  {}",
                    task.id,
                    colorize_status(task.status),
                    task.priority,
                    task.title
                );
            }
            Ok(EXIT_OK)
        }

        TaskCommand::Get { id, json, verbose } => {
            let Some(task) = read_json_opt::<Task>(data.task_file(&id)) else {
                eprintln!("{} task not found: {}", "error:".red(), id);
                return Ok(EXIT_NOT_FOUND);
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&task)?);
                if verbose {
                    if let Some(workflow) = read_json_opt::<Workflow>(data.workflow_file(&id)) {
                        println!("{}", serde_json::to_string_pretty(&workflow)?);
                    }
                    if let Some(instance) = read_json_opt::<WorkflowInstance>(data.instance_file(&id)) {
                        println!("{}", serde_json::to_string_pretty(&instance)?);
                    }
                }
                return Ok(EXIT_OK);
            }

            println!("{}   {}", "id:".bold(), task.id);
            println!("{} {}", "title:".bold(), task.title);
            println!("{} {}", "status:".bold(), colorize_status(task.status));
            println!("{} {}", "priority:".bold(), task.priority);
            println!("{} {}", "created:".bold(), task.created_at.to_rfc3339());
            if let Some(cron) = &task.schedule_cron {
                println!("{} {}", "schedule:".bold(), cron);
            }
            if let Some(error) = &task.error {
                println!("{} {}", "error:".bold(), error.red());
            }
            if let Some(output) = &task.output {
                println!("\n{}\n{}", "output:".bold(), output);
            }

            if verbose
                && let Some(instance) = read_json_opt::<WorkflowInstance>(data.instance_file(&id))
            {
                println!("\n{}", "nodes:".bold());
                let mut ids: Vec<_> = instance.node_states.keys().collect();
                ids.sort();
                for node_id in ids {
                    let state = &instance.node_states[node_id];
                    println!(
                        "  {}  {}  attempts={}  {}",
                        node_id,
                        state.status,
                        state.attempts,
                        state
                            .duration_ms
                            .map(|ms| format!("{}ms", ms))
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            Ok(EXIT_OK)
        }

        TaskCommand::Logs { id, follow } => {
            let path = data.execution_log_file(&id);
            if !data.task_dir(&id).exists() {
                eprintln!("{} task not found: {}", "error:".red(), id);
                return Ok(EXIT_NOT_FOUND);
            }

            let mut offset = 0u64;
            loop {
                if path.exists() {
                    let mut file = std::fs::File::open(&path)?;
                    let len = file.metadata()?.len();
                    if len > offset {
                        file.seek(SeekFrom::Start(offset))?;
                        let mut chunk = String::new();
                        file.read_to_string(&mut chunk)?;
                        print!("{}", chunk);
                        offset = len;
                    }
                }
                if !follow {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(EXIT_OK)
        }

        TaskCommand::Stop { id } => {
            let Some(mut task) = read_json_opt::<Task>(data.task_file(&id)) else {
                eprintln!("{} task not found: {}", "error:".red(), id);
                return Ok(EXIT_NOT_FOUND);
            };
            if task.status.is_terminal() {
                eprintln!("{} task is already {}", "error:".red(), task.status);
                return Ok(EXIT_FAILURE);
            }

            task.transition_to(TaskStatus::Cancelled)
                .map_err(|e| eyre::eyre!(e))?;
            write_json_atomic(data.task_file(&id), &task)?;

            // A live runner observes the flip; with no runner, clean up
            // here so nothing dangles
            if !runner_alive(data, &id)
                && let Some(mut instance) = read_json_opt::<WorkflowInstance>(data.instance_file(&id))
                && !instance.status.is_terminal()
            {
                JobQueue::new(data.clone()).remove_by_instance(&instance.id)?;
                instance.status = InstanceStatus::Cancelled;
                instance.completed_at = Some(chrono::Utc::now());
                write_json_atomic(data.instance_file(&id), &instance)?;
            }

            println!("{} task cancelled", "ok:".green());
            Ok(EXIT_OK)
        }

        TaskCommand::Pause { id, reason } => {
            let Some(mut task) = read_json_opt::<Task>(data.task_file(&id)) else {
                eprintln!("{} task not found: {}", "error:".red(), id);
                return Ok(EXIT_NOT_FOUND);
            };

            if let Err(e) = task.transition_to(TaskStatus::Paused) {
                eprintln!("{} {}", "error:".red(), e);
                return Ok(EXIT_FAILURE);
            }
            task.pause_reason = reason;
            write_json_atomic(data.task_file(&id), &task)?;
            println!("{} task paused", "ok:".green());
            Ok(EXIT_OK)
        }

        TaskCommand::Resume { id } => {
            let Some(mut task) = read_json_opt::<Task>(data.task_file(&id)) else {
                eprintln!("{} task not found: {}", "error:".red(), id);
                return Ok(EXIT_NOT_FOUND);
            };
            if task.status.is_terminal() {
                eprintln!("{} task is already {}", "error:".red(), task.status);
                return Ok(EXIT_FAILURE);
            }

            if task.status == TaskStatus::Paused {
                task.transition_to(TaskStatus::Developing)
                    .map_err(|e| eyre::eyre!(e))?;
                task.pause_reason = None;
                write_json_atomic(data.task_file(&id), &task)?;
            }

            // Un-gate any approved human jobs waiting in the queue
            if let Some(instance) = read_json_opt::<WorkflowInstance>(data.instance_file(&id)) {
                let resumed = JobQueue::new(data.clone()).resume_waiting_for_instance(&instance.id)?;
                if resumed > 0 {
                    println!("{} un-gated {} waiting job(s)", "ok:".green(), resumed);
                }
            }

            if runner_alive(data, &id) {
                println!("{} runner is alive; it will pick the task back up", "ok:".green());
            } else {
                let resume = data.workflow_file(&id).exists();
                let pid = spawn_detached_runner(data, &id, resume)?;
                println!("{} runner started (pid {})", "ok:".green(), pid);
            }
            Ok(EXIT_OK)
        }

        TaskCommand::Approve { id, node } => {
            let Some(task) = read_json_opt::<Task>(data.task_file(&id)) else {
                eprintln!("{} task not found: {}", "error:".red(), id);
                return Ok(EXIT_NOT_FOUND);
            };
            let Some(mut instance) = read_json_opt::<WorkflowInstance>(data.instance_file(&id)) else {
                eprintln!("{} task has no running workflow instance", "error:".red());
                return Ok(EXIT_FAILURE);
            };

            let waiting: Vec<String> = instance
                .node_states
                .iter()
                .filter(|(node_id, state)| {
                    state.status == NodeStatus::Waiting && node.as_deref().map(|n| n == node_id.as_str()).unwrap_or(true)
                })
                .map(|(node_id, _)| node_id.clone())
                .collect();

            if waiting.is_empty() {
                eprintln!("{} no waiting approval gates", "error:".red());
                return Ok(EXIT_FAILURE);
            }

            for node_id in &waiting {
                instance.mark_node_done(
                    node_id,
                    Some(serde_json::json!({ "approved": true, "approvedAt": chrono::Utc::now().to_rfc3339() })),
                );
                println!("{} approved node {}", "ok:".green(), node_id);
            }
            write_json_atomic(data.instance_file(&id), &instance)?;
            JobQueue::new(data.clone()).resume_waiting_for_instance(&instance.id)?;

            if !runner_alive(data, &id) && task.status.is_active() {
                let pid = spawn_detached_runner(data, &id, true)?;
                println!("{} runner restarted (pid {})", "ok:".green(), pid);
            }
            Ok(EXIT_OK)
        }
    }
}

async fn daemon_command(config: &Config, data: &DataDir, command: DaemonCommand) -> eyre::Result<i32> {
    let manager = DaemonManager::new(data.clone());
    match command {
        DaemonCommand::Start { foreground } => {
            if foreground {
                daemon::run_daemon(data.clone(), config.clone()).await?;
            } else {
                let pid = manager.start()?;
                println!("{} daemon started (pid {})", "ok:".green(), pid);
            }
            Ok(EXIT_OK)
        }
        DaemonCommand::Stop => {
            manager.stop()?;
            println!("{} daemon stopped", "ok:".green());
            Ok(EXIT_OK)
        }
        DaemonCommand::Status => {
            match manager.running_pid() {
                Some(pid) => println!("daemon running (pid {})", pid),
                None => println!("daemon not running"),
            }
            Ok(EXIT_OK)
        }
    }
}

fn memory_command(config: &Config, data: &DataDir, command: MemoryCommand) -> eyre::Result<i32> {
    let engine = MemoryEngine::new(data.clone(), config.memory.clone());
    match command {
        MemoryCommand::Add {
            content,
            category,
            confidence,
        } => {
            let category = match MemoryCategory::from_str(&category) {
                Ok(category) => category,
                Err(e) => {
                    eprintln!("{} {}", "error:".red(), e);
                    return Ok(EXIT_USAGE);
                }
            };
            let id = engine.remember(&content, category, MemorySource::manual(), confidence)?;
            println!("{}", id);
            Ok(EXIT_OK)
        }

        MemoryCommand::List { all } => {
            let entries = if all { engine.load_all() } else { engine.list_active() };
            for entry in entries {
                println!(
                    "{}  [{}]  strength={:.0}  {}",
                    entry.id,
                    entry.category,
                    entry.current_strength(),
                    excerpt(&entry.content, 80)
                );
            }
            Ok(EXIT_OK)
        }

        MemoryCommand::Search { query, limit } => {
            for hit in engine.associative_retrieve(&query, limit) {
                println!(
                    "{:.3}  {}  [{}]  {}",
                    hit.final_score,
                    hit.entry.id,
                    hit.entry.category,
                    excerpt(&hit.entry.content, 80)
                );
            }
            Ok(EXIT_OK)
        }

        MemoryCommand::Reinforce { id } => {
            if engine.get(&id).is_none() {
                eprintln!("{} memory not found: {}", "error:".red(), id);
                return Ok(EXIT_NOT_FOUND);
            }
            engine.reinforce(&id, ReinforceSource::ManualReview)?;
            println!("{} reinforced", "ok:".green());
            Ok(EXIT_OK)
        }

        MemoryCommand::Cleanup => {
            let stats = engine.cleanup()?;
            println!(
                "scanned {}  archived {}  deleted {}",
                stats.scanned, stats.archived, stats.deleted
            );
            Ok(EXIT_OK)
        }
    }
}

fn colorize_status(status: TaskStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        TaskStatus::Completed => text.green(),
        TaskStatus::Failed => text.red(),
        TaskStatus::Cancelled => text.dimmed(),
        TaskStatus::Paused | TaskStatus::Waiting => text.yellow(),
        TaskStatus::Developing | TaskStatus::Planning | TaskStatus::Reviewing => text.cyan(),
        TaskStatus::Pending => text.normal(),
    }
}

fn excerpt(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        line.chars().take(max).collect()
    }
}
