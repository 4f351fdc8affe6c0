//! Daemon process management
//!
//! Handles the PID file, process control, and the daemon's periodic
//! sweeps: spawning runners for due cron schedules and re-attaching
//! orphaned tasks whose runner died.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use hubstore::{DataDir, read_json_opt, write_json_atomic};

use crate::config::Config;
use crate::domain::{Task, TaskStatus};
use crate::runner::{runner_alive, spawn_detached_runner};
use crate::session::SessionManager;

/// Period between daemon sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Daemon process manager
#[derive(Debug, Clone)]
pub struct DaemonManager {
    data: DataDir,
}

impl DaemonManager {
    pub fn new(data: DataDir) -> Self {
        Self { data }
    }

    fn pid_file(&self) -> PathBuf {
        self.data.daemon_pid_file()
    }

    /// Check if a daemon is running
    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// Get the running daemon's PID
    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| hubstore::lock::process_alive(pid))
    }

    fn read_pid(&self) -> Option<u32> {
        let mut contents = String::new();
        fs::File::open(self.pid_file()).ok()?.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.pid_file().parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }
        let mut file = fs::File::create(self.pid_file()).context("Failed to create PID file")?;
        write!(file, "{}", pid).context("Failed to write PID")?;
        debug!(pid, path = %self.pid_file().display(), "wrote daemon PID file");
        Ok(())
    }

    pub fn remove_pid_file(&self) {
        if self.pid_file().exists()
            && let Err(e) = fs::remove_file(self.pid_file())
        {
            warn!(error = %e, "failed to remove daemon PID file");
        }
    }

    /// Start the daemon in the background
    ///
    /// Forks a `run-daemon` child and returns immediately.
    pub fn start(&self) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let child = Command::new(&exe)
            .arg("run-daemon")
            .arg("--data-dir")
            .arg(self.data.root())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, "daemon started");
        Ok(pid)
    }

    /// Stop the running daemon with SIGTERM
    pub fn stop(&self) -> Result<()> {
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to signal daemon")?;
        }

        self.remove_pid_file();
        info!(pid, "daemon stopped");
        Ok(())
    }
}

/// The daemon main loop: sweep schedules and orphans until SIGTERM
pub async fn run_daemon(data: DataDir, config: Config) -> Result<()> {
    let manager = DaemonManager::new(data.clone());
    manager.write_pid(std::process::id())?;
    info!(pid = std::process::id(), data_dir = %data.root().display(), "daemon running");

    let sessions = Arc::new(SessionManager::load(data.clone(), config.sessions.clone()));
    let _cleanup = SessionManager::spawn_cleanup_task(sessions.clone());

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    loop {
        schedule_sweep(&data, &config);
        orphan_sweep(&data);

        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = sigterm.recv() => {
                    info!("SIGTERM received, daemon shutting down");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, daemon shutting down");
                    break;
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    manager.remove_pid_file();
    Ok(())
}

/// Spawn runners for cron-scheduled tasks whose fire time has passed
///
/// The last fire time persists in task metadata so a sweep never
/// double-fires the same occurrence.
pub fn schedule_sweep(data: &DataDir, _config: &Config) {
    for task_id in data.list_task_ids() {
        let Some(mut task) = read_json_opt::<Task>(data.task_file(&task_id)) else {
            continue;
        };
        let Some(expr) = task.schedule_cron.clone() else { continue };

        // Only idle tasks re-fire; an active runner owns the task
        if task.status.is_active() || runner_alive(data, &task_id) {
            continue;
        }

        let schedule = match cron::Schedule::from_str(&expr) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "schedule sweep: bad cron expression");
                continue;
            }
        };

        let last_fire = task
            .metadata
            .get("lastCronFire")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(task.created_at);

        let Some(due) = schedule.after(&last_fire).next() else { continue };
        if due > Utc::now() {
            continue;
        }

        info!(task_id = %task_id, due = %due, "schedule sweep: firing scheduled task");

        // A fresh run gets a fresh instance; the workflow is reused
        let _ = std::fs::remove_file(data.instance_file(&task_id));
        task.set_status_unchecked(TaskStatus::Pending);
        task.output = None;
        task.error = None;
        task.metadata
            .insert("lastCronFire".to_string(), serde_json::json!(Utc::now().to_rfc3339()));
        if let Err(e) = write_json_atomic(data.task_file(&task_id), &task) {
            warn!(task_id = %task_id, error = %e, "schedule sweep: task write failed");
            continue;
        }
        if let Err(e) = spawn_detached_runner(data, &task_id, false) {
            warn!(task_id = %task_id, error = %e, "schedule sweep: runner spawn failed");
        }
    }
}

/// Respawn runners for active tasks whose runner process died
///
/// The resume path's own conflict guard protects against racing a runner
/// that is actually still alive.
pub fn orphan_sweep(data: &DataDir) {
    for task_id in data.list_task_ids() {
        let Some(task) = read_json_opt::<Task>(data.task_file(&task_id)) else {
            continue;
        };
        if !task.status.is_active() || runner_alive(data, &task_id) {
            continue;
        }
        // No workflow yet means planning died before producing one; a
        // fresh (non-resume) runner replans from scratch
        let resume = data.workflow_file(&task_id).exists();

        info!(task_id = %task_id, status = %task.status, resume, "orphan sweep: respawning runner");
        if let Err(e) = spawn_detached_runner(data, &task_id, resume) {
            warn!(task_id = %task_id, error = %e, "orphan sweep: spawn failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pid_file_roundtrip() {
        let temp = tempdir().unwrap();
        let data = DataDir::new(temp.path());
        let manager = DaemonManager::new(data);

        assert!(!manager.is_running());

        manager.write_pid(std::process::id()).unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.running_pid(), Some(std::process::id()));

        manager.remove_pid_file();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_dead_pid_not_running() {
        let temp = tempdir().unwrap();
        let data = DataDir::new(temp.path());
        let manager = DaemonManager::new(data);

        manager.write_pid(4194999).unwrap();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_stop_without_daemon_errors() {
        let temp = tempdir().unwrap();
        let manager = DaemonManager::new(DataDir::new(temp.path()));
        assert!(manager.stop().is_err());
    }

    #[test]
    fn test_schedule_sweep_ignores_active_and_unscheduled() {
        let temp = tempdir().unwrap();
        let data = DataDir::new(temp.path());
        data.ensure().unwrap();

        // Unscheduled task: untouched
        let plain = Task::with_id("plain", "Plain", "no cron");
        write_json_atomic(data.task_file("plain"), &plain).unwrap();

        // Scheduled but active: untouched
        let mut active = Task::with_id("active", "Active", "busy");
        active.schedule_cron = Some("0 0 * * * *".to_string());
        active.set_status_unchecked(TaskStatus::Developing);
        write_json_atomic(data.task_file("active"), &active).unwrap();

        schedule_sweep(&data, &Config::default());

        let plain_after: Task = read_json_opt(data.task_file("plain")).unwrap();
        assert!(!plain_after.metadata.contains_key("lastCronFire"));
        let active_after: Task = read_json_opt(data.task_file("active")).unwrap();
        assert_eq!(active_after.status, TaskStatus::Developing);
    }

    #[test]
    fn test_schedule_sweep_skips_future_fire() {
        let temp = tempdir().unwrap();
        let data = DataDir::new(temp.path());
        data.ensure().unwrap();

        // Fires once a year at a second that just passed this year or is
        // far in the future; pin lastCronFire to now so next fire is ahead
        let mut task = Task::with_id("yearly", "Yearly", "rare");
        task.set_status_unchecked(TaskStatus::Completed);
        task.schedule_cron = Some("0 0 0 1 1 * 2099".to_string());
        write_json_atomic(data.task_file("yearly"), &task).unwrap();

        schedule_sweep(&data, &Config::default());

        let after: Task = read_json_opt(data.task_file("yearly")).unwrap();
        assert_eq!(after.status, TaskStatus::Completed, "future schedule must not fire");
    }

    #[test]
    fn test_bad_cron_expression_tolerated() {
        let temp = tempdir().unwrap();
        let data = DataDir::new(temp.path());
        data.ensure().unwrap();

        let mut task = Task::with_id("bad", "Bad", "broken cron");
        task.set_status_unchecked(TaskStatus::Completed);
        task.schedule_cron = Some("not a cron".to_string());
        write_json_atomic(data.task_file("bad"), &task).unwrap();

        // Must not panic or mutate the task
        schedule_sweep(&data, &Config::default());
        let after: Task = read_json_opt(data.task_file("bad")).unwrap();
        assert_eq!(after.status, TaskStatus::Completed);
    }

    #[test]
    fn test_orphan_sweep_skips_terminal_and_alive() {
        let temp = tempdir().unwrap();
        let data = DataDir::new(temp.path());
        data.ensure().unwrap();

        let done = {
            let mut task = Task::with_id("done", "Done", "finished");
            task.set_status_unchecked(TaskStatus::Completed);
            task
        };
        write_json_atomic(data.task_file("done"), &done).unwrap();

        // Active task with a live "runner" (this test process)
        let mut alive = Task::with_id("alive", "Alive", "running");
        alive.set_status_unchecked(TaskStatus::Developing);
        write_json_atomic(data.task_file("alive"), &alive).unwrap();
        write_json_atomic(
            data.process_file("alive"),
            &crate::domain::ProcessRecord::for_current_process(&TaskStatus::Developing),
        )
        .unwrap();

        // Sweep must not touch either (no spawn attempted for them means
        // no process.json rewrite for "done")
        orphan_sweep(&data);
        assert!(!data.process_file("done").exists());
    }
}
