//! Cross-process lock files
//!
//! One well-known lock file per shared resource. The file contains the
//! holder's PID; acquisition creates it exclusively. A holder that died or
//! went silent past `LOCK_TIMEOUT_MS` is evicted by unlinking its file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use crate::StoreError;

/// Age past which a lock file is considered abandoned even if the holder
/// PID still exists (the holder may be wedged)
pub const LOCK_TIMEOUT_MS: u64 = 30_000;

/// Bounded spin for the blocking acquire
const ACQUIRE_ATTEMPTS: u32 = 10;
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(100);

/// A named cross-process lock backed by a PID file
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Create a lock handle for the given lock file path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Acquire the lock, spinning up to ~1s before giving up
    pub fn acquire(&self) -> Result<LockGuard, StoreError> {
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            match self.try_acquire() {
                Ok(guard) => return Ok(guard),
                Err(StoreError::LockBusy { .. }) => {
                    debug!(path = %self.path.display(), attempt, "FileLock::acquire: busy, retrying");
                    std::thread::sleep(ACQUIRE_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }

        let holder = self.read_holder().unwrap_or(0);
        Err(StoreError::LockContended {
            path: self.path.clone(),
            holder,
            attempts: ACQUIRE_ATTEMPTS,
        })
    }

    /// Try to acquire the lock without blocking
    pub fn try_acquire(&self) -> Result<LockGuard, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                write!(file, "{}", std::process::id()).map_err(|e| StoreError::io(&self.path, e))?;
                debug!(path = %self.path.display(), "FileLock::try_acquire: acquired");
                Ok(LockGuard {
                    path: self.path.clone(),
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.is_stale() {
                    warn!(path = %self.path.display(), "FileLock::try_acquire: evicting stale lock");
                    let _ = fs::remove_file(&self.path);
                    // One immediate retry after eviction; a racing process may win
                    return match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                        Ok(mut file) => {
                            write!(file, "{}", std::process::id()).map_err(|e| StoreError::io(&self.path, e))?;
                            Ok(LockGuard {
                                path: self.path.clone(),
                                released: false,
                            })
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StoreError::LockBusy {
                            path: self.path.clone(),
                        }),
                        Err(e) => Err(StoreError::io(&self.path, e)),
                    };
                }
                Err(StoreError::LockBusy {
                    path: self.path.clone(),
                })
            }
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    /// Read the PID recorded in the lock file
    pub fn read_holder(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    /// A lock is stale when its holder is dead or its mtime exceeds
    /// `LOCK_TIMEOUT_MS`
    fn is_stale(&self) -> bool {
        let holder_dead = match self.read_holder() {
            Some(pid) => !process_alive(pid),
            // Unreadable or empty lock file: treat as abandoned
            None => true,
        };
        if holder_dead {
            return true;
        }

        match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime
                .elapsed()
                .map(|age| age >= Duration::from_millis(LOCK_TIMEOUT_MS))
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Check process liveness with a no-op signal
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Guard that unlinks the lock file when dropped
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Release the lock early
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "LockGuard: release failed");
            } else {
                debug!(path = %self.path.display(), "LockGuard: released");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
