//! Cross-process advisory locks for scratchpad files.
//!
//! Each data file has a sidecar `<file>.lock`. Mutual exclusion comes from
//! `fs2` advisory locks on the sidecar, so a crashed holder's lock is
//! released by the OS. Writers take the lock exclusively and stamp the
//! sidecar with their PID and acquisition time; readers take it shared,
//! which is what lets a writer drain readers by waiting.
//!
//! A waiter that finds the sidecar held by a dead PID, or stamped longer
//! ago than [`STALE_LOCK_AGE`], breaks the lock by unlinking the sidecar
//! and re-locking a fresh file. The hung holder keeps its flock on the
//! orphaned inode, where it can no longer block anyone.

use crate::errors::ScratchpadError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

/// Default bound on how long an acquisition may wait.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Age after which a held lock is treated as abandoned and broken.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(300);

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Diagnostic payload written into the sidecar by the current holder.
#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at: chrono::DateTime<chrono::Utc>,
}

/// A held advisory lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    exclusive: bool,
}

impl FileLock {
    /// Acquire the write lock for `data_path`, waiting up to `timeout`.
    pub fn exclusive(data_path: &Path, timeout: Duration) -> Result<Self, ScratchpadError> {
        Self::acquire(data_path, timeout, true)
    }

    /// Acquire a read lock for `data_path`, waiting up to `timeout`.
    pub fn shared(data_path: &Path, timeout: Duration) -> Result<Self, ScratchpadError> {
        Self::acquire(data_path, timeout, false)
    }

    fn acquire(data_path: &Path, timeout: Duration, exclusive: bool) -> Result<Self, ScratchpadError> {
        let lock_path = sidecar_path(data_path);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ScratchpadError::Io {
                action: "create lock directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut file = open_sidecar(&lock_path)?;
        let start = Instant::now();
        loop {
            let locked = if exclusive {
                file.try_lock_exclusive().is_ok()
            } else {
                file.try_lock_shared().is_ok()
            };

            if locked {
                let mut lock = Self {
                    file,
                    path: lock_path,
                    exclusive,
                };
                if exclusive {
                    lock.write_holder();
                }
                return Ok(lock);
            }

            if is_stale(&lock_path) {
                // Break the lock: unlink the sidecar so fresh waiters bind
                // a new inode. The stale holder keeps its flock on the
                // orphan and can no longer block anyone.
                warn!(path = %lock_path.display(), "breaking stale lock");
                let _ = std::fs::remove_file(&lock_path);
                file = open_sidecar(&lock_path)?;
                continue;
            }

            if start.elapsed() >= timeout {
                return Err(ScratchpadError::LockTimeout {
                    path: lock_path,
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Best-effort holder stamp; the lock is valid even if this write fails.
    fn write_holder(&mut self) {
        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: chrono::Utc::now(),
        };
        if let Ok(body) = serde_yaml::to_string(&holder) {
            let _ = self.file.set_len(0);
            let _ = self.file.write_all(body.as_bytes());
            let _ = self.file.flush();
        }
    }

    /// Path of the sidecar lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.exclusive {
            let _ = self.file.set_len(0);
        }
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn open_sidecar(lock_path: &Path) -> Result<File, ScratchpadError> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|source| ScratchpadError::Io {
            action: "open lock file",
            path: lock_path.to_path_buf(),
            source,
        })
}

/// Whether the current holder of `lock_path` looks abandoned.
///
/// An exclusive holder stamps the sidecar with its PID and acquisition
/// time: a dead PID or an over-age stamp marks it stale. Shared holders
/// leave no stamp, so an unstamped sidecar is judged by its mtime.
fn is_stale(lock_path: &Path) -> bool {
    if let Some(holder) = read_holder(lock_path) {
        if !pid_alive(holder.pid) {
            return true;
        }
        let age = chrono::Utc::now().signed_duration_since(holder.acquired_at);
        return age > chrono::Duration::seconds(STALE_LOCK_AGE.as_secs() as i64);
    }
    match lock_path.metadata().and_then(|m| m.modified()) {
        Ok(modified) => modified
            .elapsed()
            .map(|age| age > STALE_LOCK_AGE)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn read_holder(lock_path: &Path) -> Option<LockHolder> {
    let raw = std::fs::read_to_string(lock_path).ok()?;
    serde_yaml::from_str(&raw).ok()
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without procfs only the age check applies.
#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Sidecar path for a data file: `<file>.lock`.
pub fn sidecar_path(data_path: &Path) -> PathBuf {
    let mut name = data_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    data_path.with_file_name(name)
}
