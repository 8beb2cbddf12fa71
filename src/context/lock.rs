//! Repository mutual exclusion.
//!
//! Two layers guard each repository:
//!
//! 1. An in-process FIFO queue per repo path. Callers inside one process
//!    line up on an async mutex; a panicked or errored holder cannot wedge
//!    the chain because the guard releases on drop.
//! 2. A cross-process lock file at `<git-dir>/teapot-exec.lock` holding
//!    `{pid, lockId, timestamp}`. Creation is exclusive (`O_EXCL`); after a
//!    successful create the file is read back and the lockId compared, so
//!    a racer that unlinked and re-created the file between our stale
//!    check and our write is detected rather than silently shared.
//!
//! A lock file is stale — and may be broken — when it is corrupt, or older
//! than the configured threshold, or its owning PID no longer exists.

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::clock::{Clock, Millis};
use crate::config::EngineConfig;
use crate::errors::LockAcquisitionError;
use crate::events::{EngineEvent, EventSink, LockBreakReason};

/// Lock file name within the git dir.
pub const LOCK_FILE: &str = "teapot-exec.lock";

pub fn lock_path(git_dir: &Path) -> PathBuf {
    git_dir.join(LOCK_FILE)
}

/// On-disk lock contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFileContents {
    pub pid: u32,
    pub lock_id: String,
    pub timestamp: Millis,
}

/// Check if a process with the given PID is still running.
#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // kill(pid, 0) probes existence without delivering a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    // No cheap probe available: assume alive so valid locks are never
    // broken by mistake. Stale locks still age out via the timestamp.
    true
}

/// Why (and whether) an existing lock file may be broken.
fn staleness(path: &Path, now_ms: Millis, stale_after_ms: i64) -> Option<LockBreakReason> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        // Already gone: nothing to break.
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(_) => return Some(LockBreakReason::Corrupt),
    };
    let contents: LockFileContents = match serde_json::from_str(&raw) {
        Ok(contents) => contents,
        Err(_) => return Some(LockBreakReason::Corrupt),
    };

    if now_ms.saturating_sub(contents.timestamp) > stale_after_ms {
        return Some(LockBreakReason::Expired);
    }
    if !is_process_running(contents.pid) {
        return Some(LockBreakReason::DeadOwner);
    }
    None
}

/// ENOENT-tolerant unlink. A failure is left for the next acquisition's
/// staleness check to deal with.
fn unlink_quietly(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Held cross-process lock. Unlinks its file on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
    lock_id: String,
    released: bool,
}

impl FileLockGuard {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit release; drop does the same.
    pub fn release(mut self) {
        unlink_quietly(&self.path);
        self.released = true;
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if !self.released {
            unlink_quietly(&self.path);
        }
    }
}

/// Acquire the cross-process lock for a repository.
///
/// Bounded attempts with jittered linear backoff; exhaustion raises a
/// typed `LockAcquisitionError` carrying the repo path and attempt count.
pub async fn acquire_file_lock(
    repo_path: &Path,
    git_dir: &Path,
    config: &EngineConfig,
    clock: &dyn Clock,
    events: &dyn EventSink,
    logger: &Logger,
) -> Result<FileLockGuard> {
    let path = lock_path(git_dir);
    let lock_id = Uuid::new_v4().to_string();

    for attempt in 0..config.lock_attempts {
        match try_create(&path, &lock_id, clock)? {
            CreateResult::Won => {
                return Ok(FileLockGuard {
                    path,
                    lock_id,
                    released: false,
                });
            }
            CreateResult::LostRace => {
                // Another process slid in between our unlink and create;
                // their file is fresh, so back off and requeue.
                slog::debug!(logger, "lost lock creation race"; "repo" => %repo_path.display());
            }
            CreateResult::Held => {
                if let Some(reason) = staleness(&path, clock.now_ms(), config.stale_lock_ms) {
                    slog::warn!(
                        logger,
                        "breaking stale execution lock";
                        "repo" => %repo_path.display(),
                        "reason" => format!("{:?}", reason)
                    );
                    events.emit(EngineEvent::LockBroken { reason });
                    unlink_quietly(&path);
                    // Retry immediately; the slot may now be free.
                    continue;
                }
            }
        }

        let jitter = rand::thread_rng().gen_range(0..25u64);
        let delay = 40 * (attempt as u64 + 1) + jitter;
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    Err(LockAcquisitionError {
        repo_path: repo_path.to_path_buf(),
        attempts: config.lock_attempts,
    }
    .into())
}

enum CreateResult {
    /// We created the file and the read-back shows our lockId.
    Won,
    /// We created a file but the read-back shows someone else's lockId.
    LostRace,
    /// The file already existed.
    Held,
}

fn try_create(path: &Path, lock_id: &str, clock: &dyn Clock) -> Result<CreateResult> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create git dir for lock file")?;
    }

    let created = OpenOptions::new().write(true).create_new(true).open(path);
    let mut file = match created {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(CreateResult::Held),
        Err(e) => return Err(e).context("Failed to create lock file"),
    };

    let contents = LockFileContents {
        pid: std::process::id(),
        lock_id: lock_id.to_string(),
        timestamp: clock.now_ms(),
    };
    file.write_all(serde_json::to_string(&contents)?.as_bytes())
        .context("Failed to write lock file")?;
    file.sync_all().ok();
    drop(file);

    // TOCTOU defense: confirm the file on disk is ours.
    let on_disk: Option<LockFileContents> = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok());
    match on_disk {
        Some(contents) if contents.lock_id == lock_id => Ok(CreateResult::Won),
        _ => Ok(CreateResult::LostRace),
    }
}

/// Per-repo in-process FIFO queue.
#[derive(Default)]
pub struct InProcessQueue {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held queue slot. Dropping it wakes the next waiter and removes the map
/// entry when it was the last link in the chain.
pub struct QueueGuard {
    key: String,
    entries: Arc<InProcessQueue>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl InProcessQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(self: &Arc<Self>, key: &str) -> QueueGuard {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let permit = entry.lock_owned().await;
        QueueGuard {
            key: key.to_string(),
            entries: self.clone(),
            permit: Some(permit),
        }
    }

    /// Number of live queue entries, for tests and health reporting.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        // Release the permit first so waiters proceed, then garbage-collect
        // the entry if nobody else references it.
        self.permit.take();
        let mut entries = self.entries.entries.lock().unwrap();
        if let Some(entry) = entries.get(&self.key) {
            if Arc::strong_count(entry) == 1 {
                entries.remove(&self.key);
            }
        }
    }
}
