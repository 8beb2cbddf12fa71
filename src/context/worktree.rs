//! Temporary worktree lifecycle.
//!
//! Operations run in throwaway worktrees under
//! `<git-dir>/teapot-worktrees/teapot-exec-<16-hex>`, created at the trunk
//! head with a detached HEAD. Removal is guarded twice: the basename must
//! carry the reserved prefix, and the directory's symlink-resolved parent
//! must be the owned worktree directory. Nothing outside that directory is
//! ever deleted, no matter what a token or a caller claims.

use anyhow::{Context, Result};
use slog::Logger;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::events::{EngineEvent, EventSink};
use crate::git::GitAdapter;

/// Directory under the git dir that holds temp worktrees.
pub const WORKTREES_DIR: &str = "teapot-worktrees";

/// Reserved basename prefix for engine-owned worktrees.
pub const EXEC_PREFIX: &str = "teapot-exec-";

pub fn worktrees_dir(git_dir: &Path) -> PathBuf {
    git_dir.join(WORKTREES_DIR)
}

/// Fresh `teapot-exec-<16-hex>` path under the owned directory.
pub fn new_exec_path(git_dir: &Path) -> PathBuf {
    let suffix: String = Uuid::new_v4().simple().to_string()[..16].to_string();
    worktrees_dir(git_dir).join(format!("{}{}", EXEC_PREFIX, suffix))
}

pub fn has_reserved_prefix(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(EXEC_PREFIX))
        .unwrap_or(false)
}

/// Both the owned directory and the candidate are resolved through
/// symlinks before comparison; a mismatch on either side refuses removal.
pub fn is_safe_to_remove(git_dir: &Path, path: &Path) -> bool {
    if !has_reserved_prefix(path) {
        return false;
    }
    let Ok(owned) = worktrees_dir(git_dir).canonicalize() else {
        return false;
    };
    let Ok(target) = path.canonicalize() else {
        return false;
    };
    if !has_reserved_prefix(&target) {
        return false;
    }
    target.parent() == Some(owned.as_path())
}

/// Create a temp worktree at the trunk head, detached.
pub async fn create_temp_worktree(
    git: &dyn GitAdapter,
    repo_path: &Path,
    git_dir: &Path,
    trunk_sha: &str,
) -> Result<PathBuf> {
    let dir = worktrees_dir(git_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create temp worktree directory at {:?}", dir))?;

    let path = new_exec_path(git_dir);
    git.worktree_add(repo_path, &path, trunk_sha, true)
        .await
        .with_context(|| format!("Failed to add temp worktree at {:?}", path))?;
    Ok(path)
}

/// Remove one engine-owned worktree, preferring Git's own removal and
/// falling back to a direct recursive delete when Git refuses (stale
/// registration, corrupted metadata).
pub async fn remove_temp_worktree(
    git: &dyn GitAdapter,
    repo_path: &Path,
    git_dir: &Path,
    path: &Path,
    logger: &Logger,
) -> Result<()> {
    if !is_safe_to_remove(git_dir, path) {
        anyhow::bail!(
            "refusing to remove {:?}: not an engine-owned temp worktree",
            path
        );
    }

    if let Err(err) = git.worktree_remove(repo_path, path, true).await {
        slog::debug!(
            logger,
            "git worktree remove failed, deleting directly";
            "path" => %path.display(),
            "error" => %err
        );
        if path.exists() {
            fs::remove_dir_all(path)
                .with_context(|| format!("Failed to remove temp worktree at {:?}", path))?;
        }
    }
    Ok(())
}

/// Sweep engine-owned worktree directories that Git no longer registers.
///
/// Returns the number removed and emits it as an event.
pub async fn cleanup_orphans(
    git: &dyn GitAdapter,
    repo_path: &Path,
    git_dir: &Path,
    events: &dyn EventSink,
    logger: &Logger,
) -> Result<usize> {
    let dir = worktrees_dir(git_dir);
    if !dir.exists() {
        return Ok(0);
    }

    let registered: Vec<PathBuf> = git
        .list_worktrees(repo_path)
        .await?
        .into_iter()
        .map(|wt| wt.path)
        .collect();

    let mut removed = 0;
    for entry in fs::read_dir(&dir).context("Failed to read temp worktree directory")? {
        let entry = entry?;
        let path = entry.path();
        if !has_reserved_prefix(&path) {
            continue;
        }

        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        if registered.iter().any(|r| *r == canonical) {
            continue;
        }

        match remove_temp_worktree(git, repo_path, git_dir, &path, logger).await {
            Ok(()) => removed += 1,
            Err(err) => {
                slog::warn!(
                    logger,
                    "failed to sweep orphaned worktree";
                    "path" => %path.display(),
                    "error" => %err
                );
            }
        }
    }

    if removed > 0 {
        events.emit(EngineEvent::OrphansSwept { count: removed });
    }
    Ok(removed)
}
