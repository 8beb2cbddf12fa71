//! Execution context service.
//!
//! Hands out a filesystem location to run Git operations in, guaranteeing:
//!
//! - at most one operation per repository at a time across the host
//!   (in-process queue + cross-process lock file);
//! - the chosen location survives crashes and restarts (a recovery token
//!   under the git dir, written atomically);
//! - nothing outside the service's owned worktree directory is ever
//!   deleted.
//!
//! The user's own working directory is left alone: fresh operations get a
//! temporary detached-HEAD worktree at the trunk head, unless a rebase is
//! already in progress there (continue flows) or temp worktrees are
//! disabled by configuration.

mod lock;
mod worktree;

pub use lock::{acquire_file_lock, lock_path, FileLockGuard, InProcessQueue, LockFileContents, QueueGuard, LOCK_FILE};
pub use worktree::{
    cleanup_orphans as sweep_orphans, has_reserved_prefix, is_safe_to_remove, new_exec_path,
    worktrees_dir, EXEC_PREFIX, WORKTREES_DIR,
};

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once, OnceLock};

use crate::clock::{Clock, Millis};
use crate::config::EngineConfig;
use crate::errors::WorktreeCreationError;
use crate::events::{EngineEvent, EventSink};
use crate::git::{detect_trunk, BranchScope, GitAdapter};
use crate::session::normalize_repo_path;

/// Recovery token file name within the git dir.
pub const CONTEXT_FILE: &str = "teapot-exec-context.json";

pub fn context_file_path(git_dir: &Path) -> PathBuf {
    git_dir.join(CONTEXT_FILE)
}

/// The on-disk recovery token. Unknown fields are tolerated on read and
/// never emitted on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedContext {
    pub execution_path: PathBuf,
    pub is_temporary: bool,
    pub created_at: Millis,
    pub operation: String,
    pub repo_path: PathBuf,
}

/// A live execution context.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub execution_path: PathBuf,
    pub is_temporary: bool,
    /// False when an existing session's context was re-used; the original
    /// acquirer owns cleanup.
    pub requires_cleanup: bool,
    pub created_at: Millis,
    pub operation: String,
    pub repo_path: PathBuf,
}

impl ExecutionContext {
    fn persisted(&self) -> PersistedContext {
        PersistedContext {
            execution_path: self.execution_path.clone(),
            is_temporary: self.is_temporary,
            created_at: self.created_at,
            operation: self.operation.clone(),
            repo_path: self.repo_path.clone(),
        }
    }
}

/// Machine-readable half of a doctor command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub token_exists: bool,
    pub token_age_ms: Option<Millis>,
    pub ttl_ms: i64,
    pub lock_exists: bool,
    pub lock_age_ms: Option<Millis>,
    pub temp_dir_exists: bool,
    pub temp_worktree_count: usize,
}

// Lock files that must be unlinked if the process dies. Worktrees are NOT
// removed here — Git cannot be awaited inside an exit handler — they are
// reclaimed by the next startup's orphan sweep.
static EXIT_REGISTRY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
static EXIT_HOOK: Once = Once::new();

fn exit_registry() -> &'static Mutex<HashSet<PathBuf>> {
    EXIT_REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_exit_handler() {
    EXIT_HOOK.call_once(|| {
        let _ = ctrlc::set_handler(|| {
            if let Some(registry) = EXIT_REGISTRY.get() {
                if let Ok(paths) = registry.lock() {
                    for path in paths.iter() {
                        let _ = fs::remove_file(path);
                    }
                }
            }
            std::process::exit(130);
        });
    });
}

fn exit_register(path: &Path) {
    exit_registry().lock().unwrap().insert(path.to_path_buf());
}

fn exit_unregister(path: &Path) {
    exit_registry().lock().unwrap().remove(path);
}

/// How the guard leaves things behind when it goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Remove the worktree and token (done explicitly via `release`).
    Released,
    /// Keep the token and worktree so a later `continue` finds them.
    Store,
}

/// RAII handle on an acquired context. Dropping it releases both mutex
/// layers; worktree and token disposition depends on how it was closed:
/// `release().await` cleans both up, `keep_for_recovery()` (or a bare
/// drop) leaves them for the next acquire or the orphan sweep.
pub struct ExecutionGuard {
    ctx: ExecutionContext,
    git: Arc<dyn GitAdapter>,
    git_dir: PathBuf,
    logger: Logger,
    auto_detached_branch: Option<String>,
    disposition: Disposition,
    // Drop order releases the file lock before the queue slot.
    file_lock: Option<FileLockGuard>,
    _queue_guard: QueueGuard,
}

impl std::fmt::Debug for ExecutionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGuard")
            .field("ctx", &self.ctx)
            .field("git_dir", &self.git_dir)
            .field("auto_detached_branch", &self.auto_detached_branch)
            .field("disposition", &self.disposition)
            .finish()
    }
}

impl ExecutionGuard {
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Branch the active worktree was moved off of, when HEAD had to be
    /// detached so the temp worktree could take the branch.
    pub fn auto_detached_branch(&self) -> Option<&str> {
        self.auto_detached_branch.as_deref()
    }

    /// Worktree paths whose HEAD this acquisition detached, in the shape
    /// session records store.
    pub fn auto_detached_worktrees(&self) -> Option<Vec<String>> {
        self.auto_detached_branch
            .as_ref()
            .map(|_| vec![self.ctx.repo_path.to_string_lossy().to_string()])
    }

    /// Keep the context on disk for a future `continue`, releasing only
    /// the locks.
    pub fn keep_for_recovery(mut self) {
        self.disposition = Disposition::Store;
    }

    /// Tear the context down: remove the temp worktree (when this guard
    /// owns it) and clear the recovery token, then release the locks.
    pub async fn release(mut self) -> Result<()> {
        if self.ctx.is_temporary && self.ctx.requires_cleanup {
            worktree::remove_temp_worktree(
                self.git.as_ref(),
                &self.ctx.repo_path,
                &self.git_dir,
                &self.ctx.execution_path,
                &self.logger,
            )
            .await?;
        }
        let _ = fs::remove_file(context_file_path(&self.git_dir));
        self.disposition = Disposition::Released;
        Ok(())
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.file_lock.take() {
            exit_unregister(lock.path());
            drop(lock);
        }
        if self.disposition == Disposition::Store {
            slog::debug!(
                self.logger,
                "execution context stored for recovery";
                "path" => %self.ctx.execution_path.display()
            );
        }
    }
}

/// The service. One instance serves any number of repositories.
pub struct ExecutionContextService {
    git: Arc<dyn GitAdapter>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    logger: Logger,
    queue: Arc<InProcessQueue>,
}

impl ExecutionContextService {
    pub fn new(
        git: Arc<dyn GitAdapter>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        logger: Logger,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            git,
            config,
            clock,
            events,
            logger,
            queue: InProcessQueue::new(),
        })
    }

    fn git_dir(repo_path: &Path) -> PathBuf {
        repo_path.join(".git")
    }

    fn build_guard(
        &self,
        ctx: ExecutionContext,
        git_dir: PathBuf,
        auto_detached_branch: Option<String>,
        file_lock: FileLockGuard,
        queue_guard: QueueGuard,
    ) -> ExecutionGuard {
        exit_register(file_lock.path());
        ExecutionGuard {
            ctx,
            git: self.git.clone(),
            git_dir,
            logger: self.logger.clone(),
            auto_detached_branch,
            disposition: Disposition::Store,
            file_lock: Some(file_lock),
            _queue_guard: queue_guard,
        }
    }

    /// Load the recovery token, treating corrupt JSON as absent.
    pub fn load_persisted_context(&self, repo_path: &Path) -> Option<PersistedContext> {
        let path = context_file_path(&Self::git_dir(repo_path));
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(ctx) => Some(ctx),
            Err(err) => {
                slog::warn!(
                    self.logger,
                    "discarding corrupt recovery token";
                    "path" => %path.display(),
                    "error" => %err
                );
                None
            }
        }
    }

    /// The recovery token, or a typed error when none is recorded. Hosts
    /// use this to locate an in-flight operation's worktree without
    /// taking the locks.
    pub fn require_persisted_context(&self, repo_path: &Path) -> Result<PersistedContext> {
        self.load_persisted_context(repo_path).ok_or_else(|| {
            crate::errors::ContextNotFoundError {
                repo_path: repo_path.to_path_buf(),
            }
            .into()
        })
    }

    /// Atomic token write: temp file, then rename.
    fn persist_context(&self, git_dir: &Path, ctx: &PersistedContext) -> Result<()> {
        let path = context_file_path(git_dir);
        let content = serde_json::to_string_pretty(ctx)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content.as_bytes())
            .with_context(|| format!("Failed to write recovery token at {:?}", tmp))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace recovery token at {:?}", path))?;
        Ok(())
    }

    fn clear_context(&self, git_dir: &Path) {
        let _ = fs::remove_file(context_file_path(git_dir));
    }

    /// A token is usable only if its path still exists and Git still lists
    /// it as a worktree.
    async fn token_is_valid(&self, repo_path: &Path, token: &PersistedContext) -> bool {
        if !token.execution_path.exists() {
            return false;
        }
        let canonical = token
            .execution_path
            .canonicalize()
            .unwrap_or_else(|_| token.execution_path.clone());
        match self.git.list_worktrees(repo_path).await {
            Ok(worktrees) => worktrees.iter().any(|wt| wt.path == canonical),
            Err(_) => false,
        }
    }

    /// Acquire the per-repository context: both mutex layers, then either
    /// the surviving context of an in-flight session or a fresh location.
    ///
    /// `branches_to_rewrite` lets the service detach the active worktree's
    /// HEAD when it sits on a branch the operation is about to rewrite.
    pub async fn acquire(
        &self,
        repo_path: &Path,
        operation: &str,
        branches_to_rewrite: &[String],
    ) -> Result<ExecutionGuard> {
        let key = normalize_repo_path(repo_path);
        let git_dir = Self::git_dir(repo_path);

        let queue_guard = self.queue.acquire(&key).await;
        let file_lock = acquire_file_lock(
            repo_path,
            &git_dir,
            &self.config,
            self.clock.as_ref(),
            self.events.as_ref(),
            &self.logger,
        )
        .await?;

        // An existing token either continues a session or gets cleared.
        if let Some(token) = self.load_persisted_context(repo_path) {
            let age = self.clock.now_ms().saturating_sub(token.created_at);
            if age > self.config.context_ttl_ms {
                self.clear_context(&git_dir);
                self.events
                    .emit(EngineEvent::StaleContextCleared { age_ms: age });
            } else if self.token_is_valid(repo_path, &token).await {
                let ctx = ExecutionContext {
                    execution_path: token.execution_path,
                    is_temporary: token.is_temporary,
                    requires_cleanup: false,
                    created_at: token.created_at,
                    operation: token.operation,
                    repo_path: token.repo_path,
                };
                return Ok(self.build_guard(ctx, git_dir, None, file_lock, queue_guard));
            } else {
                slog::warn!(
                    self.logger,
                    "recovery token points at a missing or unregistered worktree";
                    "repo" => key.as_str()
                );
                self.clear_context(&git_dir);
            }
        }

        let status = self.git.working_tree_status(repo_path).await?;
        let now = self.clock.now_ms();

        // Continue flows and the feature-flag bypass run in the active
        // worktree directly.
        if status.is_rebasing || !self.config.temp_worktrees {
            let ctx = ExecutionContext {
                execution_path: repo_path.to_path_buf(),
                is_temporary: false,
                requires_cleanup: false,
                created_at: now,
                operation: operation.to_string(),
                repo_path: repo_path.to_path_buf(),
            };
            self.persist_context(&git_dir, &ctx.persisted())?;
            return Ok(self.build_guard(ctx, git_dir, None, file_lock, queue_guard));
        }

        // The temp worktree cannot check out a branch that the active
        // worktree holds; detach first and roll back on failure.
        let mut auto_detached_branch = None;
        let needs_detach = match status.current_branch.as_deref() {
            Some(current) => {
                branches_to_rewrite.iter().any(|b| b == current) || !status.is_clean()
            }
            None => false,
        };
        if needs_detach {
            let current = status.current_branch.clone().unwrap_or_default();
            self.git
                .checkout(repo_path, "HEAD", true)
                .await
                .with_context(|| {
                    format!("Failed to detach HEAD in active worktree for '{}'", current)
                })?;
            auto_detached_branch = Some(current);
        }

        let branches = self.git.list_branches(repo_path, BranchScope::Local).await?;
        let trunk_name = detect_trunk(&branches)
            .ok_or_else(|| anyhow::anyhow!("repository has no branches to anchor a worktree on"))?;
        let trunk_sha = self
            .git
            .resolve_ref(repo_path, &trunk_name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("trunk '{}' does not resolve", trunk_name))?;

        let execution_path =
            match worktree::create_temp_worktree(self.git.as_ref(), repo_path, &git_dir, &trunk_sha)
                .await
            {
                Ok(path) => path,
                Err(cause) => {
                    // Roll the active worktree back onto its branch.
                    if let Some(branch) = &auto_detached_branch {
                        if let Err(err) = self.git.checkout(repo_path, branch, false).await {
                            slog::warn!(
                                self.logger,
                                "failed to roll active worktree back after worktree creation failure";
                                "branch" => branch.as_str(),
                                "error" => %err
                            );
                        }
                    }
                    return Err(WorktreeCreationError {
                        repo_path: repo_path.to_path_buf(),
                        attempts: 1,
                        cause: Some(cause.into()),
                    }
                    .into());
                }
            };

        // The exit hook exists from the first temp worktree onward.
        register_exit_handler();

        let ctx = ExecutionContext {
            execution_path,
            is_temporary: true,
            requires_cleanup: true,
            created_at: now,
            operation: operation.to_string(),
            repo_path: repo_path.to_path_buf(),
        };
        self.persist_context(&git_dir, &ctx.persisted())?;

        Ok(self.build_guard(ctx, git_dir, auto_detached_branch, file_lock, queue_guard))
    }

    /// Remove one engine-owned temp worktree. Safety checks (reserved
    /// prefix, symlink-resolved parent) still apply; anything else is
    /// refused.
    pub async fn remove_owned_worktree(&self, repo_path: &Path, path: &Path) -> Result<()> {
        worktree::remove_temp_worktree(
            self.git.as_ref(),
            repo_path,
            &Self::git_dir(repo_path),
            path,
            &self.logger,
        )
        .await
    }

    /// Drop a recovery token and the temp worktree it points at, if any.
    /// Used when the session the context served is finished or cancelled.
    pub async fn discard_persisted_context(&self, repo_path: &Path) -> Result<()> {
        let git_dir = Self::git_dir(repo_path);
        if let Some(token) = self.load_persisted_context(repo_path) {
            if token.is_temporary {
                if let Err(err) = self
                    .remove_owned_worktree(repo_path, &token.execution_path)
                    .await
                {
                    slog::warn!(
                        self.logger,
                        "could not remove worktree while discarding context";
                        "path" => %token.execution_path.display(),
                        "error" => %err
                    );
                }
            }
            self.clear_context(&git_dir);
        }
        Ok(())
    }

    /// Sweep orphaned temp worktrees and stale tokens for a repository.
    pub async fn cleanup_orphans(&self, repo_path: &Path) -> Result<usize> {
        let git_dir = Self::git_dir(repo_path);

        if let Some(token) = self.load_persisted_context(repo_path) {
            let age = self.clock.now_ms().saturating_sub(token.created_at);
            if age > self.config.context_ttl_ms {
                self.clear_context(&git_dir);
                self.events
                    .emit(EngineEvent::StaleContextCleared { age_ms: age });
            } else if !self.token_is_valid(repo_path, &token).await {
                self.clear_context(&git_dir);
            }
        }

        worktree::cleanup_orphans(
            self.git.as_ref(),
            repo_path,
            &git_dir,
            self.events.as_ref(),
            &self.logger,
        )
        .await
    }

    /// Inspect context state without mutating anything.
    pub fn health_check(&self, repo_path: &Path) -> HealthReport {
        let git_dir = Self::git_dir(repo_path);
        let now = self.clock.now_ms();

        let token_age_ms = self
            .load_persisted_context(repo_path)
            .map(|token| now.saturating_sub(token.created_at));

        let lock_file = lock_path(&git_dir);
        let lock_age_ms = fs::read_to_string(&lock_file)
            .ok()
            .and_then(|raw| serde_json::from_str::<LockFileContents>(&raw).ok())
            .map(|contents| now.saturating_sub(contents.timestamp));

        let dir = worktrees_dir(&git_dir);
        let temp_worktree_count = fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| has_reserved_prefix(&e.path()))
                    .count()
            })
            .unwrap_or(0);

        HealthReport {
            token_exists: token_age_ms.is_some(),
            token_age_ms,
            ttl_ms: self.config.context_ttl_ms,
            lock_exists: lock_file.exists(),
            lock_age_ms,
            temp_dir_exists: dir.exists(),
            temp_worktree_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{NullSink, RecordingSink};
    use crate::git::MockGit;
    use crate::snapshot::SnapshotBuilder;
    use serial_test::serial;
    use tempfile::tempdir;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn seeded_mock(repo: &Path) -> Arc<MockGit> {
        let snapshot = SnapshotBuilder::new()
            .commit("A", "", "init")
            .commit("B", "A", "trunk tip")
            .commit("C", "B", "feature work")
            .trunk("main", "B")
            .branch("feature", "C")
            .build();
        Arc::new(MockGit::from_snapshot(repo, &snapshot))
    }

    fn service(
        git: Arc<MockGit>,
        clock: ManualClock,
        events: Arc<dyn EventSink>,
    ) -> ExecutionContextService {
        ExecutionContextService::new(
            git,
            EngineConfig::default(),
            Arc::new(clock),
            events,
            crate::events::null_logger(),
        )
        .unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn test_acquire_creates_temp_worktree_and_token() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let svc = service(git.clone(), ManualClock::at(1_000_000), Arc::new(NullSink));

        let guard = svc.acquire(dir.path(), "rebase", &[]).await?;
        let ctx = guard.context().clone();
        assert!(ctx.is_temporary);
        assert!(ctx.requires_cleanup);
        assert!(ctx.execution_path.exists());
        assert!(has_reserved_prefix(&ctx.execution_path));

        let token = svc.load_persisted_context(dir.path()).unwrap();
        assert_eq!(token.execution_path, ctx.execution_path);
        assert_eq!(token.operation, "rebase");
        assert!(lock_path(&dir.path().join(".git")).exists());

        guard.release().await?;
        assert!(!ctx.execution_path.exists());
        assert!(svc.load_persisted_context(dir.path()).is_none());
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_token_round_trip_shape() -> Result<()> {
        let token = PersistedContext {
            execution_path: PathBuf::from("/repo/.git/teapot-worktrees/teapot-exec-abc"),
            is_temporary: true,
            created_at: 42,
            operation: "rebase".to_string(),
            repo_path: PathBuf::from("/repo"),
        };
        let json = serde_json::to_value(&token)?;
        assert!(json["executionPath"].is_string());
        assert_eq!(json["isTemporary"], true);
        assert_eq!(json["createdAt"], 42);
        // Unknown fields tolerated on read.
        let mut extended = json.clone();
        extended["futureField"] = serde_json::json!("ignored");
        let back: PersistedContext = serde_json::from_value(extended)?;
        assert_eq!(back, token);
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_existing_token_is_continued_without_cleanup() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let clock = ManualClock::at(1_000_000);
        let svc = service(git.clone(), clock.clone(), Arc::new(NullSink));

        let first = svc.acquire(dir.path(), "rebase", &[]).await?;
        let first_path = first.context().execution_path.clone();
        first.keep_for_recovery();

        clock.advance(HOUR_MS);
        let second = svc.acquire(dir.path(), "rebase", &[]).await?;
        assert_eq!(second.context().execution_path, first_path);
        assert!(!second.context().requires_cleanup);
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_stale_token_cleared_with_event() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let clock = ManualClock::at(1_000_000);
        let sink = Arc::new(RecordingSink::new());
        let svc = service(git.clone(), clock.clone(), sink.clone());

        let first = svc.acquire(dir.path(), "rebase", &[]).await?;
        let first_path = first.context().execution_path.clone();
        first.keep_for_recovery();

        // Twenty-five hours beats the twenty-four hour TTL.
        clock.advance(25 * HOUR_MS);
        let second = svc.acquire(dir.path(), "rebase", &[]).await?;
        assert_ne!(second.context().execution_path, first_path);

        let events = sink.take();
        let cleared = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::StaleContextCleared { age_ms } => Some(*age_ms),
                _ => None,
            })
            .expect("staleCleared event");
        assert_eq!(cleared, 25 * HOUR_MS);
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_require_persisted_context_typed_error() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let svc = service(git.clone(), ManualClock::at(1_000_000), Arc::new(NullSink));

        let err = svc.require_persisted_context(dir.path()).unwrap_err();
        let not_found = err
            .downcast::<crate::errors::ContextNotFoundError>()
            .expect("typed error");
        assert_eq!(not_found.repo_path, dir.path());

        let guard = svc.acquire(dir.path(), "rebase", &[]).await?;
        let token = svc.require_persisted_context(dir.path())?;
        assert_eq!(token.execution_path, guard.context().execution_path);
        guard.release().await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_token_with_missing_path_is_cleared() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let svc = service(git.clone(), ManualClock::at(1_000_000), Arc::new(NullSink));
        let git_dir = dir.path().join(".git");

        let bogus = PersistedContext {
            execution_path: git_dir.join("teapot-worktrees/teapot-exec-gone"),
            is_temporary: true,
            created_at: 1_000_000,
            operation: "rebase".to_string(),
            repo_path: dir.path().to_path_buf(),
        };
        fs::create_dir_all(&git_dir)?;
        fs::write(context_file_path(&git_dir), serde_json::to_string(&bogus)?)?;

        let guard = svc.acquire(dir.path(), "rebase", &[]).await?;
        assert_ne!(guard.context().execution_path, bogus.execution_path);
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_token_for_unregistered_worktree_is_cleared() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let svc = service(git.clone(), ManualClock::at(1_000_000), Arc::new(NullSink));
        let git_dir = dir.path().join(".git");

        // Directory exists on disk but Git does not list it.
        let rogue = git_dir.join("teapot-worktrees/teapot-exec-feedface00000000");
        fs::create_dir_all(&rogue)?;
        let bogus = PersistedContext {
            execution_path: rogue.clone(),
            is_temporary: true,
            created_at: 1_000_000,
            operation: "rebase".to_string(),
            repo_path: dir.path().to_path_buf(),
        };
        fs::write(context_file_path(&git_dir), serde_json::to_string(&bogus)?)?;

        let guard = svc.acquire(dir.path(), "rebase", &[]).await?;
        assert_ne!(guard.context().execution_path, rogue);
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_rebase_in_progress_uses_active_worktree() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        git.set_rebasing(&["f.rs"]);
        let svc = service(git.clone(), ManualClock::at(1_000_000), Arc::new(NullSink));

        let guard = svc.acquire(dir.path(), "continue", &[]).await?;
        assert!(!guard.context().is_temporary);
        assert_eq!(guard.context().execution_path, dir.path());
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_temp_worktrees_flag_disables_isolation() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let svc = ExecutionContextService::new(
            git.clone(),
            EngineConfig {
                temp_worktrees: false,
                ..EngineConfig::default()
            },
            Arc::new(ManualClock::at(1_000_000)),
            Arc::new(NullSink),
            crate::events::null_logger(),
        )?;

        let guard = svc.acquire(dir.path(), "rebase", &[]).await?;
        assert!(!guard.context().is_temporary);
        assert_eq!(guard.context().execution_path, dir.path());
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_active_worktree_on_target_branch_is_detached() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        git.checkout(dir.path(), "feature", false).await?;
        let svc = service(git.clone(), ManualClock::at(1_000_000), Arc::new(NullSink));

        let guard = svc
            .acquire(dir.path(), "rebase", &["feature".to_string()])
            .await?;
        assert_eq!(guard.auto_detached_branch(), Some("feature"));
        assert_eq!(
            guard.auto_detached_worktrees(),
            Some(vec![dir.path().to_string_lossy().to_string()])
        );
        // Active worktree is now detached, so the temp worktree can take
        // the branch.
        assert_eq!(git.current_branch(), None);
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_worktree_creation_failure_rolls_back_detach() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        git.checkout(dir.path(), "feature", false).await?;
        git.fail_next_worktree_add("disk full");
        let svc = service(git.clone(), ManualClock::at(1_000_000), Arc::new(NullSink));

        let err = svc
            .acquire(dir.path(), "rebase", &["feature".to_string()])
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<WorktreeCreationError>().is_some());
        // Rolled back onto the original branch.
        assert_eq!(git.current_branch().as_deref(), Some("feature"));
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_cleanup_orphans_clears_stale_token() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let clock = ManualClock::at(1_000_000);
        let sink = Arc::new(RecordingSink::new());
        let svc = service(git.clone(), clock.clone(), sink.clone());

        let guard = svc.acquire(dir.path(), "rebase", &[]).await?;
        guard.keep_for_recovery();

        clock.advance(25 * HOUR_MS);
        svc.cleanup_orphans(dir.path()).await?;

        assert!(svc.load_persisted_context(dir.path()).is_none());
        assert!(sink
            .take()
            .iter()
            .any(|e| matches!(e, EngineEvent::StaleContextCleared { .. })));
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_health_check_reports_ages() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let clock = ManualClock::at(1_000_000);
        let svc = service(git.clone(), clock.clone(), Arc::new(NullSink));

        let empty = svc.health_check(dir.path());
        assert!(!empty.token_exists);
        assert!(!empty.lock_exists);
        assert_eq!(empty.temp_worktree_count, 0);

        let guard = svc.acquire(dir.path(), "rebase", &[]).await?;
        clock.advance(5_000);
        let busy = svc.health_check(dir.path());
        assert!(busy.token_exists);
        assert_eq!(busy.token_age_ms, Some(5_000));
        assert!(busy.lock_exists);
        assert_eq!(busy.lock_age_ms, Some(5_000));
        assert!(busy.temp_dir_exists);
        assert_eq!(busy.temp_worktree_count, 1);
        assert_eq!(busy.ttl_ms, 24 * HOUR_MS);

        guard.release().await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_drop_without_release_keeps_worktree_for_sweep() -> Result<()> {
        let dir = tempdir()?;
        let git = seeded_mock(dir.path());
        let svc = service(git.clone(), ManualClock::at(1_000_000), Arc::new(NullSink));

        let path = {
            let guard = svc.acquire(dir.path(), "rebase", &[]).await?;
            guard.context().execution_path.clone()
            // guard dropped here without release()
        };
        // Worktree and token survive for crash recovery...
        assert!(path.exists());
        assert!(svc.load_persisted_context(dir.path()).is_some());
        // ...but the lock is gone, so the next acquire proceeds.
        assert!(!lock_path(&dir.path().join(".git")).exists());
        Ok(())
    }
}
