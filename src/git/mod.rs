//! Git adapter capability.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RebaseExecutor                         │
//! │  (High-level operations: plan, rebase loop, recovery)      │
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │              Arc<dyn GitAdapter>                     │   │
//! │  │  (Low-level git operations: refs, rebase, trees)    │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!     ┌────────────────┐             ┌────────────────────┐
//!     │  host backend  │             │      MockGit       │
//!     │ (CLI/libgit2,  │             │ (in-memory, for    │
//!     │  supplied by   │             │  tests)            │
//!     │  the embedder) │             │                    │
//!     └────────────────┘             └────────────────────┘
//! ```
//!
//! The engine never talks to Git directly. Everything flows through this
//! trait so the host chooses the backend and tests script outcomes without
//! a real repository. Conflicts are data, not errors: a paused rebase comes
//! back as a `RebaseProgress` with `success == false` and a non-empty
//! conflict list.

pub mod mock;

pub use mock::MockGit;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which branches to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchScope {
    /// Local branches only.
    #[default]
    Local,
    /// Local plus remote-tracking branches; remote names come back
    /// prefixed, e.g. `origin/main`.
    All,
}

/// A configured remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub name: String,
    pub url: String,
}

/// One entry from Git's worktree list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeEntry {
    /// Canonical path as reported by Git.
    pub path: PathBuf,
    pub is_main: bool,
    pub is_stale: bool,
}

/// A commit as the adapter reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEntry {
    pub sha: String,
    /// Empty for a root commit.
    #[serde(default)]
    pub parent_sha: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub message: String,
}

/// Options for `log`.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Walk at most this many parents deep.
    pub depth: Option<usize>,
    /// Return at most this many entries.
    pub max_commits: Option<usize>,
}

/// A renamed path in the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamedPath {
    pub from: String,
    pub to: String,
}

/// Parsed working-tree status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingTreeStatus {
    /// None when HEAD is detached.
    pub current_branch: Option<String>,
    pub detached: bool,
    pub is_rebasing: bool,
    #[serde(default)]
    pub staged: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
    #[serde(default)]
    pub created: Vec<String>,
    #[serde(default)]
    pub deleted: Vec<String>,
    #[serde(default)]
    pub renamed: Vec<RenamedPath>,
    #[serde(default)]
    pub not_added: Vec<String>,
    #[serde(default)]
    pub conflicted: Vec<String>,
}

impl WorkingTreeStatus {
    /// Every path with any kind of pending change.
    pub fn all_changed_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        files.extend(self.staged.iter().cloned());
        files.extend(self.modified.iter().cloned());
        files.extend(self.created.iter().cloned());
        files.extend(self.deleted.iter().cloned());
        files.extend(self.renamed.iter().map(|r| r.to.clone()));
        files.extend(self.not_added.iter().cloned());
        files.extend(self.conflicted.iter().cloned());
        files.sort();
        files.dedup();
        files
    }

    /// True when nothing is staged, modified, or conflicted.
    pub fn is_clean(&self) -> bool {
        self.all_changed_files().is_empty()
    }
}

/// Options for `commit`.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub message: String,
    pub author: Option<String>,
    pub committer: Option<String>,
    pub amend: bool,
}

/// Options for `rebase`: replay `(from, to]` onto `onto`.
#[derive(Debug, Clone)]
pub struct RebaseOptions {
    pub onto: String,
    pub from: String,
    pub to: String,
}

/// Outcome of a rebase step (`rebase`, `rebaseContinue`, `rebaseSkip`,
/// `rebaseAbort` all share this shape).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseProgress {
    pub success: bool,
    #[serde(default)]
    pub conflicts: Vec<String>,
    pub current_commit: Option<String>,
    pub error: Option<String>,
}

impl RebaseProgress {
    pub fn completed() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.success && !self.conflicts.is_empty()
    }
}

/// Credentials for push, when the host wants the adapter to authenticate.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Options for `push`.
#[derive(Debug, Clone)]
pub struct PushOptions {
    pub remote: String,
    pub reference: String,
    pub set_upstream: bool,
    pub credentials: Option<Credentials>,
}

/// Reset modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Soft,
    Mixed,
    Hard,
}

/// Unified capability for all git operations the engine performs.
///
/// Implementations wrap whatever backend the host prefers (git CLI,
/// libgit2, a test double). All methods take the repository path explicitly
/// because one adapter instance serves many repositories, including
/// temporary worktrees of the same repository.
#[async_trait]
pub trait GitAdapter: Send + Sync {
    /// List branch names. `BranchScope::All` includes remote-tracking
    /// branches with their remote prefix.
    async fn list_branches(&self, repo: &Path, scope: BranchScope) -> Result<Vec<String>>;

    async fn list_remotes(&self, repo: &Path) -> Result<Vec<RemoteInfo>>;

    /// Canonical worktree list as Git reports it.
    async fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeEntry>>;

    /// Resolve a ref to a sha; `None` when the ref does not resolve.
    async fn resolve_ref(&self, repo: &Path, reference: &str) -> Result<Option<String>>;

    async fn read_commit(&self, repo: &Path, sha: &str) -> Result<CommitEntry>;

    /// Commits reachable from `reference`, head-first.
    async fn log(&self, repo: &Path, reference: &str, opts: LogOptions) -> Result<Vec<CommitEntry>>;

    async fn working_tree_status(&self, repo: &Path) -> Result<WorkingTreeStatus>;

    /// Checkout a ref. Succeeds only on a clean tree.
    async fn checkout(&self, repo: &Path, reference: &str, detach: bool) -> Result<()>;

    /// Create a branch at HEAD, optionally switching to it.
    async fn branch(&self, repo: &Path, name: &str, checkout: bool) -> Result<()>;

    /// Create a commit, returning the new sha.
    async fn commit(&self, repo: &Path, opts: CommitOptions) -> Result<String>;

    /// Start a rebase of `(from, to]` onto `onto`.
    async fn rebase(&self, repo: &Path, opts: RebaseOptions) -> Result<RebaseProgress>;

    async fn rebase_continue(&self, repo: &Path) -> Result<RebaseProgress>;

    async fn rebase_skip(&self, repo: &Path) -> Result<RebaseProgress>;

    async fn rebase_abort(&self, repo: &Path) -> Result<RebaseProgress>;

    async fn push(&self, repo: &Path, opts: PushOptions) -> Result<()>;

    async fn reset(&self, repo: &Path, mode: ResetMode, reference: &str) -> Result<()>;

    /// Add a worktree at `path` checked out at `reference`.
    async fn worktree_add(&self, repo: &Path, path: &Path, reference: &str, detach: bool)
        -> Result<()>;

    /// Remove a worktree registration and its directory.
    async fn worktree_remove(&self, repo: &Path, path: &Path, force: bool) -> Result<()>;
}

/// Pick the trunk from a branch list: `main`, then `master`, then the first
/// local branch.
pub fn detect_trunk(branches: &[String]) -> Option<String> {
    for candidate in ["main", "master"] {
        if branches.iter().any(|b| b == candidate) {
            return Some(candidate.to_string());
        }
    }
    branches.first().cloned()
}

/// Commits in `(base, head]`, head-first, via the adapter's log.
///
/// Walks from `head` and stops when `base` is reached; `base` itself is
/// excluded. When `base` is not an ancestor, the walk runs to the root.
pub async fn commits_between(
    git: &dyn GitAdapter,
    repo: &Path,
    head: &str,
    base: &str,
) -> Result<Vec<CommitEntry>> {
    let entries = git.log(repo, head, LogOptions::default()).await?;
    let mut range = Vec::new();
    for entry in entries {
        if entry.sha == base {
            break;
        }
        range.push(entry);
    }
    Ok(range)
}
