//! Mock git adapter for testing.
//!
//! Holds a small in-memory repository (commits, branches, worktrees, HEAD)
//! and can be scripted to produce specific rebase outcomes — conflicts,
//! hard errors, already-applied ranges — so tests exercise every path the
//! executor has without a real repository. Worktree operations do touch the
//! filesystem (directories are created and removed) because the execution
//! context service verifies paths on disk.

use super::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::sync::{Arc, Mutex};

/// Scripted outcome for one `rebase`/`rebase_continue` step of a branch.
#[derive(Debug, Clone)]
pub enum RebaseScript {
    /// Rewrite the range mechanically and succeed.
    Clean,
    /// Pause with these conflicted paths.
    Conflict { files: Vec<String> },
    /// Fail outright (not a conflict).
    Error { message: String },
    /// Every commit in the range is already present upstream; the branch
    /// lands directly on the new base with no new commits.
    AlreadyApplied,
}

#[derive(Debug, Clone)]
enum Head {
    Branch(String),
    Detached(String),
}

#[derive(Debug, Clone)]
struct PendingRebase {
    opts: RebaseOptions,
}

#[derive(Debug, Default)]
struct MockRepoState {
    commits: HashMap<String, CommitEntry>,
    branches: BTreeMap<String, String>,
    remote_branches: BTreeMap<String, String>,
    remotes: Vec<RemoteInfo>,
    head: Option<Head>,
    extra_worktrees: Vec<PathBuf>,
    rebasing: bool,
    conflicted: Vec<String>,
    dirty: Vec<String>,
    scripts: HashMap<String, VecDeque<RebaseScript>>,
    pending: Option<PendingRebase>,
    rewrite_seq: u64,
    fail_worktree_add: Option<String>,
}

/// In-memory scriptable git.
pub struct MockGit {
    repo_path: PathBuf,
    state: Arc<Mutex<MockRepoState>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockGit {
    /// Create an empty mock repository rooted at `repo_path`. The directory
    /// and its `.git` dir are created on disk.
    pub fn new(repo_path: &Path) -> Self {
        fs::create_dir_all(repo_path.join(".git")).expect("failed to create mock repo dirs");
        Self {
            repo_path: repo_path.to_path_buf(),
            state: Arc::new(Mutex::new(MockRepoState::default())),
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Seed the mock from a snapshot: commits, branches, and HEAD on the
    /// trunk when there is one.
    pub fn from_snapshot(repo_path: &Path, snapshot: &crate::snapshot::RepoSnapshot) -> Self {
        let mock = Self::new(repo_path);
        {
            let mut state = mock.state.lock().unwrap();
            for commit in snapshot.commits() {
                state.commits.insert(
                    commit.sha.clone(),
                    CommitEntry {
                        sha: commit.sha.clone(),
                        parent_sha: commit.parent_sha.clone(),
                        author: "Test <test@example.com>".to_string(),
                        message: commit.message.clone(),
                    },
                );
            }
            for branch in snapshot.branches() {
                if branch.head_sha.is_empty() {
                    continue;
                }
                if branch.is_remote {
                    state
                        .remote_branches
                        .insert(branch.name.clone(), branch.head_sha.clone());
                } else {
                    state
                        .branches
                        .insert(branch.name.clone(), branch.head_sha.clone());
                }
            }
            if let Some(trunk) = snapshot.trunk() {
                state.head = Some(Head::Branch(trunk.name.clone()));
            }
            state.remotes.push(RemoteInfo {
                name: "origin".to_string(),
                url: "git@example.com:test/repo.git".to_string(),
            });
        }
        mock
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Queue a scripted outcome for the next rebase step touching `branch`.
    pub fn script_rebase(&self, branch: &str, script: RebaseScript) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(branch.to_string())
            .or_default()
            .push_back(script);
    }

    /// Make the working tree dirty with the given paths.
    pub fn set_dirty(&self, files: &[&str]) {
        self.state.lock().unwrap().dirty = files.iter().map(|f| f.to_string()).collect();
    }

    /// Simulate a rebase already in progress (e.g. left over from a crash).
    pub fn set_rebasing(&self, conflicted: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.rebasing = true;
        state.conflicted = conflicted.iter().map(|f| f.to_string()).collect();
    }

    /// Mark conflicts as resolved without finishing the rebase.
    pub fn resolve_conflicts(&self) {
        self.state.lock().unwrap().conflicted.clear();
    }

    /// Detach HEAD at the given sha.
    pub fn detach_head(&self, sha: &str) {
        self.state.lock().unwrap().head = Some(Head::Detached(sha.to_string()));
    }

    /// Make the next `worktree_add` fail with this message.
    pub fn fail_next_worktree_add(&self, message: &str) {
        self.state.lock().unwrap().fail_worktree_add = Some(message.to_string());
    }

    /// Current sha of a branch, if it exists.
    pub fn branch_sha(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().branches.get(name).cloned()
    }

    /// Name of the branch HEAD is on, or None when detached/unborn.
    pub fn current_branch(&self) -> Option<String> {
        match self.state.lock().unwrap().head.as_ref() {
            Some(Head::Branch(name)) => Some(name.clone()),
            _ => None,
        }
    }

    /// Number of times an operation was called.
    pub fn call_count(&self, operation: &str) -> usize {
        *self.calls.lock().unwrap().get(operation).unwrap_or(&0)
    }

    fn record(&self, operation: &str) {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_insert(0) += 1;
    }

    fn resolve_locked(state: &MockRepoState, reference: &str) -> Option<String> {
        if reference == "HEAD" {
            return match state.head.as_ref()? {
                Head::Branch(name) => state.branches.get(name).cloned(),
                Head::Detached(sha) => Some(sha.clone()),
            };
        }
        if let Some(sha) = state.branches.get(reference) {
            return Some(sha.clone());
        }
        if let Some(sha) = state.remote_branches.get(reference) {
            return Some(sha.clone());
        }
        if state.commits.contains_key(reference) {
            return Some(reference.to_string());
        }
        None
    }

    /// Rewrite `(from, to]` onto `onto`, moving the branch pointer. Returns
    /// the new head sha.
    fn apply_rebase(state: &mut MockRepoState, opts: &RebaseOptions) -> Result<String> {
        let head = Self::resolve_locked(state, &opts.to)
            .ok_or_else(|| anyhow::anyhow!("unknown rebase target '{}'", opts.to))?;

        // Old range, oldest-first.
        let mut range = Vec::new();
        let mut cursor = head;
        while !cursor.is_empty() && cursor != opts.from {
            let commit = state
                .commits
                .get(&cursor)
                .ok_or_else(|| anyhow::anyhow!("unknown commit '{}' in range walk", cursor))?
                .clone();
            cursor = commit.parent_sha.clone();
            range.push(commit);
        }
        range.reverse();

        state.rewrite_seq += 1;
        let seq = state.rewrite_seq;
        let mut parent = opts.onto.clone();
        for old in &range {
            let new_sha = format!("{}-r{}", old.sha, seq);
            state.commits.insert(
                new_sha.clone(),
                CommitEntry {
                    sha: new_sha.clone(),
                    parent_sha: parent.clone(),
                    author: old.author.clone(),
                    message: old.message.clone(),
                },
            );
            parent = new_sha;
        }

        state.branches.insert(opts.to.clone(), parent.clone());
        Ok(parent)
    }

    fn finish_rebase(state: &mut MockRepoState, already_applied: bool) -> Result<RebaseProgress> {
        let pending = state
            .pending
            .take()
            .ok_or_else(|| anyhow::anyhow!("no rebase in progress"))?;
        state.rebasing = false;
        state.conflicted.clear();

        if already_applied {
            state
                .branches
                .insert(pending.opts.to.clone(), pending.opts.onto.clone());
        } else {
            Self::apply_rebase(state, &pending.opts)?;
        }
        Ok(RebaseProgress::completed())
    }

    fn step(&self, state: &mut MockRepoState, opts: RebaseOptions) -> Result<RebaseProgress> {
        let script = state
            .scripts
            .get_mut(&opts.to)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(RebaseScript::Clean);

        match script {
            RebaseScript::Clean => {
                let new_head = Self::apply_rebase(state, &opts)?;
                state.rebasing = false;
                state.conflicted.clear();
                state.pending = None;
                Ok(RebaseProgress {
                    success: true,
                    conflicts: Vec::new(),
                    current_commit: Some(new_head),
                    error: None,
                })
            }
            RebaseScript::AlreadyApplied => {
                state.branches.insert(opts.to.clone(), opts.onto.clone());
                state.rebasing = false;
                state.conflicted.clear();
                state.pending = None;
                Ok(RebaseProgress {
                    success: true,
                    conflicts: Vec::new(),
                    current_commit: Some(opts.onto),
                    error: None,
                })
            }
            RebaseScript::Conflict { files } => {
                state.rebasing = true;
                state.conflicted = files.clone();
                state.pending = Some(PendingRebase { opts });
                Ok(RebaseProgress {
                    success: false,
                    conflicts: files,
                    current_commit: None,
                    error: None,
                })
            }
            RebaseScript::Error { message } => Ok(RebaseProgress {
                success: false,
                conflicts: Vec::new(),
                current_commit: None,
                error: Some(message),
            }),
        }
    }
}

#[async_trait]
impl GitAdapter for MockGit {
    async fn list_branches(&self, _repo: &Path, scope: BranchScope) -> Result<Vec<String>> {
        self.record("list_branches");
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state.branches.keys().cloned().collect();
        if scope == BranchScope::All {
            names.extend(state.remote_branches.keys().cloned());
        }
        Ok(names)
    }

    async fn list_remotes(&self, _repo: &Path) -> Result<Vec<RemoteInfo>> {
        self.record("list_remotes");
        Ok(self.state.lock().unwrap().remotes.clone())
    }

    async fn list_worktrees(&self, _repo: &Path) -> Result<Vec<WorktreeEntry>> {
        self.record("list_worktrees");
        let state = self.state.lock().unwrap();
        let mut entries = vec![WorktreeEntry {
            path: self
                .repo_path
                .canonicalize()
                .unwrap_or_else(|_| self.repo_path.clone()),
            is_main: true,
            is_stale: false,
        }];
        for path in &state.extra_worktrees {
            entries.push(WorktreeEntry {
                path: path.canonicalize().unwrap_or_else(|_| path.clone()),
                is_main: false,
                is_stale: !path.exists(),
            });
        }
        Ok(entries)
    }

    async fn resolve_ref(&self, _repo: &Path, reference: &str) -> Result<Option<String>> {
        self.record("resolve_ref");
        let state = self.state.lock().unwrap();
        Ok(Self::resolve_locked(&state, reference))
    }

    async fn read_commit(&self, _repo: &Path, sha: &str) -> Result<CommitEntry> {
        self.record("read_commit");
        self.state
            .lock()
            .unwrap()
            .commits
            .get(sha)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown commit '{}'", sha))
    }

    async fn log(&self, _repo: &Path, reference: &str, opts: LogOptions) -> Result<Vec<CommitEntry>> {
        self.record("log");
        let state = self.state.lock().unwrap();
        let mut cursor = Self::resolve_locked(&state, reference)
            .ok_or_else(|| anyhow::anyhow!("cannot log unknown ref '{}'", reference))?;

        let mut entries = Vec::new();
        let limit = opts.max_commits.or(opts.depth).unwrap_or(usize::MAX);
        while !cursor.is_empty() && entries.len() < limit {
            let commit = state
                .commits
                .get(&cursor)
                .ok_or_else(|| anyhow::anyhow!("unknown commit '{}' while walking log", cursor))?
                .clone();
            cursor = commit.parent_sha.clone();
            entries.push(commit);
        }
        Ok(entries)
    }

    async fn working_tree_status(&self, _repo: &Path) -> Result<WorkingTreeStatus> {
        self.record("working_tree_status");
        let state = self.state.lock().unwrap();
        let (current_branch, detached) = match state.head.as_ref() {
            Some(Head::Branch(name)) => (Some(name.clone()), false),
            Some(Head::Detached(_)) => (None, true),
            None => (None, false),
        };
        Ok(WorkingTreeStatus {
            current_branch,
            detached,
            is_rebasing: state.rebasing,
            modified: state.dirty.clone(),
            conflicted: state.conflicted.clone(),
            ..Default::default()
        })
    }

    async fn checkout(&self, _repo: &Path, reference: &str, detach: bool) -> Result<()> {
        self.record("checkout");
        let mut state = self.state.lock().unwrap();
        if !state.dirty.is_empty() || !state.conflicted.is_empty() {
            anyhow::bail!("cannot checkout '{}': working tree is not clean", reference);
        }
        let is_branch = state.branches.contains_key(reference);
        let sha = Self::resolve_locked(&state, reference)
            .ok_or_else(|| anyhow::anyhow!("cannot checkout unknown ref '{}'", reference))?;
        state.head = if is_branch && !detach {
            Some(Head::Branch(reference.to_string()))
        } else {
            Some(Head::Detached(sha))
        };
        Ok(())
    }

    async fn branch(&self, _repo: &Path, name: &str, checkout: bool) -> Result<()> {
        self.record("branch");
        let mut state = self.state.lock().unwrap();
        let head_sha = Self::resolve_locked(&state, "HEAD")
            .ok_or_else(|| anyhow::anyhow!("cannot branch from an unborn HEAD"))?;
        state.branches.insert(name.to_string(), head_sha);
        if checkout {
            state.head = Some(Head::Branch(name.to_string()));
        }
        Ok(())
    }

    async fn commit(&self, _repo: &Path, opts: CommitOptions) -> Result<String> {
        self.record("commit");
        let mut state = self.state.lock().unwrap();
        let parent = Self::resolve_locked(&state, "HEAD").unwrap_or_default();
        state.rewrite_seq += 1;
        let sha = format!("c{:08x}", state.rewrite_seq);
        state.commits.insert(
            sha.clone(),
            CommitEntry {
                sha: sha.clone(),
                parent_sha: parent,
                author: opts.author.unwrap_or_else(|| "Test <test@example.com>".to_string()),
                message: opts.message,
            },
        );
        if let Some(Head::Branch(name)) = state.head.clone() {
            state.branches.insert(name, sha.clone());
        } else {
            state.head = Some(Head::Detached(sha.clone()));
        }
        state.dirty.clear();
        Ok(sha)
    }

    async fn rebase(&self, _repo: &Path, opts: RebaseOptions) -> Result<RebaseProgress> {
        self.record("rebase");
        let mut state = self.state.lock().unwrap();
        if state.rebasing {
            anyhow::bail!("a rebase is already in progress");
        }
        self.step(&mut state, opts)
    }

    async fn rebase_continue(&self, _repo: &Path) -> Result<RebaseProgress> {
        self.record("rebase_continue");
        let mut state = self.state.lock().unwrap();
        if !state.rebasing {
            anyhow::bail!("no rebase in progress to continue");
        }
        if !state.conflicted.is_empty() {
            return Ok(RebaseProgress {
                success: false,
                conflicts: state.conflicted.clone(),
                current_commit: None,
                error: None,
            });
        }
        let pending = state
            .pending
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no rebase in progress"))?;
        let branch = pending.opts.to.clone();
        let next = state
            .scripts
            .get_mut(&branch)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(RebaseScript::Conflict { files }) => {
                state.conflicted = files.clone();
                Ok(RebaseProgress {
                    success: false,
                    conflicts: files,
                    current_commit: None,
                    error: None,
                })
            }
            Some(RebaseScript::AlreadyApplied) => Self::finish_rebase(&mut state, true),
            Some(RebaseScript::Error { message }) => Ok(RebaseProgress {
                success: false,
                conflicts: Vec::new(),
                current_commit: None,
                error: Some(message),
            }),
            Some(RebaseScript::Clean) | None => Self::finish_rebase(&mut state, false),
        }
    }

    async fn rebase_skip(&self, _repo: &Path) -> Result<RebaseProgress> {
        self.record("rebase_skip");
        let mut state = self.state.lock().unwrap();
        if !state.rebasing {
            anyhow::bail!("no rebase in progress to skip");
        }
        state.conflicted.clear();
        let next = {
            let pending = state
                .pending
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no rebase in progress"))?;
            let branch = pending.opts.to.clone();
            state
                .scripts
                .get_mut(&branch)
                .and_then(|queue| queue.pop_front())
        };
        match next {
            Some(RebaseScript::Conflict { files }) => {
                state.conflicted = files.clone();
                Ok(RebaseProgress {
                    success: false,
                    conflicts: files,
                    current_commit: None,
                    error: None,
                })
            }
            Some(RebaseScript::AlreadyApplied) => Self::finish_rebase(&mut state, true),
            _ => Self::finish_rebase(&mut state, false),
        }
    }

    async fn rebase_abort(&self, _repo: &Path) -> Result<RebaseProgress> {
        self.record("rebase_abort");
        let mut state = self.state.lock().unwrap();
        state.rebasing = false;
        state.conflicted.clear();
        state.pending = None;
        Ok(RebaseProgress::completed())
    }

    async fn push(&self, _repo: &Path, _opts: PushOptions) -> Result<()> {
        self.record("push");
        Ok(())
    }

    async fn reset(&self, _repo: &Path, mode: ResetMode, reference: &str) -> Result<()> {
        self.record("reset");
        let mut state = self.state.lock().unwrap();
        let sha = Self::resolve_locked(&state, reference)
            .ok_or_else(|| anyhow::anyhow!("cannot reset to unknown ref '{}'", reference))?;
        if let Some(Head::Branch(name)) = state.head.clone() {
            state.branches.insert(name, sha);
        } else {
            state.head = Some(Head::Detached(sha));
        }
        if mode == ResetMode::Hard {
            state.dirty.clear();
        }
        Ok(())
    }

    async fn worktree_add(
        &self,
        _repo: &Path,
        path: &Path,
        reference: &str,
        _detach: bool,
    ) -> Result<()> {
        self.record("worktree_add");
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_worktree_add.take() {
            anyhow::bail!("{}", message);
        }
        Self::resolve_locked(&state, reference)
            .ok_or_else(|| anyhow::anyhow!("cannot create worktree at unknown ref '{}'", reference))?;
        fs::create_dir_all(path)?;
        state.extra_worktrees.push(path.to_path_buf());
        Ok(())
    }

    async fn worktree_remove(&self, _repo: &Path, path: &Path, _force: bool) -> Result<()> {
        self.record("worktree_remove");
        let mut state = self.state.lock().unwrap();
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        state.extra_worktrees.retain(|p| {
            p.canonicalize().unwrap_or_else(|_| p.clone()) != canonical
        });
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotBuilder;
    use tempfile::tempdir;

    fn stack_snapshot() -> crate::snapshot::RepoSnapshot {
        SnapshotBuilder::new()
            .commit("a1", "", "init")
            .commit("b2", "a1", "trunk work")
            .commit("c3", "b2", "feature work")
            .trunk("main", "b2")
            .branch("stack-1", "c3")
            .build()
    }

    #[tokio::test]
    async fn test_clean_rebase_rewrites_range() {
        let dir = tempdir().unwrap();
        let git = MockGit::from_snapshot(dir.path(), &stack_snapshot());

        let progress = git
            .rebase(
                dir.path(),
                RebaseOptions {
                    onto: "a1".to_string(),
                    from: "b2".to_string(),
                    to: "stack-1".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(progress.success);
        let new_head = git.branch_sha("stack-1").unwrap();
        assert_ne!(new_head, "c3");

        // New head's lineage lands on a1, not b2.
        let log = git.log(dir.path(), "stack-1", LogOptions::default()).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].sha, "a1");
    }

    #[tokio::test]
    async fn test_conflict_then_continue() {
        let dir = tempdir().unwrap();
        let git = MockGit::from_snapshot(dir.path(), &stack_snapshot());
        git.script_rebase(
            "stack-1",
            RebaseScript::Conflict {
                files: vec!["src/lib.rs".to_string()],
            },
        );

        let opts = RebaseOptions {
            onto: "a1".to_string(),
            from: "b2".to_string(),
            to: "stack-1".to_string(),
        };
        let progress = git.rebase(dir.path(), opts).await.unwrap();
        assert!(progress.has_conflicts());
        assert!(git.working_tree_status(dir.path()).await.unwrap().is_rebasing);

        // Continue without resolving keeps reporting the conflict.
        let stuck = git.rebase_continue(dir.path()).await.unwrap();
        assert!(stuck.has_conflicts());

        git.resolve_conflicts();
        let done = git.rebase_continue(dir.path()).await.unwrap();
        assert!(done.success);
        assert!(!git.working_tree_status(dir.path()).await.unwrap().is_rebasing);
        assert_ne!(git.branch_sha("stack-1").unwrap(), "c3");
    }

    #[tokio::test]
    async fn test_already_applied_moves_branch_to_base() {
        let dir = tempdir().unwrap();
        let git = MockGit::from_snapshot(dir.path(), &stack_snapshot());
        git.script_rebase("stack-1", RebaseScript::AlreadyApplied);

        let progress = git
            .rebase(
                dir.path(),
                RebaseOptions {
                    onto: "b2".to_string(),
                    from: "b2".to_string(),
                    to: "stack-1".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(progress.success);
        assert_eq!(git.branch_sha("stack-1").unwrap(), "b2");
    }

    #[tokio::test]
    async fn test_checkout_requires_clean_tree() {
        let dir = tempdir().unwrap();
        let git = MockGit::from_snapshot(dir.path(), &stack_snapshot());
        git.set_dirty(&["README.md"]);
        assert!(git.checkout(dir.path(), "stack-1", false).await.is_err());

        git.set_dirty(&[]);
        git.checkout(dir.path(), "stack-1", false).await.unwrap();
        assert_eq!(git.current_branch().as_deref(), Some("stack-1"));
    }

    #[tokio::test]
    async fn test_worktree_add_and_remove_touch_fs() {
        let dir = tempdir().unwrap();
        let git = MockGit::from_snapshot(dir.path(), &stack_snapshot());
        let wt_path = dir.path().join(".git/teapot-worktrees/teapot-exec-0011223344556677");

        git.worktree_add(dir.path(), &wt_path, "b2", true).await.unwrap();
        assert!(wt_path.exists());
        let listed = git.list_worktrees(dir.path()).await.unwrap();
        assert_eq!(listed.len(), 2);

        git.worktree_remove(dir.path(), &wt_path, false).await.unwrap();
        assert!(!wt_path.exists());
        assert_eq!(git.list_worktrees(dir.path()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_call_counts_recorded() {
        let dir = tempdir().unwrap();
        let git = MockGit::from_snapshot(dir.path(), &stack_snapshot());
        git.resolve_ref(dir.path(), "main").await.unwrap();
        git.resolve_ref(dir.path(), "stack-1").await.unwrap();
        assert_eq!(git.call_count("resolve_ref"), 2);
        assert_eq!(git.call_count("rebase"), 0);
    }
}
