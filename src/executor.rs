//! The rebase executor.
//!
//! Drives a session to completion: validates, creates the session record,
//! then loops — take the next job, persist, checkout, rebase, settle —
//! until the queue drains or a conflict hands control back to the user.
//! Every step persists before it acts, so a crash at any point resumes
//! from the last persisted state rather than guessing.
//!
//! Conflicts are not errors. They come back as a structured outcome
//! carrying the paused job and its conflicted paths, with the execution
//! context stored on disk so a later `continue_op` finds the same
//! worktree, even across a process restart.

use anyhow::{bail, Result};
use async_trait::async_trait;
use slog::Logger;
use std::path::Path;
use std::sync::Arc;

use crate::analyzer::{RebaseIntent, StackNode};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::context::{ExecutionContextService, ExecutionGuard};
use crate::git::{commits_between, GitAdapter, RebaseOptions};
use crate::ids::IdGen;
use crate::machine::{self, CommitRewrite, RebaseJob, RebaseSession};
use crate::session::{SessionPatch, SessionPhase, SessionStore, StoredRebaseSession, UpdateOutcome};
use crate::snapshot::RepoSnapshot;
use crate::validation::{self, Validation, ValidationCode};

/// Ripple-effect capability: hosts wire this to their forge client so the
/// engine can ask for a PR to be closed when a branch's entire range turns
/// out to be already applied upstream.
#[async_trait]
pub trait PrHook: Send + Sync {
    async fn close_pr_for_branch(&self, branch: &str) -> Result<()>;
}

/// Intent plus the snapshot it was derived from.
#[derive(Debug, Clone)]
pub struct RebasePlan {
    pub intent: RebaseIntent,
    pub snapshot: RepoSnapshot,
}

/// A paused rebase, waiting on the user.
#[derive(Debug, Clone)]
pub struct ConflictReport {
    /// The offending job. Absent only in recovery mode, when Git reports a
    /// rebase no stored job owns.
    pub job: Option<RebaseJob>,
    pub conflicted_paths: Vec<String>,
}

/// What an executor entry point produced.
#[derive(Debug, Clone)]
pub enum ExecuteOutcome {
    /// Every job settled; the session is finished and cleared.
    Completed { session: RebaseSession },
    /// Paused on conflicts; session and context remain stored.
    Conflicts(ConflictReport),
    /// A validation gate refused the request.
    Rejected(Validation),
}

impl ExecuteOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecuteOutcome::Completed { .. })
    }
}

pub struct RebaseExecutor {
    git: Arc<dyn GitAdapter>,
    sessions: Arc<SessionStore>,
    contexts: Arc<ExecutionContextService>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    logger: Logger,
    pr_hook: Option<Arc<dyn PrHook>>,
}

fn find_node<'a>(intent: &'a RebaseIntent, branch: &str) -> Option<&'a StackNode> {
    intent
        .targets
        .iter()
        .find_map(|target| target.node.find(branch))
}

fn tree_branches(intent: &RebaseIntent) -> Vec<String> {
    intent
        .targets
        .iter()
        .flat_map(|t| t.node.branches())
        .map(|b| b.to_string())
        .collect()
}

impl RebaseExecutor {
    pub fn new(
        git: Arc<dyn GitAdapter>,
        sessions: Arc<SessionStore>,
        contexts: Arc<ExecutionContextService>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        logger: Logger,
    ) -> Self {
        Self {
            git,
            sessions,
            contexts,
            config,
            clock,
            ids,
            logger,
            pr_hook: None,
        }
    }

    pub fn with_pr_hook(mut self, hook: Arc<dyn PrHook>) -> Self {
        self.pr_hook = Some(hook);
        self
    }

    /// Run a plan to completion, or resume the session already stored for
    /// this repository.
    pub async fn execute(&self, repo_path: &Path, plan: RebasePlan) -> Result<ExecuteOutcome> {
        if let Some(existing) = self.sessions.get(repo_path)? {
            if existing.intent.id != plan.intent.id {
                return Ok(ExecuteOutcome::Rejected(Validation::invalid(
                    ValidationCode::SessionExists,
                    "another rebase session already exists for this repository",
                )));
            }
            return self.resume(repo_path, existing).await;
        }

        let verdict =
            validation::validate_fresh(self.git.as_ref(), repo_path, &plan.intent, false).await?;
        if !verdict.is_valid() {
            return Ok(ExecuteOutcome::Rejected(verdict));
        }

        let status = self.git.working_tree_status(repo_path).await?;
        let original_branch = status
            .current_branch
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no current branch despite passing validation"))?;

        let state = machine::create_session(
            self.ids.next_id(),
            &plan.snapshot,
            &plan.intent.targets,
            self.clock.now_ms(),
            self.ids.as_ref(),
        )?;

        match self
            .sessions
            .create(repo_path, plan.intent.clone(), state, &original_branch)?
        {
            UpdateOutcome::Updated(_) => {}
            UpdateOutcome::VersionMismatch => {
                // A concurrent caller created one between our check and now.
                return Ok(ExecuteOutcome::Rejected(Validation::invalid(
                    ValidationCode::SessionExists,
                    "another rebase session already exists for this repository",
                )));
            }
        }

        let guard = self
            .contexts
            .acquire(repo_path, "rebase", &tree_branches(&plan.intent))
            .await?;

        if let Some(worktrees) = guard.auto_detached_worktrees() {
            self.sessions
                .update_with_retry(repo_path, self.config.session_retries, move |_| {
                    Ok(SessionPatch {
                        auto_detached_worktrees: Some(worktrees.clone()),
                        ..SessionPatch::default()
                    })
                })
                .await?;
        }

        self.run_loop(repo_path, guard).await
    }

    /// Resume a stored session through `execute`.
    async fn resume(
        &self,
        repo_path: &Path,
        record: StoredRebaseSession,
    ) -> Result<ExecuteOutcome> {
        let verdict = validation::validate_resume(self.git.as_ref(), repo_path).await?;
        if !verdict.is_valid() {
            return Ok(ExecuteOutcome::Rejected(verdict));
        }

        let guard = self
            .contexts
            .acquire(repo_path, "rebase", &tree_branches(&record.intent))
            .await?;

        // Reconcile what Git actually did while we were away.
        let status = self.git.working_tree_status(repo_path).await?;
        let now = self.clock.now_ms();
        self.sessions
            .update_with_retry(repo_path, self.config.session_retries, |current| {
                Ok(SessionPatch::state(machine::resume_session(
                    &current.state,
                    &status,
                    now,
                )?))
            })
            .await?;

        self.settle_externally_finished_jobs(repo_path, guard.context().execution_path.as_path())
            .await?;

        self.run_loop(repo_path, guard).await
    }

    /// A restart may find jobs that Git finished while no executor was
    /// alive: completed status, but no rewritten head recorded. Resolve
    /// their heads, log their rewrites, and enqueue their descendants.
    async fn settle_externally_finished_jobs(
        &self,
        repo_path: &Path,
        exec_path: &Path,
    ) -> Result<()> {
        let Some(record) = self.sessions.get(repo_path)? else {
            return Ok(());
        };

        let unsettled: Vec<RebaseJob> = record
            .state
            .jobs
            .values()
            .filter(|job| {
                job.status == machine::JobStatus::Completed && job.rebased_head_sha.is_none()
            })
            .cloned()
            .collect();

        for job in unsettled {
            let new_head = self
                .git
                .resolve_ref(exec_path, &job.branch)
                .await?
                .ok_or_else(|| {
                    anyhow::anyhow!("completed branch '{}' no longer resolves", job.branch)
                })?;
            let rewrites = self.pair_rewrites(exec_path, &job, &new_head).await?;

            let now = self.clock.now_ms();
            let node = find_node(&record.intent, &job.branch).cloned();
            let job_id = job.id.clone();
            let head = new_head.clone();
            let ids = self.ids.clone();
            self.sessions
                .update_with_retry(repo_path, self.config.session_retries, move |current| {
                    let state = machine::attach_rebased_head(
                        &current.state,
                        &job_id,
                        &head,
                        now,
                        rewrites.clone(),
                    )?;
                    let state = match &node {
                        Some(node) => {
                            machine::enqueue_descendants(&state, node, &head, now, ids.as_ref())
                        }
                        None => state,
                    };
                    Ok(SessionPatch::state(state))
                })
                .await?;
        }
        Ok(())
    }

    /// The job loop: take, persist, checkout, rebase, settle. One job at a
    /// time, strictly FIFO; descendants join the queue only after their
    /// parent's new head is known.
    async fn run_loop(&self, repo_path: &Path, guard: ExecutionGuard) -> Result<ExecuteOutcome> {
        let exec_path = guard.context().execution_path.clone();

        loop {
            let record = self
                .sessions
                .get(repo_path)?
                .ok_or_else(|| anyhow::anyhow!("session vanished mid-run"))?;

            let now = self.clock.now_ms();
            let Some((next_state, job)) = machine::next_job(&record.state, now) else {
                if record.state.queue.active_job_id.is_some() {
                    // A job is still paused; nothing to run until the user
                    // resolves it.
                    let job = record.state.active_job().cloned();
                    let conflicted = job
                        .as_ref()
                        .and_then(|j| j.conflicts.as_ref())
                        .map(|c| c.iter().map(|p| p.path.clone()).collect())
                        .unwrap_or_default();
                    guard.keep_for_recovery();
                    return Ok(ExecuteOutcome::Conflicts(ConflictReport {
                        job,
                        conflicted_paths: conflicted,
                    }));
                }
                return self.finalize(repo_path, guard, record).await;
            };

            // Persist the active slot before touching Git, so a crash here
            // resumes knowing which job was in flight.
            let version = record.version;
            match self
                .sessions
                .update(repo_path, version, SessionPatch {
                    state: Some(next_state),
                    phase: Some(SessionPhase::Executing),
                    ..SessionPatch::default()
                })?
            {
                UpdateOutcome::Updated(_) => {}
                UpdateOutcome::VersionMismatch => {
                    // Lost a race with another writer; re-read and retry.
                    continue;
                }
            }

            slog::info!(
                self.logger,
                "rebasing branch";
                "branch" => job.branch.as_str(),
                "onto" => job.target_base_sha.as_str()
            );

            self.git.checkout(&exec_path, &job.branch, false).await?;
            let progress = self
                .git
                .rebase(
                    &exec_path,
                    RebaseOptions {
                        onto: job.target_base_sha.clone(),
                        from: job.original_base_sha.clone(),
                        to: job.branch.clone(),
                    },
                )
                .await?;

            if progress.success {
                let new_head = self
                    .git
                    .resolve_ref(&exec_path, &job.branch)
                    .await?
                    .ok_or_else(|| {
                        anyhow::anyhow!("branch '{}' vanished after rebase", job.branch)
                    })?;
                let rewrites = self.pair_rewrites(&exec_path, &job, &new_head).await?;
                let record = self
                    .sessions
                    .get(repo_path)?
                    .ok_or_else(|| anyhow::anyhow!("session vanished mid-run"))?;
                self.settle_completion(repo_path, &job, &new_head, rewrites, &record.intent)
                    .await?;
                continue;
            }

            if !progress.conflicts.is_empty() {
                return self.pause_on_conflict(repo_path, guard, &job).await;
            }

            // Non-conflict failure: surface it with everything we know.
            bail!(
                "git rebase of '{}' onto {} failed: {}",
                job.branch,
                job.target_base_sha,
                progress.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
    }

    /// Persist a conflict pause and hand control back to the caller. The
    /// context is stored so `continue_op` finds the same worktree later.
    async fn pause_on_conflict(
        &self,
        repo_path: &Path,
        guard: ExecutionGuard,
        job: &RebaseJob,
    ) -> Result<ExecuteOutcome> {
        let status = self
            .git
            .working_tree_status(&guard.context().execution_path)
            .await?;
        let now = self.clock.now_ms();
        let job_id = job.id.clone();
        let updated = self
            .sessions
            .update_with_retry(repo_path, self.config.session_retries, |current| {
                let state =
                    machine::record_conflict(&current.state, &job_id, &status, now, None)?;
                Ok(SessionPatch {
                    state: Some(state),
                    phase: Some(SessionPhase::Conflicted),
                    ..SessionPatch::default()
                })
            })
            .await?;

        let paused = updated.state.job(&job.id).cloned();
        let conflicted_paths = status.conflicted.clone();
        guard.keep_for_recovery();
        Ok(ExecuteOutcome::Conflicts(ConflictReport {
            job: paused,
            conflicted_paths,
        }))
    }

    /// Pair old and new commits of a completed job in topological order.
    async fn pair_rewrites(
        &self,
        exec_path: &Path,
        job: &RebaseJob,
        new_head: &str,
    ) -> Result<Vec<CommitRewrite>> {
        let mut old_range = commits_between(
            self.git.as_ref(),
            exec_path,
            &job.original_head_sha,
            &job.original_base_sha,
        )
        .await?;
        let mut new_range =
            commits_between(self.git.as_ref(), exec_path, new_head, &job.target_base_sha).await?;

        // Head-first from the log; topological pairing wants oldest first.
        old_range.reverse();
        new_range.reverse();

        Ok(old_range
            .into_iter()
            .zip(new_range)
            .map(|(old, new)| CommitRewrite {
                branch: job.branch.clone(),
                old_sha: old.sha,
                new_sha: new.sha,
            })
            .collect())
    }

    /// Commit a job's completion and its descendants' enqueueing in one
    /// persisted update, so the enqueue happens exactly once even if the
    /// process dies right after.
    async fn settle_completion(
        &self,
        repo_path: &Path,
        job: &RebaseJob,
        new_head: &str,
        rewrites: Vec<CommitRewrite>,
        intent: &RebaseIntent,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        let node = find_node(intent, &job.branch).cloned();
        let job_id = job.id.clone();
        let new_head_owned = new_head.to_string();
        let ids = self.ids.clone();

        self.sessions
            .update_with_retry(repo_path, self.config.session_retries, move |current| {
                let (state, _mutations) = machine::complete_job(
                    &current.state,
                    &job_id,
                    &new_head_owned,
                    now,
                    rewrites.clone(),
                )?;
                let state = match &node {
                    Some(node) => {
                        machine::enqueue_descendants(&state, node, &new_head_owned, now, ids.as_ref())
                    }
                    None => state,
                };
                Ok(SessionPatch::state(state))
            })
            .await?;

        // A branch whose whole range was already upstream ends up empty;
        // its PR has nothing left to merge.
        if new_head == job.target_base_sha {
            if let Some(hook) = &self.pr_hook {
                if let Err(err) = hook.close_pr_for_branch(&job.branch).await {
                    slog::warn!(
                        self.logger,
                        "pr close hook failed";
                        "branch" => job.branch.as_str(),
                        "error" => %err
                    );
                }
            }
        }
        Ok(())
    }

    /// All jobs settled: restore the user's branch, mark the session
    /// completed, persist, then clear it.
    async fn finalize(
        &self,
        repo_path: &Path,
        guard: ExecutionGuard,
        record: StoredRebaseSession,
    ) -> Result<ExecuteOutcome> {
        // Tear the temp worktree down first; it may hold the branch the
        // active worktree is about to check out. A context inherited from
        // an earlier process (requires_cleanup unset) is discarded too —
        // the session it served ends here.
        let inherited = guard.context().is_temporary && !guard.context().requires_cleanup;
        let exec_path = guard.context().execution_path.clone();
        guard.release().await?;
        if inherited {
            if let Err(err) = self.contexts.remove_owned_worktree(repo_path, &exec_path).await {
                slog::warn!(
                    self.logger,
                    "could not remove inherited temp worktree";
                    "path" => %exec_path.display(),
                    "error" => %err
                );
            }
        }

        let original_branch = record.original_branch.clone();
        if let Err(err) = self.git.checkout(repo_path, &original_branch, false).await {
            slog::warn!(
                self.logger,
                "could not restore original branch";
                "branch" => original_branch.as_str(),
                "error" => %err
            );
        }

        let branches = self
            .git
            .list_branches(repo_path, crate::git::BranchScope::Local)
            .await
            .unwrap_or_default();
        let final_trunk = match crate::git::detect_trunk(&branches) {
            Some(trunk) => self.git.resolve_ref(repo_path, &trunk).await.ok().flatten(),
            None => None,
        };
        let now = self.clock.now_ms();
        let finished = self
            .sessions
            .update_with_retry(repo_path, self.config.session_retries, |current| {
                Ok(SessionPatch {
                    state: Some(machine::complete_session(
                        &current.state,
                        final_trunk.clone(),
                        now,
                    )),
                    phase: Some(SessionPhase::Completed),
                    ..SessionPatch::default()
                })
            })
            .await?;

        self.sessions.clear(repo_path)?;
        Ok(ExecuteOutcome::Completed {
            session: finished.state.session,
        })
    }

    /// Continue after the user resolved conflicts.
    pub async fn continue_op(&self, repo_path: &Path) -> Result<ExecuteOutcome> {
        let record = self
            .sessions
            .get(repo_path)?
            .ok_or_else(|| anyhow::anyhow!("no rebase session in progress to continue"))?;

        let status = self.git.working_tree_status(repo_path).await?;
        if !status.conflicted.is_empty() {
            bail!(
                "unresolved conflicts remain in {} file(s); resolve them first",
                status.conflicted.len()
            );
        }
        if !status.is_rebasing {
            bail!("no rebase in progress to continue");
        }

        let guard = self
            .contexts
            .acquire(repo_path, "rebase", &tree_branches(&record.intent))
            .await?;
        let exec_path = guard.context().execution_path.clone();

        let progress = self.git.rebase_continue(&exec_path).await?;
        let active_job = record.state.active_job().cloned();

        if progress.success {
            if let Some(job) = active_job {
                let new_head = self
                    .git
                    .resolve_ref(&exec_path, &job.branch)
                    .await?
                    .ok_or_else(|| {
                        anyhow::anyhow!("branch '{}' vanished after continue", job.branch)
                    })?;
                let rewrites = self.pair_rewrites(&exec_path, &job, &new_head).await?;
                self.settle_completion(repo_path, &job, &new_head, rewrites, &record.intent)
                    .await?;
            } else {
                // Recovery mode: Git finished a rebase no stored job owns;
                // just reconcile the session status.
                let now = self.clock.now_ms();
                let fresh = self.git.working_tree_status(repo_path).await?;
                self.sessions
                    .update_with_retry(repo_path, self.config.session_retries, |current| {
                        Ok(SessionPatch::state(machine::resume_session(
                            &current.state,
                            &fresh,
                            now,
                        )?))
                    })
                    .await?;
            }
            return self.run_loop(repo_path, guard).await;
        }

        if !progress.conflicts.is_empty() {
            if let Some(job) = active_job {
                return self.pause_on_conflict(repo_path, guard, &job).await;
            }
            guard.keep_for_recovery();
            return Ok(ExecuteOutcome::Conflicts(ConflictReport {
                job: None,
                conflicted_paths: progress.conflicts,
            }));
        }

        bail!(
            "git rebase --continue failed: {}",
            progress.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    /// Skip the commit the rebase is stuck on and resume the loop.
    pub async fn skip(&self, repo_path: &Path) -> Result<ExecuteOutcome> {
        let record = self
            .sessions
            .get(repo_path)?
            .ok_or_else(|| anyhow::anyhow!("no rebase session in progress to skip"))?;
        let status = self.git.working_tree_status(repo_path).await?;
        if !status.is_rebasing {
            bail!("no rebase in progress to skip");
        }

        let guard = self
            .contexts
            .acquire(repo_path, "rebase", &tree_branches(&record.intent))
            .await?;
        let exec_path = guard.context().execution_path.clone();

        let progress = self.git.rebase_skip(&exec_path).await?;
        let active_job = record.state.active_job().cloned();

        if !progress.success && !progress.conflicts.is_empty() {
            if let Some(job) = active_job {
                return self.pause_on_conflict(repo_path, guard, &job).await;
            }
            guard.keep_for_recovery();
            return Ok(ExecuteOutcome::Conflicts(ConflictReport {
                job: None,
                conflicted_paths: progress.conflicts,
            }));
        }
        if !progress.success {
            bail!(
                "git rebase --skip failed: {}",
                progress.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        if let Some(job) = active_job {
            let new_head = self
                .git
                .resolve_ref(&exec_path, &job.branch)
                .await?
                .ok_or_else(|| anyhow::anyhow!("branch '{}' vanished after skip", job.branch))?;

            if new_head == job.target_base_sha {
                // Skipping exhausted every commit: the branch is empty and
                // the job has failed. Its descendants keep their place in
                // the plan but are never enqueued under a failed parent.
                let now = self.clock.now_ms();
                let job_id = job.id.clone();
                self.sessions
                    .update_with_retry(repo_path, self.config.session_retries, move |current| {
                        Ok(SessionPatch::state(machine::fail_job(
                            &current.state,
                            &job_id,
                            now,
                        )?))
                    })
                    .await?;
                if let Some(hook) = &self.pr_hook {
                    if let Err(err) = hook.close_pr_for_branch(&job.branch).await {
                        slog::warn!(
                            self.logger,
                            "pr close hook failed";
                            "branch" => job.branch.as_str(),
                            "error" => %err
                        );
                    }
                }
            } else {
                let rewrites = self.pair_rewrites(&exec_path, &job, &new_head).await?;
                self.settle_completion(repo_path, &job, &new_head, rewrites, &record.intent)
                    .await?;
            }
        }

        self.run_loop(repo_path, guard).await
    }

    /// Cancel the session: abort Git's rebase if one is paused, clear the
    /// session, release the context. Safe to call repeatedly.
    pub async fn abort(&self, repo_path: &Path) -> Result<()> {
        let record = self.sessions.get(repo_path)?;

        // The paused rebase lives wherever the recovery token says the
        // operation ran, not necessarily in the active worktree.
        let exec_path = self
            .contexts
            .load_persisted_context(repo_path)
            .map(|token| token.execution_path)
            .unwrap_or_else(|| repo_path.to_path_buf());
        let status = self.git.working_tree_status(&exec_path).await?;
        if status.is_rebasing {
            self.git.rebase_abort(&exec_path).await?;
        }

        if let Some(record) = record {
            if let Err(err) = self
                .git
                .checkout(repo_path, &record.original_branch, false)
                .await
            {
                slog::warn!(
                    self.logger,
                    "could not restore original branch after abort";
                    "branch" => record.original_branch.as_str(),
                    "error" => %err
                );
            }
            self.sessions.clear(repo_path)?;
        }

        // Tokens and temp worktrees from the cancelled run are garbage now.
        self.contexts.discard_persisted_context(repo_path).await?;
        self.contexts.cleanup_orphans(repo_path).await?;
        Ok(())
    }
}
