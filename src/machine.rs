//! The rebase state machine.
//!
//! Pure functions over immutable inputs: no I/O, no clock reads, no id
//! minting — timestamps and generators are parameters. Every operation
//! takes a state and returns a new one, so the executor can persist each
//! step before acting on it and replay decisions after a crash.
//!
//! Session status:
//!
//! ```text
//!   pending ──► running ──► awaiting-user
//!     ▲           │               │
//!     └───────────┤               │
//!                 ▼               │
//!             completed ◄─────────┘
//!                 │
//!              aborted (terminal from any non-completed state)
//! ```
//!
//! Job status: `queued → applying → (awaiting-user | completed | failed)`,
//! with `awaiting-user → applying` on continue and
//! `awaiting-user → completed` on resolve-then-complete.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::analyzer::{RebaseTarget, StackNode};
use crate::clock::Millis;
use crate::git::WorkingTreeStatus;
use crate::ids::IdGen;
use crate::snapshot::RepoSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Pending,
    Running,
    AwaitingUser,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Applying,
    AwaitingUser,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Three-way stage shas for one conflicted path, when the adapter has them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictStages {
    pub base_sha: Option<String>,
    pub ours_sha: Option<String>,
    pub theirs_sha: Option<String>,
}

/// A path left conflicted by a paused rebase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictedPath {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<ConflictStages>,
}

/// The work of rebasing one branch onto a new base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseJob {
    pub id: String,
    pub branch: String,
    pub original_base_sha: String,
    pub original_head_sha: String,
    pub target_base_sha: String,
    pub status: JobStatus,
    pub created_at_ms: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_ms: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebased_head_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<ConflictedPath>>,
}

/// FIFO scheduling state. `active_job_id` is the job currently driving Git
/// (applying, or paused in awaiting-user while its rebase sits on disk).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseQueue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_job_id: Option<String>,
    #[serde(default)]
    pub pending_job_ids: Vec<String>,
    #[serde(default)]
    pub blocked_job_ids: Vec<String>,
}

/// One rewritten commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRewrite {
    pub branch: String,
    pub old_sha: String,
    pub new_sha: String,
}

/// A branch pointer that moved as part of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackMutation {
    pub branch: String,
    pub old_head_sha: String,
    pub new_head_sha: String,
}

/// A rewrite session over one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseSession {
    pub id: String,
    pub started_at_ms: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<Millis>,
    pub status: SessionStatus,
    pub initial_trunk_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_trunk_sha: Option<String>,
    /// Every job id ever created in this session, in creation order.
    #[serde(default)]
    pub jobs: Vec<String>,
    /// Append-only log of every commit rewritten so far.
    #[serde(default)]
    pub commit_map: Vec<CommitRewrite>,
}

/// Session, queue, and job records: the whole machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseState {
    pub session: RebaseSession,
    pub queue: RebaseQueue,
    pub jobs: BTreeMap<String, RebaseJob>,
}

impl RebaseState {
    pub fn job(&self, job_id: &str) -> Option<&RebaseJob> {
        self.jobs.get(job_id)
    }

    pub fn active_job(&self) -> Option<&RebaseJob> {
        self.queue
            .active_job_id
            .as_deref()
            .and_then(|id| self.jobs.get(id))
    }
}

fn new_job(
    id: String,
    branch: &str,
    original_base_sha: &str,
    original_head_sha: &str,
    target_base_sha: &str,
    ts_ms: Millis,
) -> RebaseJob {
    RebaseJob {
        id,
        branch: branch.to_string(),
        original_base_sha: original_base_sha.to_string(),
        original_head_sha: original_head_sha.to_string(),
        target_base_sha: target_base_sha.to_string(),
        status: JobStatus::Queued,
        created_at_ms: ts_ms,
        updated_at_ms: None,
        rebased_head_sha: None,
        conflicts: None,
    }
}

/// Create a session with one queued job per target root.
///
/// Descendant jobs are *not* created here; they are enqueued as their
/// parents complete, once the parent's rewritten head is known.
///
/// Zero targets or a snapshot without a non-remote trunk are programmer
/// errors and fail loudly.
pub fn create_session(
    session_id: String,
    repo: &RepoSnapshot,
    targets: &[RebaseTarget],
    started_at_ms: Millis,
    ids: &dyn IdGen,
) -> Result<RebaseState> {
    if targets.is_empty() {
        bail!("cannot create a rebase session with zero targets");
    }
    let Some(trunk) = repo.trunk() else {
        bail!("cannot create a rebase session: repository has no non-remote trunk");
    };

    let mut jobs = BTreeMap::new();
    let mut queue = RebaseQueue::default();
    let mut job_order = Vec::new();

    for target in targets {
        let node = &target.node;
        let job = new_job(
            ids.next_id(),
            &node.branch,
            &node.base_sha,
            &node.head_sha,
            &target.target_base_sha,
            started_at_ms,
        );
        queue.pending_job_ids.push(job.id.clone());
        job_order.push(job.id.clone());
        jobs.insert(job.id.clone(), job);
    }

    Ok(RebaseState {
        session: RebaseSession {
            id: session_id,
            started_at_ms,
            completed_at_ms: None,
            status: SessionStatus::Pending,
            initial_trunk_sha: trunk.head_sha.clone(),
            final_trunk_sha: None,
            jobs: job_order,
            commit_map: Vec::new(),
        },
        queue,
        jobs,
    })
}

/// Take the next job, strictly FIFO.
///
/// Returns `None` while another job is active, regardless of how many jobs
/// are pending, and `None` when the queue is drained.
pub fn next_job(state: &RebaseState, ts_ms: Millis) -> Option<(RebaseState, RebaseJob)> {
    if state.queue.active_job_id.is_some() {
        return None;
    }
    if state.queue.pending_job_ids.is_empty() {
        return None;
    }

    let mut next = state.clone();
    let job_id = next.queue.pending_job_ids.remove(0);
    let job = next.jobs.get_mut(&job_id)?;
    job.status = JobStatus::Applying;
    job.updated_at_ms = Some(ts_ms);
    let job = job.clone();

    next.queue.active_job_id = Some(job_id);
    next.session.status = SessionStatus::Running;
    Some((next, job))
}

/// Record a conflict pause on a job.
///
/// The conflict list is built from the observed working tree's conflicted
/// paths, with three-way stage shas attached when provided. The job stays
/// active — its rebase is still on disk waiting for the user.
pub fn record_conflict(
    state: &RebaseState,
    job_id: &str,
    working_tree: &WorkingTreeStatus,
    ts_ms: Millis,
    stage_info: Option<&HashMap<String, ConflictStages>>,
) -> Result<RebaseState> {
    let mut next = state.clone();
    let job = next
        .jobs
        .get_mut(job_id)
        .ok_or_else(|| anyhow::anyhow!("cannot record conflict on unknown job '{}'", job_id))?;
    if job.status.is_terminal() {
        bail!(
            "cannot record conflict on job '{}' in terminal status {:?}",
            job_id,
            job.status
        );
    }

    job.status = JobStatus::AwaitingUser;
    job.updated_at_ms = Some(ts_ms);
    job.conflicts = Some(
        working_tree
            .conflicted
            .iter()
            .map(|path| ConflictedPath {
                path: path.clone(),
                stages: stage_info.and_then(|info| info.get(path).cloned()),
            })
            .collect(),
    );

    next.session.status = SessionStatus::AwaitingUser;
    Ok(next)
}

/// A job resumed after its conflicts were resolved goes back to applying.
pub fn resume_job(state: &RebaseState, job_id: &str, ts_ms: Millis) -> Result<RebaseState> {
    let mut next = state.clone();
    let job = next
        .jobs
        .get_mut(job_id)
        .ok_or_else(|| anyhow::anyhow!("cannot resume unknown job '{}'", job_id))?;
    if job.status != JobStatus::AwaitingUser {
        bail!(
            "cannot resume job '{}' from status {:?}",
            job_id,
            job.status
        );
    }
    job.status = JobStatus::Applying;
    job.updated_at_ms = Some(ts_ms);
    next.session.status = SessionStatus::Running;
    Ok(next)
}

/// Complete a job, appending its commit rewrites and releasing the active
/// slot. Returns the stack mutations the completion implies.
pub fn complete_job(
    state: &RebaseState,
    job_id: &str,
    rebased_head_sha: &str,
    ts_ms: Millis,
    rewrites: Vec<CommitRewrite>,
) -> Result<(RebaseState, Vec<StackMutation>)> {
    let mut next = state.clone();
    let job = next
        .jobs
        .get_mut(job_id)
        .ok_or_else(|| anyhow::anyhow!("cannot complete unknown job '{}'", job_id))?;
    if job.status.is_terminal() {
        bail!(
            "cannot complete job '{}' already in terminal status {:?}",
            job_id,
            job.status
        );
    }

    job.status = JobStatus::Completed;
    job.updated_at_ms = Some(ts_ms);
    job.rebased_head_sha = Some(rebased_head_sha.to_string());

    let mutations = vec![StackMutation {
        branch: job.branch.clone(),
        old_head_sha: job.original_head_sha.clone(),
        new_head_sha: rebased_head_sha.to_string(),
    }];

    // commit_map is append-only; existing entries are never touched.
    next.session.commit_map.extend(rewrites);

    if next.queue.active_job_id.as_deref() == Some(job_id) {
        next.queue.active_job_id = None;
    }
    if next.session.status == SessionStatus::AwaitingUser {
        next.session.status = SessionStatus::Running;
    }
    Ok((next, mutations))
}

/// Fill in the rewritten head for a job that `resume_session` marked
/// completed without one (Git finished while no executor was alive), and
/// append the rewrites recovered for it.
pub fn attach_rebased_head(
    state: &RebaseState,
    job_id: &str,
    rebased_head_sha: &str,
    ts_ms: Millis,
    rewrites: Vec<CommitRewrite>,
) -> Result<RebaseState> {
    let mut next = state.clone();
    let job = next
        .jobs
        .get_mut(job_id)
        .ok_or_else(|| anyhow::anyhow!("cannot settle unknown job '{}'", job_id))?;
    if job.status != JobStatus::Completed {
        bail!(
            "cannot attach a rebased head to job '{}' in status {:?}",
            job_id,
            job.status
        );
    }
    if job.rebased_head_sha.is_some() {
        bail!("job '{}' already has a rebased head recorded", job_id);
    }
    job.rebased_head_sha = Some(rebased_head_sha.to_string());
    job.updated_at_ms = Some(ts_ms);
    next.session.commit_map.extend(rewrites);
    Ok(next)
}

/// Mark a job failed (conflict skip exhausted its commits) and release the
/// active slot.
pub fn fail_job(state: &RebaseState, job_id: &str, ts_ms: Millis) -> Result<RebaseState> {
    let mut next = state.clone();
    let job = next
        .jobs
        .get_mut(job_id)
        .ok_or_else(|| anyhow::anyhow!("cannot fail unknown job '{}'", job_id))?;
    if job.status.is_terminal() {
        bail!(
            "cannot fail job '{}' already in terminal status {:?}",
            job_id,
            job.status
        );
    }
    job.status = JobStatus::Failed;
    job.updated_at_ms = Some(ts_ms);

    if next.queue.active_job_id.as_deref() == Some(job_id) {
        next.queue.active_job_id = None;
    }
    if next.session.status == SessionStatus::AwaitingUser {
        next.session.status = SessionStatus::Running;
    }
    Ok(next)
}

/// Queue one job per immediate child of a completed parent, targeting the
/// parent's rewritten head.
///
/// Not idempotent: the executor must call this exactly once per parent
/// completion.
pub fn enqueue_descendants(
    state: &RebaseState,
    parent_node: &StackNode,
    parent_new_head_sha: &str,
    ts_ms: Millis,
    ids: &dyn IdGen,
) -> RebaseState {
    let mut next = state.clone();
    for child in &parent_node.children {
        let job = new_job(
            ids.next_id(),
            &child.branch,
            &child.base_sha,
            &child.head_sha,
            parent_new_head_sha,
            ts_ms,
        );
        next.queue.pending_job_ids.push(job.id.clone());
        next.session.jobs.push(job.id.clone());
        next.jobs.insert(job.id.clone(), job);
    }
    next
}

/// Reconcile stored state with the working tree observed after a restart.
///
/// Four cases:
/// - rebasing + active job: the job is mid-flight; conflicted paths put it
///   in awaiting-user, otherwise it is still applying.
/// - not rebasing + active job: Git finished (or someone finished it by
///   hand); the job is completed and the active slot cleared. The rewritten
///   head is unknown here — the executor resolves it afterwards.
/// - rebasing + no active job: recovery mode; the session carries the
///   paused rebase without owning a specific job.
/// - not rebasing + no active job: nothing to reconcile.
pub fn resume_session(
    state: &RebaseState,
    working_tree: &WorkingTreeStatus,
    ts_ms: Millis,
) -> Result<RebaseState> {
    let active_id = state.queue.active_job_id.clone();

    match (working_tree.is_rebasing, active_id) {
        (true, Some(job_id)) => {
            if working_tree.conflicted.is_empty() {
                let mut next = state.clone();
                let job = next.jobs.get_mut(&job_id).ok_or_else(|| {
                    anyhow::anyhow!("active job '{}' missing from session", job_id)
                })?;
                job.status = JobStatus::Applying;
                job.updated_at_ms = Some(ts_ms);
                next.session.status = SessionStatus::Running;
                Ok(next)
            } else {
                record_conflict(state, &job_id, working_tree, ts_ms, None)
            }
        }
        (false, Some(job_id)) => {
            let mut next = state.clone();
            let job = next
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| anyhow::anyhow!("active job '{}' missing from session", job_id))?;
            job.status = JobStatus::Completed;
            job.updated_at_ms = Some(ts_ms);
            next.queue.active_job_id = None;
            next.session.status = SessionStatus::Running;
            Ok(next)
        }
        (true, None) => {
            let mut next = state.clone();
            next.session.status = if working_tree.conflicted.is_empty() {
                SessionStatus::Running
            } else {
                SessionStatus::AwaitingUser
            };
            Ok(next)
        }
        (false, None) => Ok(state.clone()),
    }
}

/// Finish the session.
pub fn complete_session(
    state: &RebaseState,
    final_trunk_sha: Option<String>,
    ts_ms: Millis,
) -> RebaseState {
    let mut next = state.clone();
    next.session.status = SessionStatus::Completed;
    next.session.completed_at_ms = Some(ts_ms);
    next.session.final_trunk_sha = final_trunk_sha;
    next
}

/// Abort the session. Terminal from any non-completed state.
pub fn abort_session(state: &RebaseState, ts_ms: Millis) -> Result<RebaseState> {
    if state.session.status == SessionStatus::Completed {
        bail!("cannot abort a completed session");
    }
    let mut next = state.clone();
    next.session.status = SessionStatus::Aborted;
    next.session.completed_at_ms = Some(ts_ms);
    Ok(next)
}
