//! Execution engine for Teapot, a stacked-diff Git client.
//!
//! Given a planned rewrite of one branch plus every branch whose lineage
//! depends on it, this crate carries the plan through to completion across
//! conflicts, process restarts, and concurrent callers, while never
//! touching the user's working directory on disk.
//!
//! The pieces, leaves first:
//!
//! - [`git`] — the `GitAdapter` capability the host supplies; the engine
//!   never talks to Git directly.
//! - [`analyzer`] — turns a repository snapshot plus a `(head, new base)`
//!   pair into a [`analyzer::RebaseIntent`] covering the whole stack.
//! - [`machine`] — a pure state machine over sessions, jobs, and queues.
//! - [`session`] — versioned two-tier persistence with optimistic
//!   concurrency.
//! - [`context`] — per-repository mutual exclusion, temporary worktrees,
//!   and crash recovery.
//! - [`executor`] — glues the above together and drives Git.

pub mod analyzer;
pub mod clock;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod executor;
pub mod git;
pub mod ids;
pub mod machine;
pub mod session;
pub mod snapshot;
pub mod validation;

pub use analyzer::{build_rebase_intent, find_valid_pr_target, RebaseIntent, RebaseTarget, StackNode};
pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use config::EngineConfig;
pub use context::{ExecutionContext, ExecutionContextService, ExecutionGuard, HealthReport};
pub use errors::{ContextNotFoundError, LockAcquisitionError, WorktreeCreationError};
pub use events::{EngineEvent, EventSink, LogSink, NullSink, RecordingSink};
pub use executor::{ConflictReport, ExecuteOutcome, PrHook, RebaseExecutor, RebasePlan};
pub use git::{GitAdapter, MockGit, RebaseProgress, WorkingTreeStatus};
pub use ids::{IdGen, SeqGen, UuidGen};
pub use machine::{
    CommitRewrite, JobStatus, RebaseJob, RebaseQueue, RebaseSession, RebaseState, SessionStatus,
    StackMutation,
};
pub use session::{
    normalize_repo_path, SessionDisk, SessionPatch, SessionPhase, SessionStore,
    StoredRebaseSession, UpdateOutcome,
};
pub use snapshot::{Branch, Commit, RepoSnapshot};
#[cfg(any(test, feature = "test-support"))]
pub use snapshot::SnapshotBuilder;
pub use validation::{Validation, ValidationCode};
