//! Typed errors raised at subsystem boundaries.
//!
//! Validation failures are *values* (see `validation.rs`), never errors.
//! The types here cover the execution-context service's failure modes,
//! where the caller needs structured context (paths, attempt counts, cause)
//! rather than a message string.

use std::path::PathBuf;
use thiserror::Error;

/// The cross-process lock could not be acquired within the configured
/// number of attempts.
#[derive(Debug, Error)]
#[error("could not acquire execution lock for {repo_path:?} after {attempts} attempts")]
pub struct LockAcquisitionError {
    pub repo_path: PathBuf,
    pub attempts: u32,
}

/// A temporary worktree could not be created.
#[derive(Debug, Error)]
#[error("could not create temporary worktree for {repo_path:?} after {attempts} attempts")]
pub struct WorktreeCreationError {
    pub repo_path: PathBuf,
    pub attempts: u32,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

/// An operation referenced an execution context that does not exist.
#[derive(Debug, Error)]
#[error("no execution context recorded for {repo_path:?}")]
pub struct ContextNotFoundError {
    pub repo_path: PathBuf,
}
