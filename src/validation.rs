//! Pre-flight validation.
//!
//! Every check here is user-recoverable and comes back as a value, never an
//! error: callers branch on the code, render the message, and try again.
//! The executor runs the full set before creating a session and a reduced
//! set (clean tree, no rebase) before resuming one.

use anyhow::Result;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;

use crate::analyzer::{RebaseIntent, StackNode};
use crate::git::GitAdapter;

/// Externally observable validation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    DirtyWorkingTree,
    RebaseInProgress,
    SessionExists,
    BranchNotFound,
    BranchMoved,
    TargetNotFound,
    SameBase,
    InvalidIntent,
    DetachedHead,
}

impl std::fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ValidationCode::DirtyWorkingTree => "DIRTY_WORKING_TREE",
            ValidationCode::RebaseInProgress => "REBASE_IN_PROGRESS",
            ValidationCode::SessionExists => "SESSION_EXISTS",
            ValidationCode::BranchNotFound => "BRANCH_NOT_FOUND",
            ValidationCode::BranchMoved => "BRANCH_MOVED",
            ValidationCode::TargetNotFound => "TARGET_NOT_FOUND",
            ValidationCode::SameBase => "SAME_BASE",
            ValidationCode::InvalidIntent => "INVALID_INTENT",
            ValidationCode::DetachedHead => "DETACHED_HEAD",
        };
        write!(f, "{}", code)
    }
}

/// Result of a validation pass.
///
/// Serializes as `{"valid":true}` or
/// `{"valid":false,"code":...,"message":...}` so hosts on the wire see the
/// same shape regardless of language.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid,
    Invalid { code: ValidationCode, message: String },
}

impl Validation {
    pub fn invalid(code: ValidationCode, message: impl Into<String>) -> Self {
        Validation::Invalid {
            code,
            message: message.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }

    pub fn code(&self) -> Option<ValidationCode> {
        match self {
            Validation::Valid => None,
            Validation::Invalid { code, .. } => Some(*code),
        }
    }
}

impl Serialize for Validation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Validation::Valid => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("valid", &true)?;
                map.end()
            }
            Validation::Invalid { code, message } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("valid", &false)?;
                map.serialize_entry("code", code)?;
                map.serialize_entry("message", message)?;
                map.end()
            }
        }
    }
}

/// Full validation set for starting a fresh session.
pub async fn validate_fresh(
    git: &dyn GitAdapter,
    repo_path: &Path,
    intent: &RebaseIntent,
    session_exists: bool,
) -> Result<Validation> {
    let status = git.working_tree_status(repo_path).await?;

    if !status.is_clean() {
        return Ok(Validation::invalid(
            ValidationCode::DirtyWorkingTree,
            format!(
                "working tree has {} uncommitted change(s); commit or stash them first",
                status.all_changed_files().len()
            ),
        ));
    }
    if status.is_rebasing {
        return Ok(Validation::invalid(
            ValidationCode::RebaseInProgress,
            "a rebase is already in progress; continue or abort it first",
        ));
    }
    if session_exists {
        return Ok(Validation::invalid(
            ValidationCode::SessionExists,
            "another rebase session already exists for this repository",
        ));
    }
    if status.detached {
        return Ok(Validation::invalid(
            ValidationCode::DetachedHead,
            "HEAD is detached; checkout a branch first",
        ));
    }
    if intent.id.is_empty() || intent.targets.is_empty() {
        return Ok(Validation::invalid(
            ValidationCode::InvalidIntent,
            "intent has no targets",
        ));
    }

    for target in &intent.targets {
        // Every branch in the tree must still exist and still point where
        // the snapshot said it did; a moved branch means the plan is stale.
        // The lookups are independent, so they run concurrently.
        let mut nodes: Vec<&StackNode> = Vec::new();
        let mut stack = vec![&target.node];
        while let Some(node) = stack.pop() {
            nodes.push(node);
            stack.extend(node.children.iter());
        }

        let lookups = futures::future::try_join_all(nodes.iter().map(|node| async move {
            let live = git.resolve_ref(repo_path, &node.branch).await?;
            Ok::<_, anyhow::Error>((*node, live))
        }))
        .await?;

        for (node, live) in lookups {
            match live {
                None => {
                    return Ok(Validation::invalid(
                        ValidationCode::BranchNotFound,
                        format!("branch '{}' does not resolve", node.branch),
                    ))
                }
                Some(sha) if sha != node.head_sha => {
                    return Ok(Validation::invalid(
                        ValidationCode::BranchMoved,
                        format!(
                            "branch '{}' moved from {} to {} since the plan was built",
                            node.branch, node.head_sha, sha
                        ),
                    ))
                }
                Some(_) => {}
            }
        }

        if git
            .resolve_ref(repo_path, &target.target_base_sha)
            .await?
            .is_none()
        {
            return Ok(Validation::invalid(
                ValidationCode::TargetNotFound,
                format!("target base '{}' does not resolve", target.target_base_sha),
            ));
        }

        if target.node.base_sha == target.target_base_sha {
            return Ok(Validation::invalid(
                ValidationCode::SameBase,
                format!(
                    "branch '{}' is already based on {}",
                    target.node.branch, target.target_base_sha
                ),
            ));
        }
    }

    Ok(Validation::Valid)
}

/// Reduced validation for resuming an existing session through `execute`.
pub async fn validate_resume(git: &dyn GitAdapter, repo_path: &Path) -> Result<Validation> {
    let status = git.working_tree_status(repo_path).await?;
    if !status.conflicted.is_empty() {
        return Ok(Validation::invalid(
            ValidationCode::DirtyWorkingTree,
            "unresolved conflicts in the working tree",
        ));
    }
    if status.is_rebasing {
        return Ok(Validation::invalid(
            ValidationCode::RebaseInProgress,
            "a rebase is in progress; use continue instead",
        ));
    }
    if !status.is_clean() {
        return Ok(Validation::invalid(
            ValidationCode::DirtyWorkingTree,
            "working tree has uncommitted changes",
        ));
    }
    Ok(Validation::Valid)
}
