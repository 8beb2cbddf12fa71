//! In-memory repository snapshot.
//!
//! The snapshot builder itself lives outside this crate; the engine only
//! consumes its output: a slice of commits plus the branches pointing into
//! them. A snapshot is immutable once observed — analysis never mutates it,
//! and a stale snapshot is detected later by validation (live refs are
//! compared against the snapshot's heads before any rewrite starts).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::clock::Millis;

/// A single commit in the analyzed slice.
///
/// `parent_sha` is empty for a root commit. Merge commits are out of scope;
/// every commit has at most one parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub sha: String,
    #[serde(default)]
    pub parent_sha: String,
    #[serde(default)]
    pub children_sha: Vec<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub time_ms: Millis,
}

/// A branch ref observed at snapshot time.
///
/// A branch with an empty `head_sha` is treated as absent for analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    #[serde(rename = "ref")]
    pub name: String,
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub is_trunk: bool,
    #[serde(default)]
    pub is_remote: bool,
}

/// Commits and branches with O(1) lookup by sha.
///
/// Branch order is preserved from the input so that tie-breaks (which branch
/// "owns" a sha several branches point at) stay deterministic.
#[derive(Debug, Clone, Default)]
pub struct RepoSnapshot {
    commits: Vec<Commit>,
    branches: Vec<Branch>,
    by_sha: HashMap<String, usize>,
}

impl RepoSnapshot {
    /// Assemble a snapshot, deriving `children_sha` from parent links when
    /// the builder did not populate them.
    pub fn new(mut commits: Vec<Commit>, branches: Vec<Branch>) -> Self {
        let mut by_sha = HashMap::with_capacity(commits.len());
        for (idx, commit) in commits.iter().enumerate() {
            by_sha.insert(commit.sha.clone(), idx);
        }

        let mut derived: HashMap<String, Vec<String>> = HashMap::new();
        for commit in &commits {
            if !commit.parent_sha.is_empty() {
                derived
                    .entry(commit.parent_sha.clone())
                    .or_default()
                    .push(commit.sha.clone());
            }
        }
        for commit in &mut commits {
            if commit.children_sha.is_empty() {
                if let Some(children) = derived.remove(&commit.sha) {
                    commit.children_sha = children;
                }
            }
        }

        Self {
            commits,
            branches,
            by_sha,
        }
    }

    pub fn commit(&self, sha: &str) -> Option<&Commit> {
        self.by_sha.get(sha).map(|idx| &self.commits[*idx])
    }

    pub fn contains_sha(&self, sha: &str) -> bool {
        self.by_sha.contains_key(sha)
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.name == name)
    }

    /// Branches pointing at a sha, in input order. Branches with an empty
    /// head are never returned.
    pub fn branches_at(&self, sha: &str) -> Vec<&Branch> {
        if sha.is_empty() {
            return Vec::new();
        }
        self.branches.iter().filter(|b| b.head_sha == sha).collect()
    }

    /// The first non-remote trunk branch, if any.
    pub fn trunk(&self) -> Option<&Branch> {
        self.branches
            .iter()
            .find(|b| b.is_trunk && !b.is_remote && !b.head_sha.is_empty())
    }
}

/// Fluent construction of snapshots for tests and fixtures. Production
/// snapshots come from the external snapshot builder, so this only exists
/// under `cfg(test)` or the `test-support` feature.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    commits: Vec<Commit>,
    branches: Vec<Branch>,
    next_time_ms: Millis,
}

#[cfg(any(test, feature = "test-support"))]
impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a commit. Commits added later get later timestamps.
    pub fn commit(mut self, sha: &str, parent_sha: &str, message: &str) -> Self {
        self.next_time_ms += 1_000;
        self.commits.push(Commit {
            sha: sha.to_string(),
            parent_sha: parent_sha.to_string(),
            children_sha: Vec::new(),
            message: message.to_string(),
            time_ms: self.next_time_ms,
        });
        self
    }

    pub fn trunk(mut self, name: &str, head_sha: &str) -> Self {
        self.branches.push(Branch {
            name: name.to_string(),
            head_sha: head_sha.to_string(),
            is_trunk: true,
            is_remote: false,
        });
        self
    }

    pub fn branch(mut self, name: &str, head_sha: &str) -> Self {
        self.branches.push(Branch {
            name: name.to_string(),
            head_sha: head_sha.to_string(),
            is_trunk: false,
            is_remote: false,
        });
        self
    }

    pub fn remote_branch(mut self, name: &str, head_sha: &str) -> Self {
        self.branches.push(Branch {
            name: name.to_string(),
            head_sha: head_sha.to_string(),
            is_trunk: false,
            is_remote: true,
        });
        self
    }

    pub fn build(self) -> RepoSnapshot {
        RepoSnapshot::new(self.commits, self.branches)
    }
}
