//! Stack analysis and intent building.
//!
//! Given a repository snapshot and a `(head, new base)` pair, work out every
//! branch that has to move for the stack to stay consistent: branches
//! sharing the head, branches forked from the head, and branches forked
//! from commits *inside* the range being rewritten. Missing that last group
//! is how stacked rebases orphan commits, so child discovery checks lineage
//! overlap, not just fork points.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::clock::Millis;
use crate::ids::IdGen;
use crate::snapshot::{Branch, RepoSnapshot};

/// One branch in the rewrite tree, with the branches that hang off it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackNode {
    pub branch: String,
    pub head_sha: String,
    pub base_sha: String,
    #[serde(default)]
    pub children: Vec<StackNode>,
}

impl StackNode {
    /// Find the node for a branch anywhere in this subtree.
    pub fn find(&self, branch: &str) -> Option<&StackNode> {
        if self.branch == branch {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(branch))
    }

    /// Every branch name in this subtree, parents before children.
    pub fn branches(&self) -> Vec<&str> {
        let mut out = vec![self.branch.as_str()];
        for child in &self.children {
            out.extend(child.branches());
        }
        out
    }
}

/// A root to rewrite and where it should land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseTarget {
    pub node: StackNode,
    pub target_base_sha: String,
}

/// The user's captured desire to rebase, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseIntent {
    pub id: String,
    pub created_at_ms: Millis,
    pub targets: Vec<RebaseTarget>,
}

/// Shas reachable from the trunk head by parent links.
fn trunk_sha_set(repo: &RepoSnapshot) -> HashSet<String> {
    let mut shas = HashSet::new();
    let Some(trunk) = repo.trunk() else {
        return shas;
    };

    let mut cursor = trunk.head_sha.clone();
    while !cursor.is_empty() && shas.insert(cursor.clone()) {
        match repo.commit(&cursor) {
            Some(commit) => cursor = commit.parent_sha.clone(),
            None => break,
        }
    }
    shas
}

/// Fork point of the branch whose head is `head_sha`.
///
/// Walking parents from the head, the base is the first parent that is on
/// trunk, or the first parent that is the head of a *different* branch; if
/// the walk reaches a root commit the base is that root itself. Each walk
/// carries its own visited set.
fn fork_point(
    repo: &RepoSnapshot,
    branch: &str,
    head_sha: &str,
    trunk_shas: &HashSet<String>,
) -> String {
    let mut visited = HashSet::new();
    let mut cursor = head_sha.to_string();

    loop {
        if !visited.insert(cursor.clone()) {
            return cursor;
        }
        let Some(commit) = repo.commit(&cursor) else {
            return cursor;
        };
        let parent = &commit.parent_sha;

        if parent.is_empty() {
            // Root commit: the branch owns its whole history.
            return cursor;
        }
        if trunk_shas.contains(parent) {
            return parent.clone();
        }
        let parent_owned_by_other = repo
            .branches_at(parent)
            .iter()
            .any(|b| !b.is_remote && b.name != branch);
        if parent_owned_by_other {
            return parent.clone();
        }
        cursor = parent.clone();
    }
}

/// Commit shas in `(base, head]`, head-first.
fn lineage(repo: &RepoSnapshot, head_sha: &str, base_sha: &str) -> Vec<String> {
    let mut shas = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = head_sha.to_string();
    while !cursor.is_empty() && cursor != base_sha && seen.insert(cursor.clone()) {
        shas.push(cursor.clone());
        match repo.commit(&cursor) {
            Some(commit) => cursor = commit.parent_sha.clone(),
            None => break,
        }
    }
    shas
}

/// Pick which branch "owns" a sha when several point at it: prefer local
/// non-trunk, else local, else any. Input order breaks remaining ties.
fn select_branch<'a>(candidates: &[&'a Branch]) -> Option<&'a Branch> {
    candidates
        .iter()
        .find(|b| !b.is_remote && !b.is_trunk)
        .or_else(|| candidates.iter().find(|b| !b.is_remote))
        .or_else(|| candidates.first())
        .copied()
}

/// Build the subtree rooted at `branch`, discovering children recursively.
///
/// The visited set is keyed on `(sha, branch)` so several branches sharing
/// one sha can appear as siblings without the walk cycling.
fn build_node(
    repo: &RepoSnapshot,
    branch: &Branch,
    trunk_shas: &HashSet<String>,
    visited: &mut HashSet<(String, String)>,
) -> StackNode {
    visited.insert((branch.head_sha.clone(), branch.name.clone()));

    let base_sha = fork_point(repo, &branch.name, &branch.head_sha, trunk_shas);
    let parent_lineage: HashSet<String> =
        lineage(repo, &branch.head_sha, &base_sha).into_iter().collect();

    let mut children = Vec::new();
    for candidate in repo.branches() {
        if candidate.is_remote || candidate.is_trunk || candidate.head_sha.is_empty() {
            continue;
        }
        if candidate.name == branch.name {
            continue;
        }
        if visited.contains(&(candidate.head_sha.clone(), candidate.name.clone())) {
            continue;
        }

        let candidate_base = fork_point(repo, &candidate.name, &candidate.head_sha, trunk_shas);
        let shares_head = candidate.head_sha == branch.head_sha;
        let forks_from_head = candidate_base == branch.head_sha;
        let overlaps_lineage = || {
            lineage(repo, &candidate.head_sha, &candidate_base)
                .iter()
                .any(|sha| parent_lineage.contains(sha))
        };

        if shares_head || forks_from_head || overlaps_lineage() {
            children.push(build_node(repo, candidate, trunk_shas, visited));
        }
    }

    StackNode {
        branch: branch.name.clone(),
        head_sha: branch.head_sha.clone(),
        base_sha,
        children,
    }
}

/// Build a rebase intent for moving `head_sha` (and everything stacked on
/// it) onto `target_base_sha`.
///
/// Returns `None` when either sha is unknown to the snapshot, or when no
/// branch points at `head_sha` — there is no identity to rewrite under.
pub fn build_rebase_intent(
    repo: &RepoSnapshot,
    head_sha: &str,
    target_base_sha: &str,
    created_at_ms: Millis,
    ids: &dyn IdGen,
) -> Option<RebaseIntent> {
    if !repo.contains_sha(head_sha) || !repo.contains_sha(target_base_sha) {
        return None;
    }
    let candidates = repo.branches_at(head_sha);
    let root_branch = select_branch(&candidates)?;

    let trunk_shas = trunk_sha_set(repo);
    let mut visited = HashSet::new();
    let node = build_node(repo, root_branch, &trunk_shas, &mut visited);

    Some(RebaseIntent {
        id: ids.next_id(),
        created_at_ms,
        targets: vec![RebaseTarget {
            node,
            target_base_sha: target_base_sha.to_string(),
        }],
    })
}

/// Walk a branch's PR-base chain to the nearest branch that is still open.
///
/// `parents` maps a branch to the base branch its PR targets; `is_open`
/// says whether a PR target is still usable. Cyclic chains happen when PR
/// bases were edited by hand — the walk tolerates them with a visited set
/// and falls back to the starting branch rather than failing.
pub fn find_valid_pr_target(
    branch: &str,
    parents: &HashMap<String, String>,
    is_open: impl Fn(&str) -> bool,
) -> String {
    let mut visited = HashSet::new();
    let mut cursor = branch.to_string();

    loop {
        if !visited.insert(cursor.clone()) {
            return branch.to_string();
        }
        match parents.get(&cursor) {
            Some(parent) if !is_open(parent) => cursor = parent.clone(),
            Some(parent) => return parent.clone(),
            None => return cursor,
        }
    }
}
