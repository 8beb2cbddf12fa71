//! Session persistence.
//!
//! A two-tier write-through cache: an in-process map in front of a durable
//! JSON store keyed by normalized repository path. Every write lands on
//! disk first and only then in memory; every read checks memory first and
//! hydrates it from disk on a miss. Mutations go through optimistic
//! concurrency — each record carries a strictly monotonic `version`, and an
//! update only applies when the caller's expected version still matches.

mod disk;

pub use disk::SessionDisk;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::analyzer::RebaseIntent;
use crate::clock::{Clock, Millis};
use crate::events::{EngineEvent, EventSink};
use crate::machine::{self, CommitRewrite, RebaseState, SessionStatus};

/// Coarse UI-oriented label for where a session stands.
///
/// Phase and session status are related but independent: status is the
/// machine's truth, phase is what a front-end shows, and the two may lag
/// each other between persist points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Planning,
    Executing,
    Conflicted,
    Completed,
}

impl SessionPhase {
    /// Migration for records written before phases existed.
    pub fn derive_from_status(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Pending => SessionPhase::Planning,
            SessionStatus::Running => SessionPhase::Executing,
            SessionStatus::AwaitingUser => SessionPhase::Conflicted,
            SessionStatus::Completed | SessionStatus::Aborted => SessionPhase::Completed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Planning => "planning",
            SessionPhase::Executing => "executing",
            SessionPhase::Conflicted => "conflicted",
            SessionPhase::Completed => "completed",
        }
    }
}

/// One persisted session record. Exists only while work is outstanding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRebaseSession {
    pub intent: RebaseIntent,
    pub state: RebaseState,
    pub phase: SessionPhase,
    pub original_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_detached_worktrees: Option<Vec<String>>,
    pub version: u64,
    pub created_at_ms: Millis,
    pub updated_at_ms: Millis,
}

/// Partial update applied through the CAS protocol. Fields outside this
/// set (version, timestamps, original branch) are store-managed.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub state: Option<RebaseState>,
    pub intent: Option<RebaseIntent>,
    pub phase: Option<SessionPhase>,
    pub auto_detached_worktrees: Option<Vec<String>>,
}

impl SessionPatch {
    pub fn state(state: RebaseState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// Outcome of a CAS mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(StoredRebaseSession),
    VersionMismatch,
}

impl UpdateOutcome {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, UpdateOutcome::VersionMismatch)
    }

    /// Machine-readable reason, mirroring the wire shape hosts see.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            UpdateOutcome::Updated(_) => None,
            UpdateOutcome::VersionMismatch => Some("version_mismatch"),
        }
    }

    pub fn into_updated(self) -> Option<StoredRebaseSession> {
        match self {
            UpdateOutcome::Updated(record) => Some(record),
            UpdateOutcome::VersionMismatch => None,
        }
    }
}

/// Normalize a repository path for use as a store key: strip trailing
/// slashes, leave everything else alone (no internal collapsing).
pub fn normalize_repo_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The two-tier store. Cheap to clone behind an `Arc`; all methods take
/// `&self`.
pub struct SessionStore {
    disk: SessionDisk,
    memory: Mutex<HashMap<String, StoredRebaseSession>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    logger: Logger,
}

impl SessionStore {
    pub fn new(
        disk: SessionDisk,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        logger: Logger,
    ) -> Self {
        Self {
            disk,
            memory: Mutex::new(HashMap::new()),
            clock,
            events,
            logger,
        }
    }

    /// Decode a raw disk record, applying the phase migration for records
    /// written before phases existed. Returns the decoded record and
    /// whether a write-back is needed.
    fn decode(&self, key: &str, mut value: serde_json::Value) -> Option<(StoredRebaseSession, bool)> {
        let mut migrated = false;
        if value.get("phase").is_none() {
            let status = value
                .get("state")
                .and_then(|s| s.get("session"))
                .and_then(|s| s.get("status"))
                .cloned()?;
            let status: SessionStatus = serde_json::from_value(status).ok()?;
            let phase = SessionPhase::derive_from_status(status);
            value.as_object_mut()?.insert(
                "phase".to_string(),
                serde_json::to_value(phase).ok()?,
            );
            migrated = true;
        }

        match serde_json::from_value::<StoredRebaseSession>(value) {
            Ok(record) => Some((record, migrated)),
            Err(err) => {
                slog::warn!(
                    self.logger,
                    "discarding schema-invalid session record";
                    "repo" => key,
                    "error" => %err
                );
                None
            }
        }
    }

    /// Fetch a session, hydrating memory from disk on a miss.
    ///
    /// A corrupt or schema-invalid disk record is logged, cleared, and
    /// treated as absent.
    pub fn get(&self, repo_path: &Path) -> Result<Option<StoredRebaseSession>> {
        let key = normalize_repo_path(repo_path);
        if let Some(record) = self.memory.lock().unwrap().get(&key) {
            return Ok(Some(record.clone()));
        }

        let Some(raw) = self.disk.get(&key)? else {
            return Ok(None);
        };
        match self.decode(&key, raw) {
            Some((record, migrated)) => {
                if migrated {
                    self.disk.put(&key, serde_json::to_value(&record)?)?;
                }
                self.memory.lock().unwrap().insert(key, record.clone());
                Ok(Some(record))
            }
            None => {
                self.disk.remove(&key)?;
                Ok(None)
            }
        }
    }

    pub fn has(&self, repo_path: &Path) -> Result<bool> {
        Ok(self.get(repo_path)?.is_some())
    }

    /// Every stored session, keyed by normalized repo path.
    pub fn get_all(&self) -> Result<HashMap<String, StoredRebaseSession>> {
        let mut out = HashMap::new();
        for key in self.disk.load_all()?.keys() {
            if let Some(record) = self.get(Path::new(key))? {
                out.insert(key.clone(), record);
            }
        }
        Ok(out)
    }

    /// Remove a session from both tiers.
    pub fn clear(&self, repo_path: &Path) -> Result<()> {
        let key = normalize_repo_path(repo_path);
        self.disk.remove(&key)?;
        self.memory.lock().unwrap().remove(&key);
        Ok(())
    }

    /// Create a session record at version 1. CAS against "not present":
    /// an existing record yields `VersionMismatch`.
    pub fn create(
        &self,
        repo_path: &Path,
        intent: RebaseIntent,
        state: RebaseState,
        original_branch: &str,
    ) -> Result<UpdateOutcome> {
        let key = normalize_repo_path(repo_path);
        if self.get(repo_path)?.is_some() {
            return Ok(UpdateOutcome::VersionMismatch);
        }

        let now = self.clock.now_ms();
        let phase = SessionPhase::derive_from_status(state.session.status);
        let record = StoredRebaseSession {
            intent,
            state,
            phase,
            original_branch: original_branch.to_string(),
            auto_detached_worktrees: None,
            version: 1,
            created_at_ms: now,
            updated_at_ms: now,
        };

        // Disk before memory: memory never holds what disk might not.
        self.disk.put(&key, serde_json::to_value(&record)?)?;
        self.memory.lock().unwrap().insert(key, record.clone());
        Ok(UpdateOutcome::Updated(record))
    }

    /// CAS update. Applies the patch only when the stored version equals
    /// `expected_version`; the version auto-increments and `updatedAtMs`
    /// refreshes on success.
    ///
    /// Updating a session that does not exist is a programmer error and
    /// fails loudly.
    pub fn update(
        &self,
        repo_path: &Path,
        expected_version: u64,
        patch: SessionPatch,
    ) -> Result<UpdateOutcome> {
        let key = normalize_repo_path(repo_path);
        let Some(current) = self.get(repo_path)? else {
            bail!("cannot update non-existent session for '{}'", key);
        };
        if current.version != expected_version {
            return Ok(UpdateOutcome::VersionMismatch);
        }

        let mut next = current;
        if let Some(state) = patch.state {
            next.state = state;
        }
        if let Some(intent) = patch.intent {
            next.intent = intent;
        }
        let phase_changed = patch.phase.filter(|p| *p != next.phase);
        if let Some(phase) = phase_changed {
            next.phase = phase;
        }
        if let Some(worktrees) = patch.auto_detached_worktrees {
            next.auto_detached_worktrees = Some(worktrees);
        }
        next.version += 1;
        next.updated_at_ms = self.clock.now_ms();

        self.disk.put(&key, serde_json::to_value(&next)?)?;
        self.memory.lock().unwrap().insert(key.clone(), next.clone());

        if let Some(phase) = phase_changed {
            self.events.emit(EngineEvent::SessionPhaseChanged {
                repo_path: key,
                phase: phase.as_str().to_string(),
            });
        }
        Ok(UpdateOutcome::Updated(next))
    }

    /// Retry a CAS update against refreshed state, with linear backoff
    /// (10·(attempt+1) ms) between attempts. Surfaces the mismatch after
    /// `max_attempts` losses.
    pub async fn update_with_retry(
        &self,
        repo_path: &Path,
        max_attempts: u32,
        mut patch_fn: impl FnMut(&StoredRebaseSession) -> Result<SessionPatch>,
    ) -> Result<StoredRebaseSession> {
        let mut attempt = 0u32;
        loop {
            let Some(current) = self.get(repo_path)? else {
                bail!(
                    "cannot update non-existent session for '{}'",
                    normalize_repo_path(repo_path)
                );
            };
            let patch = patch_fn(&current)?;
            match self.update(repo_path, current.version, patch)? {
                UpdateOutcome::Updated(record) => return Ok(record),
                UpdateOutcome::VersionMismatch => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        bail!(
                            "session update for '{}' kept losing version races after {} attempts",
                            normalize_repo_path(repo_path),
                            attempt
                        );
                    }
                    tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
                }
            }
        }
    }

    /// Convenience: move the UI phase, leaving machine state untouched.
    pub async fn set_phase(
        &self,
        repo_path: &Path,
        phase: SessionPhase,
        max_attempts: u32,
    ) -> Result<StoredRebaseSession> {
        self.update_with_retry(repo_path, max_attempts, |_| {
            Ok(SessionPatch {
                phase: Some(phase),
                ..SessionPatch::default()
            })
        })
        .await
    }

    /// Convenience: complete a job in the stored machine state.
    pub async fn mark_job_completed(
        &self,
        repo_path: &Path,
        job_id: &str,
        rebased_head_sha: &str,
        rewrites: Vec<CommitRewrite>,
        max_attempts: u32,
    ) -> Result<StoredRebaseSession> {
        let now = self.clock.now_ms();
        let job_id = job_id.to_string();
        let head = rebased_head_sha.to_string();
        self.update_with_retry(repo_path, max_attempts, move |record| {
            let (state, _mutations) =
                machine::complete_job(&record.state, &job_id, &head, now, rewrites.clone())?;
            Ok(SessionPatch::state(state))
        })
        .await
        .context("failed to mark job completed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::build_rebase_intent;
    use crate::clock::ManualClock;
    use crate::events::{NullSink, RecordingSink};
    use crate::ids::SeqGen;
    use crate::machine::create_session;
    use crate::snapshot::{RepoSnapshot, SnapshotBuilder};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn stack_repo() -> RepoSnapshot {
        SnapshotBuilder::new()
            .commit("A", "", "init")
            .commit("B", "A", "trunk tip")
            .commit("C", "B", "feature work")
            .trunk("main", "B")
            .branch("feature", "C")
            .build()
    }

    fn fixture(dir: &Path) -> (SessionStore, RebaseIntent, RebaseState, ManualClock) {
        let repo = stack_repo();
        let ids = SeqGen::new("id");
        let intent = build_rebase_intent(&repo, "C", "A", 1_000, &ids).unwrap();
        let state =
            create_session("session-1".to_string(), &repo, &intent.targets, 1_000, &ids).unwrap();
        let clock = ManualClock::at(1_000);
        let store = SessionStore::new(
            SessionDisk::at(dir.join("sessions.json")),
            Arc::new(clock.clone()),
            Arc::new(NullSink),
            crate::events::null_logger(),
        );
        (store, intent, state, clock)
    }

    #[test]
    fn test_normalize_strips_trailing_slashes_only() {
        assert_eq!(normalize_repo_path(Path::new("/work/repo/")), "/work/repo");
        assert_eq!(normalize_repo_path(Path::new("/work/repo")), "/work/repo");
        assert_eq!(normalize_repo_path(Path::new("/work//repo")), "/work//repo");
        assert_eq!(normalize_repo_path(Path::new("/")), "/");
    }

    #[test]
    fn test_create_then_get_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let (store, intent, state, _clock) = fixture(dir.path());
        let repo_path = PathBuf::from("/work/repo");

        let outcome = store.create(&repo_path, intent.clone(), state, "main")?;
        let record = outcome.into_updated().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.created_at_ms, record.updated_at_ms);
        assert_eq!(record.phase, SessionPhase::Planning);

        let loaded = store.get(&repo_path)?.unwrap();
        assert_eq!(loaded, record);
        // Trailing slash maps to the same key.
        assert!(store.has(Path::new("/work/repo/"))?);
        Ok(())
    }

    #[test]
    fn test_create_is_cas_against_absent() -> Result<()> {
        let dir = tempdir()?;
        let (store, intent, state, _clock) = fixture(dir.path());
        let repo_path = PathBuf::from("/work/repo");

        store.create(&repo_path, intent.clone(), state.clone(), "main")?;
        let second = store.create(&repo_path, intent, state, "main")?;
        assert!(second.is_mismatch());
        assert_eq!(second.reason(), Some("version_mismatch"));
        Ok(())
    }

    #[test]
    fn test_update_cas_version_race() -> Result<()> {
        let dir = tempdir()?;
        let (store, intent, state, _clock) = fixture(dir.path());
        let repo_path = PathBuf::from("/work/repo");
        store.create(&repo_path, intent, state.clone(), "main")?;

        // Two writers both expect version 1: exactly one wins, leaving v=2.
        let first = store.update(&repo_path, 1, SessionPatch::state(state.clone()))?;
        let second = store.update(&repo_path, 1, SessionPatch::state(state))?;

        assert!(!first.is_mismatch());
        assert!(second.is_mismatch());
        assert_eq!(store.get(&repo_path)?.unwrap().version, 2);
        Ok(())
    }

    #[test]
    fn test_version_increments_by_exactly_one() -> Result<()> {
        let dir = tempdir()?;
        let (store, intent, state, clock) = fixture(dir.path());
        let repo_path = PathBuf::from("/work/repo");
        store.create(&repo_path, intent, state.clone(), "main")?;

        for expected in 1..=4u64 {
            clock.advance(10);
            let outcome = store.update(&repo_path, expected, SessionPatch::state(state.clone()))?;
            let record = outcome.into_updated().unwrap();
            assert_eq!(record.version, expected + 1);
        }
        Ok(())
    }

    #[test]
    fn test_update_missing_session_is_fatal() {
        let dir = tempdir().unwrap();
        let (store, _intent, state, _clock) = fixture(dir.path());
        let result = store.update(Path::new("/nope"), 1, SessionPatch::state(state));
        assert!(result.is_err());
    }

    #[test]
    fn test_clear_removes_both_tiers() -> Result<()> {
        let dir = tempdir()?;
        let (store, intent, state, _clock) = fixture(dir.path());
        let repo_path = PathBuf::from("/work/repo");
        store.create(&repo_path, intent, state, "main")?;

        store.clear(&repo_path)?;
        assert!(store.get(&repo_path)?.is_none());
        assert!(store.get_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_memory_hydrates_from_disk() -> Result<()> {
        let dir = tempdir()?;
        let (store, intent, state, clock) = fixture(dir.path());
        let repo_path = PathBuf::from("/work/repo");
        store.create(&repo_path, intent, state, "main")?;

        // A second store over the same file sees the record cold.
        let other = SessionStore::new(
            SessionDisk::at(dir.path().join("sessions.json")),
            Arc::new(clock),
            Arc::new(NullSink),
            crate::events::null_logger(),
        );
        assert!(other.get(&repo_path)?.is_some());
        Ok(())
    }

    #[test]
    fn test_schema_invalid_record_cleared_and_absent() -> Result<()> {
        let dir = tempdir()?;
        let (store, _intent, _state, _clock) = fixture(dir.path());
        let disk = SessionDisk::at(dir.path().join("sessions.json"));
        disk.put("/bad/repo", serde_json::json!({"version": "not-a-number"}))?;

        assert!(store.get(Path::new("/bad/repo"))?.is_none());
        // Cleared on the way out.
        assert!(disk.get("/bad/repo")?.is_none());
        Ok(())
    }

    #[test]
    fn test_phaseless_record_migrated_and_written_back() -> Result<()> {
        let dir = tempdir()?;
        let (store, intent, state, _clock) = fixture(dir.path());
        let repo_path = PathBuf::from("/work/repo");
        store.create(&repo_path, intent, state, "main")?;

        // Strip the phase on disk, simulating a pre-phase record.
        let disk = SessionDisk::at(dir.path().join("sessions.json"));
        let mut raw = disk.get("/work/repo")?.unwrap();
        raw.as_object_mut().unwrap().remove("phase");
        disk.put("/work/repo", raw)?;

        let cold = SessionStore::new(
            SessionDisk::at(dir.path().join("sessions.json")),
            Arc::new(ManualClock::at(0)),
            Arc::new(NullSink),
            crate::events::null_logger(),
        );
        let record = cold.get(&repo_path)?.unwrap();
        assert_eq!(record.phase, SessionPhase::Planning);
        assert!(disk.get("/work/repo")?.unwrap().get("phase").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_with_retry_wins_after_refresh() -> Result<()> {
        let dir = tempdir()?;
        let (store, intent, state, _clock) = fixture(dir.path());
        let repo_path = PathBuf::from("/work/repo");
        store.create(&repo_path, intent, state.clone(), "main")?;

        // Bump the version behind the retry helper's back once.
        store.update(&repo_path, 1, SessionPatch::state(state.clone()))?;

        let record = store
            .update_with_retry(&repo_path, 3, |current| {
                Ok(SessionPatch::state(current.state.clone()))
            })
            .await?;
        assert_eq!(record.version, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_phase_emits_event() -> Result<()> {
        let dir = tempdir()?;
        let repo = stack_repo();
        let ids = SeqGen::new("id");
        let intent = build_rebase_intent(&repo, "C", "A", 1_000, &ids).unwrap();
        let state =
            create_session("session-1".to_string(), &repo, &intent.targets, 1_000, &ids).unwrap();
        let sink = Arc::new(RecordingSink::new());
        let store = SessionStore::new(
            SessionDisk::at(dir.path().join("sessions.json")),
            Arc::new(ManualClock::at(1_000)),
            sink.clone(),
            crate::events::null_logger(),
        );
        let repo_path = PathBuf::from("/work/repo");
        store.create(&repo_path, intent, state, "main")?;

        let record = store.set_phase(&repo_path, SessionPhase::Executing, 3).await?;
        assert_eq!(record.phase, SessionPhase::Executing);

        let events = sink.take();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::SessionPhaseChanged { phase, .. } if phase == "executing"
        )));
        Ok(())
    }

    #[tokio::test]
    async fn test_mark_job_completed_updates_machine_state() -> Result<()> {
        let dir = tempdir()?;
        let (store, intent, state, _clock) = fixture(dir.path());
        let repo_path = PathBuf::from("/work/repo");

        // Put the job into applying first.
        let (running, job) = machine::next_job(&state, 2_000).unwrap();
        store.create(&repo_path, intent, running, "main")?;

        let record = store
            .mark_job_completed(&repo_path, &job.id, "C-r1", vec![], 3)
            .await?;
        assert_eq!(
            record.state.job(&job.id).unwrap().rebased_head_sha.as_deref(),
            Some("C-r1")
        );
        Ok(())
    }
}
