//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use teapot_engine::{
    build_rebase_intent, EngineConfig, ExecutionContextService, ManualClock, MockGit,
    RebaseExecutor, RebasePlan, RecordingSink, RepoSnapshot, SeqGen, SessionDisk, SessionStore,
    SnapshotBuilder,
};

/// A fully wired engine over a mock repository in a tempdir.
pub struct TestEngine {
    pub dir: TempDir,
    pub repo: PathBuf,
    pub git: Arc<MockGit>,
    pub clock: ManualClock,
    pub events: Arc<RecordingSink>,
    pub sessions: Arc<SessionStore>,
    pub contexts: Arc<ExecutionContextService>,
    pub executor: RebaseExecutor,
}

pub fn engine(snapshot: &RepoSnapshot) -> TestEngine {
    engine_with_config(snapshot, EngineConfig::default())
}

pub fn engine_with_config(snapshot: &RepoSnapshot, config: EngineConfig) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().to_path_buf();
    let git = Arc::new(MockGit::from_snapshot(&repo, snapshot));
    let clock = ManualClock::at(1_000_000);
    let events = Arc::new(RecordingSink::new());
    let logger = teapot_engine::events::null_logger();

    let sessions = Arc::new(SessionStore::new(
        SessionDisk::at(dir.path().join("store").join("sessions.json")),
        Arc::new(clock.clone()),
        events.clone(),
        logger.clone(),
    ));
    let contexts = Arc::new(
        ExecutionContextService::new(
            git.clone(),
            config.clone(),
            Arc::new(clock.clone()),
            events.clone(),
            logger.clone(),
        )
        .unwrap(),
    );
    let executor = RebaseExecutor::new(
        git.clone(),
        sessions.clone(),
        contexts.clone(),
        config,
        Arc::new(clock.clone()),
        Arc::new(SeqGen::new("id")),
        logger,
    );

    TestEngine {
        dir,
        repo,
        git,
        clock,
        events,
        sessions,
        contexts,
        executor,
    }
}

/// Rebuild the persistence-backed half of an engine over the same repo
/// and store files, simulating a process restart. The mock git carries
/// over, standing in for the real repository on disk.
pub fn restarted(fx: &TestEngine) -> (Arc<SessionStore>, RebaseExecutor) {
    let logger = teapot_engine::events::null_logger();
    let sessions = Arc::new(SessionStore::new(
        SessionDisk::at(fx.dir.path().join("store").join("sessions.json")),
        Arc::new(fx.clock.clone()),
        fx.events.clone(),
        logger.clone(),
    ));
    let contexts = Arc::new(
        ExecutionContextService::new(
            fx.git.clone(),
            EngineConfig::default(),
            Arc::new(fx.clock.clone()),
            fx.events.clone(),
            logger.clone(),
        )
        .unwrap(),
    );
    let executor = RebaseExecutor::new(
        fx.git.clone(),
        sessions.clone(),
        contexts,
        EngineConfig::default(),
        Arc::new(fx.clock.clone()),
        Arc::new(SeqGen::new("restarted")),
        logger,
    );
    (sessions, executor)
}

/// Trunk `main@B` over A<-B, with `stack-1@C` and `stack-2@D` stacked on
/// top (C<-D).
pub fn fan_out_snapshot() -> RepoSnapshot {
    SnapshotBuilder::new()
        .commit("A", "", "init")
        .commit("B", "A", "trunk tip")
        .commit("C", "B", "stack-1 work")
        .commit("D", "C", "stack-2 work")
        .trunk("main", "B")
        .branch("stack-1", "C")
        .branch("stack-2", "D")
        .build()
}

/// A three-level stack: l1@C, l2@D, l3@E.
pub fn deep_snapshot() -> RepoSnapshot {
    SnapshotBuilder::new()
        .commit("A", "", "init")
        .commit("B", "A", "trunk tip")
        .commit("C", "B", "level one")
        .commit("D", "C", "level two")
        .commit("E", "D", "level three")
        .trunk("main", "B")
        .branch("l1", "C")
        .branch("l2", "D")
        .branch("l3", "E")
        .build()
}

pub fn plan(snapshot: &RepoSnapshot, head: &str, base: &str, id_prefix: &str) -> RebasePlan {
    let intent =
        build_rebase_intent(snapshot, head, base, 999_000, &SeqGen::new(id_prefix)).unwrap();
    RebasePlan {
        intent,
        snapshot: snapshot.clone(),
    }
}
