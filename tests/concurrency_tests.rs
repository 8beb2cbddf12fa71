//! Concurrent callers: CAS races, per-repository serialization, lock
//! behavior under contention.

mod common;

use common::{engine, fan_out_snapshot, plan};
use serial_test::serial;
use std::path::Path;
use std::sync::Arc;
use teapot_engine::git::mock::RebaseScript;
use teapot_engine::{
    normalize_repo_path, Clock, EngineConfig, ExecuteOutcome, LockAcquisitionError, ManualClock,
    SessionPatch, ValidationCode,
};

#[tokio::test]
#[serial]
async fn version_cas_exactly_one_concurrent_writer_wins() {
    let snapshot = fan_out_snapshot();
    let fx = engine(&snapshot);
    fx.git.script_rebase(
        "stack-1",
        RebaseScript::Conflict {
            files: vec!["x".to_string()],
        },
    );
    fx.executor
        .execute(&fx.repo, plan(&snapshot, "C", "A", "intent"))
        .await
        .unwrap();

    let record = fx.sessions.get(&fx.repo).unwrap().unwrap();
    let version = record.version;

    // Two writers race with the same expected version.
    let first = fx
        .sessions
        .update(&fx.repo, version, SessionPatch::state(record.state.clone()))
        .unwrap();
    let second = fx
        .sessions
        .update(&fx.repo, version, SessionPatch::state(record.state.clone()))
        .unwrap();

    assert!(!first.is_mismatch());
    assert!(second.is_mismatch());
    assert_eq!(second.reason(), Some("version_mismatch"));
    assert_eq!(fx.sessions.get(&fx.repo).unwrap().unwrap().version, version + 1);
}

#[tokio::test]
#[serial]
async fn second_plan_is_rejected_while_first_holds_the_session() {
    let snapshot = fan_out_snapshot();
    let fx = engine(&snapshot);
    fx.git.script_rebase(
        "stack-1",
        RebaseScript::Conflict {
            files: vec!["x".to_string()],
        },
    );

    let outcome = fx
        .executor
        .execute(&fx.repo, plan(&snapshot, "C", "A", "first"))
        .await
        .unwrap();
    assert!(matches!(outcome, ExecuteOutcome::Conflicts(_)));

    let outcome = fx
        .executor
        .execute(&fx.repo, plan(&snapshot, "C", "A", "second"))
        .await
        .unwrap();
    let ExecuteOutcome::Rejected(verdict) = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(verdict.code(), Some(ValidationCode::SessionExists));
}

#[tokio::test]
#[serial]
async fn context_acquisitions_queue_fifo_within_one_process() {
    let snapshot = fan_out_snapshot();
    let fx = engine(&snapshot);
    let contexts = fx.contexts.clone();
    let repo = fx.repo.clone();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let first = contexts.acquire(&repo, "rebase", &[]).await.unwrap();

    let mut handles = Vec::new();
    for tag in ["second", "third"] {
        let contexts = contexts.clone();
        let repo = repo.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let guard = contexts.acquire(&repo, "rebase", &[]).await.unwrap();
            order.lock().unwrap().push(tag);
            guard.release().await.unwrap();
        }));
        // Let this waiter join the queue before spawning the next.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    }

    assert!(order.lock().unwrap().is_empty(), "waiters ran before release");
    first.release().await.unwrap();

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(order.lock().unwrap().as_slice(), &["second", "third"]);
}

#[tokio::test]
#[serial]
async fn repos_do_not_block_each_other() {
    let snapshot = fan_out_snapshot();
    let fx_a = engine(&snapshot);
    let fx_b = engine(&snapshot);

    // Hold repository A's context while repository B runs a whole rebase.
    let guard_a = fx_a.contexts.acquire(&fx_a.repo, "rebase", &[]).await.unwrap();

    let outcome = fx_b
        .executor
        .execute(&fx_b.repo, plan(&snapshot, "C", "A", "intent"))
        .await
        .unwrap();
    assert!(outcome.is_completed());

    guard_a.release().await.unwrap();
}

#[tokio::test]
#[serial]
async fn foreign_live_lock_exhausts_with_typed_error() {
    let snapshot = fan_out_snapshot();
    let fx = engine(&snapshot);

    // A live lock held by this very process, planted as if by another
    // tool: never stale, so acquisition must give up with the typed error.
    let git_dir = fx.repo.join(".git");
    std::fs::create_dir_all(&git_dir).unwrap();
    std::fs::write(
        teapot_engine::context::lock_path(&git_dir),
        serde_json::json!({
            "pid": std::process::id(),
            "lockId": "someone-else",
            "timestamp": fx.clock.now_ms(),
        })
        .to_string(),
    )
    .unwrap();

    let contexts = teapot_engine::ExecutionContextService::new(
        fx.git.clone(),
        EngineConfig {
            lock_attempts: 2,
            ..EngineConfig::default()
        },
        Arc::new(ManualClock::at(fx.clock.now_ms())),
        fx.events.clone(),
        teapot_engine::events::null_logger(),
    )
    .unwrap();

    let err = contexts.acquire(&fx.repo, "rebase", &[]).await.unwrap_err();
    let lock_err = err.downcast::<LockAcquisitionError>().unwrap();
    assert_eq!(lock_err.attempts, 2);
    assert_eq!(
        normalize_repo_path(&lock_err.repo_path),
        normalize_repo_path(&fx.repo)
    );
}

#[tokio::test]
#[serial]
async fn applying_exclusivity_holds_at_every_persisted_state() {
    // Invariant: at most one job is ever `applying`, and it is the one the
    // queue's active slot points at. Checked at each pause point we can
    // observe from outside.
    let snapshot = common::deep_snapshot();
    let fx = engine(&snapshot);
    fx.git.script_rebase(
        "l1",
        RebaseScript::Conflict {
            files: vec!["a".to_string()],
        },
    );
    fx.git.script_rebase(
        "l2",
        RebaseScript::Conflict {
            files: vec!["b".to_string()],
        },
    );

    let check = |repo: &Path, sessions: &teapot_engine::SessionStore| {
        if let Some(record) = sessions.get(repo).unwrap() {
            let applying: Vec<_> = record
                .state
                .jobs
                .values()
                .filter(|j| j.status == teapot_engine::JobStatus::Applying)
                .collect();
            assert!(applying.len() <= 1);
            if let Some(job) = applying.first() {
                assert_eq!(
                    record.state.queue.active_job_id.as_deref(),
                    Some(job.id.as_str())
                );
            }
        }
    };

    fx.executor
        .execute(&fx.repo, plan(&snapshot, "C", "A", "intent"))
        .await
        .unwrap();
    check(&fx.repo, &fx.sessions);

    fx.git.resolve_conflicts();
    fx.executor.continue_op(&fx.repo).await.unwrap();
    check(&fx.repo, &fx.sessions);

    fx.git.resolve_conflicts();
    let outcome = fx.executor.continue_op(&fx.repo).await.unwrap();
    assert!(outcome.is_completed());
    check(&fx.repo, &fx.sessions);
}
