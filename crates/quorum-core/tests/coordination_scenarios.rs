//! End-to-end coordination scenarios: the lock handoff dance, batch
//! all-or-nothing acquisition, and full dispatch flows over a scripted
//! runtime.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use quorum_core::{
    DispatchInput, Dispatcher, DocumentStore, FallbackPolicy, Invocation, KernelConfig,
    LockManager, NormalizationStrategy, Result, RunStatus, RuntimeMode, RuntimeOutcome,
    RuntimeRegistry, WorkerModel, WorkerRegistration, WorkerRegistry, WorkerRole, WorkerRuntime,
    WorkerSpec, WorkerStatus, WorkspaceJail,
};
use tempfile::TempDir;

// ───────────────────────────────────────────────────────────────────────────
// Scripted runtime
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ScriptedRuntime {
    mode: RuntimeMode,
    exit_code: i32,
}

#[async_trait]
impl WorkerRuntime for ScriptedRuntime {
    fn mode(&self) -> RuntimeMode {
        self.mode
    }

    fn is_available(&self, _model: WorkerModel) -> bool {
        true
    }

    fn create_invocation(
        &self,
        worker: &WorkerRegistration,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Invocation> {
        Ok(Invocation {
            command: format!("scripted-{}", self.mode),
            args: Vec::new(),
            cwd: PathBuf::from(&worker.cwd),
            timeout,
            prompt: prompt.to_string(),
            model: format!("{}-scripted", worker.model),
        })
    }

    async fn run(&self, invocation: &Invocation) -> Result<RuntimeOutcome> {
        Ok(RuntimeOutcome {
            exit_code: Some(self.exit_code),
            stdout: format!("<draft from {}>", invocation.model),
            stderr: String::new(),
            duration_ms: 1,
            timed_out: false,
        })
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<DocumentStore>,
    locks: LockManager,
    registry: WorkerRegistry,
}

fn harness() -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(DocumentStore::open(dir.path().join("state.json")));
    let locks = LockManager::new(Arc::clone(&store), NormalizationStrategy::None);
    let jail = Arc::new(WorkspaceJail::new(dir.path()));
    let registry = WorkerRegistry::new(Arc::clone(&store), jail);
    Harness {
        _dir: dir,
        store,
        locks,
        registry,
    }
}

fn dispatcher(h: &Harness, exit_code: i32) -> Dispatcher {
    Dispatcher::new(
        Arc::clone(&h.store),
        RuntimeRegistry::new(vec![Arc::new(ScriptedRuntime {
            mode: RuntimeMode::Cli,
            exit_code,
        })]),
        KernelConfig::new("unused"),
    )
}

fn res(paths: &[&str]) -> Vec<String> {
    paths.iter().map(|p| (*p).to_string()).collect()
}

// ───────────────────────────────────────────────────────────────────────────
// Lock scenarios
// ───────────────────────────────────────────────────────────────────────────

/// GIVEN owner1 holds f.txt
/// WHEN owner2 tries to acquire, owner1 releases, and owner2 retries
/// THEN the second attempt rejects with LOCKED and the retry succeeds with
///      exactly one lock owned by owner2.
#[tokio::test]
async fn lock_handoff_between_owners() -> Result<()> {
    let h = harness();

    h.locks
        .acquire(&res(&["f.txt"]), "owner1", 1_000, None)
        .await?;

    let err = h
        .locks
        .acquire(&res(&["f.txt"]), "owner2", 1_000, None)
        .await
        .expect_err("contended acquire must reject");
    assert_eq!(err.code(), "LOCKED");

    h.locks.release(&res(&["f.txt"]), "owner1").await?;

    let granted = h
        .locks
        .acquire(&res(&["f.txt"]), "owner2", 1_000, None)
        .await?;
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].owner_id, "owner2");

    let active = h.locks.list().await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].owner_id, "owner2");
    Ok(())
}

/// GIVEN A free and B held by another owner
/// WHEN acquiring [A, B] as a batch
/// THEN the call fails and A is still unlocked afterward.
#[tokio::test]
async fn batch_acquire_leaves_no_partial_ownership() -> Result<()> {
    let h = harness();

    h.locks
        .acquire(&res(&["/shared/b.txt"]), "other", 60_000, None)
        .await?;

    let err = h
        .locks
        .acquire(
            &res(&["/shared/a.txt", "/shared/b.txt"]),
            "me",
            60_000,
            None,
        )
        .await
        .expect_err("batch must be all-or-nothing");
    assert_eq!(err.code(), "LOCKED");

    let active = h.locks.list().await?;
    assert!(
        !active.iter().any(|l| l.resource.ends_with("a.txt")),
        "the free member of a failed batch stays unlocked"
    );
    Ok(())
}

/// GIVEN the same owner re-acquiring a held resource
/// WHEN the TTL is extended
/// THEN the acquire succeeds (never LOCKED) and expiry moves forward.
#[tokio::test]
async fn reentrant_acquire_extends_expiry() -> Result<()> {
    let h = harness();

    let first = h
        .locks
        .acquire(&res(&["f.txt"]), "owner1", 1_000, None)
        .await?;
    let second = h
        .locks
        .acquire(&res(&["f.txt"]), "owner1", 600_000, None)
        .await?;

    assert!(second[0].expires_at > first[0].expires_at);
    assert_eq!(h.locks.list().await?.len(), 1);
    Ok(())
}

/// GIVEN a lock created already expired (ttl <= 0)
/// WHEN a different owner acquires the same resource
/// THEN the acquire succeeds.
#[tokio::test]
async fn expired_lock_never_blocks() -> Result<()> {
    let h = harness();

    h.locks
        .acquire(&res(&["f.txt"]), "owner1", 0, None)
        .await?;
    let granted = h
        .locks
        .acquire(&res(&["f.txt"]), "owner2", 1_000, None)
        .await?;
    assert_eq!(granted[0].owner_id, "owner2");
    Ok(())
}

// ───────────────────────────────────────────────────────────────────────────
// Dispatch scenarios
// ───────────────────────────────────────────────────────────────────────────

async fn register_write_review_pair(h: &Harness) -> Result<()> {
    h.registry
        .create_worker(WorkerSpec {
            name: "codex-writer".to_string(),
            model: WorkerModel::Codex,
            role: WorkerRole::Writer,
            runtime_mode: RuntimeMode::Cli,
            cwd: PathBuf::from("work"),
        })
        .await?;
    h.registry
        .create_worker(WorkerSpec {
            name: "gemini-reviewer".to_string(),
            model: WorkerModel::Gemini,
            role: WorkerRole::Reviewer,
            runtime_mode: RuntimeMode::Cli,
            cwd: PathBuf::from("work"),
        })
        .await?;
    Ok(())
}

/// GIVEN one codex writer and one gemini reviewer
/// WHEN dispatching codex_writes_gemini_reviews
/// THEN the run has exactly two steps, the first with the writer role, and
///      the reviewer's prompt contains the writer's stdout verbatim.
#[tokio::test]
async fn codex_writes_gemini_reviews_scenario() -> Result<()> {
    let h = harness();
    register_write_review_pair(&h).await?;
    let d = dispatcher(&h, 0);

    let run = d
        .dispatch_task(DispatchInput::new(
            "codex_writes_gemini_reviews",
            "write the migration script",
        ))
        .await?;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.steps.len(), 2);
    assert_eq!(run.steps[0].role, WorkerRole::Writer);
    assert!(run.steps[1].prompt.contains(&run.steps[0].stdout));
    Ok(())
}

/// GIVEN a strategy whose execution fails at the first step
/// WHEN the run finalizes
/// THEN no reserved worker is left busy: the failing worker is failed and
///      the rest are idle.
#[tokio::test]
async fn reservation_invariant_after_execution_failure() -> Result<()> {
    let h = harness();
    register_write_review_pair(&h).await?;
    let d = dispatcher(&h, 1);

    let run = d
        .dispatch_task(DispatchInput::new("codex_writes_gemini_reviews", "p"))
        .await?;
    assert_eq!(run.status, RunStatus::Failed);

    for worker in h.registry.list_workers().await? {
        assert_ne!(
            worker.status,
            WorkerStatus::Busy,
            "worker '{}' must never stay busy after finalization",
            worker.name
        );
    }
    Ok(())
}

/// GIVEN a primary runtime that always exits 1 and a healthy baseline
/// WHEN dispatching with fallback on_error vs never
/// THEN on_error lands on the baseline with fallbackFrom set, and never
///      keeps the original failing runtime with no fallbackFrom.
#[tokio::test]
async fn fallback_policy_matrix() -> Result<()> {
    let h = harness();
    h.registry
        .create_worker(WorkerSpec {
            name: "api-writer".to_string(),
            model: WorkerModel::Codex,
            role: WorkerRole::Writer,
            runtime_mode: RuntimeMode::Api,
            cwd: PathBuf::from("work"),
        })
        .await?;

    let runtimes = || {
        RuntimeRegistry::new(vec![
            Arc::new(ScriptedRuntime {
                mode: RuntimeMode::Api,
                exit_code: 1,
            }) as Arc<dyn WorkerRuntime>,
            Arc::new(ScriptedRuntime {
                mode: RuntimeMode::Cli,
                exit_code: 0,
            }),
        ])
    };

    let d = Dispatcher::new(Arc::clone(&h.store), runtimes(), KernelConfig::new("unused"));
    let run = d
        .dispatch_task(DispatchInput::new("single_worker", "p"))
        .await?;
    assert_eq!(run.steps[0].runtime_mode, RuntimeMode::Cli);
    assert_eq!(run.steps[0].fallback_from, Some(RuntimeMode::Api));
    assert_eq!(run.status, RunStatus::Completed);

    let mut input = DispatchInput::new("single_worker", "p");
    input.fallback_policy = FallbackPolicy::Never;
    let run = d.dispatch_task(input).await?;
    assert_eq!(run.steps[0].runtime_mode, RuntimeMode::Api);
    assert_eq!(run.steps[0].fallback_from, None);
    assert_eq!(run.status, RunStatus::Failed);
    Ok(())
}

/// GIVEN dispatches and lock traffic over one shared store
/// WHEN they interleave
/// THEN revisions advance monotonically and every run is finalized.
#[tokio::test]
async fn mixed_traffic_keeps_document_consistent() -> Result<()> {
    let h = harness();
    register_write_review_pair(&h).await?;
    let d = dispatcher(&h, 0);

    let lock_task = {
        let locks = h.locks.clone();
        tokio::spawn(async move {
            for i in 0..5 {
                let resource = res(&[&format!("/shared/file-{i}.txt")]);
                locks.acquire(&resource, "agent-a", 60_000, None).await?;
                locks.release(&resource, "agent-a").await?;
            }
            Ok::<_, quorum_core::Error>(())
        })
    };

    let run = d
        .dispatch_task(DispatchInput::new("codex_writes_gemini_reviews", "p"))
        .await?;
    lock_task
        .await
        .map_err(|e| quorum_core::Error::internal(e.to_string()))??;

    assert!(run.status.is_terminal());
    let doc = h.store.load().await?;
    assert!(doc.locks.is_empty(), "all lock traffic drained");
    assert_eq!(doc.worker_runs.len(), 1);
    assert_eq!(doc.worker_runs[0].status, run.status);
    Ok(())
}
