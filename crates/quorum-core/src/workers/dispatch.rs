//! Task dispatch across workers.
//!
//! `dispatch_task` runs in three phases. Reservation is one transaction:
//! workers are selected per strategy and flipped busy together with the
//! appended running run record, all-or-nothing. Execution happens outside
//! any transaction because it invokes slow external processes; every
//! failure there folds into the run record instead of propagating.
//! Finalization is one transaction that always runs: steps are recorded,
//! the run is finalized exactly once, and every reserved worker leaves the
//! busy state no matter how execution ended.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use uuid::Uuid;

use crate::{
    config::KernelConfig,
    document::{
        DispatchStrategy, Document, FallbackPolicy, RunStatus, RuntimeMode, WorkerModel,
        WorkerRegistration, WorkerRole, WorkerRun, WorkerRunStep, WorkerStatus,
    },
    store::DocumentStore,
    txn::run_txn,
    workers::runtime::{Invocation, RuntimeOutcome, RuntimeRegistry, WorkerRuntime, BASELINE_MODE},
    Error, Result,
};

/// Fixed adversarial emphasis appended to the red-team reviewer prompt.
const REDTEAM_EMPHASIS: &str = "Review as a hostile security auditor: assume the \
author is careless or malicious, hunt for injection vectors, path traversal, \
privilege escalation, unsafe deserialization, and secret leakage, and do not \
soften any finding.";

/// Caller input for a dispatch.
#[derive(Debug, Clone)]
pub struct DispatchInput {
    /// Strategy name; unknown names fail `VALIDATION_FAILED`.
    pub strategy: String,
    /// The task prompt handed to writers.
    pub prompt: String,
    /// Optional reference into the document's task array.
    pub task_id: Option<String>,
    /// Explicit worker for `single_worker`.
    pub worker_id: Option<String>,
    /// Overrides each worker's own runtime mode for this dispatch.
    pub requested_runtime_mode: Option<RuntimeMode>,
    pub fallback_policy: FallbackPolicy,
    /// Per-step timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl DispatchInput {
    /// Input with defaults: no task reference, no worker pin, the workers'
    /// own runtime modes, and fallback on error.
    #[must_use]
    pub fn new(strategy: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            prompt: prompt.into(),
            task_id: None,
            worker_id: None,
            requested_runtime_mode: None,
            fallback_policy: FallbackPolicy::OnError,
            timeout_ms: None,
        }
    }
}

/// Resolved participants for one dispatch.
#[derive(Debug, Clone)]
enum StrategyPlan {
    Single(WorkerRegistration),
    WriteReview {
        writer: WorkerRegistration,
        reviewer: WorkerRegistration,
        adversarial: bool,
    },
    DualWriteReview {
        writer_a: WorkerRegistration,
        writer_b: WorkerRegistration,
        reviewer: WorkerRegistration,
    },
}

impl StrategyPlan {
    fn workers(&self) -> Vec<&WorkerRegistration> {
        match self {
            Self::Single(worker) => vec![worker],
            Self::WriteReview {
                writer, reviewer, ..
            } => vec![writer, reviewer],
            Self::DualWriteReview {
                writer_a,
                writer_b,
                reviewer,
            } => vec![writer_a, writer_b, reviewer],
        }
    }
}

/// The worker orchestration engine.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<DocumentStore>,
    runtimes: RuntimeRegistry,
    config: KernelConfig,
}

impl Dispatcher {
    /// Create a dispatcher over the given store and runtime mapping.
    #[must_use]
    pub fn new(store: Arc<DocumentStore>, runtimes: RuntimeRegistry, config: KernelConfig) -> Self {
        Self {
            store,
            runtimes,
            config,
        }
    }

    /// Dispatch a task. Returns the finalized run record.
    pub async fn dispatch_task(&self, input: DispatchInput) -> Result<WorkerRun> {
        let strategy = DispatchStrategy::parse(&input.strategy)?;
        if input.prompt.trim().is_empty() {
            return Err(Error::validation("dispatch prompt must not be empty"));
        }

        let timeout = input
            .timeout_ms
            .map_or(self.config.step_timeout, Duration::from_millis);

        // Phase 1: reservation. All-or-nothing; nothing is reserved when
        // any selected worker is stopped or busy.
        let (run, plan) = self.reserve(&input, strategy).await?;
        tracing::info!(
            run = %run.id,
            strategy = %strategy,
            workers = plan.workers().len(),
            "reserved workers for dispatch"
        );

        // Phase 2: execution, outside any transaction. Failures fold into
        // step records; nothing propagates past this point.
        let steps = self
            .execute(&plan, &input.prompt, input.requested_runtime_mode, input.fallback_policy, timeout)
            .await;

        // Phase 3: finalization, always reached.
        let finalized = self.finalize(&run.id, &plan, steps).await?;
        tracing::info!(
            run = %finalized.id,
            status = %finalized.status,
            steps = finalized.steps.len(),
            "dispatch finalized"
        );
        Ok(finalized)
    }

    /// All runs, newest last.
    pub async fn list_runs(&self) -> Result<Vec<WorkerRun>> {
        Ok(self.store.load().await?.worker_runs)
    }

    /// Look up a run by id.
    pub async fn get_run(&self, id: &str) -> Result<WorkerRun> {
        self.store
            .load()
            .await?
            .worker_runs
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::validation(format!("unknown run '{id}'")))
    }

    async fn reserve(
        &self,
        input: &DispatchInput,
        strategy: DispatchStrategy,
    ) -> Result<(WorkerRun, StrategyPlan)> {
        let task_id = input.task_id.clone();
        let worker_id = input.worker_id.clone();
        let requested_mode = input.requested_runtime_mode;
        let policy = input.fallback_policy;

        run_txn(&self.store, move |doc| {
            if doc.panic_mode {
                return Err(Error::PanicMode);
            }
            if let Some(task_id) = &task_id {
                if !doc.tasks.iter().any(|t| t.id == *task_id) {
                    return Err(Error::validation(format!("unknown task '{task_id}'")));
                }
            }

            let plan = select_plan(doc, strategy, worker_id.as_deref())?;
            let now = Utc::now();

            let mut next = doc.clone();
            for selected in plan.workers() {
                if let Some(target) = next.workers.iter_mut().find(|w| w.id == selected.id) {
                    target.status = WorkerStatus::Busy;
                    target.updated_at = now;
                }
            }

            let run = WorkerRun {
                id: Uuid::new_v4().to_string(),
                task_id: task_id.clone(),
                strategy,
                requested_runtime_mode: requested_mode,
                fallback_policy: policy,
                status: RunStatus::Running,
                started_at: now,
                completed_at: None,
                summary: None,
                steps: Vec::new(),
                error: None,
            };
            next.worker_runs.push(run.clone());

            Ok((next, (run, plan)))
        })
        .await
    }

    /// Run the strategy's step sequence. Infallible by construction: every
    /// runtime- and invocation-level failure folds into a step record, and
    /// a failed step halts the remaining sequence.
    async fn execute(
        &self,
        plan: &StrategyPlan,
        prompt: &str,
        mode_override: Option<RuntimeMode>,
        policy: FallbackPolicy,
        timeout: Duration,
    ) -> Vec<WorkerRunStep> {
        match plan {
            StrategyPlan::Single(worker) => {
                vec![
                    self.run_step(worker, worker.role, prompt, mode_override, policy, timeout)
                        .await,
                ]
            }
            StrategyPlan::WriteReview {
                writer,
                reviewer,
                adversarial,
            } => {
                let written = self
                    .run_step(writer, WorkerRole::Writer, prompt, mode_override, policy, timeout)
                    .await;
                if !written.succeeded() {
                    return vec![written];
                }

                let review = if *adversarial {
                    redteam_prompt(prompt, &written.stdout)
                } else {
                    review_prompt(prompt, &written.stdout)
                };
                let reviewed = self
                    .run_step(reviewer, WorkerRole::Reviewer, &review, mode_override, policy, timeout)
                    .await;
                vec![written, reviewed]
            }
            StrategyPlan::DualWriteReview {
                writer_a,
                writer_b,
                reviewer,
            } => {
                let (first, second) = tokio::join!(
                    self.run_step(writer_a, WorkerRole::Writer, prompt, mode_override, policy, timeout),
                    self.run_step(writer_b, WorkerRole::Writer, prompt, mode_override, policy, timeout),
                );
                if !first.succeeded() || !second.succeeded() {
                    return vec![first, second];
                }

                let review = dual_review_prompt(
                    prompt,
                    &writer_a.name,
                    &first.stdout,
                    &writer_b.name,
                    &second.stdout,
                );
                let reviewed = self
                    .run_step(reviewer, WorkerRole::Reviewer, &review, mode_override, policy, timeout)
                    .await;
                vec![first, second, reviewed]
            }
        }
    }

    /// Execute one worker invocation with runtime selection and fallback.
    async fn run_step(
        &self,
        worker: &WorkerRegistration,
        role: WorkerRole,
        prompt: &str,
        mode_override: Option<RuntimeMode>,
        policy: FallbackPolicy,
        timeout: Duration,
    ) -> WorkerRunStep {
        let requested = mode_override.unwrap_or(worker.runtime_mode);

        // An unavailable requested runtime degrades to the baseline up
        // front; fallback-on-error only applies to a runtime that ran.
        let (runtime, fallback_from) = match self.runtimes.get(requested) {
            Some(rt) if rt.is_available(worker.model) => (rt, None),
            _ if requested != BASELINE_MODE => match self.runtimes.baseline() {
                Ok(baseline) => {
                    tracing::warn!(
                        worker = %worker.name,
                        requested = %requested,
                        "requested runtime unavailable, using baseline"
                    );
                    (baseline, Some(requested))
                }
                Err(_) => {
                    return synthetic_step(worker, role, prompt, requested, None, "no runtime available");
                }
            },
            _ => {
                return synthetic_step(worker, role, prompt, requested, None, "baseline runtime unavailable");
            }
        };

        let (invocation, outcome) = self.invoke(runtime.as_ref(), worker, prompt, timeout).await;
        let mut step = build_step(worker, role, prompt, runtime.mode(), fallback_from, invocation.as_ref(), &outcome);

        if !outcome.succeeded()
            && policy == FallbackPolicy::OnError
            && runtime.mode() != BASELINE_MODE
        {
            if let Ok(baseline) = self.runtimes.baseline() {
                if baseline.is_available(worker.model) {
                    tracing::warn!(
                        worker = %worker.name,
                        requested = %requested,
                        "step failed, re-invoking on baseline runtime"
                    );
                    let (inv, outcome) = self.invoke(baseline.as_ref(), worker, prompt, timeout).await;
                    step = build_step(worker, role, prompt, BASELINE_MODE, Some(requested), inv.as_ref(), &outcome);
                }
            }
        }

        step
    }

    async fn invoke(
        &self,
        runtime: &dyn WorkerRuntime,
        worker: &WorkerRegistration,
        prompt: &str,
        timeout: Duration,
    ) -> (Option<Invocation>, RuntimeOutcome) {
        match runtime.create_invocation(worker, prompt, timeout) {
            Ok(invocation) => match runtime.run(&invocation).await {
                Ok(outcome) => (Some(invocation), outcome),
                Err(e) => {
                    let outcome = RuntimeOutcome::failure(e.to_string(), 0);
                    (Some(invocation), outcome)
                }
            },
            Err(e) => (None, RuntimeOutcome::failure(e.to_string(), 0)),
        }
    }

    async fn finalize(
        &self,
        run_id: &str,
        plan: &StrategyPlan,
        steps: Vec<WorkerRunStep>,
    ) -> Result<WorkerRun> {
        let run_id = run_id.to_string();
        let reserved_ids: Vec<String> = plan.workers().iter().map(|w| w.id.clone()).collect();

        let error = steps
            .iter()
            .find(|s| !s.succeeded())
            .map(|s| format!("step for worker '{}' did not succeed", s.worker_id));
        let failed = error.is_some();
        let summary = if failed {
            None
        } else {
            steps.last().map(|s| s.stdout.clone())
        };
        let failed_workers: Vec<String> = steps
            .iter()
            .filter(|s| !s.succeeded())
            .map(|s| s.worker_id.clone())
            .collect();

        run_txn(&self.store, move |doc| {
            let now = Utc::now();
            let mut next = doc.clone();

            let run = next
                .worker_runs
                .iter_mut()
                .find(|r| r.id == run_id)
                .ok_or_else(|| {
                    Error::internal(format!("run '{run_id}' vanished before finalization"))
                })?;
            if run.status.is_terminal() {
                return Err(Error::internal(format!(
                    "run '{run_id}' was already finalized"
                )));
            }
            run.steps = steps.clone();
            run.status = if failed {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            };
            run.completed_at = Some(now);
            run.summary = summary.clone();
            run.error = error.clone();
            let run = run.clone();

            for worker_id in &reserved_ids {
                if let Some(worker) = next.workers.iter_mut().find(|w| w.id == *worker_id) {
                    // A worker stopped mid-run keeps its stopped status.
                    if worker.status == WorkerStatus::Busy {
                        worker.status = if failed_workers.contains(worker_id) {
                            WorkerStatus::Failed
                        } else {
                            WorkerStatus::Idle
                        };
                    }
                    worker.last_run_at = Some(now);
                    worker.updated_at = now;
                }
            }

            Ok((next, run))
        })
        .await
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Worker selection
// ───────────────────────────────────────────────────────────────────────────

fn select_plan(
    doc: &Document,
    strategy: DispatchStrategy,
    explicit_worker: Option<&str>,
) -> Result<StrategyPlan> {
    match strategy {
        DispatchStrategy::SingleWorker => {
            let worker = match explicit_worker {
                Some(id) => {
                    let worker = doc
                        .worker(id)
                        .ok_or_else(|| Error::validation(format!("unknown worker '{id}'")))?;
                    ensure_dispatchable(worker)?;
                    worker
                }
                None => pick(doc, None, None, "idle", &[])?,
            };
            Ok(StrategyPlan::Single(worker.clone()))
        }
        DispatchStrategy::CodexWritesGeminiReviews => Ok(StrategyPlan::WriteReview {
            writer: pick(doc, Some(WorkerModel::Codex), Some(WorkerRole::Writer), "codex writer", &[])?.clone(),
            reviewer: pick(doc, Some(WorkerModel::Gemini), Some(WorkerRole::Reviewer), "gemini reviewer", &[])?.clone(),
            adversarial: false,
        }),
        DispatchStrategy::GeminiWritesCodexReviews => Ok(StrategyPlan::WriteReview {
            writer: pick(doc, Some(WorkerModel::Gemini), Some(WorkerRole::Writer), "gemini writer", &[])?.clone(),
            reviewer: pick(doc, Some(WorkerModel::Codex), Some(WorkerRole::Reviewer), "codex reviewer", &[])?.clone(),
            adversarial: false,
        }),
        DispatchStrategy::ParallelDualWriteReview => {
            let writer_a =
                pick(doc, Some(WorkerModel::Codex), Some(WorkerRole::Writer), "codex writer", &[])?.clone();
            let writer_b =
                pick(doc, Some(WorkerModel::Gemini), Some(WorkerRole::Writer), "gemini writer", &[])?.clone();
            let exclude = [writer_a.id.as_str(), writer_b.id.as_str()];
            let reviewer = pick(doc, None, Some(WorkerRole::Reviewer), "reviewer", &exclude)?.clone();
            Ok(StrategyPlan::DualWriteReview {
                writer_a,
                writer_b,
                reviewer,
            })
        }
        DispatchStrategy::SecurityRedteamPass => {
            let writer = pick(doc, None, Some(WorkerRole::Writer), "writer", &[])?.clone();
            let exclude = [writer.id.as_str()];
            let reviewer = pick(doc, None, Some(WorkerRole::Reviewer), "reviewer", &exclude)?.clone();
            Ok(StrategyPlan::WriteReview {
                writer,
                reviewer,
                adversarial: true,
            })
        }
    }
}

/// Select a worker by model/role. Idle workers win in registration order,
/// then previously failed ones (re-dispatchable); a busy-only pool is a
/// `LOCKED` conflict and a stopped-or-empty pool is `VALIDATION_FAILED`.
fn pick<'a>(
    doc: &'a Document,
    model: Option<WorkerModel>,
    role: Option<WorkerRole>,
    label: &str,
    exclude: &[&str],
) -> Result<&'a WorkerRegistration> {
    let mut failed = None;
    let mut busy = None;

    for worker in &doc.workers {
        if model.is_some_and(|m| worker.model != m)
            || role.is_some_and(|r| worker.role != r)
            || exclude.contains(&worker.id.as_str())
        {
            continue;
        }
        match worker.status {
            WorkerStatus::Idle => return Ok(worker),
            WorkerStatus::Failed => failed = failed.or(Some(worker)),
            WorkerStatus::Busy => busy = busy.or(Some(worker)),
            WorkerStatus::Stopped => {}
        }
    }

    if let Some(worker) = failed {
        return Ok(worker);
    }
    if let Some(worker) = busy {
        return Err(worker_locked(worker));
    }
    Err(Error::validation(format!(
        "no dispatchable {label} worker registered"
    )))
}

fn ensure_dispatchable(worker: &WorkerRegistration) -> Result<()> {
    match worker.status {
        WorkerStatus::Idle | WorkerStatus::Failed => Ok(()),
        WorkerStatus::Stopped => Err(Error::validation(format!(
            "worker '{}' is stopped",
            worker.name
        ))),
        WorkerStatus::Busy => Err(worker_locked(worker)),
    }
}

fn worker_locked(worker: &WorkerRegistration) -> Error {
    Error::Locked {
        resource: format!("worker:{}", worker.name),
        holder: worker.id.clone(),
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Prompt assembly
// ───────────────────────────────────────────────────────────────────────────

fn review_prompt(task: &str, writer_output: &str) -> String {
    format!(
        "You are reviewing another agent's completed work.\n\n\
         Original task:\n{task}\n\n\
         Submitted output:\n{writer_output}\n\n\
         Assess correctness and completeness, list concrete defects, and \
         finish with a verdict line: APPROVE or REVISE."
    )
}

fn dual_review_prompt(
    task: &str,
    name_a: &str,
    output_a: &str,
    name_b: &str,
    output_b: &str,
) -> String {
    format!(
        "Two agents completed the same task independently.\n\n\
         Original task:\n{task}\n\n\
         Output from {name_a}:\n{output_a}\n\n\
         Output from {name_b}:\n{output_b}\n\n\
         Compare both solutions, pick the stronger one, and list any defects \
         in each. Finish with a verdict line naming the winner."
    )
}

fn redteam_prompt(task: &str, writer_output: &str) -> String {
    format!("{}\n\n{REDTEAM_EMPHASIS}", review_prompt(task, writer_output))
}

// ───────────────────────────────────────────────────────────────────────────
// Step construction
// ───────────────────────────────────────────────────────────────────────────

fn build_step(
    worker: &WorkerRegistration,
    role: WorkerRole,
    prompt: &str,
    mode: RuntimeMode,
    fallback_from: Option<RuntimeMode>,
    invocation: Option<&Invocation>,
    outcome: &RuntimeOutcome,
) -> WorkerRunStep {
    WorkerRunStep {
        worker_id: worker.id.clone(),
        role,
        prompt: prompt.to_string(),
        command: invocation.map(|i| i.command.clone()).unwrap_or_default(),
        args: invocation.map(|i| i.args.clone()).unwrap_or_default(),
        exit_code: outcome.exit_code,
        duration_ms: outcome.duration_ms,
        timed_out: outcome.timed_out,
        stdout: outcome.stdout.clone(),
        stderr: outcome.stderr.clone(),
        runtime_mode: mode,
        runtime_model: invocation
            .map_or_else(|| worker.model.to_string(), |i| i.model.clone()),
        fallback_from,
    }
}

fn synthetic_step(
    worker: &WorkerRegistration,
    role: WorkerRole,
    prompt: &str,
    mode: RuntimeMode,
    fallback_from: Option<RuntimeMode>,
    reason: &str,
) -> WorkerRunStep {
    build_step(
        worker,
        role,
        prompt,
        mode,
        fallback_from,
        None,
        &RuntimeOutcome::failure(reason.to_string(), 0),
    )
}
