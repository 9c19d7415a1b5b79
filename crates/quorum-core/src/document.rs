//! The persisted project document and its embedded entities.
//!
//! One JSON document on disk holds all shared mutable state: tasks, resource
//! locks, worker registrations, worker runs, and the global panic flag. The
//! document is owned exclusively by the [`crate::store::DocumentStore`];
//! every other component reads and writes it only through transactions.
//!
//! Wire format is camelCase JSON with RFC 3339 timestamps. Unknown top-level
//! members are preserved round-trip so other subsystems can add their own
//! arrays without a schema migration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Current document schema version. Bumped only on breaking layout changes;
/// additive members ride in `extra` instead.
pub const SCHEMA_VERSION: u32 = 1;

/// The one persisted object. `revision` increases by exactly 1 on every
/// successful store update; the store is authoritative over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub schema_version: u32,
    pub revision: u64,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub locks: Vec<ResourceLock>,
    #[serde(default)]
    pub workers: Vec<WorkerRegistration>,
    #[serde(default)]
    pub worker_runs: Vec<WorkerRun>,
    /// Global write freeze. Toggled through the same transactional path as
    /// everything else so the kill switch has the same durability guarantees.
    #[serde(default)]
    pub panic_mode: bool,
    /// Unknown top-level members, preserved for additive schema evolution.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            revision: 1,
            tasks: Vec::new(),
            locks: Vec::new(),
            workers: Vec::new(),
            worker_runs: Vec::new(),
            panic_mode: false,
            extra: serde_json::Map::new(),
        }
    }
}

impl Document {
    /// Validate the document against the schema. The store calls this on
    /// every load of an existing file and on every candidate write, failing
    /// closed before anything reaches disk.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(Error::validation(format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                self.schema_version
            )));
        }
        if self.revision == 0 {
            return Err(Error::validation("revision must be >= 1"));
        }

        let mut lock_ids = std::collections::HashSet::new();
        for lock in &self.locks {
            if lock.id.is_empty() || lock.resource.is_empty() || lock.owner_id.is_empty() {
                return Err(Error::validation("lock with empty id, resource, or owner"));
            }
            if !lock_ids.insert(lock.id.as_str()) {
                return Err(Error::validation(format!("duplicate lock id '{}'", lock.id)));
            }
        }

        let mut worker_ids = std::collections::HashSet::new();
        let mut worker_names = std::collections::HashSet::new();
        for worker in &self.workers {
            if worker.id.is_empty() || worker.name.is_empty() {
                return Err(Error::validation("worker with empty id or name"));
            }
            if !worker_ids.insert(worker.id.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate worker id '{}'",
                    worker.id
                )));
            }
            if !worker_names.insert(worker.name.to_lowercase()) {
                return Err(Error::validation(format!(
                    "duplicate worker name '{}'",
                    worker.name
                )));
            }
        }

        let mut run_ids = std::collections::HashSet::new();
        for run in &self.worker_runs {
            if run.id.is_empty() {
                return Err(Error::validation("worker run with empty id"));
            }
            if !run_ids.insert(run.id.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate worker run id '{}'",
                    run.id
                )));
            }
        }

        Ok(())
    }

    /// Find a worker by id.
    #[must_use]
    pub fn worker(&self, id: &str) -> Option<&WorkerRegistration> {
        self.workers.iter().find(|w| w.id == id)
    }

    /// Find a worker by name, case-insensitively.
    #[must_use]
    pub fn worker_by_name(&self, name: &str) -> Option<&WorkerRegistration> {
        self.workers
            .iter()
            .find(|w| w.name.eq_ignore_ascii_case(name))
    }

    /// All locks still alive at `now`.
    #[must_use]
    pub fn active_locks(&self, now: DateTime<Utc>) -> Vec<&ResourceLock> {
        self.locks.iter().filter(|l| !l.is_expired(now)).collect()
    }
}

/// A task record. Task CRUD beyond what dispatch needs lives in the calling
/// facade; the kernel only resolves `taskId` references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// A logical lock on a named external resource. Has no relationship to
/// OS-level file locking; expiry is lazy (dead records are swept on the next
/// acquire that observes them).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLock {
    pub id: String,
    /// Normalized absolute path of the locked resource.
    pub resource: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ResourceLock {
    /// Create a new lock expiring `ttl_ms` from now. A non-positive TTL
    /// produces an already-expired lock.
    #[must_use]
    pub fn new(resource: String, owner_id: String, ttl_ms: i64, reason: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            resource,
            owner_id,
            created_at: now,
            expires_at: now + Duration::milliseconds(ttl_ms),
            reason,
        }
    }

    /// Whether the lock is logically dead at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Which foundation model a worker fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerModel {
    Codex,
    Gemini,
}

impl WorkerModel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for WorkerModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part a worker plays in a dispatch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Writer,
    Reviewer,
}

impl WorkerRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Writer => "writer",
            Self::Reviewer => "reviewer",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution backend used to realize a worker invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Direct headless CLI process invocation. This is the baseline mode
    /// that fallback degrades to.
    Cli,
    /// Remote model API call.
    Api,
}

impl RuntimeMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Api => "api",
        }
    }
}

impl std::fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Eligible for dispatch.
    Idle,
    /// Reserved by a running dispatch.
    Busy,
    /// Administratively stopped. Terminal for dispatch eligibility; the
    /// record remains for audit.
    Stopped,
    /// Last run's own step did not succeed. Re-dispatchable after review.
    Failed,
}

impl WorkerStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    pub id: String,
    /// Unique across the document, compared case-insensitively.
    pub name: String,
    pub model: WorkerModel,
    pub role: WorkerRole,
    pub runtime_mode: RuntimeMode,
    pub status: WorkerStatus,
    /// Jail-validated working directory for CLI invocations.
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// When to substitute the baseline runtime for a failing requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Re-invoke on the baseline runtime after a non-zero exit or timeout.
    OnError,
    /// Record the failing result as-is.
    Never,
}

/// Named dispatch strategy. Parsed from caller input so that unknown
/// strategy names surface as `VALIDATION_FAILED` rather than a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    SingleWorker,
    CodexWritesGeminiReviews,
    GeminiWritesCodexReviews,
    ParallelDualWriteReview,
    SecurityRedteamPass,
}

impl DispatchStrategy {
    /// Parse a strategy name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "single_worker" => Ok(Self::SingleWorker),
            "codex_writes_gemini_reviews" => Ok(Self::CodexWritesGeminiReviews),
            "gemini_writes_codex_reviews" => Ok(Self::GeminiWritesCodexReviews),
            "parallel_dual_write_review" => Ok(Self::ParallelDualWriteReview),
            "security_redteam_pass" => Ok(Self::SecurityRedteamPass),
            other => Err(Error::validation(format!(
                "unsupported dispatch strategy '{other}'"
            ))),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SingleWorker => "single_worker",
            Self::CodexWritesGeminiReviews => "codex_writes_gemini_reviews",
            Self::GeminiWritesCodexReviews => "gemini_writes_codex_reviews",
            Self::ParallelDualWriteReview => "parallel_dual_write_review",
            Self::SecurityRedteamPass => "security_redteam_pass",
        }
    }
}

impl std::fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the run has been finalized.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatched strategy execution. Created with `Running` status in the
/// reservation transaction and finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRun {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub strategy: DispatchStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_runtime_mode: Option<RuntimeMode>,
    pub fallback_policy: FallbackPolicy,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkerRunStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One worker invocation inside a run. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRunStep {
    pub worker_id: String,
    pub role: WorkerRole,
    pub prompt: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub runtime_mode: RuntimeMode,
    pub runtime_model: String,
    /// Set when this step ran on the baseline runtime in place of the mode
    /// originally requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<RuntimeMode>,
}

impl WorkerRunStep {
    /// A step succeeded when the invocation exited zero without timing out.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}
