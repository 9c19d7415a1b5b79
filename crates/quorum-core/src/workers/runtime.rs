//! Worker execution runtimes.
//!
//! A runtime turns a worker plus a prompt into an [`Invocation`] descriptor
//! and executes it, returning one uniform [`RuntimeOutcome`] shape so
//! callers never branch on the backend kind. Two backends ship:
//!
//! - [`ProcessRuntime`]: headless CLI invocation (the baseline that
//!   fallback degrades to). No shell interpretation of arguments; the
//!   prompt travels on stdin; a timeout fires SIGTERM and escalates to
//!   SIGKILL after a grace window; captured output is bounded.
//! - [`ApiRuntime`]: remote model API call over HTTP.
//!
//! Binary paths, static arguments, and model names resolve from environment
//! variables with built-in defaults.

use std::{collections::HashMap, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    config::KernelConfig,
    document::{RuntimeMode, WorkerModel, WorkerRegistration},
    Error, Result,
};

/// The runtime mode fallback degrades to.
pub const BASELINE_MODE: RuntimeMode = RuntimeMode::Cli;

/// Marker appended to a captured stream that overflowed its cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// A fully resolved worker invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Binary path for CLI runtimes, endpoint URL for API runtimes.
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub prompt: String,
    /// Resolved model name recorded on the run step.
    pub model: String,
}

/// Uniform result of executing an invocation, regardless of runtime kind.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOutcome {
    /// `None` when the process was killed or never reached execution.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl RuntimeOutcome {
    /// Zero exit without a timeout.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub(crate) fn failure(stderr: String, duration_ms: u64) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr,
            duration_ms,
            timed_out: false,
        }
    }
}

/// An execution backend for worker invocations.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// The mode this runtime implements.
    fn mode(&self) -> RuntimeMode;

    /// Whether this runtime can currently serve the given model.
    fn is_available(&self, model: WorkerModel) -> bool;

    /// Build the invocation descriptor for a worker and prompt.
    fn create_invocation(
        &self,
        worker: &WorkerRegistration,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Invocation>;

    /// Execute the invocation. Execution-level failures (spawn errors,
    /// transport errors) fold into the outcome rather than erroring, so a
    /// failing backend still yields the uniform shape for fallback logic.
    async fn run(&self, invocation: &Invocation) -> Result<RuntimeOutcome>;
}

// ───────────────────────────────────────────────────────────────────────────
// Environment resolution
// ───────────────────────────────────────────────────────────────────────────

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Binary to invoke for a model, honoring `QUORUM_<MODEL>_BIN`.
#[must_use]
pub fn resolve_binary(model: WorkerModel) -> String {
    match model {
        WorkerModel::Codex => {
            env_override("QUORUM_CODEX_BIN").unwrap_or_else(|| "codex".to_string())
        }
        WorkerModel::Gemini => {
            env_override("QUORUM_GEMINI_BIN").unwrap_or_else(|| "gemini".to_string())
        }
    }
}

/// Static arguments for a model's CLI, honoring `QUORUM_<MODEL>_ARGS` as a
/// JSON array of strings.
pub fn resolve_static_args(model: WorkerModel) -> Result<Vec<String>> {
    let var = match model {
        WorkerModel::Codex => "QUORUM_CODEX_ARGS",
        WorkerModel::Gemini => "QUORUM_GEMINI_ARGS",
    };
    match env_override(var) {
        Some(json) => serde_json::from_str::<Vec<String>>(&json).map_err(|e| {
            Error::validation(format!("{var} must be a JSON array of strings: {e}"))
        }),
        None => Ok(match model {
            WorkerModel::Codex => vec!["exec".to_string()],
            WorkerModel::Gemini => Vec::new(),
        }),
    }
}

/// Model name to pass through, honoring `QUORUM_<MODEL>_MODEL`.
#[must_use]
pub fn resolve_model_name(model: WorkerModel) -> String {
    match model {
        WorkerModel::Codex => {
            env_override("QUORUM_CODEX_MODEL").unwrap_or_else(|| "gpt-5-codex".to_string())
        }
        WorkerModel::Gemini => {
            env_override("QUORUM_GEMINI_MODEL").unwrap_or_else(|| "gemini-2.5-pro".to_string())
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Process runtime (baseline)
// ───────────────────────────────────────────────────────────────────────────

/// Headless CLI process runtime.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    sigkill_grace: Duration,
    output_cap: usize,
}

impl ProcessRuntime {
    /// Create a process runtime with the given kill-escalation grace window
    /// and per-stream output cap.
    #[must_use]
    pub const fn new(sigkill_grace: Duration, output_cap: usize) -> Self {
        Self {
            sigkill_grace,
            output_cap,
        }
    }

    /// Create a process runtime from kernel configuration.
    #[must_use]
    pub const fn from_config(config: &KernelConfig) -> Self {
        Self::new(config.sigkill_grace, config.output_cap)
    }

    /// SIGTERM, wait out the grace window, then SIGKILL.
    async fn terminate(&self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        {
            use nix::{sys::signal, unistd::Pid};

            if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
                let _ = signal::kill(Pid::from_raw(pid), signal::Signal::SIGTERM);
                if tokio::time::timeout(self.sigkill_grace, child.wait())
                    .await
                    .is_ok()
                {
                    return;
                }
            }
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[async_trait]
impl WorkerRuntime for ProcessRuntime {
    fn mode(&self) -> RuntimeMode {
        RuntimeMode::Cli
    }

    fn is_available(&self, model: WorkerModel) -> bool {
        which::which(resolve_binary(model)).is_ok()
    }

    fn create_invocation(
        &self,
        worker: &WorkerRegistration,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Invocation> {
        let model_name = resolve_model_name(worker.model);
        let mut args = resolve_static_args(worker.model)?;
        args.push("--model".to_string());
        args.push(model_name.clone());

        Ok(Invocation {
            command: resolve_binary(worker.model),
            args,
            cwd: PathBuf::from(&worker.cwd),
            timeout,
            prompt: prompt.to_string(),
            model: model_name,
        })
    }

    async fn run(&self, invocation: &Invocation) -> Result<RuntimeOutcome> {
        let start = std::time::Instant::now();

        let mut command = tokio::process::Command::new(&invocation.command);
        command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(RuntimeOutcome::failure(
                    format!("failed to spawn '{}': {e}", invocation.command),
                    elapsed_ms(start),
                ));
            }
        };

        // Feed the prompt on stdin from a separate task; writing inline
        // could deadlock against a child that fills its output pipe first.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = invocation.prompt.clone();
            // Detached on purpose: the writer task ends when the pipe closes.
            let _ = tokio::spawn(async move {
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let cap = self.output_cap;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout_pipe, cap));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe, cap));

        let mut timed_out = false;
        let exit_code = match tokio::time::timeout(invocation.timeout, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                return Err(Error::internal(format!(
                    "failed waiting for '{}': {e}",
                    invocation.command
                )));
            }
            Err(_) => {
                timed_out = true;
                tracing::warn!(
                    command = %invocation.command,
                    timeout = ?invocation.timeout,
                    "worker process timed out, escalating"
                );
                self.terminate(&mut child).await;
                None
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(RuntimeOutcome {
            exit_code,
            stdout,
            stderr,
            duration_ms: elapsed_ms(start),
            timed_out,
        })
    }
}

fn elapsed_ms(start: std::time::Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Drain a child stream into a bounded buffer. Bytes past the cap are read
/// and discarded so the child never blocks on a full pipe; the capture gets
/// a truncation marker instead.
async fn read_capped<R>(pipe: Option<R>, cap: usize) -> String
where
    R: AsyncReadExt + Unpin + Send,
{
    let Some(mut pipe) = pipe else {
        return String::new();
    };

    let mut captured = Vec::with_capacity(8_192.min(cap));
    let mut chunk = [0u8; 8_192];
    let mut truncated = false;

    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(captured.len());
                let take = n.min(room);
                captured.extend_from_slice(&chunk[..take]);
                if take < n {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut out = String::from_utf8_lossy(&captured).into_owned();
    if truncated {
        out.push_str(TRUNCATION_MARKER);
    }
    out
}

// ───────────────────────────────────────────────────────────────────────────
// Remote API runtime
// ───────────────────────────────────────────────────────────────────────────

/// Remote model API runtime. Available only when `QUORUM_API_ENDPOINT` is
/// configured; authenticates with `QUORUM_API_KEY` when present.
#[derive(Debug, Clone)]
pub struct ApiRuntime {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl ApiRuntime {
    /// Resolve endpoint and credentials from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: env_override("QUORUM_API_ENDPOINT"),
            api_key: env_override("QUORUM_API_KEY"),
        }
    }

    /// Construct with an explicit endpoint (used by tests and embedders).
    #[must_use]
    pub fn with_endpoint(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: Some(endpoint.into()),
            api_key,
        }
    }
}

#[async_trait]
impl WorkerRuntime for ApiRuntime {
    fn mode(&self) -> RuntimeMode {
        RuntimeMode::Api
    }

    fn is_available(&self, _model: WorkerModel) -> bool {
        self.endpoint.is_some()
    }

    fn create_invocation(
        &self,
        worker: &WorkerRegistration,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Invocation> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| Error::validation("remote API endpoint is not configured"))?;

        Ok(Invocation {
            command: endpoint,
            args: Vec::new(),
            cwd: PathBuf::from(&worker.cwd),
            timeout,
            prompt: prompt.to_string(),
            model: resolve_model_name(worker.model),
        })
    }

    async fn run(&self, invocation: &Invocation) -> Result<RuntimeOutcome> {
        let start = std::time::Instant::now();

        let mut request = self
            .client
            .post(&invocation.command)
            .timeout(invocation.timeout)
            .json(&serde_json::json!({
                "model": invocation.model,
                "input": invocation.prompt,
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status.is_success() {
                    Ok(RuntimeOutcome {
                        exit_code: Some(0),
                        stdout: body,
                        stderr: String::new(),
                        duration_ms: elapsed_ms(start),
                        timed_out: false,
                    })
                } else {
                    Ok(RuntimeOutcome {
                        exit_code: Some(1),
                        stdout: String::new(),
                        stderr: format!("remote API returned {status}: {body}"),
                        duration_ms: elapsed_ms(start),
                        timed_out: false,
                    })
                }
            }
            Err(e) => Ok(RuntimeOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("remote API request failed: {e}"),
                duration_ms: elapsed_ms(start),
                timed_out: e.is_timeout(),
            }),
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Mode-to-implementation mapping
// ───────────────────────────────────────────────────────────────────────────

/// Maps runtime modes to implementations. Fallback is an explicit second
/// call through [`RuntimeRegistry::baseline`], never hidden retry magic
/// inside one implementation.
#[derive(Clone)]
pub struct RuntimeRegistry {
    runtimes: HashMap<RuntimeMode, Arc<dyn WorkerRuntime>>,
}

impl RuntimeRegistry {
    /// Build a registry from explicit implementations. Later entries win on
    /// mode collisions.
    #[must_use]
    pub fn new(runtimes: Vec<Arc<dyn WorkerRuntime>>) -> Self {
        Self {
            runtimes: runtimes.into_iter().map(|r| (r.mode(), r)).collect(),
        }
    }

    /// The stock registry: process baseline plus the env-configured API
    /// runtime.
    #[must_use]
    pub fn with_defaults(config: &KernelConfig) -> Self {
        Self::new(vec![
            Arc::new(ProcessRuntime::from_config(config)),
            Arc::new(ApiRuntime::from_env()),
        ])
    }

    /// Implementation for a mode, if registered.
    #[must_use]
    pub fn get(&self, mode: RuntimeMode) -> Option<Arc<dyn WorkerRuntime>> {
        self.runtimes.get(&mode).cloned()
    }

    /// The baseline implementation fallback degrades to.
    pub fn baseline(&self) -> Result<Arc<dyn WorkerRuntime>> {
        self.get(BASELINE_MODE)
            .ok_or_else(|| Error::internal("baseline runtime is not registered"))
    }
}
