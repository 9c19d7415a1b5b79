//! Worker registration lifecycle.

use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use uuid::Uuid;

use crate::{
    document::{RuntimeMode, WorkerModel, WorkerRegistration, WorkerRole, WorkerStatus},
    paths::PathJail,
    store::DocumentStore,
    txn::run_txn,
    Error, Result,
};

/// Caller-supplied description of a worker to register.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Unique name, compared case-insensitively.
    pub name: String,
    pub model: WorkerModel,
    pub role: WorkerRole,
    pub runtime_mode: RuntimeMode,
    /// Working directory for CLI invocations; validated through the jail.
    pub cwd: PathBuf,
}

/// Registration CRUD over the shared document.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<DocumentStore>,
    jail: Arc<dyn PathJail>,
}

impl WorkerRegistry {
    /// Create a registry using the given path jail for cwd validation.
    #[must_use]
    pub fn new(store: Arc<DocumentStore>, jail: Arc<dyn PathJail>) -> Self {
        Self { store, jail }
    }

    /// Register a new worker.
    ///
    /// Rejects duplicate names (case-insensitive) with `VALIDATION_FAILED`
    /// and resolves `cwd` through the jail before anything is persisted.
    pub async fn create_worker(&self, spec: WorkerSpec) -> Result<WorkerRegistration> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(Error::validation("worker name must not be empty"));
        }
        if name.len() > 128 {
            return Err(Error::validation("worker name must be at most 128 characters"));
        }

        let cwd = self.jail.validate(&spec.cwd)?;
        let name = name.to_string();

        let created = run_txn(&self.store, move |doc| {
            if doc.panic_mode {
                return Err(Error::PanicMode);
            }
            if doc.worker_by_name(&name).is_some() {
                return Err(Error::validation(format!(
                    "worker name '{name}' is already registered"
                )));
            }

            let now = Utc::now();
            let worker = WorkerRegistration {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
                model: spec.model,
                role: spec.role,
                runtime_mode: spec.runtime_mode,
                status: WorkerStatus::Idle,
                cwd: cwd.to_string_lossy().into_owned(),
                created_at: now,
                updated_at: now,
                last_run_at: None,
            };

            let mut next = doc.clone();
            next.workers.push(worker.clone());
            Ok((next, worker))
        })
        .await?;

        tracing::info!(
            worker = %created.name,
            model = %created.model,
            role = %created.role,
            "registered worker"
        );
        Ok(created)
    }

    /// All registered workers, including stopped ones.
    pub async fn list_workers(&self) -> Result<Vec<WorkerRegistration>> {
        Ok(self.store.load().await?.workers)
    }

    /// Look up a worker by id.
    pub async fn get_worker(&self, id: &str) -> Result<WorkerRegistration> {
        self.store
            .load()
            .await?
            .worker(id)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown worker '{id}'")))
    }

    /// Stop a worker. Terminal for dispatch eligibility; the record remains
    /// for audit.
    pub async fn stop_worker(&self, id: &str) -> Result<WorkerRegistration> {
        let id = id.to_string();
        let stopped = run_txn(&self.store, move |doc| {
            if doc.panic_mode {
                return Err(Error::PanicMode);
            }

            let mut next = doc.clone();
            let worker = next
                .workers
                .iter_mut()
                .find(|w| w.id == id)
                .ok_or_else(|| Error::validation(format!("unknown worker '{id}'")))?;
            worker.status = WorkerStatus::Stopped;
            worker.updated_at = Utc::now();
            let worker = worker.clone();
            Ok((next, worker))
        })
        .await?;

        tracing::info!(worker = %stopped.name, "stopped worker");
        Ok(stopped)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::paths::WorkspaceJail;

    fn registry(dir: &TempDir) -> WorkerRegistry {
        let store = Arc::new(DocumentStore::open(dir.path().join("state.json")));
        let jail = Arc::new(WorkspaceJail::new(dir.path()));
        WorkerRegistry::new(store, jail)
    }

    fn spec(name: &str) -> WorkerSpec {
        WorkerSpec {
            name: name.to_string(),
            model: WorkerModel::Codex,
            role: WorkerRole::Writer,
            runtime_mode: RuntimeMode::Cli,
            cwd: PathBuf::from("project"),
        }
    }

    #[tokio::test]
    async fn create_and_list_workers() -> Result<()> {
        let dir = TempDir::new()?;
        let registry = registry(&dir);

        let created = registry.create_worker(spec("codex-writer")).await?;
        assert_eq!(created.status, WorkerStatus::Idle);
        assert!(created.cwd.ends_with("project"));

        let workers = registry.list_workers().await?;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "codex-writer");
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_case_insensitively() -> Result<()> {
        let dir = TempDir::new()?;
        let registry = registry(&dir);

        registry.create_worker(spec("Codex-Writer")).await?;
        let err = registry
            .create_worker(spec("codex-writer"))
            .await
            .expect_err("duplicate name must be rejected");
        assert_eq!(err.code(), "VALIDATION_FAILED");
        Ok(())
    }

    #[tokio::test]
    async fn cwd_escaping_the_jail_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let registry = registry(&dir);

        let mut bad = spec("escapee");
        bad.cwd = PathBuf::from("../../outside");
        let err = registry
            .create_worker(bad)
            .await
            .expect_err("jail escape must be rejected");
        assert_eq!(err.code(), "VALIDATION_FAILED");
        Ok(())
    }

    #[tokio::test]
    async fn stop_worker_is_terminal_but_kept_for_audit() -> Result<()> {
        let dir = TempDir::new()?;
        let registry = registry(&dir);

        let created = registry.create_worker(spec("stoppable")).await?;
        let stopped = registry.stop_worker(&created.id).await?;
        assert_eq!(stopped.status, WorkerStatus::Stopped);

        let workers = registry.list_workers().await?;
        assert_eq!(workers.len(), 1, "record retained after stop");
        assert_eq!(workers[0].status, WorkerStatus::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn stop_unknown_worker_is_validation_failed() -> Result<()> {
        let dir = TempDir::new()?;
        let registry = registry(&dir);

        let err = registry
            .stop_worker("missing")
            .await
            .expect_err("unknown worker must be rejected");
        assert_eq!(err.code(), "VALIDATION_FAILED");
        Ok(())
    }
}
