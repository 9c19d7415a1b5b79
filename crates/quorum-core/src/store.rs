//! Durable document store with optimistic concurrency control.
//!
//! Owns the one JSON document on disk. Writers race on a revision token:
//! `update` re-reads the file, rejects the write with `STALE_REVISION` when
//! the token moved, and otherwise persists atomically (temp file in the same
//! directory, fsync, rename over the target, best-effort directory fsync).
//! No observer ever sees a partially written document.
//!
//! After every successful write the new revision is broadcast on a watch
//! channel so callers can await progress without polling the filesystem.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    sync::{watch, Mutex},
};
use uuid::Uuid;

use crate::{document::Document, Error, Result};

/// The durable store. Cheap to share behind an `Arc`; all mutation goes
/// through [`DocumentStore::update`].
#[derive(Debug)]
pub struct DocumentStore {
    path: PathBuf,
    /// Serializes the read-check-write critical section. Never held across
    /// caller-visible awaits outside `update`.
    write_gate: Mutex<()>,
    revision_tx: watch::Sender<u64>,
}

impl DocumentStore {
    /// Create a store over the given document path. Performs no I/O; the
    /// file is created on the first successful update.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            path: path.into(),
            write_gate: Mutex::new(()),
            revision_tx,
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current document.
    ///
    /// A missing file yields a fresh default document with `revision = 1`
    /// (create-on-first-touch; there is no separate init step). A present
    /// but unparsable or schema-invalid file fails with `VALIDATION_FAILED`
    /// rather than being silently coerced.
    pub async fn load(&self) -> Result<Document> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Document::default());
            }
            Err(e) => {
                return Err(Error::internal(format!(
                    "failed to read '{}': {e}",
                    self.path.display()
                )));
            }
        };

        let doc: Document = serde_json::from_slice(&bytes).map_err(|e| {
            Error::validation(format!(
                "store corrupted: '{}' is not a valid document: {e}",
                self.path.display()
            ))
        })?;
        doc.validate()?;
        Ok(doc)
    }

    /// Apply `updater` against the current on-disk document if and only if
    /// its revision still equals `expected_revision`.
    ///
    /// The store is authoritative over the revision field: whatever the
    /// updater returns, the persisted document carries
    /// `expected_revision + 1`. The candidate is schema-validated before
    /// anything reaches disk; on any failure the previous document remains
    /// untouched.
    pub async fn update<F>(&self, updater: F, expected_revision: u64) -> Result<Document>
    where
        F: FnOnce(&Document) -> Document,
    {
        let _gate = self.write_gate.lock().await;

        let current = self.load().await?;
        if current.revision != expected_revision {
            return Err(Error::StaleRevision {
                expected: expected_revision,
                actual: current.revision,
            });
        }

        let mut next = updater(&current);
        next.revision = expected_revision + 1;
        next.validate()?;

        self.persist(&next).await?;

        tracing::debug!(revision = next.revision, "document persisted");
        self.revision_tx.send_replace(next.revision);
        Ok(next)
    }

    /// Block until the on-disk revision exceeds `since` or `timeout`
    /// elapses. Returns the newest revision observed either way; a caller
    /// that gets back a value `<= since` interprets it as a timeout, not an
    /// error.
    pub async fn wait_for_revision(&self, since: u64, timeout: Duration) -> Result<u64> {
        // Subscribe before the disk check so an update racing with us is
        // never missed.
        let mut rx = self.revision_tx.subscribe();

        let current = self.load().await?.revision;
        if current > since {
            return Ok(current);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(current);
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {
                    let seen = *rx.borrow_and_update();
                    if seen > since {
                        return Ok(seen);
                    }
                }
                // Sender dropped: no further updates can arrive.
                Ok(Err(_)) => return Ok(current),
                Err(_) => return Ok(current),
            }
        }
    }

    /// Atomic persistence: unique-suffix temp file in the target directory,
    /// fsync, rename over the target, best-effort directory fsync. On any
    /// mid-sequence failure the temp file is removed and the previous
    /// document on disk is untouched.
    async fn persist(&self, doc: &Document) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::internal(format!("invalid store path '{}'", self.path.display()))
            })?;
        let tmp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| Error::internal(format!("failed to serialize document: {e}")))?;

        if let Err(e) = write_and_sync(&tmp_path, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::internal(format!(
                "failed to write '{}': {e}",
                tmp_path.display()
            )));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::internal(format!(
                "failed to replace '{}': {e}",
                self.path.display()
            )));
        }

        // Tolerated failure: some platforms refuse directory handles.
        if let Ok(dir_handle) = tokio::fs::File::open(&dir).await {
            let _ = dir_handle.sync_all().await;
        }

        Ok(())
    }
}

async fn write_and_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}
