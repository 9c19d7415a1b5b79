//! Resource lock manager for agent coordination.
//!
//! Provides mutual exclusion over named external resources (files the
//! kernel itself never reads or writes). Locks are logical records inside
//! the shared document with TTL expiry; they have no relationship to
//! OS-level file locking. Acquisition over a batch is all-or-nothing: the
//! whole batch is conflict-checked before any lock is granted, so a caller
//! can never end up holding half of what it asked for.
//!
//! Re-entrancy: the current holder re-acquiring a resource always succeeds
//! and replaces its lock (fresh id and expiry) instead of conflicting.

use std::{path::Path, sync::Arc};

use chrono::Utc;

use crate::{
    document::ResourceLock,
    paths::{self, NormalizationStrategy},
    store::DocumentStore,
    txn::run_txn,
    Error, Result,
};

/// Manages resource locks on top of the transactional document store. The
/// manager never touches disk directly; every mutation is a transaction.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<DocumentStore>,
    strategy: NormalizationStrategy,
}

impl LockManager {
    /// Create a manager with an explicit normalization strategy.
    #[must_use]
    pub const fn new(store: Arc<DocumentStore>, strategy: NormalizationStrategy) -> Self {
        Self { store, strategy }
    }

    /// Create a manager reading the strategy from a capability probe file.
    pub fn from_capability_file(store: Arc<DocumentStore>, path: &Path) -> Result<Self> {
        let strategy = paths::load_capability(path)?;
        Ok(Self::new(store, strategy))
    }

    /// Create a manager from kernel configuration: consult the capability
    /// file when one is configured, otherwise compare paths verbatim.
    pub fn from_config(store: Arc<DocumentStore>, config: &crate::config::KernelConfig) -> Result<Self> {
        match &config.capability_path {
            Some(path) => Self::from_capability_file(store, path),
            None => Ok(Self::new(store, NormalizationStrategy::None)),
        }
    }

    /// The strategy this manager folds resource paths with.
    #[must_use]
    pub const fn strategy(&self) -> NormalizationStrategy {
        self.strategy
    }

    /// Acquire locks on every resource in the batch, or none of them.
    ///
    /// Fails with `PANIC_MODE` when the global freeze is on, and with
    /// `LOCKED` (carrying the conflicting holder) when any resource is held
    /// non-expired by a different owner - in which case nothing in the
    /// batch is created or modified. Same-owner holdings are replaced
    /// rather than rejected. Expired locks of any owner are swept out of
    /// the document as a side effect.
    pub async fn acquire(
        &self,
        resources: &[String],
        owner_id: &str,
        ttl_ms: i64,
        reason: Option<String>,
    ) -> Result<Vec<ResourceLock>> {
        let normalized = self.normalize_batch(resources)?;
        let owner = validate_owner(owner_id)?;

        let granted = run_txn(&self.store, move |doc| {
            if doc.panic_mode {
                return Err(Error::PanicMode);
            }

            let now = Utc::now();

            // Conflict-check the entire batch before granting anything.
            for resource in &normalized {
                if let Some(conflict) = doc
                    .locks
                    .iter()
                    .find(|l| l.resource == *resource && !l.is_expired(now) && l.owner_id != owner)
                {
                    return Err(Error::Locked {
                        resource: resource.clone(),
                        holder: conflict.owner_id.clone(),
                    });
                }
            }

            let mut next = doc.clone();
            // Sweep expired locks and the owner's own locks being replaced.
            next.locks.retain(|l| {
                !l.is_expired(now) && !(l.owner_id == owner && normalized.contains(&l.resource))
            });

            let granted: Vec<ResourceLock> = normalized
                .iter()
                .map(|resource| {
                    ResourceLock::new(resource.clone(), owner.clone(), ttl_ms, reason.clone())
                })
                .collect();
            next.locks.extend(granted.iter().cloned());

            Ok((next, granted))
        })
        .await?;

        tracing::info!(
            owner = %owner_id,
            count = granted.len(),
            "acquired resource locks"
        );
        Ok(granted)
    }

    /// Release the owner's locks on the given resources.
    ///
    /// Best-effort cleanup: resources not held by this owner are silently
    /// skipped. Permitted during panic mode.
    pub async fn release(&self, resources: &[String], owner_id: &str) -> Result<()> {
        let normalized = self.normalize_batch(resources)?;
        let owner = validate_owner(owner_id)?;

        let released = run_txn(&self.store, move |doc| {
            let mut next = doc.clone();
            let before = next.locks.len();
            next.locks
                .retain(|l| !(l.owner_id == owner && normalized.contains(&l.resource)));
            let released = before - next.locks.len();
            Ok((next, released))
        })
        .await?;

        tracing::info!(owner = %owner_id, released, "released resource locks");
        Ok(())
    }

    /// Extend the expiry of the owner's locks on the given resources.
    ///
    /// Fails with `VALIDATION_FAILED` when a resource has no active lock
    /// and `LOCKED` when it is held by a different owner.
    pub async fn renew(
        &self,
        resources: &[String],
        owner_id: &str,
        ttl_ms: i64,
    ) -> Result<Vec<ResourceLock>> {
        let normalized = self.normalize_batch(resources)?;
        let owner = validate_owner(owner_id)?;

        run_txn(&self.store, move |doc| {
            if doc.panic_mode {
                return Err(Error::PanicMode);
            }

            let now = Utc::now();
            for resource in &normalized {
                match doc
                    .locks
                    .iter()
                    .find(|l| l.resource == *resource && !l.is_expired(now))
                {
                    None => {
                        return Err(Error::validation(format!(
                            "no active lock on '{resource}'"
                        )));
                    }
                    Some(lock) if lock.owner_id != owner => {
                        return Err(Error::Locked {
                            resource: resource.clone(),
                            holder: lock.owner_id.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }

            let mut next = doc.clone();
            let mut renewed = Vec::with_capacity(normalized.len());
            for lock in &mut next.locks {
                if lock.owner_id == owner && normalized.contains(&lock.resource) {
                    lock.expires_at = now + chrono::Duration::milliseconds(ttl_ms);
                    renewed.push(lock.clone());
                }
            }

            Ok((next, renewed))
        })
        .await
    }

    /// All currently active (non-expired) locks.
    pub async fn list(&self) -> Result<Vec<ResourceLock>> {
        let doc = self.store.load().await?;
        Ok(doc
            .active_locks(Utc::now())
            .into_iter()
            .cloned()
            .collect())
    }

    /// Administrative override: remove locks on the given resources
    /// regardless of owner. Used by panic/recovery flows, so it stays
    /// permitted while the freeze is on.
    pub async fn force_release(&self, resources: &[String]) -> Result<usize> {
        let normalized = self.normalize_batch(resources)?;

        let removed = run_txn(&self.store, move |doc| {
            let mut next = doc.clone();
            let before = next.locks.len();
            next.locks.retain(|l| !normalized.contains(&l.resource));
            let removed = before - next.locks.len();
            Ok((next, removed))
        })
        .await?;

        tracing::warn!(removed, "force-released resource locks");
        Ok(removed)
    }

    /// Normalize a request batch, rejecting empty batches and deduplicating
    /// repeated resources.
    fn normalize_batch(&self, resources: &[String]) -> Result<Vec<String>> {
        if resources.is_empty() {
            return Err(Error::validation("at least one resource is required"));
        }
        let mut normalized = Vec::with_capacity(resources.len());
        for raw in resources {
            let resource = paths::normalize_resource(raw, self.strategy)?;
            if !normalized.contains(&resource) {
                normalized.push(resource);
            }
        }
        Ok(normalized)
    }
}

fn validate_owner(owner_id: &str) -> Result<String> {
    if owner_id.trim().is_empty() {
        return Err(Error::validation("owner id must not be empty"));
    }
    Ok(owner_id.to_string())
}
