//! Retry-on-conflict transaction runner.
//!
//! Wraps "load, compute next state, conditional update" in a bounded retry
//! loop. Only `STALE_REVISION` triggers a retry; every other failure
//! propagates immediately. The transform is re-invoked against the fresh
//! document on each attempt, so it must be pure with respect to the state
//! it is given.

use crate::{document::Document, store::DocumentStore, Error, Result};

/// Default bound on consecutive optimistic conflicts before the mutation is
/// reported as failed instead of looping forever.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Run `transform` as a transaction with the default retry bound.
///
/// `transform` receives the current document and returns the full next
/// state together with the caller-visible result.
pub async fn run_txn<T, F>(store: &DocumentStore, transform: F) -> Result<T>
where
    F: Fn(&Document) -> Result<(Document, T)>,
{
    run_txn_with_retries(store, transform, DEFAULT_MAX_RETRIES).await
}

/// Run `transform` as a transaction, retrying up to `max_retries` times on
/// optimistic conflicts.
pub async fn run_txn_with_retries<T, F>(
    store: &DocumentStore,
    transform: F,
    max_retries: u32,
) -> Result<T>
where
    F: Fn(&Document) -> Result<(Document, T)>,
{
    for attempt in 0..max_retries {
        let current = store.load().await?;
        let (next, result) = transform(&current)?;

        match store.update(move |_| next, current.revision).await {
            Ok(_) => return Ok(result),
            Err(Error::StaleRevision { expected, actual }) => {
                tracing::debug!(
                    attempt = attempt + 1,
                    max_retries,
                    expected,
                    actual,
                    "optimistic conflict, retrying transaction"
                );
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::internal(format!(
        "transaction failed after {max_retries} retries"
    )))
}
