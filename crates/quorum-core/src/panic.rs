//! Global write-freeze (panic mode) toggle.
//!
//! The flag lives inside the same OCC document as everything else, so
//! flipping it is itself a transaction with the same durability guarantees.
//! While the freeze is on, mutating operations fail with `PANIC_MODE`; the
//! toggle itself and the lock-release recovery paths are exempt.

use crate::{store::DocumentStore, txn::run_txn, Result};

/// Set or clear the global write freeze. Returns the previous value.
pub async fn set_panic_mode(store: &DocumentStore, enabled: bool) -> Result<bool> {
    let previous = run_txn(store, move |doc| {
        let mut next = doc.clone();
        next.panic_mode = enabled;
        Ok((next, doc.panic_mode))
    })
    .await?;

    if previous != enabled {
        tracing::warn!(enabled, "panic mode toggled");
    }
    Ok(previous)
}

/// Whether the global write freeze is currently active.
pub async fn is_panic_mode(store: &DocumentStore) -> Result<bool> {
    Ok(store.load().await?.panic_mode)
}
