//! Store-level properties: optimistic concurrency atomicity, durability
//! across process re-open, and revision-wait behavior.

use std::{sync::Arc, time::Duration};

use quorum_core::{run_txn_with_retries, DocumentStore, Error, Result};
use tempfile::TempDir;

/// GIVEN N concurrent updates against the same starting revision
/// WHEN they all race through the store
/// THEN exactly one wins per revision step and the final revision equals
///      the initial revision plus the number of successful updates.
#[tokio::test]
async fn occ_exactly_one_winner_per_revision_step() -> Result<()> {
    let dir = TempDir::new()?;
    let store = Arc::new(DocumentStore::open(dir.path().join("state.json")));

    let initial = store.load().await?.revision;
    let contenders = 6u32;

    let mut handles = Vec::new();
    for _ in 0..contenders {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            // Every task read the same starting revision on purpose.
            store.update(|d| d.clone(), initial).await
        }));
    }

    let mut winners = 0u32;
    let mut stale = 0u32;
    for handle in handles {
        match handle.await.map_err(|e| Error::internal(e.to_string()))? {
            Ok(_) => winners += 1,
            Err(Error::StaleRevision { .. }) => stale += 1,
            Err(other) => return Err(other),
        }
    }

    assert_eq!(winners, 1, "exactly one update wins the revision");
    assert_eq!(stale, contenders - 1);
    assert_eq!(store.load().await?.revision, initial + 1);
    Ok(())
}

/// GIVEN many transactions retrying through the runner
/// WHEN they contend on the same document
/// THEN every logical mutation lands exactly once.
#[tokio::test]
async fn retrying_transactions_never_lose_updates() -> Result<()> {
    let dir = TempDir::new()?;
    let store = Arc::new(DocumentStore::open(dir.path().join("state.json")));

    let writers = 10u32;
    let mut handles = Vec::new();
    for i in 0..writers {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            run_txn_with_retries(
                &store,
                |doc| {
                    let mut next = doc.clone();
                    next.extra
                        .insert(format!("entry-{i}"), serde_json::Value::Null);
                    Ok((next, ()))
                },
                64,
            )
            .await
        }));
    }
    for handle in handles {
        handle.await.map_err(|e| Error::internal(e.to_string()))??;
    }

    let doc = store.load().await?;
    assert_eq!(doc.extra.len(), writers as usize, "no update was lost");
    assert_eq!(doc.revision, u64::from(writers) + 1);
    Ok(())
}

/// GIVEN a successful update
/// WHEN the store is dropped and the file re-opened (process restart)
/// THEN the new document is visible, and stray temp-file debris from a
///      simulated crash never corrupts the target.
#[tokio::test]
async fn durability_survives_reopen_and_temp_debris() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("state.json");

    {
        let store = DocumentStore::open(&path);
        let doc = store.load().await?;
        store
            .update(
                |d| {
                    let mut next = d.clone();
                    next.panic_mode = true;
                    next
                },
                doc.revision,
            )
            .await?;
        // Store dropped here: simulated process death after a completed write.
    }

    // Crash debris: a truncated temp file next to the target.
    tokio::fs::write(dir.path().join(".state.json.crash.tmp"), b"{\"schemaV").await?;

    let store = DocumentStore::open(&path);
    let doc = store.load().await?;
    assert_eq!(doc.revision, 2, "reopened store sees the committed write");
    assert!(doc.panic_mode, "committed payload is intact");
    Ok(())
}

/// GIVEN a waiter behind the current revision
/// WHEN an update lands
/// THEN the waiter wakes with the new revision; and absent progress it
///      gets its entry revision back after the deadline.
#[tokio::test]
async fn wait_for_revision_wakes_and_times_out() -> Result<()> {
    let dir = TempDir::new()?;
    let store = Arc::new(DocumentStore::open(dir.path().join("state.json")));

    // Timeout path: no progress, revision comes back unchanged.
    let unchanged = store
        .wait_for_revision(1, Duration::from_millis(40))
        .await?;
    assert_eq!(unchanged, 1);

    // Wake path.
    let waiter = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.wait_for_revision(1, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let doc = store.load().await?;
    store.update(|d| d.clone(), doc.revision).await?;

    let woken = waiter.await.map_err(|e| Error::internal(e.to_string()))??;
    assert_eq!(woken, 2);
    Ok(())
}
