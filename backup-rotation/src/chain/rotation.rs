//! Eviction of the oldest chain member and renumbering of the survivors.

use super::{naming, BackupRecord, VerifiedChain};
use crate::remote::StorageClient;
use crate::utils::errors::{RotationError, StorageError};
use std::sync::Arc;
use tracing::{info, warn};

/// Delete the oldest record and shift every survivor down by one index so
/// the chain starts at 1 again.
///
/// Only called when the chain is exactly at capacity. Renames run as one
/// task per survivor; each task owns its record and hands it back through
/// its join handle, and the handles are collected in chain order. A failure
/// is reported only after every task has finished.
pub async fn rotate<S>(chain: VerifiedChain, storage: Arc<S>) -> Result<VerifiedChain, RotationError>
where
    S: StorageClient + ?Sized + 'static,
{
    let mut records = chain.into_records();
    if records.is_empty() {
        return Ok(VerifiedChain::default());
    }

    let oldest = records.remove(0);
    info!(job = %oldest.name, title = %oldest.artifact.title, "Evicting oldest backup");
    storage
        .delete_artifact(&oldest.artifact.id)
        .await
        .map_err(|source| RotationError::Evict {
            title: oldest.artifact.title.clone(),
            source,
        })?;

    let total = records.len();
    let mut handles = Vec::with_capacity(total);
    for (position, record) in records.into_iter().enumerate() {
        let storage = Arc::clone(&storage);
        let title = record.artifact.title.clone();
        let handle = tokio::spawn(async move { renumber(storage.as_ref(), record, position as u32 + 1).await });
        handles.push((title, handle));
    }

    let mut renumbered = Vec::with_capacity(total);
    let mut failures: Vec<(String, StorageError)> = Vec::new();
    for (title, handle) in handles {
        match handle.await {
            Ok(Ok(record)) => renumbered.push(record),
            Ok(Err(e)) => {
                warn!(title = %title, error = %e, "Failed to renumber backup");
                failures.push((title, e));
            }
            Err(e) => {
                warn!(title = %title, error = %e, "Renumber task panicked");
                failures.push((title, StorageError::Request(format!("rename task failed: {e}"))));
            }
        }
    }

    let failed = failures.len();
    if let Some((title, source)) = failures.into_iter().next() {
        return Err(RotationError::Rename {
            title,
            failed,
            total,
            source,
        });
    }

    Ok(VerifiedChain::from_records(renumbered))
}

async fn renumber<S>(storage: &S, mut record: BackupRecord, index: u32) -> Result<BackupRecord, StorageError>
where
    S: StorageClient + ?Sized,
{
    let title = naming::format(&record.name, record.date, index);
    if title != record.artifact.title {
        storage.rename_artifact(&record.artifact.id, &title).await?;
    }
    record.index = index;
    record.artifact.title = title;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::validate;
    use crate::test_support::{job, MemoryStorage};
    use chrono::NaiveDate;

    fn seeded(titles: &[&str]) -> (Arc<MemoryStorage>, Vec<crate::remote::RemoteArtifact>) {
        let storage = Arc::new(MemoryStorage::new());
        let folder = storage.seed_folder("test");
        for title in titles {
            storage.seed_gzip(&folder, title);
        }
        let listed = storage.files_in(&folder);
        (storage, listed)
    }

    #[tokio::test]
    async fn test_rotation_evicts_oldest_and_shifts_dates() {
        let (storage, listed) = seeded(&[
            "test-01/01/22-1.tar.gz",
            "test-04/01/22-2.tar.gz",
            "test-07/01/22-3.tar.gz",
        ]);
        let j = job("test", 3, 3);
        let chain = validate(&j, &listed);
        assert!(chain.is_full(j.max_retained));

        let rotated = rotate(chain, storage.clone()).await.unwrap();

        assert_eq!(rotated.indices(), vec![1, 2]);
        let dates: Vec<NaiveDate> = rotated.records().iter().map(|r| r.date).collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2022, 1, 4).unwrap(),
                NaiveDate::from_ymd_opt(2022, 1, 7).unwrap(),
            ]
        );
        let mut remaining = storage.all_titles();
        remaining.sort();
        assert_eq!(remaining, vec!["test-04/01/22-1.tar.gz", "test-07/01/22-2.tar.gz"]);
        assert_eq!(rotated.records()[0].artifact.title, "test-04/01/22-1.tar.gz");
    }

    #[tokio::test]
    async fn test_rotated_chain_revalidates() {
        let (storage, listed) = seeded(&[
            "test-01/01/22-1.tar.gz",
            "test-02/01/22-2.tar.gz",
            "test-03/01/22-3.tar.gz",
            "test-04/01/22-4.tar.gz",
        ]);
        let j = job("test", 1, 4);
        let rotated = rotate(validate(&j, &listed), storage.clone()).await.unwrap();

        let folder = storage.seed_folder("test");
        let relisted = validate(&j, &storage.files_in(&folder));
        assert_eq!(relisted, rotated);
        assert_eq!(relisted.len(), 3);
    }

    #[tokio::test]
    async fn test_capacity_of_one_empties_the_chain() {
        let (storage, listed) = seeded(&["test-01/01/22-1.tar.gz"]);
        let rotated = rotate(validate(&job("test", 1, 1), &listed), storage.clone()).await.unwrap();
        assert!(rotated.is_empty());
        assert!(storage.all_titles().is_empty());
    }

    #[tokio::test]
    async fn test_delete_failure_skips_renames() {
        let (storage, listed) = seeded(&["test-01/01/22-1.tar.gz", "test-02/01/22-2.tar.gz"]);
        storage.fail_deletes();

        let err = rotate(validate(&job("test", 1, 2), &listed), storage.clone()).await.unwrap_err();
        assert!(matches!(err, RotationError::Evict { .. }));
        assert_eq!(storage.rename_calls(), 0);
    }

    #[tokio::test]
    async fn test_rename_failure_waits_for_every_task() {
        let (storage, listed) = seeded(&[
            "test-01/01/22-1.tar.gz",
            "test-02/01/22-2.tar.gz",
            "test-03/01/22-3.tar.gz",
            "test-04/01/22-4.tar.gz",
        ]);
        storage.fail_rename_of("test-02/01/22-2.tar.gz");

        let j = job("test", 1, 4);
        let err = rotate(validate(&j, &listed), storage.clone()).await.unwrap_err();
        match err {
            RotationError::Rename { title, failed, total, .. } => {
                assert_eq!(title, "test-02/01/22-2.tar.gz");
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(storage.rename_calls(), 3);

        // The half-renumbered folder never validates as a full chain
        let folder = storage.seed_folder("test");
        let relisted = validate(&j, &storage.files_in(&folder));
        assert!(relisted.len() < j.max_retained as usize);
    }
}
