//! Sweeping stale files out of the staging areas.
//!
//! Nothing here runs on its own; an external job (see the `clean` and
//! `reap-*` subcommands) decides when to sweep.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use imgcache_storage::{Area, StorageBackend};
use std::time::Duration;
use time::UtcDateTime;

/// Delete files in `area` whose modification time is more than `grace` ago.
///
/// A grace period of `None` (or zero) deletes every file in the area. Files
/// that vanish between listing and deleting are logged and skipped. Returns
/// the number of files deleted.
#[tracing::instrument(level = "debug", skip(storage), fields(backend = storage.name()))]
pub async fn reap_old_files(storage: &dyn StorageBackend, area: Area, grace: Option<Duration>) -> Result<usize> {
    let grace = grace.filter(|grace| !grace.is_zero());
    let now = UtcDateTime::now();
    let entries = storage.list(area).await.or_raise(|| ErrorKind::Storage)?;
    let mut reaped = 0;
    for entry in entries {
        let age = now - entry.modified;
        match grace {
            None => tracing::debug!(image_id = %entry.image_id, %area, "No grace period, reaping"),
            Some(grace) if age > grace => tracing::debug!(
                image_id = %entry.image_id,
                %area,
                age = age.whole_seconds(),
                grace = grace.as_secs(),
                "Cache entry exceeds grace period, reaping"
            ),
            Some(_) => continue,
        }
        match storage.delete(area, &entry.image_id).await {
            Ok(()) => reaped += 1,
            Err(e) if e.is_not_found() => {
                tracing::warn!(image_id = %entry.image_id, %area, "Cache entry disappeared before it could be reaped");
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
        }
    }
    tracing::info!(reaped, %area, "Reaped cache entries");
    Ok(reaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcache_storage::backend::MockBackend;
    use rstest::rstest;

    async fn backend_with_ages(area: Area, ages: &[(&str, i64)]) -> MockBackend {
        let backend = MockBackend::default();
        let now = UtcDateTime::now();
        for (image_id, age) in ages {
            backend.write(area, image_id, b"data").await.unwrap();
            backend.set_modified(area, image_id, now - time::Duration::seconds(*age));
        }
        backend
    }

    async fn remaining(backend: &MockBackend, area: Area) -> Vec<String> {
        let mut ids: Vec<_> = backend.list(area).await.unwrap().into_iter().map(|entry| entry.image_id).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_grace_keeps_young_entries() {
        let backend = backend_with_ages(Area::Incomplete, &[("old", 120), ("young", 10)]).await;
        let reaped = reap_old_files(&backend, Area::Incomplete, Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(remaining(&backend, Area::Incomplete).await, vec!["young"]);
    }

    #[rstest]
    #[case::no_grace(None)]
    #[case::zero_grace(Some(Duration::ZERO))]
    #[tokio::test]
    async fn test_without_grace_reaps_everything(#[case] grace: Option<Duration>) {
        let backend = backend_with_ages(Area::Invalid, &[("a", 0), ("b", 5), ("c", 100_000)]).await;
        assert_eq!(reap_old_files(&backend, Area::Invalid, grace).await.unwrap(), 3);
        assert!(remaining(&backend, Area::Invalid).await.is_empty());
    }

    #[tokio::test]
    async fn test_only_touches_given_area() {
        let backend = backend_with_ages(Area::Invalid, &[("a", 1_000)]).await;
        backend.write(Area::Cached, "a", b"data").await.unwrap();
        backend.write(Area::Incomplete, "b", b"data").await.unwrap();
        assert_eq!(reap_old_files(&backend, Area::Invalid, None).await.unwrap(), 1);
        assert!(backend.exists(Area::Cached, "a").await.unwrap());
        assert!(backend.exists(Area::Incomplete, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_area() {
        let backend = MockBackend::default();
        assert_eq!(reap_old_files(&backend, Area::Incomplete, None).await.unwrap(), 0);
    }
}
