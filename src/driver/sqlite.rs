//! SQLite driver.
//!
//! Hit counts, access times and checksums live in a database file inside the
//! cache root. The directory tree still decides which images exist; the
//! database only answers the questions the filesystem can't. Database
//! failures during normal operation are logged and degrade to defaults (see
//! [`Database::scoped()`]); only a lock that never clears is an error.

use crate::driver::{CacheDriver, WriteReceipt, checked_id, delete_logged, dequeue};
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use imgcache_db::error::ErrorKind as DbErrorKind;
use imgcache_db::{Database, Repository};
use imgcache_storage::{Area, BackendHandle, CachedImage, EntryStat, StorageBackend};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use time::OffsetDateTime;

/// Suffixes of the files SQLite keeps next to the database.
const AUXILIARY_SUFFIXES: [&str; 4] = ["", "-journal", "-wal", "-shm"];

pub struct SqliteDriver {
    storage: BackendHandle,
    db_path: PathBuf,
    lock_timeout: Duration,
    stall_time: Duration,
    repo: OnceLock<Repository>,
}

/// Raise a metadata store error, keeping lock timeouts distinguishable.
fn raise_db<T>(result: imgcache_db::error::Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if matches!(&*e, DbErrorKind::LockTimeout(_)) => Err(e).or_raise(|| ErrorKind::LockTimeout),
        Err(e) => Err(e).or_raise(|| ErrorKind::Metadata),
    }
}

impl SqliteDriver {
    pub fn new(storage: BackendHandle, db_path: PathBuf, lock_timeout: Duration, stall_time: Duration) -> Self {
        Self { storage, db_path, lock_timeout, stall_time, repo: OnceLock::new() }
    }

    fn repo(&self) -> Result<&Repository> {
        self.repo.get().ok_or_else(|| {
            exn::Exn::from(ErrorKind::Configuration {
                driver: "sqlite",
                reason: "database used before the driver was configured".to_string(),
            })
        })
    }

    /// `true` for the database file and its journals.
    fn is_auxiliary(&self, image_id: &str) -> bool {
        let Some(db_name) = self.db_path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        image_id
            .strip_prefix(db_name)
            .is_some_and(|suffix| AUXILIARY_SUFFIXES.contains(&suffix))
    }

    /// Committed image files, without the database's own files.
    async fn cached_files(&self) -> Result<Vec<EntryStat>> {
        let mut entries = self.storage.list(Area::Cached).await.or_raise(|| ErrorKind::Storage)?;
        entries.retain(|entry| !self.is_auxiliary(&entry.image_id));
        Ok(entries)
    }
}

#[async_trait]
impl CacheDriver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn storage(&self) -> &dyn StorageBackend {
        &*self.storage
    }

    fn stall_time(&self) -> Duration {
        self.stall_time
    }

    #[tracing::instrument(level = "debug", skip(self), fields(backend = self.storage.name(), db = %self.db_path.display()))]
    async fn configure(&self) -> Result<()> {
        self.storage.prepare().await.or_raise(|| ErrorKind::Configuration {
            driver: "sqlite",
            reason: "the cache directory tree could not be created".to_string(),
        })?;
        if self.repo.get().is_some() {
            return Ok(());
        }
        let db = match Database::open(&self.db_path, Some(self.lock_timeout)).await {
            Ok(db) => db,
            Err(e) => {
                tracing::error!(error = ?e, "Failed to initialize the cache database");
                return Err(e).or_raise(|| ErrorKind::Configuration {
                    driver: "sqlite",
                    reason: format!("cannot initialize {}", self.db_path.display()),
                });
            },
        };
        // A concurrent configure() may have won; both handles point at the same file.
        let _ = self.repo.set(Repository::new(db));
        Ok(())
    }

    async fn get_cache_size(&self) -> Result<u64> {
        Ok(self.cached_files().await?.iter().map(|entry| entry.size).sum())
    }

    async fn get_hit_count(&self, image_id: &str) -> Result<u64> {
        let image_id = checked_id(image_id)?;
        if !self.is_cached(image_id).await? {
            return Ok(0);
        }
        raise_db(self.repo()?.hits(image_id).await)
    }

    async fn get_cached_images(&self) -> Result<Vec<CachedImage>> {
        let mut rows: HashMap<String, CachedImage> = raise_db(self.repo()?.list().await)?
            .into_iter()
            .map(|image| (image.image_id.clone(), image))
            .collect();
        let mut images: Vec<CachedImage> = self
            .cached_files()
            .await?
            .into_iter()
            .map(|entry| match rows.remove(&entry.image_id) {
                Some(image) => image,
                None => {
                    tracing::debug!(image_id = %entry.image_id, "Cached image has no metadata row");
                    // Never read as far as the database knows.
                    CachedImage { last_accessed: OffsetDateTime::UNIX_EPOCH, ..CachedImage::from_stat(entry, 0) }
                },
            })
            .collect();
        if !rows.is_empty() {
            tracing::debug!(stale = rows.len(), "Ignoring metadata rows without a cached file");
        }
        images.sort_by(|a, b| a.image_id.cmp(&b.image_id));
        Ok(images)
    }

    /// Files without a metadata row count as never accessed, so they are
    /// evicted first.
    async fn get_least_recently_accessed(&self) -> Result<Option<(String, u64)>> {
        let mut images = self.get_cached_images().await?;
        images.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed).then_with(|| a.image_id.cmp(&b.image_id)));
        Ok(images.into_iter().next().map(|image| (image.image_id, image.size)))
    }

    async fn delete_cached_image(&self, image_id: &str) -> Result<bool> {
        let image_id = checked_id(image_id)?;
        let deleted = delete_logged(self.storage(), Area::Cached, image_id).await?;
        raise_db(self.repo()?.delete(image_id).await)?;
        Ok(deleted)
    }

    async fn delete_all_cached_images(&self) -> Result<usize> {
        let mut deleted = 0;
        for entry in self.cached_files().await? {
            if delete_logged(self.storage(), Area::Cached, &entry.image_id).await? {
                deleted += 1;
            }
        }
        let rows = raise_db(self.repo()?.delete_all().await)?;
        tracing::debug!(files = deleted, rows, "Deleted all cached images");
        Ok(deleted)
    }

    #[tracing::instrument(level = "debug", skip(self, receipt), fields(size = receipt.size))]
    async fn commit(&self, image_id: &str, receipt: &WriteReceipt) -> Result<()> {
        let image_id = checked_id(image_id)?;
        let repo = self.repo()?;
        self.storage
            .rename(Area::Incomplete, Area::Cached, image_id)
            .await
            .or_raise(|| ErrorKind::Storage)?;
        let recorded = match raise_db(repo.insert(image_id, receipt.size, Some(&receipt.checksum)).await) {
            Ok(true) => Ok(()),
            Ok(false) => Err(exn::Exn::from(ErrorKind::Metadata)),
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            // A cached file must have a row; without one it was never committed.
            tracing::warn!(image_id, error = ?e, "Failed to record committed image, moving it to invalid");
            self.storage
                .rename(Area::Cached, Area::Invalid, image_id)
                .await
                .or_raise(|| ErrorKind::Storage)?;
            return Err(e);
        }
        dequeue(self.storage(), image_id).await?;
        tracing::info!(image_id, size = receipt.size, "Committed image to cache");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn rollback(&self, image_id: &str, reason: &str) -> Result<()> {
        let image_id = checked_id(image_id)?;
        if self.storage.exists(Area::Incomplete, image_id).await.or_raise(|| ErrorKind::Storage)? {
            self.storage
                .rename(Area::Incomplete, Area::Invalid, image_id)
                .await
                .or_raise(|| ErrorKind::Storage)?;
            tracing::warn!(image_id, reason, "Rolled back image, moved to invalid");
        } else {
            tracing::debug!(image_id, "Nothing to roll back, no incomplete file");
        }
        raise_db(self.repo()?.delete(image_id).await)?;
        Ok(())
    }

    async fn record_hit(&self, image_id: &str) -> Result<()> {
        let image_id = checked_id(image_id)?;
        let stat = match self.storage.stat(Area::Cached, image_id).await {
            Ok(stat) => stat,
            Err(e) if e.is_not_found() => {
                tracing::debug!(image_id, "Image evicted before its hit could be recorded");
                return Ok(());
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
        };
        if !raise_db(self.repo()?.record_hit(&stat).await)? {
            tracing::warn!(image_id, "Failed to record image hit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcache_storage::backend::LocalBackend;
    use sqlx::SqliteConnection;
    use std::sync::Arc;

    fn driver(temp_dir: &tempfile::TempDir) -> SqliteDriver {
        driver_with_lock_timeout(temp_dir, Duration::from_secs(2))
    }

    fn driver_with_lock_timeout(temp_dir: &tempfile::TempDir, lock_timeout: Duration) -> SqliteDriver {
        let storage = Arc::new(LocalBackend::new("test", temp_dir.path()).unwrap());
        SqliteDriver::new(storage, temp_dir.path().join("cache.db"), lock_timeout, Duration::from_secs(60))
    }

    /// Take an exclusive lock on the cache database from another connection.
    async fn lock_database(temp_dir: &tempfile::TempDir) -> SqliteConnection {
        let db = Database::open(temp_dir.path().join("cache.db"), None).await.unwrap();
        let mut conn = db.connect().await.unwrap();
        sqlx::raw_sql("BEGIN EXCLUSIVE").execute(&mut conn).await.unwrap();
        conn
    }

    async fn unlock_database(mut conn: SqliteConnection) {
        sqlx::raw_sql("ROLLBACK").execute(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_use_before_configure_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        // Not cached, so the database is never consulted.
        assert_eq!(driver(&temp_dir).get_hit_count("abc").await.unwrap(), 0);
        let err = driver(&temp_dir).get_cached_images().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Configuration { driver: "sqlite", .. }));
    }

    #[tokio::test]
    async fn test_configure_creates_database() {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = driver(&temp_dir);
        driver.configure().await.unwrap();
        driver.configure().await.unwrap();
        assert!(temp_dir.path().join("cache.db").is_file());
        assert!(temp_dir.path().join("incomplete").is_dir());
    }

    #[tokio::test]
    async fn test_auxiliary_files_are_not_images() {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = driver(&temp_dir);
        assert!(driver.is_auxiliary("cache.db"));
        assert!(driver.is_auxiliary("cache.db-journal"));
        assert!(driver.is_auxiliary("cache.db-wal"));
        assert!(!driver.is_auxiliary("cache.db.png"));
        assert!(!driver.is_auxiliary("cache"));
    }

    #[tokio::test]
    async fn test_commit_records_checksum() {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = driver(&temp_dir);
        driver.configure().await.unwrap();
        driver.storage().write(Area::Incomplete, "abc", b"image").await.unwrap();
        let receipt = WriteReceipt { size: 5, checksum: blake3::hash(b"image").to_hex().to_string() };
        driver.commit("abc", &receipt).await.unwrap();
        let images = driver.get_cached_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].checksum.as_deref(), Some(receipt.checksum.as_str()));
    }

    #[tokio::test]
    async fn test_unrecorded_file_is_listed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = driver(&temp_dir);
        driver.configure().await.unwrap();
        driver.storage().write(Area::Cached, "orphan", b"image").await.unwrap();
        let images = driver.get_cached_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].image_id, "orphan");
        assert_eq!(images[0].hits, 0);
        assert_eq!(images[0].last_accessed, OffsetDateTime::UNIX_EPOCH);
        assert!(images[0].checksum.is_none());
    }

    #[tokio::test]
    async fn test_unrecorded_file_is_evicted_first_and_counts_hits() {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = driver(&temp_dir);
        driver.configure().await.unwrap();
        driver.storage().write(Area::Incomplete, "abc", b"image").await.unwrap();
        driver.commit("abc", &WriteReceipt { size: 5, checksum: String::new() }).await.unwrap();
        driver.record_hit("abc").await.unwrap();
        driver.storage().write(Area::Cached, "orphan", b"img").await.unwrap();
        assert_eq!(driver.get_least_recently_accessed().await.unwrap(), Some(("orphan".to_string(), 3)));
        driver.record_hit("orphan").await.unwrap();
        driver.record_hit("orphan").await.unwrap();
        assert_eq!(driver.get_hit_count("orphan").await.unwrap(), 2);
        assert_eq!(driver.get_hit_count("abc").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hit_on_evicted_image_is_ignored() {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = driver(&temp_dir);
        driver.configure().await.unwrap();
        driver.record_hit("gone").await.unwrap();
        assert!(driver.get_cached_images().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_locked_database_times_out() {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = driver_with_lock_timeout(&temp_dir, Duration::from_millis(300));
        driver.configure().await.unwrap();
        let blocker = lock_database(&temp_dir).await;
        let err = driver.get_cached_images().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::LockTimeout));
        unlock_database(blocker).await;
        assert!(driver.get_cached_images().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unrecorded_commit_is_invalidated() {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = driver_with_lock_timeout(&temp_dir, Duration::from_millis(300));
        driver.configure().await.unwrap();
        driver.queue_image("abc").await.unwrap();
        driver.storage().write(Area::Incomplete, "abc", b"hello").await.unwrap();
        let blocker = lock_database(&temp_dir).await;
        let err = driver.commit("abc", &WriteReceipt { size: 5, checksum: String::new() }).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::LockTimeout));
        unlock_database(blocker).await;
        assert!(!driver.is_cached("abc").await.unwrap());
        assert!(driver.storage().exists(Area::Invalid, "abc").await.unwrap());
        assert!(driver.is_queued("abc").await.unwrap());
        assert!(driver.is_cacheable("abc").await.unwrap());
        assert_eq!(driver.get_cache_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rollback_removes_row() {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = driver(&temp_dir);
        driver.configure().await.unwrap();
        driver.storage().write(Area::Incomplete, "abc", b"image").await.unwrap();
        driver.commit("abc", &WriteReceipt { size: 5, checksum: String::new() }).await.unwrap();
        // A second attempt at the same id fails and must not leave the old row behind.
        driver.storage().delete(Area::Cached, "abc").await.unwrap();
        driver.storage().write(Area::Incomplete, "abc", b"ima").await.unwrap();
        driver.rollback("abc", "truncated").await.unwrap();
        assert!(driver.storage().exists(Area::Invalid, "abc").await.unwrap());
        assert_eq!(driver.get_least_recently_accessed().await.unwrap(), None);
    }
}
