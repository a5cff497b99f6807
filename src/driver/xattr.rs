//! Extended attribute driver.
//!
//! The hit counter lives in a `user.hits` attribute on the cached file
//! itself; access and modification times come straight from the
//! filesystem. There is no shared database to lock, at the price of a
//! lossy counter (see [`imgcache_storage::TagStore::increment_tag()`]) and a
//! dependency on the filesystem supporting user attributes.

use crate::driver::{CacheDriver, WriteReceipt, checked_id, delete_logged, dequeue};
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use imgcache_storage::{Area, CachedImage, StorageBackend, TaggedHandle};
use std::time::Duration;

/// File name used to check that the cache directory accepts tags.
pub const PROBE_ID: &str = "checkme";

const HITS_TAG: &str = "hits";
const ERROR_TAG: &str = "error";

pub struct XattrDriver {
    storage: TaggedHandle,
    stall_time: Duration,
}

impl XattrDriver {
    pub fn new(storage: TaggedHandle, stall_time: Duration) -> Self {
        Self { storage, stall_time }
    }

    /// Parsed hit counter of a cached file. Unreadable or garbled tags count
    /// as zero hits, they are not worth failing a listing over.
    async fn hits_of(&self, image_id: &str) -> u64 {
        match self.storage.get_tag(Area::Cached, image_id, HITS_TAG).await {
            Ok(value) => value.and_then(|value| value.trim().parse().ok()).unwrap_or(0),
            Err(e) => {
                tracing::warn!(image_id, error = ?e, "Failed to read hit counter");
                0
            },
        }
    }
}

#[async_trait]
impl CacheDriver for XattrDriver {
    fn name(&self) -> &'static str {
        "xattr"
    }

    fn storage(&self) -> &dyn StorageBackend {
        &*self.storage
    }

    fn stall_time(&self) -> Duration {
        self.stall_time
    }

    #[tracing::instrument(level = "debug", skip(self), fields(backend = self.storage.name()))]
    async fn configure(&self) -> Result<()> {
        let outcome = match self.storage.prepare().await {
            Ok(()) => self.storage.probe(Area::Cached, PROBE_ID).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            tracing::error!(
                error = ?e,
                "Extended attributes are not available in the cache directory; \
                 mount the filesystem with the user_xattr option (see fstab) or use the sqlite driver"
            );
            return Err(e).or_raise(|| ErrorKind::Configuration {
                driver: "xattr",
                reason: "extended attributes are unavailable, mount the cache filesystem with user_xattr"
                    .to_string(),
            });
        }
        Ok(())
    }

    async fn get_cache_size(&self) -> Result<u64> {
        let entries = self.storage.list(Area::Cached).await.or_raise(|| ErrorKind::Storage)?;
        Ok(entries.iter().map(|entry| entry.size).sum())
    }

    async fn get_hit_count(&self, image_id: &str) -> Result<u64> {
        let image_id = checked_id(image_id)?;
        if !self.is_cached(image_id).await? {
            return Ok(0);
        }
        Ok(self.hits_of(image_id).await)
    }

    async fn get_cached_images(&self) -> Result<Vec<CachedImage>> {
        let entries = self.storage.list(Area::Cached).await.or_raise(|| ErrorKind::Storage)?;
        let mut images = Vec::with_capacity(entries.len());
        for entry in entries {
            let hits = self.hits_of(&entry.image_id).await;
            images.push(CachedImage::from_stat(entry, hits));
        }
        images.sort_by(|a, b| a.image_id.cmp(&b.image_id));
        Ok(images)
    }

    async fn get_least_recently_accessed(&self) -> Result<Option<(String, u64)>> {
        let entries = self.storage.list(Area::Cached).await.or_raise(|| ErrorKind::Storage)?;
        Ok(entries
            .into_iter()
            .min_by(|a, b| a.accessed.cmp(&b.accessed).then_with(|| a.image_id.cmp(&b.image_id)))
            .map(|entry| (entry.image_id, entry.size)))
    }

    async fn delete_cached_image(&self, image_id: &str) -> Result<bool> {
        let image_id = checked_id(image_id)?;
        delete_logged(self.storage(), Area::Cached, image_id).await
    }

    async fn delete_all_cached_images(&self) -> Result<usize> {
        let entries = self.storage.list(Area::Cached).await.or_raise(|| ErrorKind::Storage)?;
        let mut deleted = 0;
        for entry in entries {
            if delete_logged(self.storage(), Area::Cached, &entry.image_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    #[tracing::instrument(level = "debug", skip(self, receipt), fields(size = receipt.size))]
    async fn commit(&self, image_id: &str, receipt: &WriteReceipt) -> Result<()> {
        let image_id = checked_id(image_id)?;
        // Tag before the rename, so a cached file never exists without a counter.
        self.storage
            .set_tag(Area::Incomplete, image_id, HITS_TAG, "0")
            .await
            .or_raise(|| ErrorKind::Metadata)?;
        self.storage
            .rename(Area::Incomplete, Area::Cached, image_id)
            .await
            .or_raise(|| ErrorKind::Storage)?;
        dequeue(self.storage(), image_id).await?;
        tracing::info!(image_id, size = receipt.size, "Committed image to cache");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn rollback(&self, image_id: &str, reason: &str) -> Result<()> {
        let image_id = checked_id(image_id)?;
        if !self.storage.exists(Area::Incomplete, image_id).await.or_raise(|| ErrorKind::Storage)? {
            tracing::debug!(image_id, "Nothing to roll back, no incomplete file");
            return Ok(());
        }
        if let Err(e) = self.storage.set_tag(Area::Incomplete, image_id, ERROR_TAG, reason).await {
            tracing::warn!(image_id, error = ?e, "Failed to tag invalid image with its error");
        }
        self.storage
            .rename(Area::Incomplete, Area::Invalid, image_id)
            .await
            .or_raise(|| ErrorKind::Storage)?;
        tracing::warn!(image_id, reason, "Rolled back image, moved to invalid");
        Ok(())
    }

    async fn record_hit(&self, image_id: &str) -> Result<()> {
        let image_id = checked_id(image_id)?;
        let hits = self
            .storage
            .increment_tag(Area::Cached, image_id, HITS_TAG, 1)
            .await
            .or_raise(|| ErrorKind::Metadata)?;
        tracing::debug!(image_id, hits, "Recorded cache hit");
        Ok(())
    }
}
