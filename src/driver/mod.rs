//! Cache drivers: one contract, two ways of keeping per-image metadata.
//!
//! Both drivers share the directory tree (and therefore most of the state
//! machine, see [`EntryState`]); they differ in where hit counts and access
//! times live. The shared behaviour is written once, as provided methods of
//! [`CacheDriver`].

mod sqlite;
mod xattr;

#[cfg(test)]
mod contract;

pub use self::sqlite::SqliteDriver;
pub use self::xattr::XattrDriver;
use crate::error::{ErrorKind, Result};
use crate::reap::reap_old_files;
use async_trait::async_trait;
use exn::ResultExt;
use imgcache_storage::{Area, CachedImage, EntryState, StorageBackend, validate_image_id};
use std::time::Duration;

/// What a write session hands to [`CacheDriver::commit()`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Number of bytes written.
    pub size: u64,
    /// Hex-encoded BLAKE3 hash of the bytes written.
    pub checksum: String,
}

/// Validate an image id at the engine boundary.
pub(crate) fn checked_id(image_id: &str) -> Result<&str> {
    validate_image_id(image_id).or_raise(|| ErrorKind::InvalidImageId(image_id.to_string()))
}

/// Delete a file, treating a missing file as a logged no-op.
///
/// Returns whether a file was actually removed.
pub(crate) async fn delete_logged(storage: &dyn StorageBackend, area: Area, image_id: &str) -> Result<bool> {
    match storage.delete(area, image_id).await {
        Ok(()) => {
            tracing::debug!(image_id, %area, "Deleted image cache file");
            Ok(true)
        },
        Err(e) if e.is_not_found() => {
            tracing::warn!(image_id, %area, "Image cache file doesn't exist, unable to delete");
            Ok(false)
        },
        Err(e) => Err(e).or_raise(|| ErrorKind::Storage),
    }
}

/// Drop the queue marker of an image that just got cached, if it has one.
pub(crate) async fn dequeue(storage: &dyn StorageBackend, image_id: &str) -> Result<()> {
    match storage.delete(Area::Queue, image_id).await {
        Ok(()) => {
            tracing::debug!(image_id, "Removed image from queue after caching it");
            Ok(())
        },
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e).or_raise(|| ErrorKind::Storage),
    }
}

/// The image cache contract, implemented once per metadata store.
///
/// Required methods are the ones whose answer depends on where metadata
/// lives; everything that only looks at the directory tree is provided.
#[async_trait]
pub trait CacheDriver: Send + Sync {
    /// Short driver name, as used in configuration and logs.
    fn name(&self) -> &'static str;

    /// The directory tree this driver manages.
    fn storage(&self) -> &dyn StorageBackend;

    /// Default grace period for incomplete files in [`clean()`](Self::clean).
    fn stall_time(&self) -> Duration;

    /// Create the layout and check the driver can work with it.
    ///
    /// Fails with [`ErrorKind::Configuration`] naming the driver when the
    /// underlying storage lacks a capability the driver needs.
    async fn configure(&self) -> Result<()>;

    /// Total size in bytes of the committed images, excluding any auxiliary
    /// files the driver keeps in the cache root.
    async fn get_cache_size(&self) -> Result<u64>;

    /// Completed reads of an image since it was committed; 0 if not cached.
    async fn get_hit_count(&self, image_id: &str) -> Result<u64>;

    /// Every committed image with its metadata, ordered by image id.
    async fn get_cached_images(&self) -> Result<Vec<CachedImage>>;

    /// `(image_id, size)` of the committed image with the oldest access
    /// time, if there is any.
    async fn get_least_recently_accessed(&self) -> Result<Option<(String, u64)>>;

    /// Remove a committed image and its metadata. Returns `false` if there
    /// was no file to remove.
    async fn delete_cached_image(&self, image_id: &str) -> Result<bool>;

    /// Remove every committed image and all metadata, returning how many
    /// files were removed.
    async fn delete_all_cached_images(&self) -> Result<usize>;

    /// Promote a fully written `incomplete/` file to the cache, initialise
    /// its metadata and drop its queue marker.
    async fn commit(&self, image_id: &str, receipt: &WriteReceipt) -> Result<()>;

    /// Move a failed `incomplete/` file (if it was created) to `invalid/`
    /// and forget any metadata about the image.
    async fn rollback(&self, image_id: &str, reason: &str) -> Result<()>;

    /// Count a completed read and stamp the access time.
    async fn record_hit(&self, image_id: &str) -> Result<()>;

    /// `true` if a committed file exists for the image.
    async fn is_cached(&self, image_id: &str) -> Result<bool> {
        let image_id = checked_id(image_id)?;
        self.storage().exists(Area::Cached, image_id).await.or_raise(|| ErrorKind::Storage)
    }

    /// `true` if the image is currently being written.
    async fn is_being_cached(&self, image_id: &str) -> Result<bool> {
        let image_id = checked_id(image_id)?;
        self.storage().exists(Area::Incomplete, image_id).await.or_raise(|| ErrorKind::Storage)
    }

    /// `true` if the image has a queue marker.
    async fn is_queued(&self, image_id: &str) -> Result<bool> {
        let image_id = checked_id(image_id)?;
        self.storage().exists(Area::Queue, image_id).await.or_raise(|| ErrorKind::Storage)
    }

    /// `true` if nobody has cached or is caching the image yet. Being queued
    /// doesn't count: the queue exists precisely to be worked off.
    async fn is_cacheable(&self, image_id: &str) -> Result<bool> {
        Ok(!(self.is_cached(image_id).await? || self.is_being_cached(image_id).await?))
    }

    /// Where the image currently is in its lifecycle.
    async fn entry_state(&self, image_id: &str) -> Result<EntryState> {
        let image_id = checked_id(image_id)?;
        let mut present = [false; 4];
        for (slot, area) in present.iter_mut().zip([Area::Cached, Area::Incomplete, Area::Invalid, Area::Queue]) {
            *slot = self.storage().exists(area, image_id).await.or_raise(|| ErrorKind::Storage)?;
        }
        let [cached, incomplete, invalid, queued] = present;
        Ok(EntryState::from_presence(cached, incomplete, invalid, queued))
    }

    /// Ask for an image to be cached later.
    ///
    /// Returns `false`, without touching the filesystem, if the image is
    /// already cached, being cached or queued.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn queue_image(&self, image_id: &str) -> Result<bool> {
        if self.is_cached(image_id).await? {
            tracing::warn!(image_id, "Not queueing image, already cached");
            return Ok(false);
        }
        if self.is_being_cached(image_id).await? {
            tracing::warn!(image_id, "Not queueing image, already being written to cache");
            return Ok(false);
        }
        if self.is_queued(image_id).await? {
            tracing::warn!(image_id, "Not queueing image, already queued");
            return Ok(false);
        }
        self.storage().touch(Area::Queue, image_id).await.or_raise(|| ErrorKind::Storage)?;
        tracing::debug!(image_id, "Queued image");
        Ok(true)
    }

    /// Queued image ids, oldest marker first.
    async fn get_queued_images(&self) -> Result<Vec<String>> {
        let mut entries = self.storage().list(Area::Queue).await.or_raise(|| ErrorKind::Storage)?;
        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.image_id.cmp(&b.image_id)));
        Ok(entries.into_iter().map(|entry| entry.image_id).collect())
    }

    /// Remove the queue marker of an image. Returns `false` if there was none.
    async fn delete_queued_image(&self, image_id: &str) -> Result<bool> {
        let image_id = checked_id(image_id)?;
        match self.storage().delete(Area::Queue, image_id).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e).or_raise(|| ErrorKind::Storage),
        }
    }

    /// Remove every queue marker, returning how many there were.
    async fn delete_all_queued_images(&self) -> Result<usize> {
        let entries = self.storage().list(Area::Queue).await.or_raise(|| ErrorKind::Storage)?;
        let mut deleted = 0;
        for entry in entries {
            if delete_logged(self.storage(), Area::Queue, &entry.image_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete failed writes older than `grace`; everything if `None`.
    async fn reap_invalid(&self, grace: Option<Duration>) -> Result<usize> {
        reap_old_files(self.storage(), Area::Invalid, grace).await
    }

    /// Delete incomplete writes older than `grace`, which defaults to the
    /// configured stall time. A zero grace deletes every incomplete file.
    async fn reap_stalled(&self, grace: Option<Duration>) -> Result<usize> {
        reap_old_files(self.storage(), Area::Incomplete, Some(grace.unwrap_or(self.stall_time()))).await
    }

    /// Reap all invalid files, then incomplete files older than `stall_time`
    /// (or the configured stall time). Returns both counts.
    async fn clean(&self, stall_time: Option<Duration>) -> Result<(usize, usize)> {
        let invalid = self.reap_invalid(None).await?;
        let stalled = self.reap_stalled(stall_time).await?;
        Ok((invalid, stalled))
    }

    /// On-disk size of a committed image.
    async fn get_image_size(&self, image_id: &str) -> Result<u64> {
        let image_id = checked_id(image_id)?;
        match self.storage().stat(Area::Cached, image_id).await {
            Ok(stat) => Ok(stat.size),
            Err(e) if e.is_not_found() => Err(e).or_raise(|| ErrorKind::NotCached(image_id.to_string())),
            Err(e) => Err(e).or_raise(|| ErrorKind::Storage),
        }
    }
}
