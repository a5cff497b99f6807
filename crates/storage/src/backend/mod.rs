//! Storage backend traits and implementations.
//!
//! [`StorageBackend`] is the only way the cache touches its directory tree.
//! Every operation is addressed by an [`Area`] and an image id rather than a
//! raw path, so the layout convention cannot be bypassed by accident.
//! [`TagStore`] is the optional extended-attribute capability layered on top.

mod local;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::local::LocalBackend;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockBackend;
use crate::error::Result;
use crate::layout::Area;
use crate::models::EntryStat;
use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send + 'static>>;
pub type BoxAsyncWrite = Pin<Box<dyn AsyncWrite + Send + 'static>>;

/// Prefix applied to every tag key, regardless of platform.
///
/// Linux and FreeBSD require a namespace on extended attribute names, macOS
/// doesn't care either way, so the `user` namespace is always used.
pub const TAG_NAMESPACE: &str = "user";

/// Fully-qualified name for a tag key, e.g. `hits` becomes `user.hits`.
pub fn namespaced_key(key: &str) -> String {
    format!("{TAG_NAMESPACE}.{key}")
}

/// Unified interface over the cache's directory tree.
///
/// All methods take an already-validated image id (see
/// [`validate_image_id`](crate::validate_image_id)); implementations
/// re-validate and fail with [`InvalidImageId`](crate::error::ErrorKind::InvalidImageId)
/// rather than touch a path outside the layout.
///
/// # Examples
///
/// ```no_run
/// use imgcache_storage::{Area, StorageBackend, error::Result};
///
/// async fn promote(backend: &dyn StorageBackend, image_id: &str) -> Result<u64> {
///     backend.rename(Area::Incomplete, Area::Cached, image_id).await?;
///     Ok(backend.stat(Area::Cached, image_id).await?.size)
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the backend, used for logging only.
    fn name(&self) -> &str;

    /// Create any missing area directories.
    async fn prepare(&self) -> Result<()>;

    /// Metadata of every regular file in `area`, in no particular order.
    ///
    /// Subdirectories and anything that isn't a regular file are skipped, so
    /// listing [`Area::Cached`] never reports the other areas.
    async fn list(&self, area: Area) -> Result<Vec<EntryStat>>;

    /// Check if a regular file exists for `image_id` in `area`.
    async fn exists(&self, area: Area, image_id: &str) -> Result<bool>;

    /// Get file metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn stat(&self, area: Area, image_id: &str) -> Result<EntryStat>;

    /// Open a file for streaming reads.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn reader(&self, area: Area, image_id: &str) -> Result<BoxAsyncRead>;

    /// Create (or truncate) a file and open it for streaming writes.
    ///
    /// Callers must `flush()` and `shutdown()` the writer before renaming
    /// the file, otherwise buffered bytes may land after the rename.
    async fn writer(&self, area: Area, image_id: &str) -> Result<BoxAsyncWrite>;

    /// Write file contents in one go, creating or truncating the file.
    async fn write(&self, area: Area, image_id: &str, data: &[u8]) -> Result<()>;

    /// Create an empty file, or truncate an existing one.
    async fn touch(&self, area: Area, image_id: &str) -> Result<()> {
        self.write(area, image_id, &[]).await
    }

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, area: Area, image_id: &str) -> Result<()>;

    /// Move a file between areas, keeping its name.
    ///
    /// This is the only cross-process coordination primitive the cache relies
    /// on: implementations must make it atomic (a same-filesystem `rename()`
    /// for local storage). An existing destination is replaced. Returns
    /// [`NotFound`](crate::error::ErrorKind::NotFound) if the source does not
    /// exist.
    async fn rename(&self, from: Area, to: Area, image_id: &str) -> Result<()>;
}

/// Small string attributes attached directly to a stored file.
///
/// Tags follow the file through [`rename`](StorageBackend::rename) and
/// disappear with it on [`delete`](StorageBackend::delete). For local storage
/// they are extended attributes; support depends on the filesystem, so
/// callers should [`probe`](TagStore::probe) before relying on them.
#[async_trait]
pub trait TagStore: StorageBackend {
    /// Read a tag, returning `None` if it was never set.
    async fn get_tag(&self, area: Area, image_id: &str, key: &str) -> Result<Option<String>>;

    /// Set a tag, replacing any previous value.
    ///
    /// Returns [`TagsUnsupported`](crate::error::ErrorKind::TagsUnsupported)
    /// if the underlying storage can't hold tags.
    async fn set_tag(&self, area: Area, image_id: &str, key: &str, value: &str) -> Result<()>;

    /// Add `n` to an integer tag (missing or unparsable values count as 0)
    /// and return the new value.
    ///
    /// BEWARE: this is a read-modify-write sequence, NOT an atomic update.
    /// Two concurrent increments can read the same value and one of them is
    /// lost. The tags this is used for are statistics, where an occasional
    /// missed hit is an acceptable price for lock-free code.
    async fn increment_tag(&self, area: Area, image_id: &str, key: &str, n: u64) -> Result<u64> {
        let current = self
            .get_tag(area, image_id, key)
            .await?
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let next = current.saturating_add(n);
        self.set_tag(area, image_id, key, &next.to_string()).await?;
        Ok(next)
    }

    /// Check that tags can actually be stored, by writing a throwaway file
    /// into `area` under `probe_id`, tagging it and removing it again.
    async fn probe(&self, area: Area, probe_id: &str) -> Result<()> {
        self.write(area, probe_id, b"XXX").await?;
        let tagged = self.set_tag(area, probe_id, "hits", "1").await;
        if let Err(e) = self.delete(area, probe_id).await {
            tracing::warn!(backend = self.name(), error = ?e, "Failed to remove tag probe file");
        }
        tagged
    }
}
