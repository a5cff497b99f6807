//! Local filesystem storage backend.
//!
//! Files are stored below a configured cache root, following [`Layout`], and
//! accessed via `tokio::fs`. Tags are extended attributes; the `xattr` calls
//! are blocking syscalls, so they run on the blocking thread pool.

use crate::error::{ErrorKind, Result};
use crate::layout::{Area, Layout};
use crate::models::EntryStat;
use crate::{StorageBackend, TagStore, backend::namespaced_key, validate_image_id};
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

use super::{BoxAsyncRead, BoxAsyncWrite};

/// Local filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use imgcache_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/var/lib/imgcache")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    layout: Layout,
}
impl LocalBackend {
    /// Create a new local filesystem backend rooted at `root`.
    ///
    /// The root is created if it doesn't exist yet; the area subdirectories
    /// are left to [`prepare()`](StorageBackend::prepare).
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRoot`](ErrorKind::InvalidRoot) if the path is not
    /// absolute or exists but is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidRoot(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidRoot(root));
            }
        } else {
            // Use non-async here; it only happens once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), layout: Layout::new(root) })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Absolute path of `image_id` in `area`, after validating the id.
    fn absolute_path(&self, area: Area, image_id: &str) -> Result<PathBuf> {
        let image_id = validate_image_id(image_id)?;
        Ok(self.layout.path(area, image_id))
    }

    fn entry_stat(image_id: &str, metadata: &Metadata) -> std::result::Result<EntryStat, std::io::Error> {
        Ok(EntryStat {
            image_id: image_id.to_string(),
            size: metadata.len(),
            modified: metadata.modified()?.into(),
            accessed: metadata.accessed()?.into(),
        })
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    fn map_xattr_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            // ENOTSUP/EOPNOTSUPP: mounted without `user_xattr`, or a
            // filesystem that has no extended attributes at all.
            std::io::ErrorKind::Unsupported => ErrorKind::TagsUnsupported(path.to_path_buf()),
            _ => Self::map_io_error(e, path),
        }
    }

    /// Stat a single directory entry; `None` for anything that isn't a
    /// regular file with a usable name.
    async fn process_entry(&self, entry: DirEntry) -> Result<Option<EntryStat>> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        if !metadata.is_file() {
            return Ok(None);
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            tracing::debug!(path = %path.display(), "Skipping file with a non UTF-8 name");
            return Ok(None);
        };
        Ok(Some(Self::entry_stat(name, &metadata).map_err(|e| Self::map_io_error(e, &path))?))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self) -> Result<()> {
        for area in Area::SUBDIRECTORIES {
            let dir = self.layout.dir(area);
            fs::create_dir_all(&dir).await.map_err(|e| Self::map_io_error(e, &dir))?;
        }
        Ok(())
    }

    async fn list(&self, area: Area) -> Result<Vec<EntryStat>> {
        let dir = self.layout.dir(area);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // An area that was never prepared is simply empty.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => exn::bail!(Self::map_io_error(e, &dir)),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Self::map_io_error(e, &dir))? {
            match self.process_entry(entry).await {
                Ok(Some(stat)) => files.push(stat),
                Ok(None) => {},
                // Deleted between read_dir() and stat(); not our problem.
                Err(e) if e.is_not_found() => {},
                Err(e) => return Err(e),
            }
        }
        Ok(files)
    }

    async fn exists(&self, area: Area, image_id: &str) -> Result<bool> {
        let path = self.absolute_path(area, image_id)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => exn::bail!(Self::map_io_error(e, &path)),
        }
    }

    async fn stat(&self, area: Area, image_id: &str) -> Result<EntryStat> {
        let path = self.absolute_path(area, image_id)?;
        let metadata = fs::metadata(&path).await.map_err(|e| Self::map_io_error(e, &path))?;
        Ok(Self::entry_stat(image_id, &metadata).map_err(|e| Self::map_io_error(e, &path))?)
    }

    async fn reader(&self, area: Area, image_id: &str) -> Result<BoxAsyncRead> {
        let path = self.absolute_path(area, image_id)?;
        let file = fs::File::open(&path).await.map_err(|e| Self::map_io_error(e, &path))?;
        Ok(Box::pin(file))
    }

    async fn writer(&self, area: Area, image_id: &str) -> Result<BoxAsyncWrite> {
        let path = self.absolute_path(area, image_id)?;
        let file = fs::File::create(&path).await.map_err(|e| Self::map_io_error(e, &path))?;
        Ok(Box::pin(file))
    }

    async fn write(&self, area: Area, image_id: &str, data: &[u8]) -> Result<()> {
        let path = self.absolute_path(area, image_id)?;
        Ok(fs::write(&path, data).await.map_err(|e| Self::map_io_error(e, &path))?)
    }

    async fn delete(&self, area: Area, image_id: &str) -> Result<()> {
        let path = self.absolute_path(area, image_id)?;
        Ok(fs::remove_file(&path).await.map_err(|e| Self::map_io_error(e, &path))?)
    }

    async fn rename(&self, from: Area, to: Area, image_id: &str) -> Result<()> {
        let from_path = self.absolute_path(from, image_id)?;
        let to_path = self.absolute_path(to, image_id)?;
        // Report the source on failure: a missing source is by far the most
        // common reason for a rename to fail.
        Ok(fs::rename(&from_path, &to_path).await.map_err(|e| Self::map_io_error(e, &from_path))?)
    }
}

#[async_trait]
impl TagStore for LocalBackend {
    async fn get_tag(&self, area: Area, image_id: &str, key: &str) -> Result<Option<String>> {
        let path = self.absolute_path(area, image_id)?;
        let name = namespaced_key(key);
        let lookup_path = path.clone();
        let value = tokio::task::spawn_blocking(move || xattr::get(&lookup_path, name))
            .await
            .or_raise(|| ErrorKind::BackendError("tag lookup task failed".to_string()))?
            .map_err(|e| Self::map_xattr_error(e, &path))?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn set_tag(&self, area: Area, image_id: &str, key: &str, value: &str) -> Result<()> {
        let path = self.absolute_path(area, image_id)?;
        let name = namespaced_key(key);
        let value = value.to_string();
        let target_path = path.clone();
        tokio::task::spawn_blocking(move || xattr::set(&target_path, name, value.as_bytes()))
            .await
            .or_raise(|| ErrorKind::BackendError("tag update task failed".to_string()))?
            .map_err(|e| Self::map_xattr_error(e, &path))?;
        Ok(())
    }
}
