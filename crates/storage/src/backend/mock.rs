//! In-memory storage backend for testing.

use super::{BoxAsyncRead, BoxAsyncWrite, namespaced_key};
use crate::error::{ErrorKind, Result};
use crate::layout::{Area, Layout};
use crate::models::EntryStat;
use crate::{StorageBackend, TagStore, validate_image_id};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use time::UtcDateTime;
use tokio::io::AsyncWrite;

type Key = (Area, String);

#[derive(Clone, Debug)]
struct MockEntry {
    data: Vec<u8>,
    modified: UtcDateTime,
    accessed: UtcDateTime,
    tags: HashMap<String, String>,
}
impl MockEntry {
    fn new(data: Vec<u8>) -> Self {
        let now = UtcDateTime::now();
        Self { data, modified: now, accessed: now, tags: HashMap::new() }
    }
}

type Files = Arc<Mutex<HashMap<Key, MockEntry>>>;

fn lock(files: &Files) -> MutexGuard<'_, HashMap<Key, MockEntry>> {
    // A test that panicked mid-operation shouldn't take the others with it.
    files.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory storage backend for testing.
///
/// Files are stored in a `HashMap` behind a [`Mutex`], keyed by area and
/// image id. Unlike a real filesystem the timestamps are fully under the
/// test's control (see [`set_modified()`](Self::set_modified)), and tag
/// support can be switched off to imitate a filesystem mounted without
/// extended attributes.
///
/// # Examples
///
/// ```
/// use imgcache_storage::backend::MockBackend;
/// use imgcache_storage::{Area, StorageBackend};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::default();
/// backend.write(Area::Incomplete, "abc", b"data...").await?;
/// backend.rename(Area::Incomplete, Area::Cached, "abc").await?;
/// assert!(backend.exists(Area::Cached, "abc").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MockBackend {
    name: String,
    layout: Layout,
    files: Files,
    tags_supported: bool,
}
impl MockBackend {
    /// Refuse every tag operation with
    /// [`TagsUnsupported`](ErrorKind::TagsUnsupported).
    pub fn without_tags(mut self) -> Self {
        self.tags_supported = false;
        self
    }

    /// Overwrite the modification time of a file.
    ///
    /// Panics if the file doesn't exist; a test that sets up a missing file
    /// should not pass.
    pub fn set_modified(&self, area: Area, image_id: &str, modified: UtcDateTime) {
        self.with_entry(area, image_id, |entry| entry.modified = modified);
    }

    /// Overwrite the access time of a file. Panics if the file doesn't exist.
    pub fn set_accessed(&self, area: Area, image_id: &str, accessed: UtcDateTime) {
        self.with_entry(area, image_id, |entry| entry.accessed = accessed);
    }

    /// Contents of a file, if it exists.
    pub fn contents(&self, area: Area, image_id: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(&(area, image_id.to_string())).map(|entry| entry.data.clone())
    }

    fn with_entry(&self, area: Area, image_id: &str, f: impl FnOnce(&mut MockEntry)) {
        let mut guard = lock(&self.files);
        let Some(entry) = guard.get_mut(&(area, image_id.to_string())) else {
            // The panic here is DELIBERATE, same as a failed assertion.
            panic!("MockBackend: no file {image_id:?} in {area}");
        };
        f(entry);
    }

    fn key(area: Area, image_id: &str) -> Result<Key> {
        Ok((area, validate_image_id(image_id)?.to_string()))
    }

    fn not_found(&self, area: Area, image_id: &str) -> exn::Exn<ErrorKind> {
        exn::Exn::from(ErrorKind::NotFound(self.layout.path(area, image_id)))
    }

    fn stat_entry(image_id: &str, entry: &MockEntry) -> EntryStat {
        EntryStat {
            image_id: image_id.to_string(),
            size: entry.data.len() as u64,
            modified: entry.modified,
            accessed: entry.accessed,
        }
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            layout: Layout::new(PathBuf::from("/mock")),
            files: Arc::new(Mutex::new(HashMap::new())),
            tags_supported: true,
        }
    }
}

/// Streaming writer that appends straight into the shared map.
struct MockWriter {
    files: Files,
    key: Key,
}
impl AsyncWrite for MockWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let mut guard = lock(&self.files);
        let entry = guard.entry(self.key.clone()).or_insert_with(|| MockEntry::new(Vec::new()));
        entry.data.extend_from_slice(buf);
        entry.modified = UtcDateTime::now();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn list(&self, area: Area) -> Result<Vec<EntryStat>> {
        let guard = lock(&self.files);
        Ok(guard
            .iter()
            .filter(|((entry_area, _), _)| *entry_area == area)
            .map(|((_, image_id), entry)| Self::stat_entry(image_id, entry))
            .collect())
    }

    async fn exists(&self, area: Area, image_id: &str) -> Result<bool> {
        let key = Self::key(area, image_id)?;
        Ok(lock(&self.files).contains_key(&key))
    }

    async fn stat(&self, area: Area, image_id: &str) -> Result<EntryStat> {
        let key = Self::key(area, image_id)?;
        let guard = lock(&self.files);
        let entry = guard.get(&key).ok_or_else(|| self.not_found(area, image_id))?;
        Ok(Self::stat_entry(image_id, entry))
    }

    async fn reader(&self, area: Area, image_id: &str) -> Result<BoxAsyncRead> {
        let key = Self::key(area, image_id)?;
        let mut guard = lock(&self.files);
        let entry = guard.get_mut(&key).ok_or_else(|| self.not_found(area, image_id))?;
        entry.accessed = UtcDateTime::now();
        Ok(Box::pin(Cursor::new(entry.data.clone())))
    }

    async fn writer(&self, area: Area, image_id: &str) -> Result<BoxAsyncWrite> {
        let key = Self::key(area, image_id)?;
        lock(&self.files)
            .entry(key.clone())
            .and_modify(|entry| {
                entry.data.clear();
                entry.modified = UtcDateTime::now();
            })
            .or_insert_with(|| MockEntry::new(Vec::new()));
        Ok(Box::pin(MockWriter { files: Arc::clone(&self.files), key }))
    }

    async fn write(&self, area: Area, image_id: &str, data: &[u8]) -> Result<()> {
        let key = Self::key(area, image_id)?;
        lock(&self.files)
            .entry(key)
            .and_modify(|entry| {
                entry.data = data.to_vec();
                entry.modified = UtcDateTime::now();
            })
            .or_insert_with(|| MockEntry::new(data.to_vec()));
        Ok(())
    }

    async fn delete(&self, area: Area, image_id: &str) -> Result<()> {
        let key = Self::key(area, image_id)?;
        lock(&self.files).remove(&key).map(|_| ()).ok_or_else(|| self.not_found(area, image_id))
    }

    async fn rename(&self, from: Area, to: Area, image_id: &str) -> Result<()> {
        let from_key = Self::key(from, image_id)?;
        let to_key = Self::key(to, image_id)?;
        let mut guard = lock(&self.files);
        let entry = guard.remove(&from_key).ok_or_else(|| self.not_found(from, image_id))?;
        guard.insert(to_key, entry);
        Ok(())
    }
}

#[async_trait]
impl TagStore for MockBackend {
    async fn get_tag(&self, area: Area, image_id: &str, key: &str) -> Result<Option<String>> {
        let file_key = Self::key(area, image_id)?;
        if !self.tags_supported {
            exn::bail!(ErrorKind::TagsUnsupported(self.layout.path(area, image_id)));
        }
        let guard = lock(&self.files);
        let entry = guard.get(&file_key).ok_or_else(|| self.not_found(area, image_id))?;
        Ok(entry.tags.get(&namespaced_key(key)).cloned())
    }

    async fn set_tag(&self, area: Area, image_id: &str, key: &str, value: &str) -> Result<()> {
        let file_key = Self::key(area, image_id)?;
        if !self.tags_supported {
            exn::bail!(ErrorKind::TagsUnsupported(self.layout.path(area, image_id)));
        }
        let mut guard = lock(&self.files);
        let entry = guard.get_mut(&file_key).ok_or_else(|| self.not_found(area, image_id))?;
        entry.tags.insert(namespaced_key(key), value.to_string());
        Ok(())
    }
}
