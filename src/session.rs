//! Streaming sessions over a single cache entry.
//!
//! A [`WriteSession`] owns the `incomplete/` file of one image while it is
//! being written. It ends in exactly one of three ways:
//!
//! - [`commit()`](WriteSession::commit): the driver promotes the file,
//! - [`rollback()`](WriteSession::rollback): the file moves to `invalid/`
//!   and the caller gets its error back untouched,
//! - being dropped: a rollback is spawned on the current runtime.
//!
//! A [`ReadSession`] streams a committed image and counts a hit once the
//! reader saw the end of the file.

use crate::driver::{CacheDriver, WriteReceipt, checked_id};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use imgcache_storage::Area;
use imgcache_storage::backend::{BoxAsyncRead, BoxAsyncWrite};
use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

const DROPPED: &str = "write session dropped before commit";

fn finished() -> io::Error {
    io::Error::other("write session already finished")
}

async fn rollback_logged(driver: &dyn CacheDriver, image_id: &str, cause: String) {
    if let Err(e) = driver.rollback(image_id, &cause).await {
        tracing::error!(image_id, error = ?e, "Failed to roll back image write");
    }
}

/// Bytes on their way into `incomplete/{image_id}`.
///
/// Everything written is hashed with BLAKE3 and counted, so the driver can
/// record size and checksum on commit.
pub struct WriteSession {
    driver: Arc<dyn CacheDriver>,
    image_id: String,
    writer: Option<BoxAsyncWrite>,
    hasher: blake3::Hasher,
    size: u64,
}

impl WriteSession {
    /// Create (or truncate) the incomplete file of `image_id`.
    #[tracing::instrument(level = "debug", skip(driver), fields(driver = driver.name()))]
    pub async fn open(driver: Arc<dyn CacheDriver>, image_id: &str) -> Result<Self> {
        let image_id = checked_id(image_id)?.to_string();
        let writer = driver
            .storage()
            .writer(Area::Incomplete, &image_id)
            .await
            .or_raise(|| ErrorKind::Storage)?;
        Ok(Self { driver, image_id, writer: Some(writer), hasher: blake3::Hasher::new(), size: 0 })
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flush the file and hand it to the driver.
    ///
    /// If the file can't be closed cleanly, or the driver refuses it, the
    /// session is rolled back before the error is returned.
    #[tracing::instrument(level = "debug", skip(self), fields(image_id = %self.image_id, size = self.size))]
    pub async fn commit(mut self) -> Result<WriteReceipt> {
        let Some(mut writer) = self.writer.take() else {
            exn::bail!(ErrorKind::Write(self.image_id.clone()));
        };
        let closed = match writer.flush().await {
            Ok(()) => writer.shutdown().await,
            Err(e) => Err(e),
        };
        drop(writer);
        if let Err(e) = closed {
            rollback_logged(&*self.driver, &self.image_id, e.to_string()).await;
            return Err(e).or_raise(|| ErrorKind::Write(self.image_id.clone()));
        }
        let receipt = WriteReceipt { size: self.size, checksum: self.hasher.finalize().to_hex().to_string() };
        if let Err(e) = self.driver.commit(&self.image_id, &receipt).await {
            rollback_logged(&*self.driver, &self.image_id, format!("commit failed: {}", &*e)).await;
            return Err(e);
        }
        Ok(receipt)
    }

    /// Abandon the write because of `cause`, and hand `cause` back.
    ///
    /// The rollback is best effort: if it fails, the failure is logged and
    /// the stalled or invalid file is left for the reaper.
    pub async fn rollback<E: Display>(mut self, cause: E) -> E {
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.shutdown().await
        {
            tracing::debug!(image_id = %self.image_id, error = %e, "Failed to close abandoned cache file");
        }
        rollback_logged(&*self.driver, &self.image_id, cause.to_string()).await;
        cause
    }

    fn writer(&mut self) -> io::Result<Pin<&mut (dyn AsyncWrite + Send + 'static)>> {
        self.writer.as_mut().map(|writer| writer.as_mut()).ok_or_else(finished)
    }
}

impl AsyncWrite for WriteSession {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = match this.writer() {
            Ok(writer) => std::task::ready!(writer.poll_write(cx, buf))?,
            Err(e) => return Poll::Ready(Err(e)),
        };
        this.hasher.update(&buf[..written]);
        this.size += written as u64;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer() {
            Ok(writer) => writer.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer() {
            Ok(writer) => writer.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        drop(writer);
        let image_id = std::mem::take(&mut self.image_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let driver = Arc::clone(&self.driver);
                handle.spawn(async move { rollback_logged(&*driver, &image_id, DROPPED.to_string()).await });
            },
            Err(_) => {
                tracing::warn!(%image_id, "Write session dropped outside a runtime, leaving the file for the reaper");
            },
        }
    }
}

/// Bytes on their way out of the cache.
pub struct ReadSession {
    driver: Arc<dyn CacheDriver>,
    image_id: String,
    reader: BoxAsyncRead,
    exhausted: bool,
}

impl ReadSession {
    /// Open the committed file of `image_id`.
    ///
    /// Fails with [`ErrorKind::NotCached`] if there is none.
    #[tracing::instrument(level = "debug", skip(driver), fields(driver = driver.name()))]
    pub async fn open(driver: Arc<dyn CacheDriver>, image_id: &str) -> Result<Self> {
        let image_id = checked_id(image_id)?.to_string();
        let reader = match driver.storage().reader(Area::Cached, &image_id).await {
            Ok(reader) => reader,
            Err(e) if e.is_not_found() => return Err(e).or_raise(|| ErrorKind::NotCached(image_id.clone())),
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
        };
        Ok(Self { driver, image_id, reader, exhausted: false })
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    /// Count the read as a hit, provided the whole file was read.
    ///
    /// Returns whether a hit was recorded.
    pub async fn finish(self) -> Result<bool> {
        if !self.exhausted {
            tracing::debug!(image_id = %self.image_id, "Read stopped before the end of the image, not counting a hit");
            return Ok(false);
        }
        self.driver.record_hit(&self.image_id).await?;
        Ok(true)
    }
}

impl AsyncRead for ReadSession {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        std::task::ready!(this.reader.as_mut().poll_read(cx, buf))?;
        if buf.filled().len() == before && buf.remaining() > 0 {
            this.exhausted = true;
        }
        Poll::Ready(Ok(()))
    }
}
