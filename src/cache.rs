//! The image cache facade.
//!
//! [`ImageCache`] picks and configures a driver from [`Config`], then adds
//! the operations that are built out of driver calls: streaming sessions,
//! whole-source caching helpers and size-bounded pruning. Every
//! [`CacheDriver`] method is reachable through `Deref`.

use crate::driver::{CacheDriver, SqliteDriver, XattrDriver};
use crate::error::{ErrorKind, Result};
use crate::session::{ReadSession, WriteSession};
use async_stream::stream;
use exn::ResultExt;
use futures::{Stream, StreamExt};
use imgcache_config::{Config, DriverKind};
use imgcache_storage::TagStore;
use imgcache_storage::backend::LocalBackend;
use std::fmt::Display;
use std::ops::Deref;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

pub struct ImageCache {
    driver: Arc<dyn CacheDriver>,
    max_size: u64,
}

impl ImageCache {
    /// Open the cache directory named in `config` on the local filesystem.
    pub async fn open(config: &Config) -> Result<Self> {
        let storage = LocalBackend::new("local", &config.dir).or_raise(|| ErrorKind::Configuration {
            driver: "local",
            reason: format!("cannot use {} as cache directory", config.dir.display()),
        })?;
        Self::with_backend(config, Arc::new(storage)).await
    }

    /// Build the configured driver on top of `storage` and configure it.
    ///
    /// When the extended attribute driver can't work with the storage, the
    /// SQLite driver is used instead.
    #[tracing::instrument(level = "debug", skip_all, fields(driver = %config.driver, backend = storage.name()))]
    pub async fn with_backend<B: TagStore + 'static>(config: &Config, storage: Arc<B>) -> Result<Self> {
        let driver: Arc<dyn CacheDriver> = match config.driver {
            DriverKind::Xattr => {
                let xattr: Arc<dyn CacheDriver> = Arc::new(XattrDriver::new(storage.clone(), config.stall_time()));
                match xattr.configure().await {
                    Ok(()) => xattr,
                    Err(e) if matches!(&*e, ErrorKind::Configuration { .. }) => {
                        tracing::warn!(error = ?e, "Falling back to the sqlite image cache driver");
                        Self::sqlite(config, storage).await?
                    },
                    Err(e) => return Err(e),
                }
            },
            DriverKind::Sqlite => Self::sqlite(config, storage).await?,
        };
        tracing::debug!(driver = driver.name(), "Image cache ready");
        Ok(Self::new(driver, config.max_size))
    }

    async fn sqlite<B: TagStore + 'static>(config: &Config, storage: Arc<B>) -> Result<Arc<dyn CacheDriver>> {
        let driver = SqliteDriver::new(storage, config.sqlite_path(), config.sql_timeout(), config.stall_time());
        driver.configure().await?;
        Ok(Arc::new(driver))
    }

    /// Wrap an already configured driver.
    pub fn new(driver: Arc<dyn CacheDriver>, max_size: u64) -> Self {
        Self { driver, max_size }
    }

    pub fn driver(&self) -> &Arc<dyn CacheDriver> {
        &self.driver
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub async fn open_for_write(&self, image_id: &str) -> Result<WriteSession> {
        WriteSession::open(Arc::clone(&self.driver), image_id).await
    }

    pub async fn open_for_read(&self, image_id: &str) -> Result<ReadSession> {
        ReadSession::open(Arc::clone(&self.driver), image_id).await
    }

    /// Read a whole cached image into memory, counting a hit.
    pub async fn read_image(&self, image_id: &str) -> Result<Vec<u8>> {
        let mut session = self.open_for_read(image_id).await?;
        let mut data = Vec::new();
        session.read_to_end(&mut data).await.or_raise(|| ErrorKind::Storage)?;
        session.finish().await?;
        Ok(data)
    }

    /// Evict least recently accessed images until the cache fits in the
    /// configured maximum size.
    pub async fn prune(&self) -> Result<(usize, u64)> {
        self.prune_to(self.max_size).await
    }

    /// Evict least recently accessed images until the cache holds at most
    /// `max_size` bytes. Returns the number of images and bytes evicted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn prune_to(&self, max_size: u64) -> Result<(usize, u64)> {
        let mut size = self.get_cache_size().await?;
        if size <= max_size {
            tracing::debug!(size, max_size, "Image cache within size limit, nothing to prune");
            return Ok((0, 0));
        }
        let (mut files, mut bytes) = (0, 0);
        let mut previous: Option<String> = None;
        while size > max_size {
            let Some((image_id, image_size)) = self.get_least_recently_accessed().await? else {
                break;
            };
            if previous.as_deref() == Some(image_id.as_str()) {
                tracing::warn!(%image_id, "Least recently accessed image did not go away, stopping prune");
                break;
            }
            self.delete_cached_image(&image_id).await?;
            tracing::debug!(%image_id, size = image_size, "Pruned image");
            files += 1;
            bytes += image_size;
            size = size.saturating_sub(image_size);
            previous = Some(image_id);
        }
        tracing::info!(files, bytes, size, max_size, "Pruned image cache");
        Ok((files, bytes))
    }

    /// Cache a whole byte stream under `image_id`.
    ///
    /// Returns `false`, without consuming the stream, if the image is
    /// already cached or being cached. An error from the stream rolls the
    /// write back and is returned inside [`ErrorKind::Write`].
    pub async fn cache_image_stream<S, B, E>(&self, image_id: &str, source: S) -> Result<bool>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.is_cacheable(image_id).await? {
            tracing::debug!(image_id, "Image not cacheable, skipping");
            return Ok(false);
        }
        let mut session = self.open_for_write(image_id).await?;
        let mut source = std::pin::pin!(source);
        while let Some(chunk) = source.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let e = session.rollback(e).await;
                    return Err(e).or_raise(|| ErrorKind::Write(image_id.to_string()));
                },
            };
            if let Err(e) = session.write_all(chunk.as_ref()).await {
                let e = session.rollback(e).await;
                return Err(e).or_raise(|| ErrorKind::Write(image_id.to_string()));
            }
        }
        session.commit().await?;
        Ok(true)
    }

    /// Cache everything `reader` produces under `image_id`.
    ///
    /// Same contract as [`cache_image_stream()`](Self::cache_image_stream).
    pub async fn cache_image_reader<R>(&self, image_id: &str, mut reader: R) -> Result<bool>
    where
        R: AsyncRead + Unpin,
    {
        if !self.is_cacheable(image_id).await? {
            tracing::debug!(image_id, "Image not cacheable, skipping");
            return Ok(false);
        }
        let mut session = self.open_for_write(image_id).await?;
        if let Err(e) = tokio::io::copy(&mut reader, &mut session).await {
            let e = session.rollback(e).await;
            return Err(e).or_raise(|| ErrorKind::Write(image_id.to_string()));
        }
        session.commit().await?;
        Ok(true)
    }

    /// Pass `source` through unchanged while writing a copy into the cache.
    ///
    /// The caller always gets every item of `source`: failing to cache only
    /// rolls the copy back. The copy is committed once `source` ends without
    /// an error; an error item rolls it back. Dropping the returned stream
    /// early rolls back too.
    pub fn caching_stream<'a, S, B, E>(
        &'a self,
        image_id: &'a str,
        source: S,
    ) -> impl Stream<Item = std::result::Result<B, E>> + 'a
    where
        S: Stream<Item = std::result::Result<B, E>> + 'a,
        B: AsRef<[u8]> + 'a,
        E: Display + 'a,
    {
        // `rustfmt` does not format macros that use braces. Wrap in parentheses!
        stream!({
            let mut session = match self.is_cacheable(image_id).await {
                Ok(true) => match self.open_for_write(image_id).await {
                    Ok(session) => Some(session),
                    Err(e) => {
                        tracing::warn!(image_id, error = ?e, "Failed to start caching image, serving it uncached");
                        None
                    },
                },
                Ok(false) => None,
                Err(e) => {
                    tracing::warn!(image_id, error = ?e, "Failed to check whether image is cacheable");
                    None
                },
            };
            for await item in source {
                match &item {
                    Ok(chunk) => {
                        let written = match session.as_mut() {
                            Some(active) => active.write_all(chunk.as_ref()).await,
                            None => Ok(()),
                        };
                        if let Err(e) = written {
                            tracing::warn!(image_id, error = %e, "Failed to cache image, still serving it");
                            if let Some(failed) = session.take() {
                                failed.rollback(e).await;
                            }
                        }
                    },
                    Err(e) => {
                        if let Some(failed) = session.take() {
                            failed.rollback(e.to_string()).await;
                        }
                    },
                }
                yield item;
            }
            if let Some(finished) = session.take() {
                if let Err(e) = finished.commit().await {
                    tracing::warn!(image_id, error = ?e, "Failed to commit streamed image");
                }
            }
        })
    }
}

impl Deref for ImageCache {
    type Target = dyn CacheDriver;

    fn deref(&self) -> &Self::Target {
        &*self.driver
    }
}
