//! Disk-backed image cache.
//!
//! Images are plain files in a cache directory; the subdirectory a file sits
//! in is its state (queued, being written, cached or invalid). Per-image
//! statistics (hit count, last access) are kept either in extended
//! attributes on the files themselves or in an SQLite database next to them,
//! behind the one [`CacheDriver`] contract.
//!
//! ```no_run
//! use imgcache::{Config, ImageCache};
//!
//! # async fn example() -> imgcache::error::Result<()> {
//! let cache = ImageCache::open(&Config::default()).await?;
//! if cache.is_cacheable("42").await? {
//!     let source = futures::stream::iter([Ok::<_, std::io::Error>(b"...".to_vec())]);
//!     cache.cache_image_stream("42", source).await?;
//! }
//! let bytes = cache.read_image("42").await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod driver;
pub mod error;
pub mod reap;
pub mod session;

pub use crate::cache::ImageCache;
pub use crate::driver::{CacheDriver, SqliteDriver, WriteReceipt, XattrDriver};
pub use crate::session::{ReadSession, WriteSession};
pub use imgcache_config::{Config, DriverKind};
pub use imgcache_storage::{Area, CachedImage, EntryState};
