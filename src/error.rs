//! Image Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Errors from the storage and metadata
//! crates are raised into these kinds at the driver boundary, keeping the
//! original error in the tree.

use derive_more::{Display, Error};

/// An image cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for image cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The driver can't work with this cache directory; pick another driver
    /// or fix the filesystem.
    #[display("image cache driver `{driver}` failed to configure: {reason}")]
    Configuration { driver: &'static str, reason: String },
    /// The image id can't be used as a file name inside the cache.
    #[display("invalid image id: {_0:?}")]
    InvalidImageId(#[error(not(source))] String),
    /// The image has no committed file in the cache.
    #[display("image not cached: {_0}")]
    NotCached(#[error(not(source))] String),
    /// The cache directory tree could not be read or changed.
    #[display("image cache storage error")]
    Storage,
    /// The metadata store failed in a way that couldn't be swallowed.
    #[display("image cache metadata error")]
    Metadata,
    /// The SQLite database stayed locked for the whole retry window.
    #[display("image cache database is locked")]
    LockTimeout,
    /// Streaming an image into the cache failed; the partial file was
    /// rolled back.
    #[display("failed to write image {_0} into the cache")]
    Write(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout | Self::Storage | Self::Write(_))
    }
}
