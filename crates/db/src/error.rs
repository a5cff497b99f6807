//! Metadata Store Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::time::Duration;

/// A metadata store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for metadata store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    /// The `cached_images` table could not be created.
    #[display("failed to initialize the image cache database")]
    Schema,
    /// The database stayed locked by another connection for the whole
    /// retry window.
    #[display("database stayed locked for {_0:?}")]
    LockTimeout(#[error(not(source))] Duration),
    /// A stored value does not fit the model (negative size, bad timestamp).
    #[display("invalid {_0} in cache database")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}
