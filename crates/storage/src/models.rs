//! Storage models.
//!
//! These types represent both database rows (for the SQLite metadata store)
//! and storage backend metadata (for listing and reaping).

use serde::Serialize;
use time::UtcDateTime;

/// File metadata returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStat {
    /// File name, which is the image id
    pub image_id: String,
    /// File size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: UtcDateTime,
    /// Last access timestamp (only as accurate as the filesystem's atime)
    pub accessed: UtcDateTime,
}

/// A committed cache entry, as reported by the cache drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedImage {
    pub image_id: String,
    /// Size in bytes
    pub size: u64,
    /// Completed reads since the image was committed
    pub hits: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: time::OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: time::OffsetDateTime,
    /// BLAKE3 hash of the image bytes, if the driver records one
    pub checksum: Option<String>,
}
impl CachedImage {
    /// Build an entry from a filesystem stat and a hit count.
    pub fn from_stat(stat: EntryStat, hits: u64) -> Self {
        Self {
            image_id: stat.image_id,
            size: stat.size,
            hits,
            last_accessed: stat.accessed.into(),
            last_modified: stat.modified.into(),
            checksum: None,
        }
    }
}
