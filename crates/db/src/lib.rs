//! SQLite metadata store for the image cache.
//!
//! The cache keeps one auxiliary database file next to the cached images,
//! holding a single table:
//!
//! ```text
//! cached_images(image_id TEXT PRIMARY KEY, last_accessed REAL, last_modified REAL,
//!               size INTEGER, hits INTEGER, checksum TEXT)
//! ```
//!
//! The directory tree stays the source of truth for *which* images are
//! cached; the database only answers questions the filesystem can't answer
//! cheaply or reliably (hit counts, access order, checksums). Several
//! processes share the file, so connections are short-lived and lock
//! contention is retried with a deadline (see [`retry`]).

mod db;
pub mod error;
mod models;
mod repo;
pub mod retry;

pub use crate::db::Database;
pub use crate::repo::Repository;
