//! On-disk layout and storage backends for the image cache.
//!
//! The cache directory tree doubles as the state machine of every cached
//! image: which subdirectory a file lives in says whether it is queued, being
//! written, cached or invalid. This crate owns that convention ([`Layout`],
//! [`Area`], [`EntryState`]) and the [`StorageBackend`] trait that reads and
//! mutates it, plus the optional [`TagStore`] capability used to hang small
//! key/value attributes off an entry.

pub mod backend;
pub mod error;
mod id;
mod layout;
mod models;

pub use crate::backend::{StorageBackend, TagStore};
pub use crate::id::validate as validate_image_id;
pub use crate::layout::{Area, EntryState, Layout};
pub use crate::models::{CachedImage, EntryStat};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend>;
pub type TaggedHandle = Arc<dyn TagStore>;
