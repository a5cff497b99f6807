//! Directory convention of the cache root.
//!
//! ```text
//! $root/
//!   entry1
//!   entry2
//!   ...
//!   incomplete/
//!   invalid/
//!   queue/
//! ```

use derive_more::Display;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// One of the directories of the cache layout.
///
/// Which area a file lives in encodes the state of the image it belongs to.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Area {
    /// The cache root itself; fully written, committed images.
    #[display("cached")]
    Cached,
    /// Images currently being written.
    #[display("incomplete")]
    Incomplete,
    /// Images whose write failed; kept around for debugging until reaped.
    #[display("invalid")]
    Invalid,
    /// Empty marker files for images requested for deferred caching.
    #[display("queue")]
    Queue,
}
impl Area {
    pub const ALL: [Area; 4] = [Area::Cached, Area::Incomplete, Area::Invalid, Area::Queue];
    pub const SUBDIRECTORIES: [Area; 3] = [Area::Incomplete, Area::Invalid, Area::Queue];

    /// Name of the subdirectory for this area, or `None` for the root.
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            Self::Cached => None,
            Self::Incomplete => Some("incomplete"),
            Self::Invalid => Some("invalid"),
            Self::Queue => Some("queue"),
        }
    }
}

/// Resolves areas and image ids to absolute paths below a cache root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}
impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, area: Area) -> PathBuf {
        match area.dir_name() {
            Some(name) => self.root.join(name),
            None => self.root.clone(),
        }
    }

    /// Path of `image_id` in `area`. The id must already be validated.
    pub fn path(&self, area: Area, image_id: &str) -> PathBuf {
        self.dir(area).join(image_id)
    }
}

/// Lifecycle state of a single image, as derived from the layout.
///
/// ```text
///            queue_image()                 commit()
/// Absent ──────────────────▶ Queued ──▶ Writing ──────────▶ Cached
///                                          │ failure
///                                          ▼
///                                       Invalid
/// ```
///
/// Under normal operation only one of these holds at a time. Nothing locks
/// that in place, so when several areas hold the same id the most advanced
/// state wins: `Cached`, then `Writing`, `Invalid` and `Queued`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    #[display("absent")]
    Absent,
    #[display("queued")]
    Queued,
    #[display("writing")]
    Writing,
    #[display("cached")]
    Cached,
    #[display("invalid")]
    Invalid,
}
impl EntryState {
    /// The state implied by an image being present in the given areas.
    pub fn from_presence(cached: bool, incomplete: bool, invalid: bool, queued: bool) -> Self {
        match (cached, incomplete, invalid, queued) {
            (true, ..) => Self::Cached,
            (false, true, ..) => Self::Writing,
            (false, false, true, _) => Self::Invalid,
            (false, false, false, true) => Self::Queued,
            (false, false, false, false) => Self::Absent,
        }
    }

    /// The area a file lives in for this state, if any.
    pub fn area(&self) -> Option<Area> {
        match self {
            Self::Absent => None,
            Self::Queued => Some(Area::Queue),
            Self::Writing => Some(Area::Incomplete),
            Self::Cached => Some(Area::Cached),
            Self::Invalid => Some(Area::Invalid),
        }
    }
}
