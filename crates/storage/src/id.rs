//! Image identifier validation.
//!
//! Image ids are opaque to the cache, but they double as file names in every
//! area of the layout, so they must be a single, plain path component.

use std::path::{Component, Path};

use crate::error::{ErrorKind, Result};
use crate::layout::Area;

/// Validates an image id for use as a file name inside the cache.
///
/// Rejects anything that is not exactly one normal path component (so no
/// separators, `.` or `..`), ids containing null bytes, and ids that collide
/// with the names of the layout's own subdirectories.
///
/// # Examples
///
/// ```
/// use imgcache_storage::validate_image_id;
/// assert!(validate_image_id("71c675ab-d94f-49cd-a114-e12490b328d9").is_ok());
/// assert!(validate_image_id("42").is_ok());
/// assert!(validate_image_id("../etc/passwd").is_err());
/// assert!(validate_image_id("a/b").is_err());
/// assert!(validate_image_id("queue").is_err());
/// assert!(validate_image_id("").is_err());
/// ```
pub fn validate(id: &str) -> Result<&str> {
    let invalid = || exn::Exn::from(ErrorKind::InvalidImageId(id.to_string()));
    // Null bytes pass through Path::components() on Unix but cause
    // truncation in C-based syscalls.
    if id.is_empty() || id.contains('\0') || id.contains('/') || id.contains('\\') {
        return Err(invalid());
    }
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == id => {},
        _ => return Err(invalid()),
    }
    if Area::SUBDIRECTORIES.iter().any(|area| area.dir_name() == Some(id)) {
        return Err(invalid());
    }
    Ok(id)
}
