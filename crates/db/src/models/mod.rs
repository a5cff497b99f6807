mod image;

pub(crate) use self::image::{CachedImageRow, to_timestamp};
