use crate::error::{Error, ErrorKind, Result};
use exn::ResultExt;
use imgcache_storage::CachedImage;
use time::{OffsetDateTime, UtcDateTime};

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Seconds since the Unix epoch, as stored in the `REAL` timestamp columns.
pub(crate) fn to_timestamp(datetime: UtcDateTime) -> f64 {
    datetime.unix_timestamp() as f64 + f64::from(datetime.nanosecond()) / NANOS_PER_SECOND
}

/// Whole seconds and the fraction are converted separately: scaling the
/// whole value to nanoseconds first would go through an `f64` that can't
/// hold current timestamps at nanosecond precision.
pub(crate) fn from_timestamp(seconds: f64, field: &'static str) -> Result<OffsetDateTime> {
    if !seconds.is_finite() {
        exn::bail!(ErrorKind::InvalidData(field));
    }
    let whole = seconds.trunc();
    let nanos = ((seconds - whole) * NANOS_PER_SECOND).round() as i64;
    OffsetDateTime::from_unix_timestamp(whole as i64)
        .or_raise(|| ErrorKind::InvalidData(field))?
        .checked_add(time::Duration::nanoseconds(nanos))
        .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidData(field)))
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CachedImageRow {
    image_id: String,
    last_accessed: f64,
    last_modified: f64,
    size: i64,
    hits: i64,
    checksum: Option<String>,
}
impl CachedImageRow {
    pub(crate) fn image_id(&self) -> &str {
        &self.image_id
    }
}
impl TryFrom<CachedImageRow> for CachedImage {
    type Error = Error;
    fn try_from(row: CachedImageRow) -> Result<Self> {
        Ok(Self {
            image_id: row.image_id,
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("size"))?,
            hits: u64::try_from(row.hits).or_raise(|| ErrorKind::InvalidData("hit count"))?,
            last_accessed: from_timestamp(row.last_accessed, "last access time")?,
            last_modified: from_timestamp(row.last_modified, "modification time")?,
            checksum: row.checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_to_model() {
        let row = CachedImageRow {
            image_id: "abc".to_string(),
            last_accessed: 0.0,
            last_modified: 1_700_000_000.25,
            size: 1024,
            hits: 3,
            checksum: Some("af1349b9".to_string()),
        };
        let model = CachedImage::try_from(row).unwrap();
        assert_eq!(model.size, 1024);
        assert_eq!(model.hits, 3);
        assert_eq!(model.last_accessed, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(model.last_modified.unix_timestamp(), 1_700_000_000);
        assert_eq!(model.last_modified.millisecond(), 250);
    }

    #[test]
    fn test_negative_size_is_invalid() {
        let row = CachedImageRow {
            image_id: "abc".to_string(),
            last_accessed: 0.0,
            last_modified: 0.0,
            size: -1,
            hits: 0,
            checksum: None,
        };
        let err = CachedImage::try_from(row).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("size")));
    }

    #[test]
    fn test_timestamp_round_trip_keeps_milliseconds() {
        let now = UtcDateTime::now();
        let restored = from_timestamp(to_timestamp(now), "test").unwrap();
        let drift = (restored.unix_timestamp_nanos() - now.unix_timestamp_nanos()).abs();
        assert!(drift < 1_000_000, "drift of {drift}ns");
    }

    #[test]
    fn test_non_finite_timestamp_is_invalid() {
        assert!(from_timestamp(f64::NAN, "test").is_err());
        assert!(from_timestamp(f64::INFINITY, "test").is_err());
        assert!(from_timestamp(1e300, "test").is_err());
    }

    #[test]
    fn test_fractional_timestamps_keep_their_milliseconds() {
        let datetime = from_timestamp(1_760_000_000.125, "test").unwrap();
        assert_eq!(datetime.unix_timestamp(), 1_760_000_000);
        assert_eq!(datetime.millisecond(), 125);
        let datetime = from_timestamp(-1.5, "test").unwrap();
        assert_eq!(datetime.unix_timestamp_nanos(), -1_500_000_000);
    }
}
