//! Repository over the `cached_images` table.
//!
//! A row exists for every committed image and nothing else: it is written
//! when a write session commits and removed on rollback or eviction. Every
//! method runs in its own [`scoped()`](Database::scoped) transaction, so a
//! database error degrades to a conservative default (no hits, no rows,
//! nothing changed) after being logged.

use crate::Database;
use crate::error::Result;
use crate::models::{CachedImageRow, to_timestamp};
use imgcache_storage::{CachedImage, EntryStat};
use time::UtcDateTime;

/// Repository for the per-image metadata rows.
#[derive(Debug, Clone)]
pub struct Repository {
    db: Database,
}
impl Repository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    /// Stored hit counter of an image; 0 if there is no row.
    pub async fn hits(&self, image_id: &str) -> Result<u64> {
        let image_id = image_id.to_string();
        let hits: Option<Option<(i64,)>> = self
            .db
            .scoped("get_hits", move |conn| {
                let image_id = image_id.clone();
                Box::pin(async move {
                    sqlx::query_as(include_str!("../queries/get_hits.sql")).bind(image_id).fetch_optional(conn).await
                })
            })
            .await?;
        Ok(hits.flatten().and_then(|(hits,)| u64::try_from(hits).ok()).unwrap_or(0))
    }

    /// All rows, ordered by image id. Rows holding values that don't fit the
    /// model are logged and left out.
    pub async fn list(&self) -> Result<Vec<CachedImage>> {
        let rows: Option<Vec<CachedImageRow>> = self
            .db
            .scoped("list_cached_images", |conn| {
                Box::pin(async move { sqlx::query_as(include_str!("../queries/list_cached_images.sql")).fetch_all(conn).await })
            })
            .await?;
        Ok(rows
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| {
                let image_id = row.image_id().to_string();
                CachedImage::try_from(row)
                    .inspect_err(|e| tracing::error!(%image_id, error = ?e, "Skipping unreadable metadata row"))
                    .ok()
            })
            .collect())
    }

    // =========================================================================
    // Insert/Update
    // =========================================================================

    /// Record a freshly committed image: zero hits, never accessed, modified
    /// now. Replaces any stale row left behind by an earlier attempt.
    ///
    /// Returns `false` if the row could not be written.
    pub async fn insert(&self, image_id: &str, size: u64, checksum: Option<&str>) -> Result<bool> {
        let image_id = image_id.to_string();
        let checksum = checksum.map(str::to_string);
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let now = to_timestamp(UtcDateTime::now());
        let written = self
            .db
            .scoped("insert_cached_image", move |conn| {
                let (image_id, checksum) = (image_id.clone(), checksum.clone());
                Box::pin(async move {
                    sqlx::query(include_str!("../queries/insert_cached_image.sql"))
                        .bind(image_id)
                        .bind(now)
                        .bind(size)
                        .bind(checksum)
                        .execute(conn)
                        .await
                })
            })
            .await?;
        Ok(written.is_some())
    }

    /// Count one more completed read of the file described by `stat` and
    /// stamp the access time.
    ///
    /// Unlike the extended attribute counter this is a single statement, so
    /// concurrent readers don't lose hits. A file without a row gets one,
    /// starting at one hit. Returns `false` if nothing could be written.
    pub async fn record_hit(&self, stat: &EntryStat) -> Result<bool> {
        let image_id = stat.image_id.clone();
        let size = i64::try_from(stat.size).unwrap_or(i64::MAX);
        let modified = to_timestamp(stat.modified);
        let now = to_timestamp(UtcDateTime::now());
        let updated = self
            .db
            .scoped("record_hit", move |conn| {
                let image_id = image_id.clone();
                Box::pin(async move {
                    sqlx::query(include_str!("../queries/record_hit.sql"))
                        .bind(image_id)
                        .bind(now)
                        .bind(modified)
                        .bind(size)
                        .execute(conn)
                        .await
                })
            })
            .await?;
        Ok(updated.is_some_and(|result| result.rows_affected() > 0))
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove the row of an image. Returns `false` if there was none.
    pub async fn delete(&self, image_id: &str) -> Result<bool> {
        let image_id = image_id.to_string();
        let deleted = self
            .db
            .scoped("delete_cached_image", move |conn| {
                let image_id = image_id.clone();
                Box::pin(async move {
                    sqlx::query(include_str!("../queries/delete_cached_image.sql")).bind(image_id).execute(conn).await
                })
            })
            .await?;
        Ok(deleted.is_some_and(|result| result.rows_affected() > 0))
    }

    /// Remove every row, returning how many there were.
    pub async fn delete_all(&self) -> Result<u64> {
        let deleted = self
            .db
            .scoped("delete_all_cached_images", |conn| {
                Box::pin(async move {
                    sqlx::query(include_str!("../queries/delete_all_cached_images.sql")).execute(conn).await
                })
            })
            .await?;
        Ok(deleted.map(|result| result.rows_affected()).unwrap_or(0))
    }
}
