//! Behaviour every driver must share, run against both of them.
//!
//! The xattr driver runs on the in-memory backend (the test machine's
//! filesystem may not support user attributes), the sqlite driver on a real
//! temporary directory.

use crate::cache::ImageCache;
use crate::error::ErrorKind;
use imgcache_config::{Config, DriverKind};
use imgcache_storage::backend::MockBackend;
use imgcache_storage::{Area, EntryState, Layout, StorageBackend};
use rstest::rstest;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use time::UtcDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct Harness {
    cache: ImageCache,
    mock: Option<MockBackend>,
    temp_dir: tempfile::TempDir,
}

impl Harness {
    async fn new(driver: DriverKind) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config { dir: temp_dir.path().to_path_buf(), driver, stall_time: 60, ..Config::default() };
        match driver {
            DriverKind::Xattr => {
                let mock = MockBackend::default();
                let cache = ImageCache::with_backend(&config, Arc::new(mock.clone())).await.unwrap();
                Self { cache, mock: Some(mock), temp_dir }
            },
            DriverKind::Sqlite => {
                let cache = ImageCache::open(&config).await.unwrap();
                Self { cache, mock: None, temp_dir }
            },
        }
    }

    fn storage(&self) -> &dyn StorageBackend {
        self.cache.storage()
    }

    async fn write(&self, image_id: &str, data: &[u8]) {
        let mut session = self.cache.open_for_write(image_id).await.unwrap();
        session.write_all(data).await.unwrap();
        session.commit().await.unwrap();
    }

    async fn read(&self, image_id: &str) -> Vec<u8> {
        let mut session = self.cache.open_for_read(image_id).await.unwrap();
        let mut data = Vec::new();
        session.read_to_end(&mut data).await.unwrap();
        assert!(session.finish().await.unwrap());
        data
    }

    /// Backdate the modification time of a file.
    fn age(&self, area: Area, image_id: &str, seconds: u64) {
        match &self.mock {
            Some(mock) => {
                let modified = UtcDateTime::now() - time::Duration::seconds(seconds.cast_signed());
                mock.set_modified(area, image_id, modified);
            },
            None => {
                let path = Layout::new(self.temp_dir.path()).path(area, image_id);
                let file = std::fs::File::options().write(true).open(path).unwrap();
                let modified = SystemTime::now() - Duration::from_secs(seconds);
                file.set_times(std::fs::FileTimes::new().set_modified(modified)).unwrap();
            },
        }
    }
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_configured_driver(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    assert_eq!(harness.cache.name(), driver.to_string());
    for area in [Area::Incomplete, Area::Invalid, Area::Queue] {
        assert!(harness.storage().list(area).await.unwrap().is_empty());
    }
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_queue_on_empty_cache(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    assert!(harness.cache.queue_image("abc").await.unwrap());
    assert!(harness.cache.is_queued("abc").await.unwrap());
    assert!(harness.cache.is_cacheable("abc").await.unwrap());
    assert_eq!(harness.cache.entry_state("abc").await.unwrap(), EntryState::Queued);
    assert!(!harness.cache.queue_image("abc").await.unwrap());
    assert_eq!(harness.cache.get_queued_images().await.unwrap(), vec!["abc"]);
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_commit_caches_and_dequeues(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    harness.cache.queue_image("abc").await.unwrap();
    harness.write("abc", b"hello").await;
    assert!(harness.cache.is_cached("abc").await.unwrap());
    assert!(!harness.cache.is_queued("abc").await.unwrap());
    assert!(!harness.cache.is_being_cached("abc").await.unwrap());
    assert!(!harness.cache.is_cacheable("abc").await.unwrap());
    assert_eq!(harness.cache.entry_state("abc").await.unwrap(), EntryState::Cached);
    assert_eq!(harness.cache.get_hit_count("abc").await.unwrap(), 0);
    assert_eq!(harness.cache.get_image_size("abc").await.unwrap(), 5);
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_reads_count_hits(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    harness.write("abc", b"hello").await;
    for expected in 1..=3 {
        assert_eq!(harness.read("abc").await, b"hello");
        assert_eq!(harness.cache.get_hit_count("abc").await.unwrap(), expected);
    }
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_recommit_resets_hits(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    harness.write("abc", b"hello").await;
    harness.read("abc").await;
    harness.write("abc", b"hello again").await;
    assert_eq!(harness.cache.get_hit_count("abc").await.unwrap(), 0);
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_failed_write_is_invalid(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    let mut session = harness.cache.open_for_write("xyz").await.unwrap();
    session.write_all(b"hel").await.unwrap();
    assert!(harness.cache.is_being_cached("xyz").await.unwrap());
    assert!(!harness.cache.is_cacheable("xyz").await.unwrap());
    let cause = session.rollback("connection reset").await;
    assert_eq!(cause, "connection reset");
    assert!(!harness.cache.is_cached("xyz").await.unwrap());
    assert!(harness.storage().exists(Area::Invalid, "xyz").await.unwrap());
    assert_eq!(harness.cache.entry_state("xyz").await.unwrap(), EntryState::Invalid);
    assert_eq!(harness.cache.get_hit_count("xyz").await.unwrap(), 0);
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_queue_refused_when_cached_or_writing(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    harness.write("abc", b"hello").await;
    let session = harness.cache.open_for_write("xyz").await.unwrap();
    assert!(!harness.cache.queue_image("abc").await.unwrap());
    assert!(!harness.cache.queue_image("xyz").await.unwrap());
    assert!(harness.storage().list(Area::Queue).await.unwrap().is_empty());
    session.rollback("done").await;
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_least_recently_accessed(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    assert_eq!(harness.cache.get_least_recently_accessed().await.unwrap(), None);
    harness.write("first", b"12345").await;
    harness.write("second", b"123").await;
    harness.read("first").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.read("second").await;
    assert_eq!(harness.cache.get_least_recently_accessed().await.unwrap(), Some(("first".to_string(), 5)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.read("first").await;
    assert_eq!(harness.cache.get_least_recently_accessed().await.unwrap(), Some(("second".to_string(), 3)));
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_cached_images_listing(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    harness.write("b", b"123").await;
    harness.write("a", b"12345").await;
    harness.read("b").await;
    let images = harness.cache.get_cached_images().await.unwrap();
    let summary: Vec<_> = images.iter().map(|image| (image.image_id.as_str(), image.size, image.hits)).collect();
    assert_eq!(summary, vec![("a", 5, 0), ("b", 3, 1)]);
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_size_counts_only_images(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    assert_eq!(harness.cache.get_cache_size().await.unwrap(), 0);
    harness.write("abc", b"hello").await;
    harness.cache.queue_image("queued").await.unwrap();
    harness.storage().write(Area::Invalid, "bad", b"garbage").await.unwrap();
    assert_eq!(harness.cache.get_cache_size().await.unwrap(), 5);
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_delete_cached_images(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    for image_id in ["a", "b", "c"] {
        harness.write(image_id, b"data").await;
    }
    harness.read("a").await;
    assert!(harness.cache.delete_cached_image("a").await.unwrap());
    assert!(!harness.cache.delete_cached_image("a").await.unwrap());
    assert_eq!(harness.cache.get_hit_count("a").await.unwrap(), 0);
    assert_eq!(harness.cache.delete_all_cached_images().await.unwrap(), 2);
    assert!(harness.cache.get_cached_images().await.unwrap().is_empty());
    assert_eq!(harness.cache.get_least_recently_accessed().await.unwrap(), None);
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_delete_queued_images(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    for image_id in ["a", "b", "c"] {
        harness.cache.queue_image(image_id).await.unwrap();
    }
    assert!(harness.cache.delete_queued_image("a").await.unwrap());
    assert!(!harness.cache.delete_queued_image("a").await.unwrap());
    assert_eq!(harness.cache.delete_all_queued_images().await.unwrap(), 2);
    assert!(harness.cache.get_queued_images().await.unwrap().is_empty());
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_queued_images_oldest_first(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    for (image_id, age) in [("young", 10), ("old", 300), ("middle", 100)] {
        harness.cache.queue_image(image_id).await.unwrap();
        harness.age(Area::Queue, image_id, age);
    }
    assert_eq!(harness.cache.get_queued_images().await.unwrap(), vec!["old", "middle", "young"]);
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_reap_stalled_with_grace(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    for (image_id, age) in [("old", 120), ("young", 10)] {
        harness.storage().write(Area::Incomplete, image_id, b"partial").await.unwrap();
        harness.age(Area::Incomplete, image_id, age);
    }
    assert_eq!(harness.cache.reap_stalled(Some(Duration::from_secs(60))).await.unwrap(), 1);
    assert!(!harness.cache.is_being_cached("old").await.unwrap());
    assert!(harness.cache.is_being_cached("young").await.unwrap());
    assert_eq!(harness.cache.reap_stalled(Some(Duration::ZERO)).await.unwrap(), 1);
    assert!(!harness.cache.is_being_cached("young").await.unwrap());
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_reap_stalled_defaults_to_stall_time(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    for (image_id, age) in [("old", 120), ("young", 10)] {
        harness.storage().write(Area::Incomplete, image_id, b"partial").await.unwrap();
        harness.age(Area::Incomplete, image_id, age);
    }
    // The harness configures a 60 second stall time.
    assert_eq!(harness.cache.reap_stalled(None).await.unwrap(), 1);
    assert!(!harness.cache.is_being_cached("old").await.unwrap());
    assert!(harness.cache.is_being_cached("young").await.unwrap());
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_clean(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    harness.storage().write(Area::Invalid, "broken", b"bad").await.unwrap();
    for (image_id, age) in [("stalled", 120), ("active", 10)] {
        harness.storage().write(Area::Incomplete, image_id, b"partial").await.unwrap();
        harness.age(Area::Incomplete, image_id, age);
    }
    // The harness configures a 60 second stall time.
    assert_eq!(harness.cache.clean(None).await.unwrap(), (1, 1));
    assert!(harness.storage().list(Area::Invalid).await.unwrap().is_empty());
    assert!(harness.cache.is_being_cached("active").await.unwrap());
    assert_eq!(harness.cache.clean(Some(Duration::from_secs(5))).await.unwrap(), (0, 1));
}

#[rstest]
#[case::xattr(DriverKind::Xattr)]
#[case::sqlite(DriverKind::Sqlite)]
#[tokio::test]
async fn test_missing_and_invalid_ids(#[case] driver: DriverKind) {
    let harness = Harness::new(driver).await;
    assert_eq!(harness.cache.get_hit_count("missing").await.unwrap(), 0);
    assert_eq!(harness.cache.entry_state("missing").await.unwrap(), EntryState::Absent);
    let err = harness.cache.get_image_size("missing").await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::NotCached(_)));
    let err = harness.cache.is_cached("../cache.db").await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::InvalidImageId(_)));
    let err = harness.cache.queue_image("").await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::InvalidImageId(_)));
}
