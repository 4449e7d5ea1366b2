use std::sync::Arc;
use std::time::Duration;

use courier_cache::cache::{
    CacheConfig, FileStorage, ManualClock, MemorySink, PersistentCache, StorageProvider,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DraftOrder {
    pickup: String,
    items: Vec<String>,
}

fn draft() -> DraftOrder {
    DraftOrder {
        pickup: "Dock 4".to_string(),
        items: vec!["crate".to_string(), "pallet".to_string()],
    }
}

fn open(
    dir: &std::path::Path,
    clock: Arc<ManualClock>,
    quota: Option<u64>,
) -> (PersistentCache, Arc<FileStorage>) {
    let storage = Arc::new(FileStorage::open(dir, quota).expect("storage should open"));
    let cache = PersistentCache::new(
        storage.clone(),
        &CacheConfig::default(),
        clock,
        Arc::new(MemorySink::new()),
    );
    (cache, storage)
}

#[tokio::test]
async fn round_trip_then_expire() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    let (cache, _) = open(dir.path(), clock.clone(), None);
    assert!(cache.is_available());

    cache
        .save_with_ttl("draft:checkout", &draft(), Duration::from_millis(1_000))
        .await;
    assert_eq!(cache.load::<DraftOrder>("draft:checkout").await, Some(draft()));
    assert_eq!(cache.size(), 1);

    clock.advance(Duration::from_millis(1_001));
    assert_eq!(cache.load::<DraftOrder>("draft:checkout").await, None);
    assert_eq!(cache.size(), 0);
}

#[tokio::test]
async fn entries_survive_reopen_until_expired() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    {
        let (cache, _) = open(dir.path(), clock.clone(), None);
        cache
            .save_with_ttl("short", &draft(), Duration::from_secs(1))
            .await;
        cache
            .save_with_ttl("long", &draft(), Duration::from_secs(3_600))
            .await;
    }

    clock.advance(Duration::from_secs(2));
    let (reopened, storage) = open(dir.path(), clock, None);

    assert_eq!(reopened.size(), 1);
    assert_eq!(reopened.load::<DraftOrder>("long").await, Some(draft()));
    assert!(
        storage
            .keys()
            .expect("keys")
            .contains(&"courier-cache-expiry".to_string())
    );
}

#[tokio::test]
async fn quota_pressure_reclaims_soonest_expiring_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    // Room for a handful of small entries plus the index.
    let (cache, _) = open(dir.path(), clock, Some(900));

    for i in 0..20u64 {
        cache
            .save_with_ttl(&format!("k{i:02}"), &i, Duration::from_secs(100 + i))
            .await;
    }

    // The newest write always lands; the earliest-expiring ones were reclaimed.
    assert_eq!(cache.load::<u64>("k19").await, Some(19));
    assert_eq!(cache.load::<u64>("k00").await, None);
    assert!(cache.size() < 20);
}

#[tokio::test]
async fn clear_all_empties_directory_of_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    let (cache, storage) = open(dir.path(), clock, None);
    cache.save("a", &1).await;
    cache.save("b", &2).await;

    assert_eq!(cache.clear_all().await, 2);
    assert!(storage.keys().expect("keys").is_empty());
}

#[tokio::test]
async fn long_keys_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    let (cache, storage) = open(dir.path(), clock, None);

    let key = format!(
        "orders:list:{}",
        "status=new&zone=north&courier=any&sort=eta&".repeat(6)
    );
    cache.save(&key, &draft()).await;

    assert_eq!(cache.load::<DraftOrder>(&key).await, Some(draft()));
    assert!(
        storage
            .keys()
            .expect("keys")
            .contains(&format!("courier-cache:{key}"))
    );
    cache.remove(&key).await;
    assert_eq!(cache.size(), 0);
}

#[tokio::test]
async fn write_whose_index_record_overflows_quota_leaves_nothing_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    // The entry file alone fits; entry plus expiry index does not.
    let (cache, storage) = open(dir.path(), clock.clone(), Some(145));

    cache
        .save_with_ttl("a", &"x".repeat(20), Duration::from_millis(10))
        .await;
    assert_eq!(cache.size(), 0);
    assert!(storage.keys().expect("keys").is_empty());

    clock.advance(Duration::from_millis(100));
    cache.save("b", "1").await;
    assert_eq!(cache.load::<String>("b").await.as_deref(), Some("1"));
}
