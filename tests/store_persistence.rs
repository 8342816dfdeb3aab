//! On-disk behavior of the response store across restarts and generations.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use isr_cache::cache::{CacheConfig, CacheEntry, CacheStore, GenerationManifest, MANIFEST_FILE};

fn config(root: &Path, generation: &str, max_bytes: usize) -> CacheConfig {
    CacheConfig {
        root_dir: root.to_path_buf(),
        generation: generation.to_string(),
        max_bytes,
        index_flush_debounce_ms: 10,
        ..CacheConfig::default()
    }
}

fn entry(body: &'static [u8]) -> CacheEntry {
    CacheEntry {
        body: Bytes::from_static(body),
        headers: vec![(
            "content-type".to_string(),
            Bytes::from_static(b"text/plain"),
        )],
        status: 200,
        cached_at_ms: 1_700_000_000_000,
        s_maxage: 60,
        swr: 30,
    }
}

#[tokio::test]
async fn entries_round_trip_through_a_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = CacheStore::open(config(dir.path(), "g", 1_000)).await.unwrap();
        assert!(store.set("/one", entry(&[1, 2, 3])));
        assert!(store.set("/two", entry(&[4, 5, 6])));
        store.save().await;
    }

    let store = CacheStore::open(config(dir.path(), "g", 1_000)).await.unwrap();
    let one = store.get("/one").await.expect("first entry restored");
    let two = store.get("/two").await.expect("second entry restored");

    assert_eq!(one.body.as_ref(), &[1, 2, 3]);
    assert_eq!(two.body.as_ref(), &[4, 5, 6]);
    assert_eq!(one.headers, entry(&[1, 2, 3]).headers);
    assert_eq!(one.cached_at_ms, 1_700_000_000_000);
    assert_eq!((one.s_maxage, one.swr), (60, 30));
}

#[tokio::test]
async fn drop_flushes_pending_index_changes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let slow_flush = CacheConfig {
            index_flush_debounce_ms: 60_000,
            ..config(dir.path(), "g", 1_000)
        };
        let store = CacheStore::open(slow_flush).await.unwrap();
        store.set("/late", entry(b"late"));
        // The entry write lands; the debounced index flush does not.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let store = CacheStore::open(config(dir.path(), "g", 1_000)).await.unwrap();
    assert!(store.get("/late").await.is_some());
}

#[tokio::test]
async fn new_generation_vacuums_the_previous_one_only() {
    let dir = tempfile::tempdir().unwrap();
    let stray = dir.path().join("hand-made");
    std::fs::create_dir_all(&stray).unwrap();

    {
        let store = CacheStore::open(config(dir.path(), "A", 1_000)).await.unwrap();
        store.set("/a", entry(b"a"));
        store.save().await;
    }
    assert!(dir.path().join("A").exists());

    let store = CacheStore::open(config(dir.path(), "B", 1_000)).await.unwrap();

    assert!(!dir.path().join("A").exists());
    assert!(dir.path().join("B").exists());
    assert!(stray.exists(), "directories never recorded must survive");
    assert!(store.get("/a").await.is_none());

    let manifest = GenerationManifest::load(dir.path()).await.unwrap();
    assert_eq!(manifest.generations, vec!["B"]);
}

#[tokio::test]
async fn garbage_index_yields_an_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = CacheStore::open(config(dir.path(), "g", 1_000)).await.unwrap();
        store.set("/a", entry(b"a"));
        store.save().await;
    }
    std::fs::write(dir.path().join("g").join("index.json"), b"\x00not json{{").unwrap();

    let store = CacheStore::open(config(dir.path(), "g", 1_000)).await.unwrap();
    assert_eq!(store.stats().disk_entries, 0);
    assert!(store.get("/a").await.is_none());
}

#[tokio::test]
async fn garbage_manifest_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("old")).unwrap();
    std::fs::write(dir.path().join(MANIFEST_FILE), "][").unwrap();

    let store = CacheStore::open(config(dir.path(), "g", 1_000)).await.unwrap();

    assert_eq!(store.stats().disk_entries, 0);
    assert!(dir.path().join("old").exists());
}

#[tokio::test]
async fn evicted_entries_reload_after_restart_with_smaller_budget() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = CacheStore::open(config(dir.path(), "g", 10_000)).await.unwrap();
        store.set("/x", entry(&[7; 64]));
        store.set("/y", entry(&[8; 64]));
        store.save().await;
    }

    let store = CacheStore::open(config(dir.path(), "g", 150)).await.unwrap();
    assert_eq!(store.get("/x").await.unwrap().body.as_ref(), &[7; 64]);
    assert_eq!(store.get("/y").await.unwrap().body.as_ref(), &[8; 64]);
    assert!(!store.in_memory("/x"), "budget only fits one entry at a time");
    assert!(store.get("/x").await.is_some());
    assert!(store.stats().memory_bytes <= 150);
}
