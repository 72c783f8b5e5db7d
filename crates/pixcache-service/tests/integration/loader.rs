use pixcache_service::caching::{MemoryCache, ResourceKey, Store};
use pixcache_service::decode::ImageDecoder;
use pixcache_service::dispatch::{Dispatcher, InlineContext, channel_context};
use pixcache_service::loader::LoadStatus;

use crate::utils::{Harness, TestSlot, corrupt_png, png, shade_of};

fn key(k: &str) -> ResourceKey {
    ResourceKey::new(k).unwrap()
}

#[tokio::test]
async fn test_load_then_memory_hit() {
    let h = Harness::new();
    h.serve("a.png", 0);

    let slot = TestSlot::new("a.png");
    assert_eq!(h.load(&slot, "a.png"), LoadStatus::Pending);
    assert_eq!(slot.placeholders(), 1);
    assert!(h.loader.is_loading("a.png"));

    assert_eq!(h.executor.run_all().await, 1);
    assert_eq!(slot.applied_keys(), vec!["a.png"]);
    assert_eq!(h.fetcher.fetches("a.png"), 1);
    assert_eq!(h.store().writes(), 1);
    assert!(!h.loader.is_loading("a.png"));

    let other = TestSlot::new("a.png");
    assert_eq!(h.load(&other, "a.png"), LoadStatus::Hit);
    assert_eq!(other.applied_keys(), vec!["a.png"]);
    assert_eq!(other.placeholders(), 0);
    assert_eq!(h.executor.submitted(), 1);
}

#[tokio::test]
async fn test_empty_key_is_ignored() {
    let h = Harness::new();

    let slot = TestSlot::new("");
    assert_eq!(h.load(&slot, "  "), LoadStatus::Ignored);
    assert_eq!(slot.placeholders(), 0);
    assert_eq!(h.executor.submitted(), 0);
    assert!(!h.loader.cancel(""));
}

#[tokio::test]
async fn test_dedup_queued() {
    let h = Harness::new();
    h.serve("a.png", 0);

    let slot1 = TestSlot::new("a.png");
    let slot2 = TestSlot::new("a.png");
    h.load(&slot1, "a.png");
    h.load(&slot2, "a.png");

    // the second load replaced the first unit before it got to run
    assert_eq!(h.executor.submitted(), 2);
    assert_eq!(h.executor.queued(), 1);

    assert_eq!(h.executor.run_all().await, 1);
    assert_eq!(h.fetcher.fetches("a.png"), 1);
    assert_eq!(h.store().writes(), 1);
    assert_eq!(slot1.applied_keys(), vec!["a.png"]);
    assert_eq!(slot2.applied_keys(), vec!["a.png"]);
}

#[tokio::test]
async fn test_dedup_running() {
    let h = Harness::new();
    h.serve("a.png", 0);
    h.fetcher.gate();

    let slot1 = TestSlot::new("a.png");
    h.load(&slot1, "a.png");
    let unit = h.executor.start_next().unwrap();
    let task = tokio::spawn(unit);
    h.fetcher.entered().await;

    // the first unit is in the middle of fetching, the second load joins it
    let slot2 = TestSlot::new("a.png");
    assert_eq!(h.load(&slot2, "a.png"), LoadStatus::Pending);
    assert_eq!(h.executor.submitted(), 1);

    h.fetcher.open();
    task.await.unwrap();

    assert_eq!(h.fetcher.total_fetches(), 1);
    assert_eq!(h.store().writes(), 1);
    assert_eq!(slot1.applied_keys(), vec!["a.png"]);
    assert_eq!(slot2.applied_keys(), vec!["a.png"]);
}

#[tokio::test]
async fn test_reused_slot_keeps_newer_image() {
    let h = Harness::new();
    h.serve("k1.png", 0);
    h.serve("k2.png", 10);

    let other = TestSlot::new("k2.png");
    h.load(&other, "k2.png");
    h.executor.run_all().await;

    let slot = TestSlot::new("k1.png");
    assert_eq!(h.load(&slot, "k1.png"), LoadStatus::Pending);

    // the slot is reused before the first load completes
    slot.want("k2.png");
    assert_eq!(h.load(&slot, "k2.png"), LoadStatus::Hit);

    h.executor.run_all().await;
    assert_eq!(slot.applied_keys(), vec!["k2.png"]);
    assert_eq!(shade_of(&slot.shown().unwrap()), 10);

    // the stale result was still cached for later
    assert!(h.loader.get_cached("k1.png").is_some());
}

#[tokio::test]
async fn test_interest_rechecked_on_consumer_context() {
    let (context, mut receiver) = channel_context();
    let h = Harness::with(
        MemoryCache::new(100, 1024 * 1024),
        ImageDecoder::default(),
        Dispatcher::new(context),
    );
    h.serve("k1.png", 0);

    let slot = TestSlot::new("k1.png");
    h.load(&slot, "k1.png");
    h.executor.run_all().await;

    // the result waits for the consumer, which moved on in the meantime
    slot.want("k2.png");
    assert_eq!(receiver.run_pending(), 1);
    assert!(slot.applied_keys().is_empty());

    let slot = TestSlot::new("k1.png");
    assert_eq!(h.load(&slot, "k1.png"), LoadStatus::Hit);
    assert_eq!(receiver.run_pending(), 0);
    assert_eq!(slot.applied_keys(), vec!["k1.png"]);
}

#[tokio::test]
async fn test_store_hit() {
    let h = Harness::new();

    let bytes = png(16, 16, 5);
    let store = h.store().inner();
    let staged = store.write_temp(&key("a.png"), &bytes).unwrap();
    store.promote(staged, &key("a.png")).unwrap();

    let slot = TestSlot::new("a.png");
    assert_eq!(h.load(&slot, "a.png"), LoadStatus::Pending);
    h.executor.run_all().await;

    assert_eq!(slot.applied_keys(), vec!["a.png"]);
    assert_eq!(slot.shown().unwrap().dimensions(), (16, 16));
    assert_eq!(shade_of(&slot.shown().unwrap()), 5);
    assert_eq!(h.fetcher.total_fetches(), 0);
    assert_eq!(h.store().writes(), 0);
}

#[tokio::test]
async fn test_corrupted_store_entry_is_refetched() {
    let h = Harness::new();
    let bytes = h.serve("a.png", 0);

    let store = h.store().inner();
    let staged = store.write_temp(&key("a.png"), b"garbage").unwrap();
    store.promote(staged, &key("a.png")).unwrap();

    let slot = TestSlot::new("a.png");
    h.load(&slot, "a.png");
    h.executor.run_all().await;

    assert_eq!(slot.applied_keys(), vec!["a.png"]);
    assert_eq!(h.fetcher.fetches("a.png"), 1);
    assert_eq!(
        h.store().inner().read(&key("a.png")).unwrap().as_deref(),
        Some(&bytes[..])
    );
}

#[tokio::test]
async fn test_corrupt_image_in_store_is_refetched() {
    let h = Harness::new();
    h.serve("a.png", 7);

    // signature, header and trailer are intact, the pixel data is not
    let store = h.store().inner();
    let staged = store
        .write_temp(&key("a.png"), &corrupt_png(png(16, 16, 3)))
        .unwrap();
    store.promote(staged, &key("a.png")).unwrap();

    let slot = TestSlot::new("a.png");
    h.load(&slot, "a.png");
    h.executor.run_all().await;

    assert_eq!(h.fetcher.fetches("a.png"), 1);
    assert_eq!(h.store().writes(), 1);
    assert_eq!(slot.applied_keys(), vec!["a.png"]);
    assert_eq!(shade_of(&slot.shown().unwrap()), 7);
}

#[tokio::test]
async fn test_fetch_failure_keeps_placeholder() {
    let h = Harness::new();

    let slot = TestSlot::new("missing.png");
    assert_eq!(h.load(&slot, "missing.png"), LoadStatus::Pending);
    h.executor.run_all().await;

    assert_eq!(h.fetcher.fetches("missing.png"), 1);
    assert!(slot.applied_keys().is_empty());
    assert_eq!(slot.placeholders(), 1);
    assert_eq!(h.store().writes(), 0);
    assert!(h.loader.memory().is_empty());
    assert!(!h.loader.is_loading("missing.png"));
}

#[tokio::test]
async fn test_out_of_memory_clears_cache() {
    let h = Harness::with(
        MemoryCache::new(100, 1024 * 1024),
        ImageDecoder::new(Some(1024 * 1024)),
        Dispatcher::new(InlineContext),
    );
    h.serve("small.png", 0);
    h.fetcher.insert("big.png", png(1024, 1024, 0));

    let small = TestSlot::new("small.png");
    h.load(&small, "small.png");
    h.executor.run_all().await;
    assert_eq!(h.loader.memory().len(), 1);

    let big = TestSlot::new("big.png");
    h.load(&big, "big.png");
    h.executor.run_all().await;

    assert!(h.loader.memory().is_empty());
    assert_eq!(h.loader.memory().total_size(), 0);
    assert!(big.applied_keys().is_empty());
    assert_eq!(big.placeholders(), 1);
}

#[tokio::test]
async fn test_cancel_queued() {
    let h = Harness::new();
    h.serve("a.png", 0);

    let slot = TestSlot::new("a.png");
    h.load(&slot, "a.png");
    assert!(h.loader.cancel("a.png"));
    assert!(!h.loader.cancel("a.png"));
    assert_eq!(h.executor.queued(), 0);

    assert_eq!(h.executor.run_all().await, 0);
    assert_eq!(h.fetcher.total_fetches(), 0);
    assert_eq!(h.store().reads(), 0);
    assert!(slot.applied_keys().is_empty());
}

#[tokio::test]
async fn test_cancel_running() {
    let h = Harness::new();
    h.serve("a.png", 0);
    h.fetcher.gate();

    let slot = TestSlot::new("a.png");
    h.load(&slot, "a.png");
    let unit = h.executor.start_next().unwrap();
    let task = tokio::spawn(unit);
    h.fetcher.entered().await;

    assert!(h.loader.cancel("a.png"));
    assert!(!h.loader.is_loading("a.png"));
    h.fetcher.open();
    task.await.unwrap();

    // the download was persisted, but neither decoded nor delivered
    assert_eq!(h.fetcher.fetches("a.png"), 1);
    assert_eq!(h.store().writes(), 1);
    assert!(slot.applied_keys().is_empty());
    assert!(h.loader.memory().is_empty());

    // loading again finds it in the store
    assert_eq!(h.load(&slot, "a.png"), LoadStatus::Pending);
    h.executor.run_all().await;
    assert_eq!(slot.applied_keys(), vec!["a.png"]);
    assert_eq!(h.fetcher.fetches("a.png"), 1);
    assert_eq!(h.store().writes(), 1);
}

#[tokio::test]
async fn test_clear_falls_back_to_store() {
    let h = Harness::new();
    h.serve("a.png", 0);

    let slot = TestSlot::new("a.png");
    h.load(&slot, "a.png");
    h.executor.run_all().await;

    h.loader.clear();
    assert!(h.loader.get_cached("a.png").is_none());

    assert_eq!(h.load(&slot, "a.png"), LoadStatus::Pending);
    h.executor.run_all().await;
    assert_eq!(slot.applied_keys(), vec!["a.png", "a.png"]);
    assert_eq!(h.fetcher.fetches("a.png"), 1);
}

#[tokio::test]
async fn test_memory_bounds() {
    let h = Harness::with(
        MemoryCache::new(2, 1024 * 1024),
        ImageDecoder::default(),
        Dispatcher::new(InlineContext),
    );
    for name in ["a.png", "b.png", "c.png"] {
        h.serve(name, 0);
        let slot = TestSlot::new(name);
        h.load(&slot, name);
    }
    assert_eq!(h.executor.run_all().await, 3);

    assert_eq!(h.loader.memory().len(), 2);
    assert!(h.loader.get_cached("a.png").is_none());
    assert!(h.loader.get_cached("b.png").is_some());
    assert!(h.loader.get_cached("c.png").is_some());
    assert_eq!(h.loader.memory().total_size(), 2 * 16 * 16 * 4);
}
