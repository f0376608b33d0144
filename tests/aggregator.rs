mod common;

use common::{limiter, provision};
use weir::store::{Store, Update, get_n};
use weir::{Acquire, Aggregator, SnapshotWindow, TimeSource, keys};

/// Drains most of the bucket so a batch shows heavy consumption, then
/// returns the full change feed as one batch.
async fn consume_heavily(
    limiter: &weir::Limiter<weir::MemoryStore>,
    store: &weir::MemoryStore,
) -> Vec<weir::store::ChangeRecord> {
    provision(limiter, "acct", "gpt").await;
    limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 80))
        .await
        .unwrap()
        .release()
        .await
        .unwrap();
    store.poll_changes(0, 1_000).await.unwrap()
}

#[tokio::test]
async fn it_refills_proactively_once() {
    let (limiter, store, clock) = limiter(false);
    let batch = consume_heavily(&limiter, &store).await;
    clock.advance(600);

    let aggregator = Aggregator::new(store.clone()).time_source(clock.clone());
    let stats = aggregator.process_changes(&batch).await.unwrap();
    assert_eq!(stats.refills, 1);
    assert_eq!(stats.refill_conflicts, 0);

    // 600 ms refilled exactly 1000 milli on top of the 20 000 left.
    let bucket = store
        .get_item(&keys::bucket("default", "acct", "gpt", 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(get_n(&bucket, "b_rpm_tk"), Some(21_000));
    assert_eq!(get_n(&bucket, "rf"), Some(clock.now_ms()));
}

#[tokio::test]
async fn it_skips_replayed_refills() {
    let (limiter, store, clock) = limiter(false);
    let batch = consume_heavily(&limiter, &store).await;
    clock.advance(600);

    let aggregator = Aggregator::new(store.clone()).time_source(clock.clone());
    aggregator.process_changes(&batch).await.unwrap();
    let bucket_after_first = store
        .get_item(&keys::bucket("default", "acct", "gpt", 0))
        .await
        .unwrap()
        .unwrap();

    // At-least-once delivery: the same batch arrives again. The refill's
    // clock guard fails and the write is silently skipped.
    let stats = aggregator.process_changes(&batch).await.unwrap();
    assert_eq!(stats.refills, 0);
    assert_eq!(stats.refill_conflicts, 1);

    let bucket_after_replay = store
        .get_item(&keys::bucket("default", "acct", "gpt", 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(get_n(&bucket_after_replay, "b_rpm_tk"), get_n(&bucket_after_first, "b_rpm_tk"));
    assert_eq!(get_n(&bucket_after_replay, "rf"), get_n(&bucket_after_first, "rf"));
}

#[tokio::test]
async fn it_materializes_usage_snapshots() {
    let (limiter, store, clock) = limiter(false);
    let batch = consume_heavily(&limiter, &store).await;

    let aggregator = Aggregator::new(store.clone()).time_source(clock.clone());
    let stats = aggregator.process_changes(&batch).await.unwrap();
    assert_eq!(stats.snapshot_updates, 2); // one hourly, one daily

    let windows = limiter.usage("acct", "gpt").await.unwrap();
    assert_eq!(windows.len(), 2);
    for window in &windows {
        assert_eq!(window.consumed_milli["rpm"], 80_000);
        // The hidden write-capacity limit never appears in usage.
        assert!(window.consumed_milli.keys().all(|n| n.as_str() != "wcu"));
    }
    assert!(windows.iter().any(|w| w.window == SnapshotWindow::Hour));
    assert!(windows.iter().any(|w| w.window == SnapshotWindow::Day));

    let now = clock.now_ms();
    for window in &windows {
        let span = match window.window {
            SnapshotWindow::Hour => 3_600_000,
            SnapshotWindow::Day => 86_400_000,
        };
        assert_eq!(window.start_ms, now - now.rem_euclid(span));
    }
}

#[tokio::test]
async fn it_accumulates_rollbacks_into_snapshots_commutatively() {
    let (limiter, store, clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;

    limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 10))
        .await
        .unwrap()
        .release()
        .await
        .unwrap();
    limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 4))
        .await
        .unwrap()
        .rollback()
        .await
        .unwrap();

    let aggregator = Aggregator::new(store.clone()).time_source(clock);
    let batch = store.poll_changes(0, 1_000).await.unwrap();
    aggregator.process_changes(&batch).await.unwrap();

    // +10 000, +4 000, -4 000: the window nets the committed consumption.
    let windows = limiter.usage("acct", "gpt").await.unwrap();
    assert_eq!(windows.len(), 2);
    assert!(windows.iter().all(|w| w.consumed_milli["rpm"] == 10_000));
}

#[tokio::test]
async fn it_doubles_shards_on_write_pressure() {
    let (limiter, store, clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;
    limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 1))
        .await
        .unwrap()
        .release()
        .await
        .unwrap();
    let processed = store.poll_changes(0, 1_000).await.unwrap();
    let cursor = processed.last().unwrap().sequence;

    // A batch that burned more than 80% of shard 0's write capacity.
    let shard0 = keys::bucket("default", "acct", "gpt", 0);
    store
        .update_item(
            Update::new(shard0.clone())
                .add("b_wcu_tc", 900_000)
                .add("b_wcu_tk", -900_000),
        )
        .await
        .unwrap();

    let aggregator = Aggregator::new(store.clone()).time_source(clock);
    let batch = store.poll_changes(cursor, 1_000).await.unwrap();
    let stats = aggregator.process_changes(&batch).await.unwrap();
    assert_eq!(stats.reshards, 1);

    let bucket = store.get_item(&shard0).await.unwrap().unwrap();
    assert_eq!(get_n(&bucket, "shard_count"), Some(2));
    // Shard-effective capacity was rewritten with the layout.
    assert_eq!(get_n(&bucket, "b_rpm_cp"), Some(50_000));

    // Replaying the batch cannot double again: the guard sees count 2.
    let stats = aggregator.process_changes(&batch).await.unwrap();
    assert_eq!(stats.reshards, 0);
    let bucket = store.get_item(&shard0).await.unwrap().unwrap();
    assert_eq!(get_n(&bucket, "shard_count"), Some(2));
}

#[tokio::test]
async fn it_invalidates_config_caches_from_the_feed() {
    let (limiter, store, clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;

    let aggregator = Aggregator::new(store.clone()).time_source(clock);
    let batch = store.poll_changes(0, 1_000).await.unwrap();
    let stats = aggregator.process_changes(&batch).await.unwrap();
    assert!(stats.config_invalidations >= 1);
}
