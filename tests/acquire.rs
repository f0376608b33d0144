mod common;

use common::{limiter, provision, rpm_limit};
use futures_util::future;
use weir::store::{Store, get_n};
use weir::{Acquire, Error, Limit, keys};

#[tokio::test]
async fn it_consumes_on_acquire_and_writes_before_entry() {
    let (limiter, store, _clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;

    let lease = limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 1))
        .await
        .unwrap();

    // Write-on-enter: the debit is durable while the lease is held.
    let bucket = store
        .get_item(&keys::bucket("default", "acct", "gpt", 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(get_n(&bucket, "b_rpm_tk"), Some(99_000));
    assert_eq!(get_n(&bucket, "b_rpm_tc"), Some(1_000));

    lease.release().await.unwrap();
}

#[tokio::test]
async fn it_rejects_without_writing() {
    let (limiter, store, clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;

    // Drain the bucket, then wait long enough to refill exactly 500 milli.
    limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 100))
        .await
        .unwrap()
        .release()
        .await
        .unwrap();
    clock.advance(300);

    let before = store.change_count();
    let err = limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 1))
        .await
        .unwrap_err();

    match err {
        Error::RateLimitExceeded { limits, retry_after_ms } => {
            assert_eq!(limits.len(), 1);
            assert_eq!(limits[0].name.as_str(), "rpm");
            assert_eq!(limits[0].deficit_milli, 500);
            assert_eq!(limits[0].retry_after_ms, 301);
            assert_eq!(retry_after_ms, 301);
        }
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }

    // Rejection is pre-write: no store mutation, balance untouched.
    assert_eq!(store.change_count(), before);
    let bucket = store
        .get_item(&keys::bucket("default", "acct", "gpt", 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(get_n(&bucket, "b_rpm_tk"), Some(0));
}

#[tokio::test]
async fn it_flushes_adjustments_on_release() {
    let (limiter, store, _clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;

    let lease = limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 1).consume("tpm", 500))
        .await
        .unwrap();

    // The real cost came back higher than the estimate.
    lease.adjust("tpm", 1_500);
    lease.release().await.unwrap();

    let bucket = store
        .get_item(&keys::bucket("default", "acct", "gpt", 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(get_n(&bucket, "b_rpm_tc"), Some(1_000));
    assert_eq!(get_n(&bucket, "b_tpm_tc"), Some(2_000_000));
    assert_eq!(get_n(&bucket, "b_tpm_tk"), Some(10_000_000 - 2_000_000));
}

#[tokio::test]
async fn it_rolls_back_exactly_on_scope_failure() {
    let (limiter, store, _clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;

    // Establish a baseline debit that must survive the failed scope.
    limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 3))
        .await
        .unwrap()
        .release()
        .await
        .unwrap();

    let outcome: weir::Result<Result<(), &str>> = limiter
        .acquire_scoped(
            Acquire::new("acct", "gpt").consume("rpm", 5).consume("tpm", 200),
            |lease| {
                Box::pin(async move {
                    lease.adjust("tpm", 999);
                    Err("model call failed")
                })
            },
        )
        .await;
    assert_eq!(outcome.unwrap().unwrap_err(), "model call failed");

    // Net effect of the failed scope is zero; the baseline remains.
    let bucket = store
        .get_item(&keys::bucket("default", "acct", "gpt", 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(get_n(&bucket, "b_rpm_tc"), Some(3_000));
    assert_eq!(get_n(&bucket, "b_rpm_tk"), Some(97_000));
    assert_eq!(get_n(&bucket, "b_tpm_tc"), Some(0));
}

#[tokio::test]
async fn it_commits_scoped_success() {
    let (limiter, _store, _clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;

    let outcome: weir::Result<Result<i64, std::convert::Infallible>> = limiter
        .acquire_scoped(Acquire::new("acct", "gpt").consume("rpm", 1), |lease| {
            Box::pin(async move {
                lease.adjust("rpm", 1);
                Ok(42)
            })
        })
        .await;
    assert_eq!(outcome.unwrap().unwrap(), 42);

    let available = limiter.available("acct", "gpt").await.unwrap();
    assert_eq!(available["rpm"], 98);
}

#[tokio::test]
async fn it_admits_at_most_capacity_under_concurrency() {
    let (limiter, store, _clock) = limiter(true);
    limiter.create_entity(weir::Entity::new("acct")).await.unwrap();
    limiter
        .set_config(
            weir::ConfigScope::Resource("gpt".into()),
            vec![Limit::per_period("rpm", 10, 60_000).unwrap()],
            weir::OnUnavailable::FailClosed,
        )
        .await
        .unwrap();

    let attempts = (0..25).map(|_| {
        let limiter = limiter.clone();
        async move {
            limiter
                .acquire(Acquire::new("acct", "gpt").consume("rpm", 1))
                .await
        }
    });
    let results = future::join_all(attempts).await;

    let mut admitted = 0;
    for result in results {
        match result {
            Ok(lease) => {
                admitted += 1;
                lease.release().await.unwrap();
            }
            Err(Error::RateLimitExceeded { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(admitted, 10);

    // Total consumption across shards matches the admissions exactly.
    let bucket = store
        .get_item(&keys::bucket("default", "acct", "gpt", 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(get_n(&bucket, "b_rpm_tc"), Some(10_000));
}

#[tokio::test]
async fn it_reports_availability_summed_and_hides_wcu() {
    let (limiter, _store, clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;

    limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 40))
        .await
        .unwrap()
        .release()
        .await
        .unwrap();

    let available = limiter.available("acct", "gpt").await.unwrap();
    assert_eq!(available["rpm"], 60);
    assert_eq!(available["tpm"], 10_000);
    assert!(available.keys().all(|name| name.as_str() != "wcu"));

    // Never above capacity, no matter how long the bucket rests.
    clock.advance(3_600_000);
    let available = limiter.available("acct", "gpt").await.unwrap();
    assert_eq!(available["rpm"], 100);
}

#[tokio::test]
async fn it_uses_explicit_limits_only_as_fallback() {
    let (limiter, _store, _clock) = limiter(false);
    limiter.create_entity(weir::Entity::new("acct")).await.unwrap();

    // Nothing configured anywhere: explicit limits carry the acquire.
    let lease = limiter
        .acquire(
            Acquire::new("acct", "unconfigured")
                .consume("rpm", 1)
                .with_limits(vec![rpm_limit()]),
        )
        .await
        .unwrap();
    lease.release().await.unwrap();

    // Without explicit limits the same acquire is a configuration error.
    let err = limiter
        .acquire(Acquire::new("acct", "unconfigured2").consume("rpm", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn it_distinguishes_missing_entities_from_missing_buckets() {
    let (limiter, _store, _clock) = limiter(false);
    limiter
        .set_config(
            weir::ConfigScope::Resource("gpt".into()),
            vec![rpm_limit()],
            weir::OnUnavailable::FailClosed,
        )
        .await
        .unwrap();

    let err = limiter
        .acquire(Acquire::new("ghost", "gpt").consume("rpm", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EntityNotFound(_)));
}

#[tokio::test]
async fn it_applies_the_unavailability_policy() {
    // Fail-closed (the default): the outage propagates.
    let (limiter, store, _clock) = limiter(false);
    provision(&limiter, "acct", "gpt").await;
    store.fail_next(1, false);
    let err = limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable { .. }));

    // Fail-open: the call is admitted unmetered and the lease is inert.
    let clock = common::ManualClock::at(1_000_000);
    let open_store = weir::MemoryStore::with_time_source(clock.clone());
    let open_limiter = weir::Limiter::builder(open_store.clone())
        .time_source(clock)
        .on_unavailable("gpt", weir::OnUnavailable::FailOpen)
        .build();
    open_store.fail_next(1, false);
    let lease = open_limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 1))
        .await
        .unwrap();
    assert!(lease.is_unmetered());
    lease.release().await.unwrap();
}
