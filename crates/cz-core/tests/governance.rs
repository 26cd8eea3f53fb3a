//! End-to-end tests of the governance layer over in-process backends:
//! admission windows, penalty blocks, store-outage degradation, cache
//! behavior, single-flight recomputation, and cost aggregation.

use cz_core::cache::{Cache, MemoryCache};
use cz_core::cost::{CostConfig, CostLedger, CostTrend};
use cz_core::limiter::{
    LimiterConfig, OperationClass, PolicySet, RateLimitError, RateLimitPolicy, RequestRateLimiter,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
}

#[tokio::test]
async fn admission_window_admits_budget_exactly() {
    let policies = PolicySet::default().with(
        OperationClass::Api,
        RateLimitPolicy::new(5, Duration::from_secs(60)),
    );
    let limiter = RequestRateLimiter::in_process(policies).unwrap();

    for i in 0..5 {
        assert!(
            limiter.check_api("u1", ip(1)).await.is_ok(),
            "request {i} should have been admitted"
        );
    }

    let denied = limiter.check_api("u1", ip(1)).await.unwrap_err();
    let retry = denied.retry_after_secs().expect("denial carries retry-after");
    assert!((55..=60).contains(&retry), "retry_after was {retry}s");
}

#[tokio::test]
async fn admission_resumes_after_window_boundary() {
    let policies = PolicySet::default().with(
        OperationClass::Api,
        RateLimitPolicy::new(2, Duration::from_millis(80)),
    );
    let limiter = RequestRateLimiter::in_process(policies).unwrap();

    assert!(limiter.check_api("u1", ip(2)).await.is_ok());
    assert!(limiter.check_api("u1", ip(2)).await.is_ok());
    assert!(limiter.check_api("u1", ip(2)).await.is_err());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(limiter.check_api("u1", ip(2)).await.is_ok());
}

#[tokio::test]
async fn penalty_block_outlives_count_window() {
    let policies = PolicySet::default().with(
        OperationClass::Mutation,
        RateLimitPolicy::new(1, Duration::from_millis(50))
            .with_block(Duration::from_millis(400)),
    );
    let limiter = RequestRateLimiter::in_process(policies).unwrap();

    assert!(limiter.check_mutation("u1", ip(3)).await.is_ok());
    assert!(limiter.check_mutation("u1", ip(3)).await.is_err());

    // Past the window, inside the block: still denied.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(limiter.check_mutation("u1", ip(3)).await.is_err());

    // Past the block: admitted again.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(limiter.check_mutation("u1", ip(3)).await.is_ok());
}

#[tokio::test]
async fn unreachable_store_still_enforces_a_bound() {
    // A pool pointed at a closed port: every distributed check fails with a
    // connection error and degrades to the in-process fallback.
    let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:1")
        .builder()
        .unwrap()
        .max_size(2)
        .runtime(deadpool_redis::Runtime::Tokio1)
        .build()
        .unwrap();

    let policies = PolicySet::default().with(
        OperationClass::Api,
        RateLimitPolicy::new(3, Duration::from_secs(60)),
    );
    let limiter =
        RequestRateLimiter::from_pool(LimiterConfig::in_process(), policies, pool).unwrap();

    for _ in 0..3 {
        assert!(limiter.check_api("u1", ip(4)).await.is_ok());
    }

    // The fallback budget holds: the limiter does not admit unconditionally
    // just because the store is down.
    assert!(matches!(
        limiter.check_api("u1", ip(4)).await,
        Err(RateLimitError::LimitExceeded { .. })
    ));
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Payload {
    a: u32,
}

#[tokio::test]
async fn cache_round_trip_and_ttl_expiry() {
    let cache = MemoryCache::new();

    cache
        .set_json("k", &Payload { a: 1 }, Duration::from_secs(1))
        .await
        .unwrap();

    let hit: Option<Payload> = cache.get_json("k").await.unwrap();
    assert_eq!(hit, Some(Payload { a: 1 }));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let gone: Option<Payload> = cache.get_json("k").await.unwrap();
    assert_eq!(gone, None);
}

#[tokio::test]
async fn pattern_invalidation_spares_unrelated_keys() {
    let cache = MemoryCache::new();

    cache
        .set("products:a", b"1", Duration::from_secs(60))
        .await
        .unwrap();
    cache
        .set("products:b", b"2", Duration::from_secs(60))
        .await
        .unwrap();
    cache
        .set("recipes:pasta", b"3", Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(cache.invalidate_pattern("products:*").await.unwrap(), 2);

    assert_eq!(cache.get("products:a").await.unwrap(), None);
    assert_eq!(cache.get("products:b").await.unwrap(), None);
    assert_eq!(
        cache.get("recipes:pasta").await.unwrap(),
        Some(b"3".to_vec())
    );
}

#[tokio::test]
async fn concurrent_cold_reads_compute_once() {
    let cache = Arc::new(MemoryCache::new());
    let computations = Arc::new(AtomicUsize::new(0));

    let mut handles = vec![];
    for _ in 0..12 {
        let cache = Arc::clone(&cache);
        let computations = Arc::clone(&computations);
        handles.push(tokio::spawn(async move {
            cache
                .get_or_set("menu:rendered", Duration::from_secs(30), || {
                    let computations = Arc::clone(&computations);
                    async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        computations.fetch_add(1, Ordering::SeqCst);
                        Ok(b"menu".to_vec())
                    }
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), b"menu".to_vec());
    }
    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cost_totals_and_trend_match_hand_computation() {
    let ledger = CostLedger::new(CostConfig::default().with_rates(0.01, 0.0));

    // Ten samples: five at 100ms, five at 400ms, all at 1 GB. Hand-computed:
    // first-half mean 0.001, second-half mean 0.004 → increasing; total
    // 5 × 0.001 + 5 × 0.004 = 0.025.
    for _ in 0..5 {
        ledger
            .record("syncInventory", Duration::from_millis(100), 1024.0)
            .await;
    }
    for _ in 0..5 {
        ledger
            .record("syncInventory", Duration::from_millis(400), 1024.0)
            .await;
    }

    let report = ledger.analyze(1).await;
    assert!((report.total_cost - 0.025).abs() < 1e-9);
    assert_eq!(report.operations.len(), 1);
    assert_eq!(report.operations[0].invocations, 10);
    assert_eq!(report.operations[0].trend, CostTrend::Increasing);
}

#[tokio::test]
async fn admitted_request_flows_through_cache_and_ledger() {
    let policies = PolicySet::default();
    let limiter = RequestRateLimiter::in_process(policies).unwrap();
    let cache = MemoryCache::with_namespace("inventory");
    let ledger = CostLedger::default();

    // The shape of a governed read path: admit, then serve through the
    // cache, then record what it cost.
    limiter.check_api("chef-7", ip(5)).await.unwrap();

    let started = std::time::Instant::now();
    let value = cache
        .get_or_set("products:list", Duration::from_secs(60), || async {
            Ok(b"[\"saffron\",\"flour\"]".to_vec())
        })
        .await
        .unwrap();
    ledger
        .record("listProducts", started.elapsed(), 256.0)
        .await;

    assert_eq!(value, b"[\"saffron\",\"flour\"]".to_vec());
    assert_eq!(ledger.len().await, 1);

    // A second read is a hit and costs another sample, not another compute.
    let again = cache
        .get_or_set("products:list", Duration::from_secs(60), || async {
            panic!("cached value must be served")
        })
        .await
        .unwrap();
    assert_eq!(again, value);
}
