//! Tests against a live Redis. Run with `REDIS_URL=redis://... cargo test -- --ignored`.

use quotaguard::health::{HealthChecker, SharedStoreStatus};
use quotaguard::rate_limiter::RateLimiter;
use quotaguard::redis::{ConnectionState, RedisCounterStore};
use quotaguard::store::CounterStore;
use std::sync::Arc;
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn connected_store(prefix: &str) -> Arc<RedisCounterStore> {
    let store = Arc::new(RedisCounterStore::new(&redis_url(), prefix).unwrap());
    store.connect().await.unwrap();
    assert_eq!(store.state(), ConnectionState::Ready);
    store
}

fn unique_prefix() -> String {
    format!("quotaguard-test-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore]
async fn test_fixed_window_counting() {
    let store = connected_store(&unique_prefix()).await;
    let window = Duration::from_secs(30);

    let first = store.increment("query:user:1", window).await.unwrap();
    let second = store.increment("query:user:1", window).await.unwrap();
    assert_eq!(first.count, 1);
    assert_eq!(second.count, 2);
    assert_eq!(first.window_start_ms, second.window_start_ms);

    let read = store.read("query:user:1").await.unwrap().unwrap();
    assert_eq!(read, second);
    assert!(store.read("query:user:2").await.unwrap().is_none());

    store.reset("query:user:1").await.unwrap();
    assert!(store.read("query:user:1").await.unwrap().is_none());

    store.increment("query:user:3", window).await.unwrap();
    store.reset_all().await.unwrap();
    assert!(store.read("query:user:3").await.unwrap().is_none());

    store.close().await;
    assert_eq!(store.state(), ConnectionState::Closed);
}

#[tokio::test]
#[ignore]
async fn test_counter_expires_with_window() {
    let store = connected_store(&unique_prefix()).await;
    let window = Duration::from_millis(200);

    store.increment("auth:ip:1", window).await.unwrap();
    store.increment("auth:ip:1", window).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(store.read("auth:ip:1").await.unwrap().is_none());
    assert_eq!(store.increment("auth:ip:1", window).await.unwrap().count, 1);
    store.reset_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_processes_share_one_atomic_counter() {
    let prefix = unique_prefix();
    // Two independent connections stand in for two processes.
    let a = connected_store(&prefix).await;
    let b = connected_store(&prefix).await;

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            tokio::spawn(async move {
                store
                    .increment("mutation:user:hot", Duration::from_secs(30))
                    .await
                    .unwrap()
                    .count
            })
        })
        .collect();

    let mut counts = Vec::new();
    for handle in handles {
        counts.push(handle.await.unwrap());
    }
    counts.sort_unstable();
    assert_eq!(counts, (1..=200).collect::<Vec<u64>>());

    a.reset_all().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_readiness_pings_connected_store() {
    let store = connected_store(&unique_prefix()).await;
    store.ping().await.unwrap();

    let checker = HealthChecker::new(RateLimiter::local_only().unwrap(), Some(store.clone()));
    assert_eq!(checker.shared_store_status().await, SharedStoreStatus::Connected);

    store.close().await;
    assert_eq!(checker.shared_store_status().await, SharedStoreStatus::Unavailable);
}
