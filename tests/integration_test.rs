//! Integration tests running one or more cache instances against in-process stores
//! and a shared in-process backplane hub.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};

use hybrid_cache::{
    AutoRecoveryOptions, BackoffPolicy, BoxError, Cache, CacheBuilder, CacheError, CacheEvent,
    CacheOptions, EntryOptions, EventHub, FactoryContext, HashMapStore, HashMapStoreConfig,
    MemoryBackplane, Store,
};

// ============================================================================
// Test Types
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Product {
    id: u64,
    name: String,
    price_cents: u64,
}

fn product(id: u64, name: &str) -> Product {
    Product {
        id,
        name: name.to_string(),
        price_cents: 999,
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn shared_distributed() -> Arc<dyn Store> {
    Arc::new(HashMapStore::new(HashMapStoreConfig {
        serialized: true,
        ..Default::default()
    }))
}

fn cluster_options(instance: &str) -> CacheOptions {
    CacheOptions::new("products")
        .with_instance_id(instance)
        .with_auto_recovery(AutoRecoveryOptions {
            delay: Duration::from_millis(10),
            backoff: BackoffPolicy::Fixed,
            drain_interval: Duration::from_millis(20),
            ..Default::default()
        })
}

async fn local_cache<V>() -> Cache<V>
where
    V: Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    CacheBuilder::new(CacheOptions::new("products"))
        .build()
        .await
        .unwrap()
}

/// An instance sharing the distributed store and the backplane hub of a cluster.
async fn node(
    instance: &str,
    hub: &MemoryBackplane,
    distributed: &Arc<dyn Store>,
) -> (Cache<Product>, Arc<MemoryBackplane>, EventHub) {
    let conn = Arc::new(hub.connect());
    let events = EventHub::new();
    let cache = CacheBuilder::new(cluster_options(instance))
        .with_distributed_store(distributed.clone())
        .with_backplane(conn.clone())
        .with_events(events.clone())
        .build()
        .await
        .unwrap();
    (cache, conn, events)
}

fn count_received(events: &EventHub) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    events.subscribe(move |event| {
        if matches!(event, CacheEvent::MessageReceived { .. }) {
            c.fetch_add(1, Ordering::SeqCst);
        }
    });
    counter
}

/// Poll `cache` until `key` holds `expected` or the deadline passes.
async fn wait_for(cache: &Cache<Product>, key: &str, expected: Option<&Product>) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cache.try_get(key).await.unwrap().as_ref() == expected {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

fn failing_factory(
    _ctx: FactoryContext<String>,
) -> impl Future<Output = Result<String, BoxError>> + Send + 'static {
    async { Err::<String, BoxError>("database unavailable".into()) }
}

// ============================================================================
// Single Instance
// ============================================================================

#[tokio::test]
async fn test_concurrent_callers_share_one_factory_execution() {
    let cache: Cache<String> = local_cache().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let cache = cache.clone();
        let calls = calls.clone();
        let running = running.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_set("product:1", move |_ctx| async move {
                    assert!(!running.swap(true, Ordering::SeqCst), "factories overlapped");
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    running.store(false, Ordering::SeqCst);
                    Ok("computed".to_string())
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "computed");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_soft_timeout_serves_stale_and_completes_in_background() {
    let cache: Cache<String> = local_cache().await;
    let options = EntryOptions::default()
        .with_duration(Duration::from_millis(50))
        .with_fail_safe(Duration::from_secs(60))
        .with_soft_timeout(Duration::from_millis(50));

    cache.set_with_options("k", "old".to_string(), &options).await.unwrap();
    sleep(Duration::from_millis(80)).await;

    let started = Instant::now();
    let value = cache
        .get_or_set_with_options(
            "k",
            |_ctx| async {
                sleep(Duration::from_millis(500)).await;
                Ok("new".to_string())
            },
            &options,
        )
        .await
        .unwrap();
    assert_eq!(value, "old");
    assert!(started.elapsed() < Duration::from_millis(400));

    sleep(Duration::from_millis(600)).await;
    assert_eq!(cache.try_get("k").await.unwrap(), Some("new".to_string()));
}

#[tokio::test]
async fn test_hard_timeout_without_stale_value_fails() {
    let cache: Cache<String> = local_cache().await;
    let options = EntryOptions::default()
        .with_hard_timeout(Duration::from_millis(100))
        .with_background_completion(false);

    let started = Instant::now();
    let result = cache
        .get_or_set_with_options(
            "k",
            |_ctx| async {
                sleep(Duration::from_secs(1)).await;
                Ok("late".to_string())
            },
            &options,
        )
        .await;

    assert!(matches!(result, Err(CacheError::FactoryTimeout { .. })));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(cache.try_get("k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_fail_safe_returns_expired_value_when_factory_fails() {
    let cache: Cache<String> = local_cache().await;
    let with_fail_safe = EntryOptions::default()
        .with_duration(Duration::from_millis(30))
        .with_fail_safe(Duration::from_secs(60));

    cache
        .set_with_options("k", "last known".to_string(), &with_fail_safe)
        .await
        .unwrap();
    sleep(Duration::from_millis(60)).await;

    let value = cache
        .get_or_set_with_options("k", failing_factory, &with_fail_safe)
        .await
        .unwrap();
    assert_eq!(value, "last known");

    // Without fail-safe the failure surfaces.
    let plain = EntryOptions::default().with_duration(Duration::from_millis(30));
    cache.set_with_options("other", "v".to_string(), &plain).await.unwrap();
    sleep(Duration::from_millis(60)).await;
    let result = cache
        .get_or_set_with_options("other", failing_factory, &plain)
        .await;
    assert!(matches!(result, Err(CacheError::Factory { .. })));
}

#[tokio::test]
async fn test_lock_timeout_returns_stale_value() {
    let cache: Cache<String> = local_cache().await;
    let options = EntryOptions::default()
        .with_duration(Duration::from_millis(30))
        .with_fail_safe(Duration::from_secs(60))
        .with_lock_timeout(Duration::from_millis(50));

    cache.set_with_options("k", "old".to_string(), &options).await.unwrap();
    sleep(Duration::from_millis(60)).await;

    let slow = {
        let cache = cache.clone();
        let options = options.clone().with_lock_timeout(Duration::from_secs(5));
        tokio::spawn(async move {
            cache
                .get_or_set_with_options(
                    "k",
                    |_ctx| async {
                        sleep(Duration::from_millis(300)).await;
                        Ok("new".to_string())
                    },
                    &options,
                )
                .await
        })
    };
    sleep(Duration::from_millis(20)).await;

    let value = cache
        .get_or_set_with_options("k", |_ctx| async { Ok("unused".to_string()) }, &options)
        .await
        .unwrap();
    assert_eq!(value, "old");
    assert_eq!(slow.await.unwrap().unwrap(), "new");
}

#[tokio::test]
async fn test_lock_timeout_without_stale_value_fails() {
    let cache: Cache<String> = local_cache().await;
    let options = EntryOptions::default().with_lock_timeout(Duration::from_millis(50));

    let slow = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_set("k", |_ctx| async {
                    sleep(Duration::from_millis(300)).await;
                    Ok("v".to_string())
                })
                .await
        })
    };
    sleep(Duration::from_millis(20)).await;

    let result = cache
        .get_or_set_with_options("k", |_ctx| async { Ok("unused".to_string()) }, &options)
        .await;
    assert!(matches!(result, Err(CacheError::LockTimeout { .. })));
    assert!(slow.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_eager_refresh_updates_entry_in_background() {
    let cache: Cache<String> = local_cache().await;
    let options = EntryOptions::default()
        .with_duration(Duration::from_millis(300))
        .with_eager_refresh(0.5);

    cache.set_with_options("k", "v1".to_string(), &options).await.unwrap();
    sleep(Duration::from_millis(180)).await;

    let value = cache
        .get_or_set_with_options("k", |_ctx| async { Ok("v2".to_string()) }, &options)
        .await
        .unwrap();
    assert_eq!(value, "v1");

    sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.try_get("k").await.unwrap(), Some("v2".to_string()));
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let cache: Cache<String> = local_cache().await;

    cache.remove("missing").await.unwrap();
    cache.remove("missing").await.unwrap();

    cache.set("k", "v".to_string()).await.unwrap();
    cache.remove("k").await.unwrap();
    cache.remove("k").await.unwrap();
    assert!(cache.try_get("k").await.unwrap().is_none());
}

// ============================================================================
// Multiple Instances
// ============================================================================

#[tokio::test]
async fn test_second_instance_reads_from_distributed_store() {
    let hub = MemoryBackplane::new();
    let distributed = shared_distributed();
    let (a, _, _) = node("node-a", &hub, &distributed).await;
    let (b, _, _) = node("node-b", &hub, &distributed).await;

    a.get_or_set("product:1", |_ctx| async { Ok(product(1, "Keyboard")) })
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let value = b
        .get_or_set("product:1", move |_ctx| async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(product(1, "Other"))
        })
        .await
        .unwrap();

    assert_eq!(value, product(1, "Keyboard"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_set_and_remove_propagate_to_other_instances() {
    let hub = MemoryBackplane::new();
    let distributed = shared_distributed();
    let (a, _, _) = node("node-a", &hub, &distributed).await;
    let (b, _, _) = node("node-b", &hub, &distributed).await;

    a.set("product:1", product(1, "Keyboard")).await.unwrap();
    assert_eq!(
        b.get_or_set("product:1", |_ctx| async { Ok(product(1, "unused")) })
            .await
            .unwrap(),
        product(1, "Keyboard")
    );

    let updated = product(1, "Mechanical Keyboard");
    a.set("product:1", updated.clone()).await.unwrap();
    assert!(wait_for(&b, "product:1", Some(&updated)).await);

    a.remove("product:1").await.unwrap();
    assert!(wait_for(&b, "product:1", None).await);
}

#[tokio::test]
async fn test_instance_ignores_its_own_messages() {
    let hub = MemoryBackplane::new();
    let distributed = shared_distributed();
    let (a, _, a_events) = node("node-a", &hub, &distributed).await;
    let (_b, _, b_events) = node("node-b", &hub, &distributed).await;
    let a_received = count_received(&a_events);
    let b_received = count_received(&b_events);

    a.set("product:1", product(1, "Keyboard")).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while b_received.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b_received.load(Ordering::SeqCst), 1);
    assert_eq!(a_received.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missed_notification_is_delivered_after_reconnect() {
    let hub = MemoryBackplane::new();
    let distributed = shared_distributed();
    let (a, a_conn, _) = node("node-a", &hub, &distributed).await;
    let (b, _, _) = node("node-b", &hub, &distributed).await;

    a.set("product:1", product(1, "v1")).await.unwrap();
    b.get_or_set("product:1", |_ctx| async { Ok(product(1, "unused")) })
        .await
        .unwrap();

    a_conn.set_connected(false);
    let v2 = product(1, "v2");
    a.set("product:1", v2.clone()).await.unwrap();

    // The distributed write succeeded, only the notification is pending.
    let deadline = Instant::now() + Duration::from_secs(2);
    while a.auto_recovery_len() == 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(a.auto_recovery_len(), 1);
    assert_eq!(b.try_get("product:1").await.unwrap(), Some(product(1, "v1")));

    a_conn.set_connected(true);
    assert!(wait_for(&b, "product:1", Some(&v2)).await);
    let deadline = Instant::now() + Duration::from_secs(2);
    while a.auto_recovery_len() > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(a.auto_recovery_len(), 0);
}

#[tokio::test]
async fn test_expire_keeps_fail_safe_value_on_other_instances() {
    let hub = MemoryBackplane::new();
    let distributed = shared_distributed();
    let (a, _, _) = node("node-a", &hub, &distributed).await;
    let (b, _, b_events) = node("node-b", &hub, &distributed).await;
    let b_received = count_received(&b_events);
    let options = EntryOptions::default().with_fail_safe(Duration::from_secs(60));

    a.set_with_options("product:1", product(1, "Keyboard"), &options)
        .await
        .unwrap();
    b.get_or_set_with_options("product:1", |_ctx| async { Ok(product(1, "unused")) }, &options)
        .await
        .unwrap();
    let before = b_received.load(Ordering::SeqCst);

    a.expire_with_options("product:1", &options).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while b_received.load(Ordering::SeqCst) == before && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert!(b.try_get("product:1").await.unwrap().is_none());

    // The factory fails on B; the expired copy is still available as fallback.
    let value = b
        .get_or_set_with_options(
            "product:1",
            |_ctx| async { Err::<Product, BoxError>("database unavailable".into()) },
            &options,
        )
        .await
        .unwrap();
    assert_eq!(value, product(1, "Keyboard"));
}
