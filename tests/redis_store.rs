//! Redis store behaviour against a real server. These need Docker:
//! `cargo test --test redis_store -- --ignored`

use redis::AsyncCommands;
use request_guard::store::{CacheStore, IncrementStrategy, RedisConfig, RedisStore};
use std::{sync::Arc, time::Duration};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

const STRATEGIES: [IncrementStrategy; 2] = [IncrementStrategy::Atomic, IncrementStrategy::IncrThenExpire];

fn redis_image() -> GenericImage {
    GenericImage::new("redis", "7-alpine")
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .with_exposed_port(6379)
}

fn redis_url(container: &Container<'_, GenericImage>) -> String {
    format!("redis://127.0.0.1:{}", container.get_host_port_ipv4(6379))
}

async fn store(url: &str, increment_strategy: IncrementStrategy) -> RedisStore {
    let config = RedisConfig {
        url: url.to_string(),
        increment_strategy,
        ..RedisConfig::default()
    };
    RedisStore::connect(config).await.unwrap()
}

async fn ttl_of(url: &str, key: &str) -> i64 {
    let client = redis::Client::open(url).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    conn.ttl(key).await.unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_first_increment_sets_the_expiry() {
    let docker = Cli::default();
    let container = docker.run(redis_image());
    let url = redis_url(&container);

    for strategy in STRATEGIES {
        let store = store(&url, strategy).await;
        let key = format!("first:{:?}", strategy);

        assert_eq!(store.increment(&key, 1, Duration::from_secs(90)).await.unwrap(), 1);
        let ttl = ttl_of(&url, &key).await;
        assert!((1..=90).contains(&ttl), "{:?}: ttl {}", strategy, ttl);
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_later_increments_keep_the_first_expiry() {
    let docker = Cli::default();
    let container = docker.run(redis_image());
    let url = redis_url(&container);

    for strategy in STRATEGIES {
        let store = store(&url, strategy).await;
        let key = format!("later:{:?}", strategy);

        store.increment(&key, 1, Duration::from_secs(300)).await.unwrap();
        assert_eq!(store.increment(&key, 2, Duration::from_secs(5)).await.unwrap(), 3);

        let ttl = ttl_of(&url, &key).await;
        assert!(ttl > 5, "{:?}: expiry was shortened to {}", strategy, ttl);
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_increments_are_all_counted() {
    let docker = Cli::default();
    let container = docker.run(redis_image());
    let url = redis_url(&container);

    for strategy in STRATEGIES {
        let store = Arc::new(store(&url, strategy).await);
        let key = format!("burst:{:?}", strategy);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.increment(&key, 1, Duration::from_secs(60)).await })
            })
            .collect();

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap().unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=50).collect::<Vec<u64>>(), "{:?}", strategy);
        assert!(ttl_of(&url, &key).await > 0);
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_ban_record_round_trip() {
    let docker = Cli::default();
    let container = docker.run(redis_image());
    let url = redis_url(&container);
    let store = store(&url, IncrementStrategy::Atomic).await;

    store.write("ban:1.2.3.4", 1_700_000_600, Duration::from_secs(600)).await.unwrap();
    assert_eq!(store.read("ban:1.2.3.4").await.unwrap(), Some(1_700_000_600));
    assert!((1..=600).contains(&ttl_of(&url, "ban:1.2.3.4").await));

    store.delete("ban:1.2.3.4").await.unwrap();
    assert_eq!(store.read("ban:1.2.3.4").await.unwrap(), None);
    assert!(store.health_check().await.is_ok());
}
