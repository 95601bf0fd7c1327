//! Shop lookups under each rebuild policy.

use cache_shield::{
    backend::InMemoryBackend, error::Result, repository::InMemoryRepository, CacheEntity,
    CacheFeed, CacheService, ExecutorConfig, LoaderConfig, RebuildPolicy,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Serialize, Deserialize, Debug)]
struct Shop {
    id: u64,
    name: String,
    type_id: u64,
    area: String,
    score: u32,
}

impl CacheEntity for Shop {
    type Key = u64;

    fn cache_key(&self) -> Self::Key {
        self.id
    }

    fn cache_prefix() -> &'static str {
        "shop"
    }
}

struct ShopFeeder {
    id: u64,
    shop: Option<Shop>,
}

impl CacheFeed<Shop> for ShopFeeder {
    fn entity_id(&mut self) -> u64 {
        self.id
    }

    fn feed(&mut self, entity: Option<Shop>) {
        self.shop = entity;
    }
}

fn seed() -> InMemoryRepository<Shop> {
    let repository = InMemoryRepository::with_latency(Duration::from_millis(200));
    repository.insert(
        1,
        Shop {
            id: 1,
            name: "103 Teahouse".to_string(),
            type_id: 1,
            area: "Daguan".to_string(),
            score: 37,
        },
    );
    repository.insert(
        2,
        Shop {
            id: 2,
            name: "Lucky Noodles".to_string(),
            type_id: 1,
            area: "Yuanyuan".to_string(),
            score: 46,
        },
    );
    repository
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Cache Shield - Shop Example ===\n");

    let config = LoaderConfig {
        logical_window: Duration::from_secs(1),
        ..LoaderConfig::default()
    };
    let cache = CacheService::with_config(InMemoryBackend::new(), config, ExecutorConfig::default())?;
    let repository = seed();

    // 1. Pass-through: the second read is served from cache
    println!("1. Pass-through reads for shop 1:");
    for _ in 0..2 {
        let mut feeder = ShopFeeder { id: 1, shop: None };
        cache
            .execute::<Shop, _, _>(&mut feeder, &repository, RebuildPolicy::PassThrough)
            .await?;
        if let Some(shop) = &feeder.shop {
            println!("   ✓ {} ({} ★{})", shop.name, shop.area, shop.score);
        }
    }
    println!("   repository fetches: {}\n", repository.fetch_count());

    // 2. Unknown ids are remembered as absent
    println!("2. Lookups for a shop that does not exist:");
    for _ in 0..3 {
        let shop = cache
            .get::<Shop, _>(&100, &repository, RebuildPolicy::PassThrough)
            .await?;
        println!("   shop 100 -> {:?}", shop.map(|s| s.name));
    }
    println!("   repository fetches: {}\n", repository.fetch_count());

    // 3. Mutex: a burst of cold reads loads once
    println!("3. Twenty concurrent mutex reads for shop 2:");
    let mut handles = Vec::new();
    for _ in 0..20 {
        let cache = cache.clone();
        let repository = repository.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get::<Shop, _>(&2, &repository, RebuildPolicy::Mutex)
                .await
        }));
    }
    for handle in handles {
        if let Ok(result) = handle.await {
            result?;
        }
    }
    println!(
        "   repository fetches: {} (max concurrent: {})\n",
        repository.fetch_count(),
        repository.max_concurrent_fetches()
    );

    // 4. Logical expiration: warm, let it go stale, keep serving
    println!("4. Logical expiration for shop 1:");
    cache
        .warm::<Shop, _>(&1, &repository, Duration::from_secs(1))
        .await?;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    if let Some(mut shop) = repository.remove(&1) {
        shop.score = 49;
        repository.insert(1, shop);
    }
    let stale = cache
        .get::<Shop, _>(&1, &repository, RebuildPolicy::LogicalExpiration)
        .await?;
    println!("   served immediately: score {:?}", stale.map(|s| s.score));

    cache.wait_idle().await;
    let fresh = cache
        .get::<Shop, _>(&1, &repository, RebuildPolicy::LogicalExpiration)
        .await?;
    println!("   after rebuild: score {:?}\n", fresh.map(|s| s.score));

    // 5. Updates write through the repository and evict
    println!("5. Update shop 2:");
    let renamed = Shop {
        id: 2,
        name: "Lucky Noodles II".to_string(),
        type_id: 1,
        area: "Yuanyuan".to_string(),
        score: 46,
    };
    cache.update(&renamed, &repository).await?;
    let reread = cache
        .get::<Shop, _>(&2, &repository, RebuildPolicy::Mutex)
        .await?;
    println!("   ✓ now {:?}\n", reread.map(|s| s.name));

    println!("=== Example Complete ===\n");

    Ok(())
}
