pub mod manager;
pub mod store;

pub use manager::{CacheError, CacheManager, WalletBalance};
pub use store::{CacheStore, MemoryStore, RedisStore};

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Redis when a URL is configured, otherwise a store private to this process.
pub async fn open_store(redis_url: Option<&str>) -> Result<Arc<dyn CacheStore>> {
    match redis_url {
        Some(url) => {
            let store = RedisStore::connect(url).await?;
            info!("Cache backed by Redis");
            Ok(Arc::new(store))
        }
        None => {
            info!("REDIS_URL not set, caching in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
