use super::store::CacheStore;
use crate::price::{PriceSource, QUOTE_SYMBOL};
use crate::repository::{BalanceRepository, Database};
use crate::rpc::ChainClient;
use alloy_primitives::Address;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const BLOCK_TIMESTAMP_TTL: Duration = Duration::from_secs(3 * 60 * 60);
const QUOTE_TTL: Duration = Duration::from_secs(30 * 60);
const PRICE_BUCKET_SECS: i64 = 5 * 60;
const WALLET_BALANCE_TTL: Duration = Duration::from_secs(5 * 60);
const WALLET_CHAIN_BALANCE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("block {block} has invalid timestamp {timestamp}")]
    InvalidTimestamp { block: u64, timestamp: u64 },
    #[error("cached value {value:?} under {key} is not parseable")]
    BadCachedValue { key: String, value: String },
}

/// USD balance of a wallet, across all chains when `chain_id` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub wallet: Address,
    pub chain_id: Option<u64>,
    pub balance_usd: Decimal,
}

impl WalletBalance {
    pub fn formatted(&self) -> String {
        format!("{:.2}", self.balance_usd.round_dp(2))
    }
}

/// Read-through cache for block timestamps, symbol quotes and wallet balances.
///
/// Get-then-set is not atomic; two concurrent misses for the same key both
/// go to the backing service and write the same value.
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    chain: Arc<dyn ChainClient>,
    prices: Arc<dyn PriceSource>,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn CacheStore>,
        chain: Arc<dyn ChainClient>,
        prices: Arc<dyn PriceSource>,
    ) -> Self {
        Self {
            store,
            chain,
            prices,
        }
    }

    pub async fn get_cached_block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>> {
        let key = format!("block:{block_number}");

        if let Some(cached) = self.read(&key).await {
            let seconds = cached
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0));
            return seconds.ok_or_else(|| {
                CacheError::BadCachedValue {
                    key,
                    value: cached,
                }
                .into()
            });
        }

        let timestamp = self.chain.block_timestamp(block_number).await?;
        let instant = i64::try_from(timestamp)
            .ok()
            .filter(|secs| *secs > 0)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or(CacheError::InvalidTimestamp {
                block: block_number,
                timestamp,
            })?;

        self.write(&key, &timestamp.to_string(), Some(BLOCK_TIMESTAMP_TTL))
            .await;
        Ok(instant)
    }

    /// USD close price of `symbol` for the five-minute bucket containing `at`.
    pub async fn get_cached_symbol_price_at_time(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<Decimal> {
        if symbol.eq_ignore_ascii_case(QUOTE_SYMBOL) {
            return Ok(Decimal::ONE);
        }

        let bucket = truncate_to_bucket(at);
        let key = format!(
            "quote:{}:{}",
            symbol.to_uppercase(),
            bucket.timestamp_millis()
        );

        if let Some(cached) = self.read(&key).await {
            return Decimal::from_str(&cached).map_err(|_| {
                CacheError::BadCachedValue {
                    key,
                    value: cached,
                }
                .into()
            });
        }

        let price = self.prices.close_price(symbol, bucket).await?;
        self.write(&key, &price.to_string(), Some(QUOTE_TTL)).await;
        Ok(price)
    }

    pub async fn get_cached_balance_of_wallet(
        &self,
        db: &Database,
        wallet: Address,
    ) -> Result<WalletBalance> {
        let key = format!("balance:{wallet:?}");
        self.cached_balance(db, key, wallet, None, WALLET_BALANCE_TTL)
            .await
    }

    pub async fn get_cached_balance_of_wallet_on_chain(
        &self,
        db: &Database,
        chain_id: u64,
        wallet: Address,
    ) -> Result<WalletBalance> {
        let key = format!("balance:{chain_id}:{wallet:?}");
        self.cached_balance(db, key, wallet, Some(chain_id), WALLET_CHAIN_BALANCE_TTL)
            .await
    }

    async fn cached_balance(
        &self,
        db: &Database,
        key: String,
        wallet: Address,
        chain_id: Option<u64>,
        ttl: Duration,
    ) -> Result<WalletBalance> {
        if let Some(cached) = self.read(&key).await {
            match serde_json::from_str::<WalletBalance>(&cached) {
                Ok(balance) => return Ok(balance),
                Err(e) => warn!("Discarding unreadable balance cached under {}: {}", key, e),
            }
        }

        let db = db.clone();
        let balance_usd = tokio::task::spawn_blocking(move || {
            let conn = db.conn();
            BalanceRepository::new(&conn).wallet_balance(&wallet, chain_id)
        })
        .await??;

        let balance = WalletBalance {
            wallet,
            chain_id,
            balance_usd,
        };
        self.write(&key, &serde_json::to_string(&balance)?, Some(ttl))
            .await;
        Ok(balance)
    }

    /// A failing store degrades to a miss.
    async fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => {
                if value.is_some() {
                    debug!("Cache hit for {}", key);
                }
                value
            }
            Err(e) => {
                warn!("Cache read for {} failed: {:#}", key, e);
                None
            }
        }
    }

    async fn write(&self, key: &str, value: &str, ttl: Option<Duration>) {
        if let Err(e) = self.store.set(key, value, ttl).await {
            warn!("Cache write for {} failed: {:#}", key, e);
        }
    }
}

fn truncate_to_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    let truncated = secs - secs.rem_euclid(PRICE_BUCKET_SECS);
    DateTime::from_timestamp(truncated, 0).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::interactions::Deal;
    use crate::repository::InteractionRepository;
    use crate::test_utils::{CountingPriceSource, ScriptedChain, sample_deal};
    use chrono::TimeZone;

    fn manager(
        chain: Arc<ScriptedChain>,
        prices: Arc<CountingPriceSource>,
    ) -> (CacheManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = CacheManager::new(store.clone(), chain, prices);
        (manager, store)
    }

    #[tokio::test]
    async fn block_timestamp_is_fetched_once() {
        let chain = Arc::new(ScriptedChain::new(1));
        chain.set_block_timestamp(1000, 1_700_000_000);
        let (cache, _) = manager(chain.clone(), Arc::new(CountingPriceSource::default()));

        let first = cache.get_cached_block_timestamp(1000).await.unwrap();
        let second = cache.get_cached_block_timestamp(1000).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.timestamp(), 1_700_000_000);
        assert_eq!(chain.timestamp_calls(), 1);
    }

    #[tokio::test]
    async fn zero_timestamp_is_rejected_and_not_cached() {
        let chain = Arc::new(ScriptedChain::new(1));
        chain.set_block_timestamp(7, 0);
        let (cache, store) = manager(chain.clone(), Arc::new(CountingPriceSource::default()));

        let err = cache.get_cached_block_timestamp(7).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::InvalidTimestamp { block: 7, .. })
        ));
        assert_eq!(store.get("block:7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_cached_timestamp_is_a_distinct_error() {
        let chain = Arc::new(ScriptedChain::new(1));
        let (cache, store) = manager(chain.clone(), Arc::new(CountingPriceSource::default()));
        store.set("block:5", "yesterday", None).await.unwrap();

        let err = cache.get_cached_block_timestamp(5).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::BadCachedValue { .. })
        ));
        assert_eq!(chain.timestamp_calls(), 0);
    }

    #[tokio::test]
    async fn prices_in_same_bucket_hit_source_once() {
        let prices = Arc::new(CountingPriceSource::with_price("ETH", "3000.5"));
        let (cache, _) = manager(Arc::new(ScriptedChain::new(1)), prices.clone());

        let first_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 10).unwrap();
        let second_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 4, 59).unwrap();
        let next_bucket = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();

        let first = cache.get_cached_symbol_price_at_time("ETH", first_at).await.unwrap();
        let second = cache.get_cached_symbol_price_at_time("eth", second_at).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(prices.calls(), 1);

        cache.get_cached_symbol_price_at_time("ETH", next_bucket).await.unwrap();
        assert_eq!(prices.calls(), 2);
    }

    #[tokio::test]
    async fn quote_symbol_is_always_one() {
        let prices = Arc::new(CountingPriceSource::default());
        let (cache, _) = manager(Arc::new(ScriptedChain::new(1)), prices.clone());

        let price = cache
            .get_cached_symbol_price_at_time("USDT", Utc::now())
            .await
            .unwrap();

        assert_eq!(price, Decimal::ONE);
        assert_eq!(prices.calls(), 0);
    }

    #[tokio::test]
    async fn price_source_failure_propagates() {
        let prices = Arc::new(CountingPriceSource::default());
        let (cache, _) = manager(Arc::new(ScriptedChain::new(1)), prices);

        let err = cache
            .get_cached_symbol_price_at_time("UNLISTED", Utc::now())
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<crate::price::PriceError>().is_some());
    }

    #[test]
    fn bucket_truncation_floors_to_five_minutes() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 7, 42).unwrap();
        let bucket = truncate_to_bucket(at);
        assert_eq!(bucket, Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap());
    }

    /// Keeps the TTL each key was written with but expires entries after
    /// `lifetime`, so expiry can be observed without waiting minutes.
    struct ShortLivedStore {
        inner: MemoryStore,
        lifetime: Duration,
        requested: std::sync::Mutex<std::collections::HashMap<String, Duration>>,
    }

    impl ShortLivedStore {
        fn new(lifetime: Duration) -> Self {
            Self {
                inner: MemoryStore::new(),
                lifetime,
                requested: Default::default(),
            }
        }

        fn requested_ttl(&self, key: &str) -> Option<Duration> {
            self.requested.lock().unwrap().get(key).copied()
        }
    }

    #[async_trait::async_trait]
    impl CacheStore for ShortLivedStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
            if let Some(ttl) = ttl {
                self.requested.lock().unwrap().insert(key.to_string(), ttl);
            }
            self.inner
                .set(key, value, ttl.map(|ttl| ttl.min(self.lifetime)))
                .await
        }
    }

    #[tokio::test]
    async fn wallet_balance_is_served_from_cache_until_expiry() {
        let db = crate::test_utils::memory_db();
        let wallet = Address::repeat_byte(0xaa);
        let other = Address::repeat_byte(0xbb);
        {
            let conn = db.conn();
            let repo = InteractionRepository::new(&conn);
            let incoming: Deal = sample_deal(1, other, wallet, "12.5");
            repo.save_progressively(&[incoming]).unwrap();
        }

        let store = Arc::new(ShortLivedStore::new(Duration::from_millis(200)));
        let cache = CacheManager::new(
            store.clone(),
            Arc::new(ScriptedChain::new(1)),
            Arc::new(CountingPriceSource::default()),
        );
        let balance = cache.get_cached_balance_of_wallet(&db, wallet).await.unwrap();
        assert_eq!(balance.formatted(), "12.50");
        let on_chain = cache
            .get_cached_balance_of_wallet_on_chain(&db, 1, wallet)
            .await
            .unwrap();
        assert_eq!(on_chain.formatted(), "12.50");

        {
            let conn = db.conn();
            let repo = InteractionRepository::new(&conn);
            repo.save_progressively(&[sample_deal(2, wallet, other, "2.5")])
                .unwrap();
        }

        let cached = cache.get_cached_balance_of_wallet(&db, wallet).await.unwrap();
        assert_eq!(cached.formatted(), "12.50");
        assert_eq!(
            store.requested_ttl(&format!("balance:{wallet:?}")),
            Some(WALLET_BALANCE_TTL)
        );
        assert_eq!(
            store.requested_ttl(&format!("balance:1:{wallet:?}")),
            Some(WALLET_CHAIN_BALANCE_TTL)
        );

        tokio::time::sleep(Duration::from_millis(300)).await;

        let refreshed = cache.get_cached_balance_of_wallet(&db, wallet).await.unwrap();
        assert_eq!(refreshed.formatted(), "10.00");
        let on_chain = cache
            .get_cached_balance_of_wallet_on_chain(&db, 1, wallet)
            .await
            .unwrap();
        assert_eq!(on_chain.formatted(), "10.00");
    }
}
