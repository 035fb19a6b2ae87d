pub mod aave;
pub mod compound3;
pub mod hodl;
pub mod lending;
pub mod uniswap_v3;

pub use aave::AaveHandler;
pub use compound3::CompoundHandler;
pub use hodl::HodlHandler;
pub use uniswap_v3::UniswapV3Handler;

use crate::cache::CacheManager;
use crate::interactions::{EventMeta, Valuation};
use crate::parser::DecodeError;
use crate::repository::Token;
use alloy::rpc::types::Log;
use alloy_primitives::{Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

/// One deployed instance of a supported protocol.
///
/// Fetching and enrichment are separate phases so a caller can decide what
/// to persist between them. Handlers keep no state across calls.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    type Event: Send + Sync + 'static;
    type Interaction: Send + 'static;

    fn name(&self) -> &str;

    /// Logs touching `participants` in `[from_block, to_block]`, decoded.
    /// No matching logs is an empty vector, not an error.
    async fn fetch_blockchain_interactions(
        &self,
        chain_id: u64,
        participants: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Self::Event>>;

    /// Prices each event. Events for unknown tokens or with unrepresentable
    /// amounts are logged and dropped.
    async fn populate_with_finance_info(
        &self,
        events: Vec<Self::Event>,
    ) -> Result<Vec<Self::Interaction>>;
}

pub type DynHandler<E, I> = Arc<dyn ProtocolHandler<Event = E, Interaction = I>>;

/// Token reference data for one chain, keyed by contract address.
#[derive(Debug, Clone, Default)]
pub struct TokenBook {
    tokens: HashMap<Address, Token>,
}

impl TokenBook {
    pub fn new(tokens: impl IntoIterator<Item = Token>) -> Self {
        Self {
            tokens: tokens.into_iter().map(|t| (t.address, t)).collect(),
        }
    }

    pub fn get(&self, address: &Address) -> Option<&Token> {
        self.tokens.get(address)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Largest mantissa a `Decimal` holds (2^96 - 1).
const MAX_DECIMAL_MANTISSA: u128 = (1u128 << 96) - 1;
const MAX_DECIMAL_SCALE: u32 = 28;

/// `raw / 10^decimals` as a `Decimal`. Digits below `Decimal`'s precision
/// are dropped; `None` when the integer part itself does not fit.
pub fn token_volume(raw: U256, decimals: u8) -> Option<Decimal> {
    let max_mantissa = U256::from(MAX_DECIMAL_MANTISSA);
    let ten = U256::from(10u8);

    let mut mantissa = raw;
    let mut scale = u32::from(decimals);
    while mantissa > max_mantissa || scale > MAX_DECIMAL_SCALE {
        if scale == 0 {
            return None;
        }
        mantissa /= ten;
        scale -= 1;
    }

    let mantissa = i128::try_from(u128::try_from(mantissa).ok()?).ok()?;
    Decimal::try_from_i128_with_scale(mantissa, scale)
        .ok()
        .map(|d| d.normalize())
}

/// Prices `amount` of `token` at `at`. `Ok(None)` when the amount cannot be
/// represented; lookup failures are errors.
pub(crate) async fn value_amount(
    cache: &CacheManager,
    token: &Token,
    amount: U256,
    at: DateTime<Utc>,
) -> Result<Option<Valuation>> {
    let Some(volume) = token_volume(amount, token.decimals) else {
        return Ok(None);
    };
    let unit_price = cache
        .get_cached_symbol_price_at_time(&token.symbol, at)
        .await?;
    let Some(volume_usd) = volume.checked_mul(unit_price) else {
        return Ok(None);
    };

    Ok(Some(Valuation {
        symbol: token.symbol.clone(),
        unit_price,
        volume,
        volume_usd,
    }))
}

/// Runs `enrich` over `events` with at most `parallel_factor` in flight,
/// keeping the records it produced.
pub(crate) async fn enrich_concurrently<E, I, F, Fut>(
    events: Vec<E>,
    parallel_factor: usize,
    enrich: F,
) -> Result<Vec<I>>
where
    F: Fn(E) -> Fut,
    Fut: Future<Output = Result<Option<I>>>,
{
    let enriched: Vec<Option<I>> = stream::iter(events)
        .map(enrich)
        .buffer_unordered(parallel_factor.max(1))
        .try_collect()
        .await?;
    Ok(enriched.into_iter().flatten().collect())
}

/// Position of a decoded log plus its block's timestamp from the cache.
pub(crate) async fn event_meta(
    chain_id: u64,
    log: &Log,
    cache: &CacheManager,
) -> Result<EventMeta, DecodeError> {
    let (Some(block_number), Some(tx_hash), Some(log_index)) =
        (log.block_number, log.transaction_hash, log.log_index)
    else {
        return Err(DecodeError::Malformed(anyhow::anyhow!(
            "log from {} is missing its block position",
            log.address()
        )));
    };

    let timestamp = cache
        .get_cached_block_timestamp(block_number)
        .await
        .map_err(DecodeError::Lookup)?;

    Ok(EventMeta {
        chain_id,
        block_number,
        tx_hash,
        log_index,
        timestamp,
    })
}

/// Drops logs already seen under the same `(tx_hash, log_index)`.
pub(crate) fn dedupe_logs(logs: Vec<Log>) -> Vec<Log> {
    let mut seen: HashSet<(Option<B256>, Option<u64>)> = HashSet::new();
    logs.into_iter()
        .filter(|log| seen.insert((log.transaction_hash, log.log_index)))
        .collect()
}

pub(crate) fn address_topics(addresses: &[Address]) -> Vec<B256> {
    addresses.iter().map(|a| a.into_word()).collect()
}
