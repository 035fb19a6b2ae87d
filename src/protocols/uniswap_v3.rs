use super::{
    ProtocolHandler, TokenBook, address_topics, enrich_concurrently, event_meta, value_amount,
};
use crate::cache::CacheManager;
use crate::events::{IUniswapV3Pool, decode_event};
use crate::interactions::{PoolDeal, PoolEvent, PoolEventKind};
use crate::parser::{DecodeError, parse_concurrently};
use crate::repository::Token;
use crate::rpc::{ChainClient, call_contract};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, I256, U256, Uint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

enum PoolLog {
    Mint(Log),
    Burn(Log),
    Swap(Log),
}

impl PoolLog {
    fn classify(log: Log) -> Option<Self> {
        let signature = *log.topics().first()?;
        if signature == IUniswapV3Pool::Mint::SIGNATURE_HASH {
            Some(PoolLog::Mint(log))
        } else if signature == IUniswapV3Pool::Burn::SIGNATURE_HASH {
            Some(PoolLog::Burn(log))
        } else if signature == IUniswapV3Pool::Swap::SIGNATURE_HASH {
            Some(PoolLog::Swap(log))
        } else {
            None
        }
    }
}

/// `1.0001^tick` adjusted for the decimals of the pair, token1 per token0.
pub fn tick_to_price(tick: i32, decimals0: u8, decimals1: u8) -> f64 {
    1.0001f64.powi(tick) * decimal_adjustment(decimals0, decimals1)
}

/// `(sqrtPriceX96 / 2^96)^2` adjusted for the decimals of the pair.
pub fn sqrt_price_x96_to_price<const BITS: usize, const LIMBS: usize>(
    sqrt_price_x96: &Uint<BITS, LIMBS>,
    decimals0: u8,
    decimals1: u8,
) -> f64 {
    let sqrt = uint_to_f64(sqrt_price_x96) / 2f64.powi(96);
    sqrt * sqrt * decimal_adjustment(decimals0, decimals1)
}

fn decimal_adjustment(decimals0: u8, decimals1: u8) -> f64 {
    10f64.powi(i32::from(decimals0) - i32::from(decimals1))
}

fn uint_to_f64<const BITS: usize, const LIMBS: usize>(value: &Uint<BITS, LIMBS>) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, limb| acc * 2f64.powi(64) + *limb as f64)
}

fn to_signed(amount: U256) -> Result<I256, DecodeError> {
    I256::try_from(amount)
        .map_err(|_| DecodeError::Malformed(anyhow::anyhow!("amount {amount} overflows int256")))
}

/// Liquidity and swap activity of tracked wallets on one Uniswap V3 pool.
///
/// Amounts are pool balance deltas: positive flows into the pool, so burns
/// are negative.
pub struct UniswapV3Handler {
    chain: Arc<dyn ChainClient>,
    cache: Arc<CacheManager>,
    pool: Address,
    token0: Token,
    token1: Token,
    parallel_factor: usize,
    name: String,
}

impl UniswapV3Handler {
    /// Resolves the pool's pair on chain. Both tokens must be known.
    pub async fn new(
        chain: Arc<dyn ChainClient>,
        cache: Arc<CacheManager>,
        tokens: &TokenBook,
        pool: Address,
        parallel_factor: usize,
    ) -> Result<Self> {
        let (token0, token1) = tokio::try_join!(
            call_contract(chain.as_ref(), pool, IUniswapV3Pool::token0Call {}),
            call_contract(chain.as_ref(), pool, IUniswapV3Pool::token1Call {}),
        )
        .with_context(|| format!("Failed to read pair of pool {pool:?}"))?;

        let lookup = |address: Address| {
            tokens
                .get(&address)
                .cloned()
                .with_context(|| format!("Pool {pool:?} trades unknown token {address:?}"))
        };
        let token0 = lookup(token0)?;
        let token1 = lookup(token1)?;

        let name = format!("UniswapV3 {}/{} {:?}", token0.symbol, token1.symbol, pool);
        info!("[{}] Pool resolved", name);

        Ok(Self {
            chain,
            cache,
            pool,
            token0,
            token1,
            parallel_factor,
            name,
        })
    }

    /// Every mint and burn on the pool in `[from_block, to_block]`, whoever
    /// the owner is.
    pub async fn fetch_liquidity_interactions(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PoolEvent>> {
        let filter = self.liquidity_filter(from_block, to_block);
        let logs = self.chain.get_logs(&filter).await?;
        debug!(
            "[{}] {} liquidity logs in blocks {}-{}",
            self.name,
            logs.len(),
            from_block,
            to_block
        );
        self.decode_all(chain_id, logs).await
    }

    fn liquidity_filter(&self, from_block: u64, to_block: u64) -> Filter {
        Filter::new()
            .address(self.pool)
            .event_signature(vec![
                IUniswapV3Pool::Mint::SIGNATURE_HASH,
                IUniswapV3Pool::Burn::SIGNATURE_HASH,
            ])
            .from_block(from_block)
            .to_block(to_block)
    }

    async fn decode_all(&self, chain_id: u64, logs: Vec<Log>) -> Result<Vec<PoolEvent>> {
        let raw: Vec<PoolLog> = logs
            .into_iter()
            .filter_map(|log| {
                let tx_hash = log.transaction_hash;
                let classified = PoolLog::classify(log);
                if classified.is_none() {
                    warn!("[{}] Unexpected log in tx {:?}, skipping", self.name, tx_hash);
                }
                classified
            })
            .collect();

        parse_concurrently(&self.name, raw, self.parallel_factor, |log| {
            self.decode(chain_id, log)
        })
        .await
    }

    async fn decode(&self, chain_id: u64, raw: PoolLog) -> Result<PoolEvent, DecodeError> {
        let (d0, d1) = (self.token0.decimals, self.token1.decimals);

        let (log, kind, participant, amount0, amount1, liquidity, price_lower, price_upper) =
            match &raw {
                PoolLog::Mint(log) => {
                    let e = decode_event::<IUniswapV3Pool::Mint>(log)
                        .map_err(DecodeError::Malformed)?;
                    (
                        log,
                        PoolEventKind::Mint,
                        e.owner,
                        to_signed(e.amount0)?,
                        to_signed(e.amount1)?,
                        e.amount,
                        tick_to_price(e.tickLower.as_i32(), d0, d1),
                        tick_to_price(e.tickUpper.as_i32(), d0, d1),
                    )
                }
                PoolLog::Burn(log) => {
                    let e = decode_event::<IUniswapV3Pool::Burn>(log)
                        .map_err(DecodeError::Malformed)?;
                    (
                        log,
                        PoolEventKind::Burn,
                        e.owner,
                        -to_signed(e.amount0)?,
                        -to_signed(e.amount1)?,
                        e.amount,
                        tick_to_price(e.tickLower.as_i32(), d0, d1),
                        tick_to_price(e.tickUpper.as_i32(), d0, d1),
                    )
                }
                PoolLog::Swap(log) => {
                    let e = decode_event::<IUniswapV3Pool::Swap>(log)
                        .map_err(DecodeError::Malformed)?;
                    let price = sqrt_price_x96_to_price(&e.sqrtPriceX96, d0, d1);
                    (
                        log,
                        PoolEventKind::Swap,
                        e.recipient,
                        e.amount0,
                        e.amount1,
                        e.liquidity,
                        price,
                        price,
                    )
                }
            };

        Ok(PoolEvent {
            meta: event_meta(chain_id, log, &self.cache).await?,
            pool: self.pool,
            kind,
            participant,
            amount0,
            amount1,
            liquidity,
            price_lower,
            price_upper,
        })
    }

    async fn enrich(&self, event: PoolEvent) -> Result<Option<PoolDeal>> {
        let at = event.meta.timestamp;
        let (token0, token1) = tokio::try_join!(
            value_amount(&self.cache, &self.token0, event.amount0.unsigned_abs(), at),
            value_amount(&self.cache, &self.token1, event.amount1.unsigned_abs(), at),
        )?;

        let valued = token0.zip(token1).and_then(|(token0, token1)| {
            let volume_usd = token0.volume_usd.checked_add(token1.volume_usd)?;
            Some((token0, token1, volume_usd))
        });
        let Some((token0, token1, volume_usd)) = valued else {
            warn!(
                "[{}] Amounts in tx {:?} are out of range, skipping",
                self.name, event.meta.tx_hash
            );
            return Ok(None);
        };

        Ok(Some(PoolDeal {
            event,
            token0,
            token1,
            volume_usd,
        }))
    }
}

#[async_trait]
impl ProtocolHandler for UniswapV3Handler {
    type Event = PoolEvent;
    type Interaction = PoolDeal;

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_blockchain_interactions(
        &self,
        chain_id: u64,
        participants: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<PoolEvent>> {
        if participants.is_empty() {
            return Ok(Vec::new());
        }

        let topics = address_topics(participants);
        let liquidity = self
            .liquidity_filter(from_block, to_block)
            .topic1(topics.clone());
        let swaps = Filter::new()
            .address(self.pool)
            .event_signature(IUniswapV3Pool::Swap::SIGNATURE_HASH)
            .topic2(topics)
            .from_block(from_block)
            .to_block(to_block);

        let (mut logs, swap_logs) =
            tokio::try_join!(self.chain.get_logs(&liquidity), self.chain.get_logs(&swaps))?;
        logs.extend(swap_logs);

        debug!(
            "[{}] {} pool logs in blocks {}-{}",
            self.name,
            logs.len(),
            from_block,
            to_block
        );

        self.decode_all(chain_id, logs).await
    }

    async fn populate_with_finance_info(&self, events: Vec<PoolEvent>) -> Result<Vec<PoolDeal>> {
        enrich_concurrently(events, self.parallel_factor, |event| self.enrich(event)).await
    }
}
