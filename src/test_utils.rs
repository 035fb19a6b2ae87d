// Fakes shared by unit tests. Nothing here touches the network.

use crate::cache::{CacheManager, MemoryStore};
use crate::interactions::{Deal, EventMeta, TransferEvent, Valuation};
use crate::price::{PriceError, PriceSource};
use crate::repository::{Database, Token};
use crate::rpc::ChainClient;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, Bytes, U256};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
const BLOCK_TIME: u64 = 12;

/// In-memory chain: canned logs, block timestamps and call results.
pub struct ScriptedChain {
    chain_id: u64,
    head: AtomicU64,
    timestamps: Mutex<HashMap<u64, u64>>,
    logs: Mutex<Vec<Log>>,
    calls: Mutex<HashMap<(Address, [u8; 4]), Bytes>>,
    failing_contracts: Mutex<HashSet<Address>>,
    timestamp_calls: AtomicUsize,
    log_queries: AtomicUsize,
}

impl ScriptedChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            head: AtomicU64::new(0),
            timestamps: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            failing_contracts: Mutex::new(HashSet::new()),
            timestamp_calls: AtomicUsize::new(0),
            log_queries: AtomicUsize::new(0),
        }
    }

    pub fn set_head(&self, block: u64) {
        self.head.store(block, Ordering::SeqCst);
    }

    pub fn set_block_timestamp(&self, block: u64, timestamp: u64) {
        self.timestamps.lock().unwrap().insert(block, timestamp);
    }

    pub fn push_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn set_call_result(&self, contract: Address, selector: [u8; 4], output: Vec<u8>) {
        self.calls
            .lock()
            .unwrap()
            .insert((contract, selector), output.into());
    }

    /// Log queries against `contract` fail from now on.
    pub fn fail_logs_for(&self, contract: Address) {
        self.failing_contracts.lock().unwrap().insert(contract);
    }

    pub fn timestamp_calls(&self) -> usize {
        self.timestamp_calls.load(Ordering::SeqCst)
    }

    pub fn log_queries(&self) -> usize {
        self.log_queries.load(Ordering::SeqCst)
    }
}

fn filter_matches(filter: &Filter, log: &Log) -> bool {
    if !filter.address.matches(&log.address()) {
        return false;
    }
    if let Some(block) = log.block_number {
        if filter.get_from_block().is_some_and(|from| block < from)
            || filter.get_to_block().is_some_and(|to| block > to)
        {
            return false;
        }
    }
    filter
        .topics
        .iter()
        .enumerate()
        .all(|(i, wanted)| match log.topics().get(i) {
            Some(topic) => wanted.matches(topic),
            None => wanted.is_empty(),
        })
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        self.timestamp_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.timestamps.lock().unwrap().get(&block_number).copied();
        Ok(scripted.unwrap_or(GENESIS_TIMESTAMP + block_number * BLOCK_TIME))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.log_queries.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_contracts
            .lock()
            .unwrap()
            .iter()
            .any(|contract| !filter.address.is_empty() && filter.address.matches(contract));
        if failing {
            anyhow::bail!("all 1 RPC endpoint(s) failed; last error: rate limited");
        }

        let logs = self.logs.lock().unwrap();
        Ok(logs
            .iter()
            .filter(|log| filter_matches(filter, log))
            .cloned()
            .collect())
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        let selector: [u8; 4] = input
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| anyhow::anyhow!("call without selector"))?;
        self.calls
            .lock()
            .unwrap()
            .get(&(to, selector))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("execution reverted"))
    }
}

/// Fixed quotes per symbol; counts every lookup.
#[derive(Default)]
pub struct CountingPriceSource {
    prices: HashMap<String, Decimal>,
    calls: AtomicUsize,
}

impl CountingPriceSource {
    pub fn with_price(symbol: &str, price: &str) -> Self {
        Self::with_prices(&[(symbol, price)])
    }

    pub fn with_prices(prices: &[(&str, &str)]) -> Self {
        Self {
            prices: prices
                .iter()
                .map(|(s, p)| (s.to_uppercase(), Decimal::from_str(p).unwrap()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for CountingPriceSource {
    async fn close_price(&self, symbol: &str, _at: DateTime<Utc>) -> Result<Decimal, PriceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prices
            .get(&symbol.to_uppercase())
            .copied()
            .ok_or_else(|| PriceError::FetchFailed {
                symbol: symbol.to_string(),
                status: StatusCode::BAD_REQUEST,
            })
    }
}

pub fn memory_db() -> Database {
    Database::in_memory().unwrap()
}

pub fn cache_manager(
    chain: Arc<ScriptedChain>,
    prices: Arc<CountingPriceSource>,
) -> Arc<CacheManager> {
    Arc::new(CacheManager::new(
        Arc::new(MemoryStore::new()),
        chain,
        prices,
    ))
}

pub fn token(chain_id: u64, address: Address, symbol: &str, decimals: u8) -> Token {
    Token {
        chain_id,
        address,
        symbol: symbol.to_string(),
        decimals,
    }
}

pub fn usdc_token(chain_id: u64) -> Token {
    token(chain_id, Address::repeat_byte(0xc5), "USDC", 6)
}

pub fn log_at(
    address: Address,
    topics: Vec<B256>,
    data: impl Into<Bytes>,
    block_number: u64,
    tx_hash: B256,
    log_index: u64,
) -> Log {
    Log {
        inner: alloy_primitives::Log::new_unchecked(address, topics, data.into()),
        block_number: Some(block_number),
        transaction_hash: Some(tx_hash),
        log_index: Some(log_index),
        ..Default::default()
    }
}

pub fn transfer_log(
    token: Address,
    from: Address,
    to: Address,
    amount: U256,
    block_number: u64,
    tx_hash: B256,
    log_index: u64,
) -> Log {
    log_at(
        token,
        vec![
            crate::events::IERC20::Transfer::SIGNATURE_HASH,
            from.into_word(),
            to.into_word(),
        ],
        amount.to_be_bytes::<32>().to_vec(),
        block_number,
        tx_hash,
        log_index,
    )
}

pub fn meta(chain_id: u64, block_number: u64, log_index: u64) -> EventMeta {
    EventMeta {
        chain_id,
        block_number,
        tx_hash: B256::from(U256::from(block_number * 1_000 + log_index)),
        log_index,
        timestamp: DateTime::from_timestamp(
            (GENESIS_TIMESTAMP + block_number * BLOCK_TIME) as i64,
            0,
        )
        .unwrap(),
    }
}

/// A priced transfer on chain 1 in block `1000 + n` worth `usd`.
pub fn sample_deal(n: u64, sender: Address, recipient: Address, usd: &str) -> Deal {
    let volume_usd = Decimal::from_str(usd).unwrap();
    Deal {
        event: TransferEvent {
            meta: meta(1, 1000 + n, n),
            token: usdc_token(1).address,
            sender,
            recipient,
            amount: U256::from(1_000_000u64),
        },
        valuation: Valuation {
            symbol: "USDC".to_string(),
            unit_price: volume_usd,
            volume: Decimal::ONE,
            volume_usd,
        },
    }
}
