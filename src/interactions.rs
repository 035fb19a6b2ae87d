use alloy_primitives::{Address, B256, I256, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Where a decoded event sits on chain. `(tx_hash, log_index)` identifies it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMeta {
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub timestamp: DateTime<Utc>,
}

/// USD valuation attached to a raw event.
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub symbol: String,
    pub unit_price: Decimal,
    pub volume: Decimal,
    pub volume_usd: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub meta: EventMeta,
    pub token: Address,
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
}

/// A priced ERC-20 transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct Deal {
    pub event: TransferEvent,
    pub valuation: Valuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LendingProtocol {
    Aave,
    Compound3,
}

impl LendingProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            LendingProtocol::Aave => "aave",
            LendingProtocol::Compound3 => "compound3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LendingAction {
    Supply,
    Withdraw,
}

impl LendingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LendingAction::Supply => "supply",
            LendingAction::Withdraw => "withdraw",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LendingEvent {
    pub meta: EventMeta,
    pub protocol: LendingProtocol,
    pub action: LendingAction,
    /// Pool or comet contract that emitted the event.
    pub market: Address,
    pub user: Address,
    pub asset: Address,
    pub amount: U256,
    pub collateral: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LendingInteraction {
    pub event: LendingEvent,
    pub valuation: Valuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEventKind {
    Mint,
    Burn,
    Swap,
}

impl PoolEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolEventKind::Mint => "mint",
            PoolEventKind::Burn => "burn",
            PoolEventKind::Swap => "swap",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolEvent {
    pub meta: EventMeta,
    pub pool: Address,
    pub kind: PoolEventKind,
    /// Position owner for mint/burn, swap recipient for swaps.
    pub participant: Address,
    /// Pool balance deltas, positive into the pool.
    pub amount0: I256,
    pub amount1: I256,
    pub liquidity: u128,
    /// Tick range prices for mint/burn; both equal the post-swap price for swaps.
    pub price_lower: f64,
    pub price_upper: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolDeal {
    pub event: PoolEvent,
    pub token0: Valuation,
    pub token1: Valuation,
    pub volume_usd: Decimal,
}
