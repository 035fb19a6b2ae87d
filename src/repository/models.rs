use alloy_primitives::Address;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub chain_id: u64,
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedWallet {
    pub chain_id: u64,
    pub address: Address,
    pub last_block: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Hodl,
    Aave,
    Compound3,
    UniswapV3,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Hodl => "hodl",
            ProtocolKind::Aave => "aave",
            ProtocolKind::Compound3 => "compound3",
            ProtocolKind::UniswapV3 => "uniswapv3",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hodl" => Ok(ProtocolKind::Hodl),
            "aave" => Ok(ProtocolKind::Aave),
            "compound3" => Ok(ProtocolKind::Compound3),
            "uniswapv3" => Ok(ProtocolKind::UniswapV3),
            other => Err(anyhow::anyhow!("Unknown protocol kind: {}", other)),
        }
    }
}

/// A deployed contract the indexer watches. For `Hodl` the address is the
/// token itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolInstance {
    pub id: i64,
    pub chain_id: u64,
    pub kind: ProtocolKind,
    pub address: Address,
    pub position_manager: Option<Address>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub id: i64,
    pub rpc_urls: Vec<String>,
    /// Endpoints for timestamp lookups; falls back to `rpc_urls` when empty.
    pub cache_rpc_urls: Vec<String>,
    pub blocks_interval: u64,
    pub parallel_factor: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsWorkerConfig {
    pub id: i64,
    pub rpc_urls: Vec<String>,
    pub blocks_interval: u64,
    pub last_block: u64,
    pub pool: Address,
}
