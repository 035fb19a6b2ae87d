pub mod balance_repository;
pub mod database;
pub mod interaction_repository;
pub mod models;
pub mod protocol_repository;
pub mod token_repository;
pub mod wallet_repository;
pub mod worker_repository;

pub use balance_repository::{BalanceRepository, calculate_balance};
pub use database::Database;
pub use interaction_repository::{
    DealView, InteractionRepository, SaveReport, StoredInteraction, is_duplicate_key,
};
pub use models::{
    AnalyticsWorkerConfig, ProtocolInstance, ProtocolKind, Token, TrackedWallet, WorkerConfig,
};
pub use protocol_repository::ProtocolRepository;
pub use token_repository::TokenRepository;
pub use wallet_repository::WalletRepository;
pub use worker_repository::WorkerRepository;

use alloy_primitives::Address;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::str::FromStr;

pub(crate) fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw).with_context(|| format!("Invalid address stored: {raw}"))
}

pub(crate) fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Invalid decimal stored: {raw}"))
}
