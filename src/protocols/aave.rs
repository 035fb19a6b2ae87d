use super::lending::enrich_lending_event;
use super::{ProtocolHandler, TokenBook, address_topics, enrich_concurrently, event_meta};
use crate::cache::CacheManager;
use crate::events::{IAavePool, decode_event};
use crate::interactions::{LendingAction, LendingEvent, LendingInteraction, LendingProtocol};
use crate::parser::{DecodeError, parse_concurrently};
use crate::rpc::ChainClient;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy_primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Raw pool logs tagged by the query that produced them.
enum AaveLog {
    Supply(Log),
    Withdraw(Log),
}

/// Supplies credited to and withdrawals paid out to tracked wallets on one
/// Aave V3 pool.
pub struct AaveHandler {
    chain: Arc<dyn ChainClient>,
    cache: Arc<CacheManager>,
    tokens: Arc<TokenBook>,
    pool: Address,
    parallel_factor: usize,
    name: String,
}

impl AaveHandler {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        cache: Arc<CacheManager>,
        tokens: Arc<TokenBook>,
        pool: Address,
        parallel_factor: usize,
    ) -> Self {
        Self {
            chain,
            cache,
            tokens,
            pool,
            parallel_factor,
            name: format!("Aave {pool:?}"),
        }
    }

    async fn decode(&self, chain_id: u64, raw: AaveLog) -> Result<LendingEvent, DecodeError> {
        let (log, action, user, asset, amount) = match &raw {
            AaveLog::Supply(log) => {
                let supply =
                    decode_event::<IAavePool::Supply>(log).map_err(DecodeError::Malformed)?;
                (
                    log,
                    LendingAction::Supply,
                    supply.onBehalfOf,
                    supply.reserve,
                    supply.amount,
                )
            }
            AaveLog::Withdraw(log) => {
                let withdraw =
                    decode_event::<IAavePool::Withdraw>(log).map_err(DecodeError::Malformed)?;
                (
                    log,
                    LendingAction::Withdraw,
                    withdraw.to,
                    withdraw.reserve,
                    withdraw.amount,
                )
            }
        };

        Ok(LendingEvent {
            meta: event_meta(chain_id, log, &self.cache).await?,
            protocol: LendingProtocol::Aave,
            action,
            market: self.pool,
            user,
            asset,
            amount,
            collateral: false,
        })
    }
}

#[async_trait]
impl ProtocolHandler for AaveHandler {
    type Event = LendingEvent;
    type Interaction = LendingInteraction;

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_blockchain_interactions(
        &self,
        chain_id: u64,
        participants: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LendingEvent>> {
        if participants.is_empty() {
            return Ok(Vec::new());
        }

        let topics = address_topics(participants);
        let base = Filter::new()
            .address(self.pool)
            .from_block(from_block)
            .to_block(to_block);
        let supplies = base
            .clone()
            .event_signature(IAavePool::Supply::SIGNATURE_HASH)
            .topic2(topics.clone());
        let withdrawals = base
            .event_signature(IAavePool::Withdraw::SIGNATURE_HASH)
            .topic3(topics);

        let (supply_logs, withdraw_logs) = tokio::try_join!(
            self.chain.get_logs(&supplies),
            self.chain.get_logs(&withdrawals)
        )?;

        debug!(
            "[{}] {} supply and {} withdraw logs in blocks {}-{}",
            self.name,
            supply_logs.len(),
            withdraw_logs.len(),
            from_block,
            to_block
        );

        let raw: Vec<AaveLog> = supply_logs
            .into_iter()
            .map(AaveLog::Supply)
            .chain(withdraw_logs.into_iter().map(AaveLog::Withdraw))
            .collect();

        parse_concurrently(&self.name, raw, self.parallel_factor, |log| {
            self.decode(chain_id, log)
        })
        .await
    }

    async fn populate_with_finance_info(
        &self,
        events: Vec<LendingEvent>,
    ) -> Result<Vec<LendingInteraction>> {
        enrich_concurrently(events, self.parallel_factor, |event| {
            enrich_lending_event(&self.name, &self.cache, &self.tokens, event)
        })
        .await
    }
}
