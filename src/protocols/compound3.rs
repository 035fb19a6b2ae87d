use super::lending::enrich_lending_event;
use super::{ProtocolHandler, TokenBook, address_topics, enrich_concurrently, event_meta};
use crate::cache::CacheManager;
use crate::events::{IComet, decode_event};
use crate::interactions::{LendingAction, LendingEvent, LendingInteraction, LendingProtocol};
use crate::parser::{DecodeError, parse_concurrently};
use crate::rpc::{ChainClient, call_contract};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

enum CometLog {
    Supply(Log),
    Withdraw(Log),
    SupplyCollateral(Log),
    WithdrawCollateral(Log),
}

impl CometLog {
    fn classify(log: Log) -> Option<Self> {
        let signature = *log.topics().first()?;
        if signature == IComet::Supply::SIGNATURE_HASH {
            Some(CometLog::Supply(log))
        } else if signature == IComet::Withdraw::SIGNATURE_HASH {
            Some(CometLog::Withdraw(log))
        } else if signature == IComet::SupplyCollateral::SIGNATURE_HASH {
            Some(CometLog::SupplyCollateral(log))
        } else if signature == IComet::WithdrawCollateral::SIGNATURE_HASH {
            Some(CometLog::WithdrawCollateral(log))
        } else {
            None
        }
    }
}

/// Base-asset and collateral flows of tracked wallets on one Compound III
/// comet.
pub struct CompoundHandler {
    chain: Arc<dyn ChainClient>,
    cache: Arc<CacheManager>,
    tokens: Arc<TokenBook>,
    comet: Address,
    base_token: Address,
    parallel_factor: usize,
    name: String,
}

impl CompoundHandler {
    /// Resolves the comet's base token on chain.
    pub async fn new(
        chain: Arc<dyn ChainClient>,
        cache: Arc<CacheManager>,
        tokens: Arc<TokenBook>,
        comet: Address,
        parallel_factor: usize,
    ) -> Result<Self> {
        let base_token = call_contract(chain.as_ref(), comet, IComet::baseTokenCall {})
            .await
            .with_context(|| format!("Failed to read base token of comet {comet:?}"))?;

        let name = format!("Compound3 {comet:?}");
        info!("[{}] Base token {:?}", name, base_token);

        Ok(Self {
            chain,
            cache,
            tokens,
            comet,
            base_token,
            parallel_factor,
            name,
        })
    }

    async fn decode(&self, chain_id: u64, raw: CometLog) -> Result<LendingEvent, DecodeError> {
        let (log, action, user, asset, amount, collateral) = match &raw {
            CometLog::Supply(log) => {
                let e = decode_event::<IComet::Supply>(log).map_err(DecodeError::Malformed)?;
                (log, LendingAction::Supply, e.dst, self.base_token, e.amount, false)
            }
            CometLog::Withdraw(log) => {
                let e = decode_event::<IComet::Withdraw>(log).map_err(DecodeError::Malformed)?;
                (log, LendingAction::Withdraw, e.to, self.base_token, e.amount, false)
            }
            CometLog::SupplyCollateral(log) => {
                let e = decode_event::<IComet::SupplyCollateral>(log)
                    .map_err(DecodeError::Malformed)?;
                (log, LendingAction::Supply, e.dst, e.asset, e.amount, true)
            }
            CometLog::WithdrawCollateral(log) => {
                let e = decode_event::<IComet::WithdrawCollateral>(log)
                    .map_err(DecodeError::Malformed)?;
                (log, LendingAction::Withdraw, e.to, e.asset, e.amount, true)
            }
        };

        Ok(LendingEvent {
            meta: event_meta(chain_id, log, &self.cache).await?,
            protocol: LendingProtocol::Compound3,
            action,
            market: self.comet,
            user,
            asset,
            amount,
            collateral,
        })
    }
}

#[async_trait]
impl ProtocolHandler for CompoundHandler {
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

        // dst/to is the second indexed argument of all four events
        let filter = Filter::new()
            .address(self.comet)
            .event_signature(vec![
                IComet::Supply::SIGNATURE_HASH,
                IComet::Withdraw::SIGNATURE_HASH,
                IComet::SupplyCollateral::SIGNATURE_HASH,
                IComet::WithdrawCollateral::SIGNATURE_HASH,
            ])
            .topic2(address_topics(participants))
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.chain.get_logs(&filter).await?;
        debug!(
            "[{}] {} comet logs in blocks {}-{}",
            self.name,
            logs.len(),
            from_block,
            to_block
        );

        let raw: Vec<CometLog> = logs
            .into_iter()
            .filter_map(|log| {
                let tx_hash = log.transaction_hash;
                let classified = CometLog::classify(log);
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
