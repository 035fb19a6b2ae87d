use super::{
    ProtocolHandler, TokenBook, address_topics, dedupe_logs, enrich_concurrently, event_meta,
    value_amount,
};
use crate::cache::CacheManager;
use crate::events::{IERC20, decode_event};
use crate::interactions::{Deal, TransferEvent};
use crate::parser::{DecodeError, parse_concurrently};
use crate::repository::Token;
use crate::rpc::ChainClient;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy_primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Plain ERC-20 transfers of one token to or from tracked wallets.
pub struct HodlHandler {
    chain: Arc<dyn ChainClient>,
    cache: Arc<CacheManager>,
    tokens: Arc<TokenBook>,
    token: Token,
    parallel_factor: usize,
    name: String,
}

impl HodlHandler {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        cache: Arc<CacheManager>,
        tokens: Arc<TokenBook>,
        token: Token,
        parallel_factor: usize,
    ) -> Self {
        let name = format!("HODL {}", token.symbol);
        Self {
            chain,
            cache,
            tokens,
            token,
            parallel_factor,
            name,
        }
    }

    async fn decode(&self, chain_id: u64, log: Log) -> Result<TransferEvent, DecodeError> {
        let transfer =
            decode_event::<IERC20::Transfer>(&log).map_err(DecodeError::Malformed)?;
        let meta = event_meta(chain_id, &log, &self.cache).await?;

        Ok(TransferEvent {
            meta,
            token: log.address(),
            sender: transfer.from,
            recipient: transfer.to,
            amount: transfer.value,
        })
    }

    async fn enrich(&self, event: TransferEvent) -> Result<Option<Deal>> {
        let Some(token) = self.tokens.get(&event.token) else {
            warn!(
                "[{}] Unknown token {:?} in tx {:?}, skipping",
                self.name, event.token, event.meta.tx_hash
            );
            return Ok(None);
        };

        match value_amount(&self.cache, token, event.amount, event.meta.timestamp).await? {
            Some(valuation) => Ok(Some(Deal { event, valuation })),
            None => {
                warn!(
                    "[{}] Amount {} in tx {:?} is out of range, skipping",
                    self.name, event.amount, event.meta.tx_hash
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for HodlHandler {
    type Event = TransferEvent;
    type Interaction = Deal;

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_blockchain_interactions(
        &self,
        chain_id: u64,
        participants: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>> {
        if participants.is_empty() {
            return Ok(Vec::new());
        }

        let topics = address_topics(participants);
        let base = Filter::new()
            .address(self.token.address)
            .event_signature(IERC20::Transfer::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);
        let sent = base.clone().topic1(topics.clone());
        let received = base.topic2(topics);

        let (mut logs, incoming) =
            tokio::try_join!(self.chain.get_logs(&sent), self.chain.get_logs(&received))?;
        logs.extend(incoming);
        let logs = dedupe_logs(logs);

        debug!(
            "[{}] {} transfer logs in blocks {}-{}",
            self.name,
            logs.len(),
            from_block,
            to_block
        );

        parse_concurrently(&self.name, logs, self.parallel_factor, |log| {
            self.decode(chain_id, log)
        })
        .await
    }

    async fn populate_with_finance_info(&self, events: Vec<TransferEvent>) -> Result<Vec<Deal>> {
        enrich_concurrently(events, self.parallel_factor, |event| self.enrich(event)).await
    }
}
