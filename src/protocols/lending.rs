use super::{TokenBook, value_amount};
use crate::cache::CacheManager;
use crate::interactions::{LendingEvent, LendingInteraction};
use anyhow::Result;
use tracing::warn;

/// Shared enrichment for lending-pool and money-market events; both price
/// the supplied or withdrawn asset.
pub(crate) async fn enrich_lending_event(
    name: &str,
    cache: &CacheManager,
    tokens: &TokenBook,
    event: LendingEvent,
) -> Result<Option<LendingInteraction>> {
    let Some(token) = tokens.get(&event.asset) else {
        warn!(
            "[{}] Unknown asset {:?} in tx {:?}, skipping",
            name, event.asset, event.meta.tx_hash
        );
        return Ok(None);
    };

    match value_amount(cache, token, event.amount, event.meta.timestamp).await? {
        Some(valuation) => Ok(Some(LendingInteraction { event, valuation })),
        None => {
            warn!(
                "[{}] Amount {} in tx {:?} is out of range, skipping",
                name, event.amount, event.meta.tx_hash
            );
            Ok(None)
        }
    }
}
