use crate::interactions::{
    Deal, LendingEvent, LendingInteraction, PoolDeal, PoolEvent, TransferEvent,
};
use crate::protocols::{DynHandler, ProtocolHandler};
use crate::repository::{
    Database, InteractionRepository, SaveReport, StoredInteraction, WalletRepository,
};
use alloy_primitives::Address;
use anyhow::{Context, Result, bail};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handlers for every protocol family, one entry per deployed instance.
#[derive(Default, Clone)]
pub struct Handlers {
    pub hodl: Vec<DynHandler<TransferEvent, Deal>>,
    pub aave: Vec<DynHandler<LendingEvent, LendingInteraction>>,
    pub compound: Vec<DynHandler<LendingEvent, LendingInteraction>>,
    pub uniswap: Vec<DynHandler<PoolEvent, PoolDeal>>,
}

impl Handlers {
    pub fn len(&self) -> usize {
        self.hodl.len() + self.aave.len() + self.compound.len() + self.uniswap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type FamilyOutcome = (&'static str, Result<()>);

/// Everything one pass over a block range needs: the chain, the store, the
/// wallets being tracked and the handlers to run for them.
pub struct FetchEnvironment {
    chain_id: u64,
    db: Database,
    wallets: Arc<Vec<Address>>,
    handlers: Handlers,
}

impl FetchEnvironment {
    pub fn new(chain_id: u64, db: Database, wallets: Vec<Address>, handlers: Handlers) -> Self {
        Self {
            chain_id,
            db,
            wallets: Arc::new(wallets),
            handlers,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn wallets(&self) -> &[Address] {
        &self.wallets
    }

    pub fn set_wallets(&mut self, wallets: Vec<Address>) {
        self.wallets = Arc::new(wallets);
    }

    /// Scans `[start, end]` with every protocol family concurrently and
    /// persists what they produce. Wallet checkpoints move to `end` only when
    /// all families succeed; the first failure cancels the others.
    pub async fn fetch(&self, start: u64, end: u64, shutdown: &CancellationToken) -> Result<()> {
        let cancel = shutdown.child_token();
        let mut tasks: JoinSet<FamilyOutcome> = JoinSet::new();

        self.spawn_family(&mut tasks, "hodl", &self.handlers.hodl, start, end, &cancel);
        self.spawn_family(&mut tasks, "aave", &self.handlers.aave, start, end, &cancel);
        self.spawn_family(&mut tasks, "compound3", &self.handlers.compound, start, end, &cancel);
        self.spawn_family(&mut tasks, "uniswapv3", &self.handlers.uniswap, start, end, &cancel);

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((family, Err(e))) => {
                    error!("[{}] Blocks {}-{} failed: {:#}", family, start, end, e);
                    cancel.cancel();
                    failed.push(family);
                }
                Err(e) => {
                    error!("Family task for blocks {}-{} died: {}", start, end, e);
                    cancel.cancel();
                    failed.push("unknown");
                }
            }
        }

        if !failed.is_empty() {
            bail!(
                "Blocks {}-{} not indexed, failed families: {}",
                start,
                end,
                failed.join(", ")
            );
        }

        self.advance_checkpoints(end).await?;
        info!(
            "Blocks {}-{} indexed, {} wallet checkpoint(s) at {}",
            start,
            end,
            self.wallets.len(),
            end
        );
        Ok(())
    }

    fn spawn_family<E, I>(
        &self,
        tasks: &mut JoinSet<FamilyOutcome>,
        family: &'static str,
        handlers: &[DynHandler<E, I>],
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) where
        E: Send + Sync + 'static,
        I: StoredInteraction + Send + 'static,
    {
        let handlers = handlers.to_vec();
        let wallets = Arc::clone(&self.wallets);
        let db = self.db.clone();
        let chain_id = self.chain_id;
        let cancel = cancel.clone();

        tasks.spawn(async move {
            if handlers.is_empty() {
                return (family, Ok(()));
            }

            let work = try_join_all(handlers.iter().map(|handler| {
                run_handler(handler.as_ref(), chain_id, &wallets, start, end, db.clone())
            }));

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(anyhow::anyhow!("cancelled")),
                result = work => result.map(|_| ()),
            };
            (family, outcome)
        });
    }

    async fn advance_checkpoints(&self, end: u64) -> Result<()> {
        let db = self.db.clone();
        let wallets = Arc::clone(&self.wallets);
        let chain_id = self.chain_id;

        tokio::task::spawn_blocking(move || {
            let conn = db.conn();
            WalletRepository::new(&conn).advance_checkpoints(chain_id, &wallets, end)
        })
        .await
        .context("Checkpoint task panicked")?
        .with_context(|| format!("Failed to advance checkpoints to {end}"))
    }
}

async fn run_handler<E, I>(
    handler: &dyn ProtocolHandler<Event = E, Interaction = I>,
    chain_id: u64,
    wallets: &[Address],
    start: u64,
    end: u64,
    db: Database,
) -> Result<()>
where
    E: Send + Sync + 'static,
    I: StoredInteraction + Send + 'static,
{
    let events = handler
        .fetch_blockchain_interactions(chain_id, wallets, start, end)
        .await
        .with_context(|| format!("[{}] fetch failed", handler.name()))?;

    if events.is_empty() {
        debug!("[{}] Nothing in blocks {}-{}", handler.name(), start, end);
        return Ok(());
    }

    let fetched = events.len();
    let records = handler
        .populate_with_finance_info(events)
        .await
        .with_context(|| format!("[{}] enrichment failed", handler.name()))?;
    info!(
        "[{}] {} of {} events valued in blocks {}-{}",
        handler.name(),
        records.len(),
        fetched,
        start,
        end
    );

    persist(handler.name(), db, records).await?;
    Ok(())
}

/// Saves `records` off the async runtime. Records rejected for their own
/// content are logged and dropped; any other store failure is returned so
/// the range is not checkpointed.
pub(crate) async fn persist<I>(name: &str, db: Database, records: Vec<I>) -> Result<SaveReport>
where
    I: StoredInteraction + Send + 'static,
{
    if records.is_empty() {
        return Ok(SaveReport::default());
    }

    let report = tokio::task::spawn_blocking(move || {
        let conn = db.conn();
        InteractionRepository::new(&conn).save_progressively(&records)
    })
    .await
    .with_context(|| format!("[{name}] Persistence task panicked"))?
    .with_context(|| format!("[{name}] Failed to persist records"))?;

    if report.failed > 0 {
        warn!(
            "[{}] Saved {} records, {} duplicates, {} dropped",
            name, report.inserted, report.duplicates, report.failed
        );
    } else {
        info!(
            "[{}] Saved {} records, {} duplicates",
            name, report.inserted, report.duplicates
        );
    }
    Ok(report)
}
