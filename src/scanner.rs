use crate::cache::CacheManager;
use crate::config::Config;
use crate::fetching::{FetchEnvironment, Handlers, persist};
use crate::protocols::{
    AaveHandler, CompoundHandler, HodlHandler, ProtocolHandler, TokenBook, UniswapV3Handler,
};
use crate::repository::{
    AnalyticsWorkerConfig, Database, ProtocolKind, ProtocolRepository, TokenRepository,
    TrackedWallet, WalletRepository, WorkerConfig, WorkerRepository,
};
use crate::rpc::ChainClient;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Parallelism for the analytics loop, which has no worker row setting.
const ANALYTICS_PARALLEL_FACTOR: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeDecision {
    /// Too close to the head to be worth a pass.
    Backoff { start: u64, head: u64 },
    Fetch { start: u64, end: u64 },
}

/// Next range to scan from checkpoint `start`: at most `interval` blocks,
/// never past `head`, and at least `min_useful_span` blocks wide.
pub fn plan_range(start: u64, head: u64, interval: u64, min_useful_span: u64) -> RangeDecision {
    let end = start.saturating_add(interval).min(head);
    if end.saturating_sub(start) < min_useful_span {
        RangeDecision::Backoff { start, head }
    } else {
        RangeDecision::Fetch { start, end }
    }
}

/// Loop timings shared by both scanners.
#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    pub min_useful_span: u64,
    pub backoff: Duration,
    pub pass_pause: Duration,
}

impl From<&Config> for ScanSettings {
    fn from(config: &Config) -> Self {
        Self {
            min_useful_span: config.min_useful_span,
            backoff: config.backoff,
            pass_pause: config.pass_pause,
        }
    }
}

/// Sleeps for `duration` unless shut down first. Returns false on shutdown.
async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

async fn blocking<T, F>(db: &Database, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.conn();
        op(&conn)
    })
    .await
    .context("Database task panicked")?
}

/// Indexing loop for one worker: tracked wallets on one chain across every
/// protocol instance registered for that chain.
pub struct Scanner {
    worker: WorkerConfig,
    settings: ScanSettings,
    chain: Arc<dyn ChainClient>,
    cache: Arc<CacheManager>,
    db: Database,
}

impl Scanner {
    pub fn new(
        worker: WorkerConfig,
        settings: ScanSettings,
        chain: Arc<dyn ChainClient>,
        cache: Arc<CacheManager>,
        db: Database,
    ) -> Self {
        Self {
            worker,
            settings,
            chain,
            cache,
            db,
        }
    }

    /// Runs until `shutdown` fires. Only setup failures are returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let (mut env, mut tracked) = self.setup().await?;
        let chain_id = env.chain_id();

        loop {
            match blocking(&self.db, move |conn| {
                WalletRepository::new(conn).list_for_chain(chain_id)
            })
            .await
            {
                Ok(wallets) => tracked = wallets,
                Err(e) => warn!("Failed to reload tracked wallets, keeping previous set: {:#}", e),
            }
            env.set_wallets(tracked.iter().map(|w| w.address).collect());

            // The lowest checkpoint, so no wallet is skipped.
            let Some(start) = tracked.iter().map(|w| w.last_block).min() else {
                info!("No tracked wallets on chain {}, waiting", chain_id);
                if !pause(self.settings.backoff, &shutdown).await {
                    break;
                }
                continue;
            };

            let head = match self.chain.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    warn!("Failed to read chain head: {:#}", e);
                    if !pause(self.settings.pass_pause, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match plan_range(
                start,
                head,
                self.worker.blocks_interval,
                self.settings.min_useful_span,
            ) {
                RangeDecision::Backoff { start, head } => {
                    info!(
                        "Checkpoint {} is {} blocks behind head {}, backing off for {:?}",
                        start,
                        head.saturating_sub(start),
                        head,
                        self.settings.backoff
                    );
                    if !pause(self.settings.backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
                RangeDecision::Fetch { start, end } => {
                    info!("Fetching blocks {} to {}", start, end);
                    if let Err(e) = env.fetch(start, end, &shutdown).await {
                        warn!("{:#}", e);
                    }
                }
            }

            if !pause(self.settings.pass_pause, &shutdown).await {
                break;
            }
        }

        info!("Worker {} stopped", self.worker.id);
        Ok(())
    }

    async fn setup(&self) -> Result<(FetchEnvironment, Vec<TrackedWallet>)> {
        let chain_id = self
            .chain
            .chain_id()
            .await
            .context("Failed to resolve chain id")?;
        info!("Worker {} indexing chain {}", self.worker.id, chain_id);

        let (tokens, instances, wallets) = blocking(&self.db, move |conn| {
            Ok((
                TokenRepository::new(conn).list_for_chain(chain_id)?,
                ProtocolRepository::new(conn).list_for_chain(chain_id)?,
                WalletRepository::new(conn).list_for_chain(chain_id)?,
            ))
        })
        .await
        .context("Failed to load tokens, protocols and wallets")?;

        let tokens = Arc::new(TokenBook::new(tokens));
        let mut handlers = Handlers::default();
        let parallel_factor = self.worker.parallel_factor;

        for instance in instances {
            let chain = Arc::clone(&self.chain);
            let cache = Arc::clone(&self.cache);
            match instance.kind {
                ProtocolKind::Hodl => match tokens.get(&instance.address) {
                    Some(token) => handlers.hodl.push(Arc::new(HodlHandler::new(
                        chain,
                        cache,
                        Arc::clone(&tokens),
                        token.clone(),
                        parallel_factor,
                    ))),
                    None => warn!(
                        "HODL instance {} references unknown token {:?}, skipping",
                        instance.id, instance.address
                    ),
                },
                ProtocolKind::Aave => handlers.aave.push(Arc::new(AaveHandler::new(
                    chain,
                    cache,
                    Arc::clone(&tokens),
                    instance.address,
                    parallel_factor,
                ))),
                ProtocolKind::Compound3 => {
                    match CompoundHandler::new(
                        chain,
                        cache,
                        Arc::clone(&tokens),
                        instance.address,
                        parallel_factor,
                    )
                    .await
                    {
                        Ok(handler) => handlers.compound.push(Arc::new(handler)),
                        Err(e) => warn!("Skipping instance {}: {:#}", instance.id, e),
                    }
                }
                ProtocolKind::UniswapV3 => {
                    match UniswapV3Handler::new(
                        chain,
                        cache,
                        &tokens,
                        instance.address,
                        parallel_factor,
                    )
                    .await
                    {
                        Ok(handler) => handlers.uniswap.push(Arc::new(handler)),
                        Err(e) => warn!("Skipping instance {}: {:#}", instance.id, e),
                    }
                }
            }
        }

        info!(
            "{} handler(s) ready, {} tracked wallet(s), {} token(s)",
            handlers.len(),
            wallets.len(),
            tokens.len()
        );

        let env = FetchEnvironment::new(chain_id, self.db.clone(), Vec::new(), handlers);
        Ok((env, wallets))
    }
}

/// Liquidity scan of one Uniswap V3 pool, checkpointed on its own
/// analytics worker row.
pub struct AnalyticsScanner {
    worker: AnalyticsWorkerConfig,
    settings: ScanSettings,
    chain: Arc<dyn ChainClient>,
    cache: Arc<CacheManager>,
    db: Database,
}

impl AnalyticsScanner {
    pub fn new(
        worker: AnalyticsWorkerConfig,
        settings: ScanSettings,
        chain: Arc<dyn ChainClient>,
        cache: Arc<CacheManager>,
        db: Database,
    ) -> Self {
        Self {
            worker,
            settings,
            chain,
            cache,
            db,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let chain_id = self
            .chain
            .chain_id()
            .await
            .context("Failed to resolve chain id")?;
        let tokens = blocking(&self.db, move |conn| {
            TokenRepository::new(conn).list_for_chain(chain_id)
        })
        .await?;
        let handler = UniswapV3Handler::new(
            Arc::clone(&self.chain),
            Arc::clone(&self.cache),
            &TokenBook::new(tokens),
            self.worker.pool,
            ANALYTICS_PARALLEL_FACTOR,
        )
        .await?;

        let mut current = self.worker.last_block;
        info!("[{}] Analytics from block {}", handler.name(), current);

        loop {
            let head = match self.chain.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    warn!("[{}] Failed to read chain head: {:#}", handler.name(), e);
                    if !pause(self.settings.pass_pause, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match plan_range(
                current,
                head,
                self.worker.blocks_interval,
                self.settings.min_useful_span,
            ) {
                RangeDecision::Backoff { .. } => {
                    if !pause(self.settings.backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
                RangeDecision::Fetch { start, end } => {
                    let pass = self.scan(&handler, chain_id, start, end);
                    let outcome = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        outcome = pass => outcome,
                    };
                    match outcome {
                        Ok(()) => current = end + 1,
                        Err(e) => warn!("[{}] Blocks {}-{}: {:#}", handler.name(), start, end, e),
                    }
                }
            }

            if !pause(self.settings.pass_pause, &shutdown).await {
                break;
            }
        }

        info!("Analytics worker {} stopped", self.worker.id);
        Ok(())
    }

    async fn scan(
        &self,
        handler: &UniswapV3Handler,
        chain_id: u64,
        start: u64,
        end: u64,
    ) -> Result<()> {
        let events = handler
            .fetch_liquidity_interactions(chain_id, start, end)
            .await?;
        let records = handler.populate_with_finance_info(events).await?;
        info!(
            "[{}] {} liquidity records in blocks {}-{}",
            handler.name(),
            records.len(),
            start,
            end
        );
        persist(handler.name(), self.db.clone(), records).await?;

        let id = self.worker.id;
        blocking(&self.db, move |conn| {
            WorkerRepository::new(conn).advance_analytics_checkpoint(id, end)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InteractionRepository;
    use crate::test_utils::{
        CountingPriceSource, ScriptedChain, cache_manager, memory_db, transfer_log, usdc_token,
    };
    use alloy_primitives::{Address, B256, U256};

    #[test]
    fn backs_off_near_the_head() {
        assert_eq!(
            plan_range(1000, 1010, 100, 50),
            RangeDecision::Backoff {
                start: 1000,
                head: 1010
            }
        );
    }

    #[test]
    fn range_is_capped_by_interval_and_head() {
        assert_eq!(
            plan_range(1000, 5000, 100, 50),
            RangeDecision::Fetch {
                start: 1000,
                end: 1100
            }
        );
        assert_eq!(
            plan_range(1000, 1060, 100, 50),
            RangeDecision::Fetch {
                start: 1000,
                end: 1060
            }
        );
    }

    #[test]
    fn checkpoint_past_head_backs_off() {
        assert!(matches!(
            plan_range(2000, 1500, 100, 50),
            RangeDecision::Backoff { .. }
        ));
    }

    const WALLET: Address = Address::repeat_byte(0x0a);

    fn settings(backoff: Duration) -> ScanSettings {
        ScanSettings {
            min_useful_span: 50,
            backoff,
            pass_pause: Duration::from_secs(3600),
        }
    }

    fn worker() -> WorkerConfig {
        WorkerConfig {
            id: 1,
            rpc_urls: vec!["http://localhost:8545".into()],
            cache_rpc_urls: Vec::new(),
            blocks_interval: 100,
            parallel_factor: 4,
        }
    }

    fn seeded(chain: &ScriptedChain) -> Database {
        let db = memory_db();
        let usdc = usdc_token(1);
        {
            let conn = db.conn();
            TokenRepository::new(&conn).insert(&usdc).unwrap();
            ProtocolRepository::new(&conn)
                .insert(1, ProtocolKind::Hodl, &usdc.address, None)
                .unwrap();
            WalletRepository::new(&conn)
                .insert(&TrackedWallet {
                    chain_id: 1,
                    address: WALLET,
                    last_block: 1000,
                })
                .unwrap();
        }
        chain.push_log(transfer_log(
            usdc.address,
            Address::repeat_byte(0x0c),
            WALLET,
            U256::from(2_500_000u64),
            1020,
            B256::repeat_byte(0x02),
            3,
        ));
        db
    }

    fn checkpoint(db: &Database) -> u64 {
        let conn = db.conn();
        WalletRepository::new(&conn).list_for_chain(1).unwrap()[0].last_block
    }

    #[tokio::test]
    async fn near_head_loop_never_queries_logs() {
        let chain = Arc::new(ScriptedChain::new(1));
        chain.set_head(1010);
        let db = seeded(&chain);
        let cache = cache_manager(chain.clone(), Arc::new(CountingPriceSource::default()));
        let scanner = Scanner::new(
            worker(),
            settings(Duration::from_millis(10)),
            chain.clone(),
            cache,
            db.clone(),
        );

        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { scanner.run(shutdown).await }
        });
        sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(chain.log_queries(), 0);
        assert_eq!(checkpoint(&db), 1000);
    }

    #[tokio::test]
    async fn one_pass_indexes_and_advances() {
        let chain = Arc::new(ScriptedChain::new(1));
        chain.set_head(5000);
        let db = seeded(&chain);
        let prices = Arc::new(CountingPriceSource::with_price("USDC", "1"));
        let cache = cache_manager(chain.clone(), prices);
        let scanner = Scanner::new(
            worker(),
            settings(Duration::from_secs(3600)),
            chain.clone(),
            cache,
            db.clone(),
        );

        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { scanner.run(shutdown).await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while checkpoint(&db) != 1100 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();
        running.await.unwrap().unwrap();

        let conn = db.conn();
        let deals = InteractionRepository::new(&conn)
            .wallet_deals(&WALLET, 10, 0)
            .unwrap();
        assert_eq!(deals.len(), 1);
        assert_eq!(deals[0].volume_usd.to_string(), "2.5");
    }

    #[tokio::test]
    async fn unresolvable_chain_id_ends_the_loop() {
        struct NoChain;

        #[async_trait::async_trait]
        impl ChainClient for NoChain {
            async fn chain_id(&self) -> Result<u64> {
                anyhow::bail!("all 1 RPC endpoint(s) failed")
            }
            async fn block_number(&self) -> Result<u64> {
                unreachable!()
            }
            async fn block_timestamp(&self, _block_number: u64) -> Result<u64> {
                unreachable!()
            }
            async fn get_logs(
                &self,
                _filter: &alloy::rpc::types::Filter,
            ) -> Result<Vec<alloy::rpc::types::Log>> {
                unreachable!()
            }
            async fn call(
                &self,
                _to: Address,
                _input: alloy_primitives::Bytes,
            ) -> Result<alloy_primitives::Bytes> {
                unreachable!()
            }
        }

        let cache = cache_manager(
            Arc::new(ScriptedChain::new(1)),
            Arc::new(CountingPriceSource::default()),
        );
        let scanner = Scanner::new(
            worker(),
            settings(Duration::from_secs(1)),
            Arc::new(NoChain),
            cache,
            memory_db(),
        );

        let err = scanner.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("chain id"));
    }
}
