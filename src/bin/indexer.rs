use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use defi_indexer::cache::{CacheManager, open_store};
use defi_indexer::config::Config;
use defi_indexer::price::BinancePriceSource;
use defi_indexer::repository::{Database, WorkerRepository};
use defi_indexer::rpc::RpcClient;
use defi_indexer::scanner::{AnalyticsScanner, ScanSettings, Scanner};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Index DeFi activity of tracked wallets into USD valued records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index tracked wallets with the given worker row's settings.
    Run {
        #[arg(long, default_value = "1")]
        worker_id: i64,
    },
    /// Scan all liquidity events of one pool.
    Analytics {
        #[arg(long, default_value = "1")]
        worker_id: i64,
    },
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
        token.cancel();
    });
    shutdown
}

async fn cache_manager(
    config: &Config,
    rpc_urls: &[String],
) -> Result<Arc<CacheManager>> {
    let store = open_store(config.redis_url.as_deref()).await?;
    let chain = Arc::new(RpcClient::new(rpc_urls)?);
    let prices = Arc::new(BinancePriceSource::new(&config.price_api_url)?);
    Ok(Arc::new(CacheManager::new(store, chain, prices)))
}

#[tokio::main]
async fn main() -> Result<()> {
    defi_indexer::init_tracing();
    let cli = Cli::parse();

    info!("Starting DeFi indexer");

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url)?;
    info!("Database initialized");

    let settings = ScanSettings::from(&config);
    let shutdown = shutdown_on_ctrl_c();

    let outcome = match cli.command {
        Commands::Run { worker_id } => {
            let worker = WorkerRepository::new(&db.conn())
                .get(worker_id)?
                .with_context(|| format!("Worker {worker_id} not found"))?;
            info!(
                "Worker {}: {} RPC endpoint(s), {} cache endpoint(s), interval {}, parallelism {}",
                worker.id,
                worker.rpc_urls.len(),
                worker.cache_rpc_urls.len(),
                worker.blocks_interval,
                worker.parallel_factor
            );

            let cache_urls = if worker.cache_rpc_urls.is_empty() {
                &worker.rpc_urls
            } else {
                &worker.cache_rpc_urls
            };
            let cache = cache_manager(&config, cache_urls).await?;
            let chain = Arc::new(RpcClient::new(&worker.rpc_urls)?);

            Scanner::new(worker, settings, chain, cache, db)
                .run(shutdown)
                .await
        }
        Commands::Analytics { worker_id } => {
            let worker = WorkerRepository::new(&db.conn())
                .get_analytics(worker_id)?
                .with_context(|| format!("Analytics worker {worker_id} not found"))?;
            info!(
                "Analytics worker {} on pool {:?} from block {}",
                worker.id, worker.pool, worker.last_block
            );

            let cache = cache_manager(&config, &worker.rpc_urls).await?;
            let chain = Arc::new(RpcClient::new(&worker.rpc_urls)?);

            AnalyticsScanner::new(worker, settings, chain, cache, db)
                .run(shutdown)
                .await
        }
    };

    if let Err(e) = outcome {
        error!("Indexer stopped: {:#}", e);
        return Err(e);
    }

    Ok(())
}
