use anyhow::Result;
use clap::{Parser, Subcommand};
use defi_indexer::cache::{CacheManager, open_store};
use defi_indexer::config::Config;
use defi_indexer::price::BinancePriceSource;
use defi_indexer::query::commands::{cmd_balance, cmd_deals, cmd_wallets};
use defi_indexer::query::formatters::OutputFormat;
use defi_indexer::repository::{Database, WorkerRepository};
use defi_indexer::rpc::RpcClient;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "query")]
#[command(about = "Query indexed DeFi records", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// USD balance of a wallet from its transfer deals.
    Balance {
        address: String,

        #[arg(long)]
        chain_id: Option<u64>,

        /// Worker whose RPC endpoints back the cache.
        #[arg(long, default_value = "1")]
        worker_id: i64,
    },
    Wallets {
        #[arg(long)]
        chain_id: Option<u64>,
    },
    Deals {
        address: String,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url)?;

    match cli.command {
        Commands::Balance {
            address,
            chain_id,
            worker_id,
        } => {
            let worker = WorkerRepository::new(&db.conn())
                .get(worker_id)?
                .ok_or_else(|| anyhow::anyhow!("Worker {} not found", worker_id))?;

            let store = open_store(config.redis_url.as_deref()).await?;
            let chain = Arc::new(RpcClient::new(&worker.rpc_urls)?);
            let prices = Arc::new(BinancePriceSource::new(&config.price_api_url)?);
            let cache = CacheManager::new(store, chain, prices);

            cmd_balance(&cache, &db, &address, chain_id, &format).await?;
        }
        Commands::Wallets { chain_id } => {
            cmd_wallets(&db, chain_id, &format)?;
        }
        Commands::Deals {
            address,
            limit,
            offset,
        } => {
            cmd_deals(&db, &address, limit, offset, &format)?;
        }
    }

    Ok(())
}
