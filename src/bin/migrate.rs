use anyhow::Result;
use defi_indexer::config::Config;
use defi_indexer::repository::Database;
use tracing::info;

fn main() -> Result<()> {
    defi_indexer::init_tracing();

    let config = Config::from_env()?;
    info!("Running migrations on database: {}", config.database_url);

    let _db = Database::new(&config.database_url)?;

    info!("Migrations completed successfully");

    Ok(())
}
