use crate::cache::CacheManager;
use crate::query::formatters::{OutputFormat, format_balance, format_deals, format_wallets};
use crate::repository::{Database, InteractionRepository, WalletRepository};
use alloy_primitives::Address;
use anyhow::Result;
use std::str::FromStr;

fn parse_wallet(address: &str) -> Result<Address> {
    Address::from_str(address).map_err(|_| anyhow::anyhow!("Invalid address format: {}", address))
}

/// USD balance of a wallet from stored transfer deals, served through the
/// balance cache.
pub async fn cmd_balance(
    cache: &CacheManager,
    db: &Database,
    address: &str,
    chain_id: Option<u64>,
    format: &OutputFormat,
) -> Result<()> {
    let wallet = parse_wallet(address)?;

    let balance = match chain_id {
        Some(chain_id) => {
            cache
                .get_cached_balance_of_wallet_on_chain(db, chain_id, wallet)
                .await?
        }
        None => cache.get_cached_balance_of_wallet(db, wallet).await?,
    };
    println!("{}", format_balance(&balance, format));

    Ok(())
}

pub fn cmd_wallets(db: &Database, chain_id: Option<u64>, format: &OutputFormat) -> Result<()> {
    let conn = db.conn();
    let repo = WalletRepository::new(&conn);
    let wallets = match chain_id {
        Some(chain_id) => repo.list_for_chain(chain_id)?,
        None => repo.list_all()?,
    };
    println!("{}", format_wallets(&wallets, format));

    Ok(())
}

pub fn cmd_deals(
    db: &Database,
    address: &str,
    limit: usize,
    offset: usize,
    format: &OutputFormat,
) -> Result<()> {
    let wallet = parse_wallet(address)?;

    let conn = db.conn();
    let deals = InteractionRepository::new(&conn).wallet_deals(&wallet, limit, offset)?;
    println!("{}", format_deals(&deals, format));

    Ok(())
}
