use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to the SQLite store. Cloning shares the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let db_path = db_path.strip_prefix("sqlite:").unwrap_or(db_path);
        let conn = Connection::open(db_path).context("Failed to open database")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        create_tables(&conn)?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the connection. Do not hold the guard across an `.await`.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn create_tables(conn: &Connection) -> Result<()> {
    // Reference data
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tokens (
            chain_id INTEGER NOT NULL,
            address TEXT NOT NULL,
            symbol TEXT NOT NULL,
            decimals INTEGER NOT NULL,
            PRIMARY KEY (chain_id, address)
        );

        CREATE TABLE IF NOT EXISTS tracked_wallets (
            chain_id INTEGER NOT NULL,
            address TEXT NOT NULL,
            last_block INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (chain_id, address)
        );

        CREATE TABLE IF NOT EXISTS protocol_instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chain_id INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('hodl', 'aave', 'compound3', 'uniswapv3')),
            address TEXT NOT NULL,
            position_manager TEXT,
            UNIQUE (chain_id, kind, address)
        );

        CREATE TABLE IF NOT EXISTS workers (
            id INTEGER PRIMARY KEY,
            rpc_urls TEXT NOT NULL,
            cache_rpc_urls TEXT NOT NULL DEFAULT '[]',
            blocks_interval INTEGER NOT NULL,
            parallel_factor INTEGER NOT NULL DEFAULT 16
        );

        CREATE TABLE IF NOT EXISTS analytics_workers (
            id INTEGER PRIMARY KEY,
            rpc_urls TEXT NOT NULL,
            blocks_interval INTEGER NOT NULL,
            last_block INTEGER NOT NULL,
            pool_address TEXT NOT NULL
        );",
    )?;

    // Raw events
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS erc20_transfers (
            tx_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            chain_id INTEGER NOT NULL,
            block_number INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            token_address TEXT NOT NULL,
            sender TEXT NOT NULL,
            recipient TEXT NOT NULL,
            amount TEXT NOT NULL,
            PRIMARY KEY (tx_hash, log_index)
        );

        CREATE TABLE IF NOT EXISTS lending_events (
            tx_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            chain_id INTEGER NOT NULL,
            block_number INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            protocol TEXT NOT NULL,
            action TEXT NOT NULL,
            market TEXT NOT NULL,
            user_address TEXT NOT NULL,
            asset TEXT NOT NULL,
            amount TEXT NOT NULL,
            collateral INTEGER NOT NULL,
            PRIMARY KEY (tx_hash, log_index)
        );

        CREATE TABLE IF NOT EXISTS pool_events (
            tx_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            chain_id INTEGER NOT NULL,
            block_number INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            pool TEXT NOT NULL,
            kind TEXT NOT NULL,
            participant TEXT NOT NULL,
            amount0 TEXT NOT NULL,
            amount1 TEXT NOT NULL,
            liquidity TEXT NOT NULL,
            price_lower REAL NOT NULL,
            price_upper REAL NOT NULL,
            PRIMARY KEY (tx_hash, log_index)
        );",
    )?;

    // Financial records, one per raw event
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS deals (
            tx_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            token_symbol TEXT NOT NULL CHECK (token_symbol <> ''),
            unit_price TEXT NOT NULL,
            volume TEXT NOT NULL,
            volume_usd TEXT NOT NULL,
            PRIMARY KEY (tx_hash, log_index),
            FOREIGN KEY (tx_hash, log_index) REFERENCES erc20_transfers(tx_hash, log_index)
        );

        CREATE TABLE IF NOT EXISTS lending_interactions (
            tx_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            token_symbol TEXT NOT NULL CHECK (token_symbol <> ''),
            unit_price TEXT NOT NULL,
            volume TEXT NOT NULL,
            volume_usd TEXT NOT NULL,
            PRIMARY KEY (tx_hash, log_index),
            FOREIGN KEY (tx_hash, log_index) REFERENCES lending_events(tx_hash, log_index)
        );

        CREATE TABLE IF NOT EXISTS pool_deals (
            tx_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            symbol0 TEXT NOT NULL CHECK (symbol0 <> ''),
            symbol1 TEXT NOT NULL CHECK (symbol1 <> ''),
            price0 TEXT NOT NULL,
            price1 TEXT NOT NULL,
            volume0 TEXT NOT NULL,
            volume1 TEXT NOT NULL,
            volume_usd TEXT NOT NULL,
            PRIMARY KEY (tx_hash, log_index),
            FOREIGN KEY (tx_hash, log_index) REFERENCES pool_events(tx_hash, log_index)
        );",
    )?;

    // Indexes for wallet lookups
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_erc20_transfers_sender ON erc20_transfers(sender);
        CREATE INDEX IF NOT EXISTS idx_erc20_transfers_recipient ON erc20_transfers(recipient);
        CREATE INDEX IF NOT EXISTS idx_lending_events_user ON lending_events(user_address);
        CREATE INDEX IF NOT EXISTS idx_pool_events_participant ON pool_events(participant);",
    )?;

    Ok(())
}
