use super::models::TrackedWallet;
use super::parse_address;
use alloy_primitives::Address;
use anyhow::Result;
use rusqlite::{Connection, params};

pub struct WalletRepository<'a> {
    conn: &'a Connection,
}

impl<'a> WalletRepository<'a> {
    const INSERT_WALLET: &'static str =
        "INSERT OR IGNORE INTO tracked_wallets (chain_id, address, last_block) VALUES (?1, ?2, ?3)";

    const SELECT_FOR_CHAIN: &'static str =
        "SELECT chain_id, address, last_block FROM tracked_wallets WHERE chain_id = ?1
         ORDER BY address";

    const SELECT_ALL: &'static str =
        "SELECT chain_id, address, last_block FROM tracked_wallets ORDER BY chain_id, address";

    // Checkpoints never move backwards.
    const ADVANCE_CHECKPOINT: &'static str =
        "UPDATE tracked_wallets SET last_block = MAX(last_block, ?1)
         WHERE chain_id = ?2 AND address = ?3";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, wallet: &TrackedWallet) -> Result<()> {
        self.conn.execute(
            Self::INSERT_WALLET,
            params![
                wallet.chain_id,
                format!("{:?}", wallet.address),
                wallet.last_block
            ],
        )?;
        Ok(())
    }

    pub fn list_for_chain(&self, chain_id: u64) -> Result<Vec<TrackedWallet>> {
        self.query(Self::SELECT_FOR_CHAIN, Some(chain_id))
    }

    pub fn list_all(&self) -> Result<Vec<TrackedWallet>> {
        self.query(Self::SELECT_ALL, None)
    }

    /// Moves every listed wallet's checkpoint to `block` in one transaction.
    pub fn advance_checkpoints(&self, chain_id: u64, wallets: &[Address], block: u64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(Self::ADVANCE_CHECKPOINT)?;
            for wallet in wallets {
                stmt.execute(params![block, chain_id, format!("{wallet:?}")])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query(&self, sql: &str, chain_id: Option<u64>) -> Result<Vec<TrackedWallet>> {
        let mut stmt = self.conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u64>(2)?,
            ))
        };
        let rows = match chain_id {
            Some(chain_id) => stmt
                .query_map(params![chain_id], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        rows.into_iter()
            .map(|(chain_id, address, last_block)| {
                Ok(TrackedWallet {
                    chain_id,
                    address: parse_address(&address)?,
                    last_block,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::memory_db;

    fn wallet(byte: u8, last_block: u64) -> TrackedWallet {
        TrackedWallet {
            chain_id: 1,
            address: Address::repeat_byte(byte),
            last_block,
        }
    }

    #[test]
    fn checkpoint_never_decreases() {
        let db = memory_db();
        let conn = db.conn();
        let repo = WalletRepository::new(&conn);
        repo.insert(&wallet(0x01, 1000)).unwrap();
        repo.insert(&wallet(0x02, 5000)).unwrap();

        repo.advance_checkpoints(
            1,
            &[Address::repeat_byte(0x01), Address::repeat_byte(0x02)],
            2000,
        )
        .unwrap();

        let wallets = repo.list_for_chain(1).unwrap();
        assert_eq!(wallets[0].last_block, 2000);
        assert_eq!(wallets[1].last_block, 5000);
    }

    #[test]
    fn other_chains_are_untouched() {
        let db = memory_db();
        let conn = db.conn();
        let repo = WalletRepository::new(&conn);
        repo.insert(&wallet(0x01, 10)).unwrap();
        repo.insert(&TrackedWallet {
            chain_id: 137,
            ..wallet(0x01, 10)
        })
        .unwrap();

        repo.advance_checkpoints(1, &[Address::repeat_byte(0x01)], 99)
            .unwrap();

        let all = repo.list_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].last_block, 99);
        assert_eq!(all[1].last_block, 10);
    }
}
