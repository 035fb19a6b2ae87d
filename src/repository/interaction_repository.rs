use super::{parse_address, parse_decimal};
use crate::interactions::{Deal, EventMeta, LendingInteraction, PoolDeal};
use alloy_primitives::Address;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, ffi, params};
use rust_decimal::Decimal;
use tracing::{debug, warn};

pub const BATCH_SIZE: usize = 100;

/// A financial record together with the raw event it was derived from.
pub trait StoredInteraction {
    fn meta(&self) -> &EventMeta;

    /// Writes the raw event (ignored if present) and then the financial row
    /// (a duplicate is a constraint error).
    fn insert(&self, conn: &Connection) -> rusqlite::Result<()>;
}

const INSERT_TRANSFER: &str = "INSERT OR IGNORE INTO erc20_transfers (
        tx_hash, log_index, chain_id, block_number, timestamp,
        token_address, sender, recipient, amount
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const INSERT_DEAL: &str = "INSERT INTO deals (
        tx_hash, log_index, token_symbol, unit_price, volume, volume_usd
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const INSERT_LENDING_EVENT: &str = "INSERT OR IGNORE INTO lending_events (
        tx_hash, log_index, chain_id, block_number, timestamp,
        protocol, action, market, user_address, asset, amount, collateral
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const INSERT_LENDING_INTERACTION: &str = "INSERT INTO lending_interactions (
        tx_hash, log_index, token_symbol, unit_price, volume, volume_usd
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const INSERT_POOL_EVENT: &str = "INSERT OR IGNORE INTO pool_events (
        tx_hash, log_index, chain_id, block_number, timestamp,
        pool, kind, participant, amount0, amount1, liquidity, price_lower, price_upper
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

const INSERT_POOL_DEAL: &str = "INSERT INTO pool_deals (
        tx_hash, log_index, symbol0, symbol1, price0, price1, volume0, volume1, volume_usd
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

impl StoredInteraction for Deal {
    fn meta(&self) -> &EventMeta {
        &self.event.meta
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        let meta = &self.event.meta;
        let tx_hash = format!("{:?}", meta.tx_hash);
        conn.execute(
            INSERT_TRANSFER,
            params![
                tx_hash,
                meta.log_index,
                meta.chain_id,
                meta.block_number,
                meta.timestamp.timestamp(),
                format!("{:?}", self.event.token),
                format!("{:?}", self.event.sender),
                format!("{:?}", self.event.recipient),
                self.event.amount.to_string(),
            ],
        )?;
        conn.execute(
            INSERT_DEAL,
            params![
                tx_hash,
                meta.log_index,
                self.valuation.symbol,
                self.valuation.unit_price.to_string(),
                self.valuation.volume.to_string(),
                self.valuation.volume_usd.to_string(),
            ],
        )?;
        Ok(())
    }
}

impl StoredInteraction for LendingInteraction {
    fn meta(&self) -> &EventMeta {
        &self.event.meta
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        let event = &self.event;
        let tx_hash = format!("{:?}", event.meta.tx_hash);
        conn.execute(
            INSERT_LENDING_EVENT,
            params![
                tx_hash,
                event.meta.log_index,
                event.meta.chain_id,
                event.meta.block_number,
                event.meta.timestamp.timestamp(),
                event.protocol.as_str(),
                event.action.as_str(),
                format!("{:?}", event.market),
                format!("{:?}", event.user),
                format!("{:?}", event.asset),
                event.amount.to_string(),
                event.collateral,
            ],
        )?;
        conn.execute(
            INSERT_LENDING_INTERACTION,
            params![
                tx_hash,
                event.meta.log_index,
                self.valuation.symbol,
                self.valuation.unit_price.to_string(),
                self.valuation.volume.to_string(),
                self.valuation.volume_usd.to_string(),
            ],
        )?;
        Ok(())
    }
}

impl StoredInteraction for PoolDeal {
    fn meta(&self) -> &EventMeta {
        &self.event.meta
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<()> {
        let event = &self.event;
        let tx_hash = format!("{:?}", event.meta.tx_hash);
        conn.execute(
            INSERT_POOL_EVENT,
            params![
                tx_hash,
                event.meta.log_index,
                event.meta.chain_id,
                event.meta.block_number,
                event.meta.timestamp.timestamp(),
                format!("{:?}", event.pool),
                event.kind.as_str(),
                format!("{:?}", event.participant),
                event.amount0.to_string(),
                event.amount1.to_string(),
                event.liquidity.to_string(),
                event.price_lower,
                event.price_upper,
            ],
        )?;
        conn.execute(
            INSERT_POOL_DEAL,
            params![
                tx_hash,
                event.meta.log_index,
                self.token0.symbol,
                self.token1.symbol,
                self.token0.unit_price.to_string(),
                self.token1.unit_price.to_string(),
                self.token0.volume.to_string(),
                self.token1.volume.to_string(),
                self.volume_usd.to_string(),
            ],
        )?;
        Ok(())
    }
}

/// Primary-key and unique violations mean the row is already stored.
pub fn is_duplicate_key(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Errors caused by the record itself. Anything else means the store is
/// unusable and the rest of the records would fail the same way.
pub fn is_record_error(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(e, _) => e.code == ErrorCode::ConstraintViolation,
        rusqlite::Error::ToSqlConversionFailure(_) => true,
        _ => false,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// A priced transfer as read back for display.
#[derive(Debug, Clone)]
pub struct DealView {
    pub tx_hash: String,
    pub log_index: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub sender: Address,
    pub recipient: Address,
    pub volume: Decimal,
    pub volume_usd: Decimal,
}

pub struct InteractionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> InteractionRepository<'a> {
    const SELECT_WALLET_DEALS: &'static str = "SELECT t.tx_hash, t.log_index, t.chain_id,
            t.block_number, t.timestamp, d.token_symbol, t.sender, t.recipient,
            d.volume, d.volume_usd
        FROM deals d
        JOIN erc20_transfers t ON t.tx_hash = d.tx_hash AND t.log_index = d.log_index
        WHERE t.sender = ?1 OR t.recipient = ?1
        ORDER BY t.block_number DESC, t.log_index DESC
        LIMIT ?2 OFFSET ?3";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Inserts `records` in batches of [`BATCH_SIZE`]. A batch that fails as
    /// a whole is retried row by row so one bad record only loses itself.
    /// Returns an error as soon as a row fails for a reason other than its
    /// own content.
    pub fn save_progressively<T: StoredInteraction>(
        &self,
        records: &[T],
    ) -> rusqlite::Result<SaveReport> {
        let mut report = SaveReport::default();

        for batch in records.chunks(BATCH_SIZE) {
            match self.insert_batch(batch) {
                Ok(()) => report.inserted += batch.len(),
                Err(e) => {
                    debug!(
                        "Batch of {} failed ({}), inserting one by one",
                        batch.len(),
                        e
                    );
                    for record in batch {
                        match self.insert_one(record) {
                            Ok(()) => report.inserted += 1,
                            Err(e) if is_duplicate_key(&e) => report.duplicates += 1,
                            Err(e) if is_record_error(&e) => {
                                let meta = record.meta();
                                warn!(
                                    "Dropping record {:?}#{}: {}",
                                    meta.tx_hash, meta.log_index, e
                                );
                                report.failed += 1;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    fn insert_batch<T: StoredInteraction>(&self, batch: &[T]) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for record in batch {
            record.insert(&tx)?;
        }
        tx.commit()
    }

    fn insert_one<T: StoredInteraction>(&self, record: &T) -> rusqlite::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        record.insert(&tx)?;
        tx.commit()
    }

    pub fn wallet_deals(&self, wallet: &Address, limit: usize, offset: usize) -> Result<Vec<DealView>> {
        let mut stmt = self.conn.prepare(Self::SELECT_WALLET_DEALS)?;
        let rows = stmt
            .query_map(params![format!("{wallet:?}"), limit, offset], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(tx_hash, log_index, chain_id, block_number, ts, symbol, sender, recipient, volume, volume_usd)| {
                    Ok(DealView {
                        tx_hash,
                        log_index,
                        chain_id,
                        block_number,
                        timestamp: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
                        symbol,
                        sender: parse_address(&sender)?,
                        recipient: parse_address(&recipient)?,
                        volume: parse_decimal(&volume)?,
                        volume_usd: parse_decimal(&volume_usd)?,
                    })
                },
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{memory_db, sample_deal};

    fn count(conn: &Connection, table: &str) -> usize {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn one_bad_record_does_not_sink_its_batch() {
        let db = memory_db();
        let conn = db.conn();
        let repo = InteractionRepository::new(&conn);
        let a = Address::repeat_byte(0x01);
        let b = Address::repeat_byte(0x02);

        let mut records: Vec<Deal> = (0..10).map(|i| sample_deal(i, a, b, "1.5")).collect();
        records[4].valuation.symbol = String::new();

        let report = repo.save_progressively(&records).unwrap();

        assert_eq!(report.inserted, 9);
        assert_eq!(report.failed, 1);
        assert_eq!(count(&conn, "deals"), 9);
        assert_eq!(count(&conn, "erc20_transfers"), 9);
    }

    #[test]
    fn replaying_a_batch_reports_duplicates() {
        let db = memory_db();
        let conn = db.conn();
        let repo = InteractionRepository::new(&conn);
        let a = Address::repeat_byte(0x01);
        let b = Address::repeat_byte(0x02);
        let records: Vec<Deal> = (0..3).map(|i| sample_deal(i, a, b, "2")).collect();

        let first = repo.save_progressively(&records).unwrap();
        let second = repo.save_progressively(&records).unwrap();

        assert_eq!(first.inserted, 3);
        assert_eq!(
            second,
            SaveReport {
                inserted: 0,
                duplicates: 3,
                failed: 0
            }
        );
        assert_eq!(count(&conn, "deals"), 3);
    }

    #[test]
    fn records_beyond_one_batch_are_all_saved() {
        let db = memory_db();
        let conn = db.conn();
        let repo = InteractionRepository::new(&conn);
        let a = Address::repeat_byte(0x01);
        let b = Address::repeat_byte(0x02);
        let records: Vec<Deal> = (0..250).map(|i| sample_deal(i, a, b, "1")).collect();

        let report = repo.save_progressively(&records).unwrap();

        assert_eq!(report.inserted, 250);
        assert_eq!(count(&conn, "deals"), 250);
    }

    #[test]
    fn unusable_store_is_an_error_not_a_dropped_row() {
        let db = memory_db();
        let conn = db.conn();
        conn.execute_batch("DROP TABLE deals").unwrap();
        let repo = InteractionRepository::new(&conn);
        let a = Address::repeat_byte(0x01);
        let b = Address::repeat_byte(0x02);
        let records: Vec<Deal> = (0..3).map(|i| sample_deal(i, a, b, "1")).collect();

        assert!(repo.save_progressively(&records).is_err());
        assert_eq!(count(&conn, "erc20_transfers"), 0);
    }

    #[test]
    fn wallet_deals_are_newest_first() {
        let db = memory_db();
        let conn = db.conn();
        let repo = InteractionRepository::new(&conn);
        let a = Address::repeat_byte(0x01);
        let b = Address::repeat_byte(0x02);
        let records: Vec<Deal> = (0..5).map(|i| sample_deal(i, a, b, "3")).collect();
        repo.save_progressively(&records).unwrap();

        let deals = repo.wallet_deals(&b, 2, 0).unwrap();

        assert_eq!(deals.len(), 2);
        assert!(deals[0].block_number > deals[1].block_number);
        assert_eq!(deals[0].recipient, b);
    }
}
