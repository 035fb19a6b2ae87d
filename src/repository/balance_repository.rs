use super::parse_decimal;
use alloy_primitives::Address;
use anyhow::Result;
use rusqlite::{Connection, ToSql, params_from_iter};
use rust_decimal::Decimal;

pub struct BalanceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> BalanceRepository<'a> {
    const SELECT_INCOMING: &'static str = "SELECT d.volume_usd FROM deals d
        JOIN erc20_transfers t ON t.tx_hash = d.tx_hash AND t.log_index = d.log_index
        WHERE t.recipient = ?1";

    const SELECT_OUTGOING: &'static str = "SELECT d.volume_usd FROM deals d
        JOIN erc20_transfers t ON t.tx_hash = d.tx_hash AND t.log_index = d.log_index
        WHERE t.sender = ?1";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// USD balance of `wallet` from stored transfer deals, on one chain or
    /// across all of them.
    pub fn wallet_balance(&self, wallet: &Address, chain_id: Option<u64>) -> Result<Decimal> {
        let incoming = self.volumes(Self::SELECT_INCOMING, wallet, chain_id)?;
        let outgoing = self.volumes(Self::SELECT_OUTGOING, wallet, chain_id)?;
        Ok(calculate_balance(&incoming, &outgoing))
    }

    fn volumes(&self, base: &str, wallet: &Address, chain_id: Option<u64>) -> Result<Vec<Decimal>> {
        let mut sql = base.to_string();
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(format!("{wallet:?}"))];
        if let Some(chain_id) = chain_id {
            sql.push_str(" AND t.chain_id = ?2");
            params.push(Box::new(chain_id));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let values = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        values.iter().map(|v| parse_decimal(v)).collect()
    }
}

/// Incoming minus outgoing USD volume.
pub fn calculate_balance(incoming: &[Decimal], outgoing: &[Decimal]) -> Decimal {
    let received: Decimal = incoming.iter().sum();
    let sent: Decimal = outgoing.iter().sum();
    received - sent
}
