use super::models::{ProtocolInstance, ProtocolKind};
use super::parse_address;
use alloy_primitives::Address;
use anyhow::Result;
use rusqlite::{Connection, params};

pub struct ProtocolRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ProtocolRepository<'a> {
    const INSERT_INSTANCE: &'static str =
        "INSERT OR IGNORE INTO protocol_instances (chain_id, kind, address, position_manager)
         VALUES (?1, ?2, ?3, ?4)";

    const SELECT_FOR_CHAIN: &'static str =
        "SELECT id, chain_id, kind, address, position_manager
         FROM protocol_instances WHERE chain_id = ?1 ORDER BY id";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(
        &self,
        chain_id: u64,
        kind: ProtocolKind,
        address: &Address,
        position_manager: Option<&Address>,
    ) -> Result<()> {
        self.conn.execute(
            Self::INSERT_INSTANCE,
            params![
                chain_id,
                kind.as_str(),
                format!("{address:?}"),
                position_manager.map(|a| format!("{a:?}"))
            ],
        )?;
        Ok(())
    }

    pub fn list_for_chain(&self, chain_id: u64) -> Result<Vec<ProtocolInstance>> {
        let mut stmt = self.conn.prepare(Self::SELECT_FOR_CHAIN)?;
        let rows = stmt
            .query_map(params![chain_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, chain_id, kind, address, position_manager)| {
                Ok(ProtocolInstance {
                    id,
                    chain_id,
                    kind: kind.parse()?,
                    address: parse_address(&address)?,
                    position_manager: position_manager
                        .as_deref()
                        .map(parse_address)
                        .transpose()?,
                })
            })
            .collect()
    }
}
