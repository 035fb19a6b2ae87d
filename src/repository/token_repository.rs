use super::models::Token;
use super::parse_address;
use anyhow::Result;
use rusqlite::{Connection, params};

pub struct TokenRepository<'a> {
    conn: &'a Connection,
}

impl<'a> TokenRepository<'a> {
    const INSERT_TOKEN: &'static str =
        "INSERT OR IGNORE INTO tokens (chain_id, address, symbol, decimals)
         VALUES (?1, ?2, ?3, ?4)";

    const SELECT_FOR_CHAIN: &'static str =
        "SELECT chain_id, address, symbol, decimals FROM tokens WHERE chain_id = ?1";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, token: &Token) -> Result<()> {
        self.conn.execute(
            Self::INSERT_TOKEN,
            params![
                token.chain_id,
                format!("{:?}", token.address),
                token.symbol,
                token.decimals
            ],
        )?;
        Ok(())
    }

    pub fn list_for_chain(&self, chain_id: u64) -> Result<Vec<Token>> {
        let mut stmt = self.conn.prepare(Self::SELECT_FOR_CHAIN)?;
        let rows = stmt.query_map(params![chain_id], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u8>(3)?,
            ))
        })?;

        let mut tokens = Vec::new();
        for row in rows {
            let (chain_id, address, symbol, decimals) = row?;
            tokens.push(Token {
                chain_id,
                address: parse_address(&address)?,
                symbol,
                decimals,
            });
        }
        Ok(tokens)
    }
}
