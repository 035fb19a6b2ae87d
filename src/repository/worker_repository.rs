use super::models::{AnalyticsWorkerConfig, WorkerConfig};
use super::parse_address;
use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

pub struct WorkerRepository<'a> {
    conn: &'a Connection,
}

impl<'a> WorkerRepository<'a> {
    const INSERT_WORKER: &'static str = "INSERT OR REPLACE INTO workers
            (id, rpc_urls, cache_rpc_urls, blocks_interval, parallel_factor)
         VALUES (?1, ?2, ?3, ?4, ?5)";

    const SELECT_WORKER: &'static str =
        "SELECT id, rpc_urls, cache_rpc_urls, blocks_interval, parallel_factor
         FROM workers WHERE id = ?1";

    const INSERT_ANALYTICS_WORKER: &'static str = "INSERT OR REPLACE INTO analytics_workers
            (id, rpc_urls, blocks_interval, last_block, pool_address)
         VALUES (?1, ?2, ?3, ?4, ?5)";

    const SELECT_ANALYTICS_WORKER: &'static str =
        "SELECT id, rpc_urls, blocks_interval, last_block, pool_address
         FROM analytics_workers WHERE id = ?1";

    const ADVANCE_ANALYTICS_CHECKPOINT: &'static str =
        "UPDATE analytics_workers SET last_block = MAX(last_block, ?1) WHERE id = ?2";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, worker: &WorkerConfig) -> Result<()> {
        self.conn.execute(
            Self::INSERT_WORKER,
            params![
                worker.id,
                serde_json::to_string(&worker.rpc_urls)?,
                serde_json::to_string(&worker.cache_rpc_urls)?,
                worker.blocks_interval,
                worker.parallel_factor
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<WorkerConfig>> {
        let row = self
            .conn
            .query_row(Self::SELECT_WORKER, params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, usize>(4)?,
                ))
            })
            .optional()?;

        let Some((id, rpc_urls, cache_rpc_urls, blocks_interval, parallel_factor)) = row else {
            return Ok(None);
        };

        Ok(Some(WorkerConfig {
            id,
            rpc_urls: parse_urls(&rpc_urls, id)?,
            cache_rpc_urls: parse_urls(&cache_rpc_urls, id)?,
            blocks_interval,
            parallel_factor,
        }))
    }

    pub fn insert_analytics(&self, worker: &AnalyticsWorkerConfig) -> Result<()> {
        self.conn.execute(
            Self::INSERT_ANALYTICS_WORKER,
            params![
                worker.id,
                serde_json::to_string(&worker.rpc_urls)?,
                worker.blocks_interval,
                worker.last_block,
                format!("{:?}", worker.pool)
            ],
        )?;
        Ok(())
    }

    pub fn get_analytics(&self, id: i64) -> Result<Option<AnalyticsWorkerConfig>> {
        let row = self
            .conn
            .query_row(Self::SELECT_ANALYTICS_WORKER, params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, u64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()?;

        let Some((id, rpc_urls, blocks_interval, last_block, pool)) = row else {
            return Ok(None);
        };

        Ok(Some(AnalyticsWorkerConfig {
            id,
            rpc_urls: parse_urls(&rpc_urls, id)?,
            blocks_interval,
            last_block,
            pool: parse_address(&pool)?,
        }))
    }

    pub fn advance_analytics_checkpoint(&self, id: i64, block: u64) -> Result<()> {
        self.conn
            .execute(Self::ADVANCE_ANALYTICS_CHECKPOINT, params![block, id])?;
        Ok(())
    }
}

fn parse_urls(raw: &str, worker_id: i64) -> Result<Vec<String>> {
    serde_json::from_str(raw)
        .with_context(|| format!("Worker {worker_id} has malformed RPC URL list: {raw}"))
}
