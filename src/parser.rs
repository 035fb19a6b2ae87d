use anyhow::Result;
use futures::future::try_join_all;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The record itself is unusable. It is skipped.
    #[error("malformed record: {0:#}")]
    Malformed(anyhow::Error),
    /// A timestamp or price lookup failed. The whole batch fails.
    #[error("lookup failed: {0:#}")]
    Lookup(anyhow::Error),
}

/// Decodes `records` with `decode` across `parallel_factor` workers and
/// returns once every worker has finished. Output order is unspecified.
pub async fn parse_concurrently<R, E, F, Fut>(
    name: &str,
    records: Vec<R>,
    parallel_factor: usize,
    decode: F,
) -> Result<Vec<E>>
where
    R: Send,
    E: Send,
    F: Fn(R) -> Fut + Sync,
    Fut: Future<Output = Result<E, DecodeError>> + Send,
{
    if records.is_empty() {
        return Ok(Vec::new());
    }

    let total = records.len();
    let workers = parallel_factor.clamp(1, total);
    let chunk_size = total.div_ceil(workers);

    let mut chunks = Vec::with_capacity(workers);
    let mut remaining = records.into_iter();
    loop {
        let chunk: Vec<R> = remaining.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let decode = &decode;

    let tasks = chunks.into_iter().map(|chunk| {
        let tx = tx.clone();
        async move {
            for record in chunk {
                match decode(record).await {
                    Ok(event) => {
                        // receiver outlives every worker
                        let _ = tx.send(event);
                    }
                    Err(DecodeError::Malformed(e)) => {
                        warn!("[{}] Skipping undecodable log: {:#}", name, e);
                    }
                    Err(DecodeError::Lookup(e)) => return Err(e),
                }
            }
            anyhow::Ok(())
        }
    });

    try_join_all(tasks).await?;
    drop(tx);

    let mut events = Vec::with_capacity(total);
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    debug!("[{}] Decoded {}/{} logs", name, events.len(), total);
    Ok(events)
}
