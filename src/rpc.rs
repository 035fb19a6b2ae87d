use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log, TransactionRequest};
use alloy::sol_types::SolCall;
use alloy_primitives::{Address, Bytes};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120); // 2 minutes timeout per request

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("all {endpoints} RPC endpoint(s) failed; last error from {url}: {source:#}")]
    Exhausted {
        endpoints: usize,
        url: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Read access to one logical chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;
    async fn block_number(&self) -> Result<u64>;
    /// Unix timestamp of the block's header.
    async fn block_timestamp(&self, block_number: u64) -> Result<u64>;
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>>;
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes>;
}

pub async fn call_contract<C: SolCall>(
    client: &dyn ChainClient,
    address: Address,
    call: C,
) -> Result<C::Return> {
    let output = client.call(address, call.abi_encode().into()).await?;
    Ok(C::abi_decode_returns(&output)?)
}

#[derive(Clone)]
pub struct Endpoint<P> {
    pub handle: P,
    pub url: String,
}

/// Redundant connections to the same chain. Order is the failover order.
#[derive(Clone)]
pub struct EndpointPool<P> {
    endpoints: Vec<Endpoint<P>>,
    request_timeout: Duration,
}

impl<P: Clone> EndpointPool<P> {
    pub fn new(endpoints: Vec<Endpoint<P>>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC endpoint must be provided"));
        }
        Ok(EndpointPool {
            endpoints,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Runs `op` against each endpoint in pool order and returns the first
    /// success. One attempt per endpoint, no delay between attempts.
    pub async fn retry_each<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(P) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_from(0, op).await
    }

    /// Same as [`retry_each`](Self::retry_each) but starts at a random
    /// endpoint, spreading pure reads across the pool.
    pub async fn retry_each_from_random<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(P) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = rand::thread_rng().gen_range(0..self.endpoints.len());
        self.retry_from(start, op).await
    }

    async fn retry_from<T, F, Fut>(&self, start: usize, op: F) -> Result<T>
    where
        F: Fn(P) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let count = self.endpoints.len();
        let mut last_error = None;

        for offset in 0..count {
            let endpoint = &self.endpoints[(start + offset) % count];
            match timeout(self.request_timeout, op(endpoint.handle.clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!("RPC error on {}: {:#}, trying next endpoint", endpoint.url, e);
                    last_error = Some((endpoint.url.clone(), e));
                }
                Err(_) => {
                    warn!(
                        "Request timeout after {} seconds on {}, trying next endpoint",
                        self.request_timeout.as_secs(),
                        endpoint.url
                    );
                    last_error = Some((
                        endpoint.url.clone(),
                        anyhow::anyhow!(
                            "Request timeout after {} seconds",
                            self.request_timeout.as_secs()
                        ),
                    ));
                }
            }
        }

        let (url, source) = last_error
            .unwrap_or_else(|| (String::new(), anyhow::anyhow!("endpoint pool is empty")));
        Err(PoolError::Exhausted {
            endpoints: count,
            url,
            source,
        }
        .into())
    }
}

/// [`ChainClient`] over a pool of alloy HTTP providers.
#[derive(Clone)]
pub struct RpcClient {
    pool: EndpointPool<DynProvider>,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String]) -> Result<Self> {
        let mut endpoints = Vec::new();
        for url in rpc_urls {
            match url.parse() {
                Ok(parsed_url) => {
                    let provider = ProviderBuilder::new().connect_http(parsed_url).erased();
                    endpoints.push(Endpoint {
                        handle: provider,
                        url: url.clone(),
                    });
                }
                Err(_) => warn!("Invalid RPC URL {}, skipping", url),
            }
        }

        if endpoints.is_empty() {
            return Err(anyhow::anyhow!("No usable RPC URL among {} provided", rpc_urls.len()));
        }

        Ok(RpcClient {
            pool: EndpointPool::new(endpoints)?,
        })
    }

    async fn get_logs_internal(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.pool
            .retry_each(|provider| async move { anyhow::Ok(provider.get_logs(filter).await?) })
            .await
    }
}

fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
    let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
    let captures = re.captures(error_str)?;

    let from = captures.get(1)?.as_str().parse().ok()?;
    let to = captures.get(2)?.as_str().parse().ok()?;

    Some((from, to))
}

/// Fetches logs for the filter's range with `fetch`, narrowing the end of
/// the window to the node's suggested block when it refuses with "exceeds
/// max results". Windows are contiguous and never overlap.
pub async fn split_get_logs<F, Fut>(filter: &Filter, fetch: F) -> Result<Vec<Log>>
where
    F: Fn(Filter) -> Fut,
    Fut: Future<Output = Result<Vec<Log>>>,
{
    let (Some(from_block), Some(to_block)) = (filter.get_from_block(), filter.get_to_block())
    else {
        return fetch(filter.clone()).await;
    };

    let mut all_logs = Vec::new();
    let mut current_from = from_block;
    let mut current_to = to_block;

    while current_from <= to_block {
        let window = filter.clone().from_block(current_from).to_block(current_to);

        match fetch(window).await {
            Ok(logs) => {
                debug!(
                    "Fetched {} logs for blocks {}-{}",
                    logs.len(),
                    current_from,
                    current_to
                );
                all_logs.extend(logs);
                let Some(next) = current_to.checked_add(1) else {
                    break;
                };
                current_from = next;
                current_to = to_block;
            }
            Err(e) => {
                let error_str = format!("{e:#}");

                if !error_str.contains("exceeds max results") {
                    return Err(e);
                }
                let Some((suggested_from, suggested_to)) = parse_max_results_error(&error_str)
                else {
                    return Err(e);
                };
                if suggested_to < current_from || suggested_to >= current_to {
                    return Err(e);
                }

                info!(
                    "Hit max results limit for blocks {}-{} (node suggests {}-{}), retrying up to block {}",
                    current_from, current_to, suggested_from, suggested_to, suggested_to
                );
                current_to = suggested_to;
            }
        }
    }

    Ok(all_logs)
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn chain_id(&self) -> Result<u64> {
        self.pool
            .retry_each(|provider| async move { anyhow::Ok(provider.get_chain_id().await?) })
            .await
    }

    async fn block_number(&self) -> Result<u64> {
        self.pool
            .retry_each(|provider| async move { anyhow::Ok(provider.get_block_number().await?) })
            .await
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        self.pool
            .retry_each_from_random(|provider| async move {
                let block = provider
                    .get_block_by_number(BlockNumberOrTag::Number(block_number))
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Block {} not found", block_number))?;
                anyhow::Ok(block.header.timestamp)
            })
            .await
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        split_get_logs(filter, |window| async move { self.get_logs_internal(&window).await }).await
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        self.pool
            .retry_each(|provider| {
                let request = TransactionRequest::default().to(to).input(input.clone().into());
                async move { anyhow::Ok(provider.call(request).await?) }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool_of(size: usize) -> EndpointPool<usize> {
        let endpoints = (0..size)
            .map(|i| Endpoint {
                handle: i,
                url: format!("http://node-{i}"),
            })
            .collect();
        EndpointPool::new(endpoints).unwrap()
    }

    #[tokio::test]
    async fn returns_result_of_first_healthy_endpoint() {
        let pool = pool_of(4);
        let attempts = AtomicUsize::new(0);

        let result = pool
            .retry_each(|handle| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if handle < 3 {
                        anyhow::bail!("node {handle} is rate limited")
                    }
                    anyhow::Ok(handle * 10)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 30);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let pool = pool_of(3);
        let attempts = AtomicUsize::new(0);

        let result = pool
            .retry_each(|handle| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { anyhow::Ok(handle) }
            })
            .await
            .unwrap();

        assert_eq!(result, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_reports_last_endpoint() {
        let pool = pool_of(3);

        let err = pool
            .retry_each(|handle| async move {
                Err::<(), _>(anyhow::anyhow!("connection refused by {handle}"))
            })
            .await
            .unwrap_err();

        let pool_error = err.downcast_ref::<PoolError>().unwrap();
        let PoolError::Exhausted { endpoints, url, .. } = pool_error;
        assert_eq!(*endpoints, 3);
        assert_eq!(url, "http://node-2");
        assert!(err.to_string().contains("connection refused by 2"));
    }

    #[tokio::test]
    async fn random_start_still_visits_every_endpoint() {
        let pool = pool_of(5);
        let visited = std::sync::Mutex::new(Vec::new());

        let err = pool
            .retry_each_from_random(|handle| {
                visited.lock().unwrap().push(handle);
                async move { Err::<(), _>(anyhow::anyhow!("down")) }
            })
            .await;

        assert!(err.is_err());
        let mut visited = visited.into_inner().unwrap();
        visited.sort();
        assert_eq!(visited, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_and_fails_over() {
        let pool = pool_of(2).with_request_timeout(Duration::from_millis(20));

        let result = pool
            .retry_each(|handle| async move {
                if handle == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                anyhow::Ok(handle)
            })
            .await
            .unwrap();

        assert_eq!(result, 1);
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(EndpointPool::<usize>::new(Vec::new()).is_err());
    }

    #[test]
    fn parses_suggested_range_from_node_error() {
        let message = "query exceeds max results 10000, retry with the range 100-250";
        assert_eq!(parse_max_results_error(message), Some((100, 250)));
        assert_eq!(parse_max_results_error("rate limited"), None);
    }

    /// Node that serves at most 201 blocks per query and suggests a window
    /// starting 50 blocks after the requested one.
    async fn capped_node(
        filter: Filter,
        blocks_with_logs: &[u64],
        windows: &std::sync::Mutex<Vec<(u64, u64)>>,
    ) -> Result<Vec<Log>> {
        let from = filter.get_from_block().unwrap();
        let to = filter.get_to_block().unwrap();
        windows.lock().unwrap().push((from, to));

        if to - from + 1 > 201 {
            anyhow::bail!(
                "query exceeds max results 10000, retry with the range {}-{}",
                from + 50,
                from + 200
            );
        }
        Ok(blocks_with_logs
            .iter()
            .filter(|block| (from..=to).contains(block))
            .map(|block| Log {
                block_number: Some(*block),
                ..Default::default()
            })
            .collect())
    }

    #[tokio::test]
    async fn split_ranges_cover_every_block_once() {
        let blocks_with_logs = [100, 149, 150, 300, 301, 551, 999, 1000];
        let windows = std::sync::Mutex::new(Vec::new());
        let filter = Filter::new().from_block(100u64).to_block(1000u64);

        let logs = split_get_logs(&filter, |window| {
            capped_node(window, &blocks_with_logs, &windows)
        })
        .await
        .unwrap();

        let found: Vec<u64> = logs.iter().filter_map(|log| log.block_number).collect();
        assert_eq!(found, blocks_with_logs.to_vec());

        let served: Vec<(u64, u64)> = windows
            .into_inner()
            .unwrap()
            .into_iter()
            .filter(|(from, to)| to - from + 1 <= 201)
            .collect();
        assert_eq!(served.first().map(|w| w.0), Some(100));
        assert_eq!(served.last().map(|w| w.1), Some(1000));
        for pair in served.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[tokio::test]
    async fn unrelated_errors_are_not_split() {
        let calls = AtomicUsize::new(0);
        let filter = Filter::new().from_block(1u64).to_block(500u64);

        let err = split_get_logs(&filter, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<Vec<Log>, _>(anyhow::anyhow!("connection reset")) }
        })
        .await
        .unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn suggestion_that_does_not_shrink_the_window_is_an_error() {
        let filter = Filter::new().from_block(1u64).to_block(500u64);

        let result = split_get_logs(&filter, |_| async {
            Err::<Vec<Log>, _>(anyhow::anyhow!(
                "query exceeds max results 10000, retry with the range 1-500"
            ))
        })
        .await;

        assert!(result.is_err());
    }
}
