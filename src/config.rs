use anyhow::{Context, Result};
use std::time::Duration;

const DEFAULT_PRICE_API_URL: &str = "https://api.binance.com";
const DEFAULT_MIN_USEFUL_SPAN: u64 = 50;
const DEFAULT_BACKOFF_SECS: u64 = 180;
const DEFAULT_PASS_PAUSE_MS: u64 = 1000;

/// Process-level settings. Per-worker settings (RPC URLs, scan interval,
/// parallelism) live in the `workers` table.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub price_api_url: String,
    pub min_useful_span: u64,
    pub backoff: Duration,
    pub pass_pause: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:./indexer.db".to_string());

        let redis_url = std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty());

        let price_api_url = std::env::var("PRICE_API_URL")
            .unwrap_or_else(|_| DEFAULT_PRICE_API_URL.to_string());

        let min_useful_span = parse_var("MIN_USEFUL_SPAN", DEFAULT_MIN_USEFUL_SPAN)?;
        let backoff_secs = parse_var("BACKOFF_SECS", DEFAULT_BACKOFF_SECS)?;
        let pass_pause_ms = parse_var("PASS_PAUSE_MS", DEFAULT_PASS_PAUSE_MS)?;

        Ok(Config {
            database_url,
            redis_url,
            price_api_url,
            min_useful_span,
            backoff: Duration::from_secs(backoff_secs),
            pass_pause: Duration::from_millis(pass_pause_ms),
        })
    }
}

fn parse_var(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} must be an unsigned integer, got {value:?}")),
        Err(_) => Ok(default),
    }
}
