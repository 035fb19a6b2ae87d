use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

/// Symbol every quote is denominated in.
pub const QUOTE_SYMBOL: &str = "USDT";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: usize = 3;
const CLOSE_PRICE_INDEX: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum PriceError {
    #[error("price request for {symbol} failed: {source}")]
    Request {
        symbol: String,
        source: reqwest::Error,
    },
    #[error("price source answered {status} for {symbol}")]
    FetchFailed { symbol: String, status: StatusCode },
    #[error("no candle for {symbol} at {at}")]
    NoCandles { symbol: String, at: DateTime<Utc> },
    #[error("could not decode candles for {symbol}: {source}")]
    Decode {
        symbol: String,
        source: reqwest::Error,
    },
    #[error("close price {value:?} for {symbol} is not numeric")]
    MalformedPrice { symbol: String, value: String },
}

impl PriceError {
    /// Transport errors, throttling and server-side failures are worth
    /// another attempt; everything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            PriceError::Request { .. } => true,
            PriceError::FetchFailed { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }
}

/// Historical USD quotes for a token symbol.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn close_price(&self, symbol: &str, at: DateTime<Utc>) -> Result<Decimal, PriceError>;
}

/// Reads one-minute klines of `<SYMBOL>USDT` from a Binance compatible API.
pub struct BinancePriceSource {
    client: Client,
    base_url: String,
}

impl BinancePriceSource {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100)
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(MAX_ATTEMPTS - 1)
    }

    async fn fetch_close_price(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<Decimal, PriceError> {
        let pair = format!("{}{}", symbol.to_uppercase(), QUOTE_SYMBOL);
        let start_time = at.timestamp_millis().to_string();

        let response = self
            .client
            .get(format!("{}/api/v3/klines", self.base_url))
            .query(&[
                ("symbol", pair.as_str()),
                ("interval", "1m"),
                ("startTime", start_time.as_str()),
                ("limit", "1"),
            ])
            .send()
            .await
            .map_err(|source| PriceError::Request {
                symbol: symbol.to_string(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(PriceError::FetchFailed {
                symbol: symbol.to_string(),
                status,
            });
        }

        let candles: Vec<Vec<serde_json::Value>> =
            response.json().await.map_err(|source| PriceError::Decode {
                symbol: symbol.to_string(),
                source,
            })?;

        let close = candles
            .first()
            .and_then(|candle| candle.get(CLOSE_PRICE_INDEX))
            .ok_or_else(|| PriceError::NoCandles {
                symbol: symbol.to_string(),
                at,
            })?;

        parse_close_price(symbol, close)
    }
}

fn parse_close_price(symbol: &str, close: &serde_json::Value) -> Result<Decimal, PriceError> {
    let raw = match close {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Decimal::from_str(&raw).map_err(|_| PriceError::MalformedPrice {
        symbol: symbol.to_string(),
        value: raw,
    })
}

#[async_trait]
impl PriceSource for BinancePriceSource {
    async fn close_price(&self, symbol: &str, at: DateTime<Utc>) -> Result<Decimal, PriceError> {
        let price = RetryIf::start(
            self.get_retry_strategy(),
            || async {
                let result = self.fetch_close_price(symbol, at).await;
                if let Err(e) = &result {
                    if e.is_transient() {
                        warn!("Price lookup for {} failed, retrying: {}", symbol, e);
                    }
                }
                result
            },
            PriceError::is_transient,
        )
        .await?;

        debug!("Close price of {} at {} is {}", symbol, at, price);
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_close_price() {
        let price = parse_close_price("ETH", &json!("3120.55000000")).unwrap();
        assert_eq!(price, Decimal::from_str("3120.55").unwrap());
    }

    #[test]
    fn non_numeric_close_is_malformed_not_fetch_failure() {
        let err = parse_close_price("ETH", &json!("n/a")).unwrap_err();
        assert!(matches!(err, PriceError::MalformedPrice { ref value, .. } if value == "n/a"));
        assert!(!err.is_transient());
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        let throttled = PriceError::FetchFailed {
            symbol: "ETH".into(),
            status: StatusCode::TOO_MANY_REQUESTS,
        };
        let unavailable = PriceError::FetchFailed {
            symbol: "ETH".into(),
            status: StatusCode::BAD_GATEWAY,
        };
        let bad_symbol = PriceError::FetchFailed {
            symbol: "NOPE".into(),
            status: StatusCode::BAD_REQUEST,
        };

        assert!(throttled.is_transient());
        assert!(unavailable.is_transient());
        assert!(!bad_symbol.is_transient());
    }
}
