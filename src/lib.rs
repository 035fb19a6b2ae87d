pub mod cache;
pub mod config;
pub mod events;
pub mod fetching;
pub mod interactions;
pub mod parser;
pub mod price;
pub mod protocols;
pub mod query;
pub mod repository;
pub mod rpc;
pub mod scanner;

#[cfg(test)]
pub(crate) mod test_utils;

/// Installs the fmt subscriber used by every binary. `RUST_LOG` overrides
/// the default `info` level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
