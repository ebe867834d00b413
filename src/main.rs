//! keypool daemon — owns the key pools for every configured provider
//! class and serves them over a local control socket.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use keypool::adapters::openai::OpenAiCompatAdapter;
use keypool::config::{AdapterConfig, Config};
use keypool::pool::dispatch::AdapterMap;
use keypool::server::Server;
use keypool::{Dispatcher, PoolRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keypool=info".into()),
        )
        .with_target(false)
        .init();

    info!("keypool v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("Failed to load configuration")?;

    // ── Key Pools ───────────────────────────────────────────────────
    let registry = Arc::new(PoolRegistry::from_config(&config, |name| std::env::var(name).ok()));
    if registry.is_empty() {
        info!("No pools configured — add a `pools:` section to the config file");
        info!("   Example: pools: [{{ name: text, env_var: TOGETHER_API_KEY, daily_limit: 1000 }}]");
    }
    for stats in registry.stats() {
        info!(
            provider = %stats.provider_class,
            keys = stats.key_count,
            capacity = stats.total_daily_capacity,
            "Pool loaded"
        );
    }

    // ── Provider Adapters ───────────────────────────────────────────
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let mut adapters = AdapterMap::new();
    for pool in &config.pools {
        match &pool.adapter {
            Some(AdapterConfig::OpenaiCompat { base_url, endpoint }) => {
                adapters.insert(
                    pool.name.clone(),
                    Box::new(OpenAiCompatAdapter::new(&pool.name, base_url, *endpoint, timeout)),
                );
            }
            None => warn!(provider = %pool.name, "No adapter configured — kp.generate unavailable"),
        }
    }

    let dispatcher = Arc::new(Dispatcher::new(registry, Arc::new(adapters)));

    // ── Control Server ──────────────────────────────────────────────
    let server = Server::new(
        config.socket_path.clone(),
        dispatcher,
        Duration::from_secs(config.pulse_interval_minutes * 60),
    );

    tokio::select! {
        res = server.run() => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    if config.socket_path.exists() {
        let _ = std::fs::remove_file(&config.socket_path);
    }

    Ok(())
}
