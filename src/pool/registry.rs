//! Pool registry — one independent key pool per provider class.
//!
//! Text and image providers (or two unrelated services) never share
//! rotation state. The registry is built once at startup from config
//! and handed to the dispatcher and the control server.

use std::collections::HashMap;
use std::sync::Arc;

use super::{KeyRotationScheduler, PoolStats};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::discovery;

#[derive(Default)]
pub struct PoolRegistry {
    pools: HashMap<String, Arc<KeyRotationScheduler>>,
}

impl PoolRegistry {
    /// Build every configured pool, resolving credentials through `lookup`.
    pub fn from_config<F>(config: &Config, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_config_with_clock(config, lookup, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock<F>(config: &Config, lookup: F, clock: Arc<dyn Clock>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut registry = Self::default();
        for pool in &config.pools {
            let credentials = discovery::collect_credentials(&pool.env_var, &lookup);
            if credentials.is_empty() {
                tracing::warn!(
                    provider = %pool.name,
                    env_var = %pool.env_var,
                    "No credentials found — requests for this provider will fail"
                );
            }
            registry.insert(KeyRotationScheduler::with_clock(
                &pool.name,
                credentials,
                pool.daily_limit,
                Arc::clone(&clock),
            ));
        }
        registry
    }

    /// Add (or replace) a pool under its provider class.
    pub fn insert(&mut self, pool: KeyRotationScheduler) {
        self.pools.insert(pool.provider_class().to_string(), Arc::new(pool));
    }

    pub fn get(&self, provider_class: &str) -> Option<Arc<KeyRotationScheduler>> {
        self.pools.get(provider_class).cloned()
    }

    /// Provider class names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Per-pool stats, sorted by provider class.
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.values().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.provider_class.cmp(&b.provider_class));
        stats
    }

    /// Totals across every pool.
    pub fn aggregate(&self) -> PoolStats {
        self.stats().into_iter().fold(
            PoolStats {
                provider_class: "all".to_string(),
                ..PoolStats::default()
            },
            |mut acc, s| {
                acc.key_count += s.key_count;
                acc.total_requests_today += s.total_requests_today;
                acc.total_daily_capacity += s.total_daily_capacity;
                acc
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn config() -> Config {
        Config {
            pools: vec![
                PoolConfig::new("text", "TEXT_API_KEY", 100),
                PoolConfig::new("image", "IMAGE_API_KEY", 20),
            ],
            ..Config::default()
        }
    }

    #[test]
    fn test_pools_built_from_env() {
        let lookup = env(&[
            ("TEXT_API_KEY", "t-one-0000"),
            ("TEXT_API_KEY_2", "t-two-0000"),
            ("IMAGE_API_KEY", "i-one-0000"),
        ]);
        let registry = PoolRegistry::from_config(&config(), lookup);

        assert_eq!(registry.names(), vec!["image", "text"]);
        assert_eq!(registry.get("text").unwrap().len(), 2);
        assert_eq!(registry.get("image").unwrap().len(), 1);
        assert!(registry.get("video").is_none());
    }

    #[test]
    fn test_pools_are_independent() {
        let lookup = env(&[("TEXT_API_KEY", "shared-key-00"), ("IMAGE_API_KEY", "shared-key-00")]);
        let registry = PoolRegistry::from_config(&config(), lookup);

        let text = registry.get("text").unwrap();
        text.mark_exhausted("shared-key-00", true);

        let image = registry.get("image").unwrap();
        assert_eq!(image.snapshot()[0].state, "healthy");
        assert_eq!(text.snapshot()[0].state, "monthly_quarantine");
    }

    #[test]
    fn test_aggregate_sums_pools() {
        let lookup = env(&[
            ("TEXT_API_KEY", "t-one-0000"),
            ("TEXT_API_KEY_2", "t-two-0000"),
            ("IMAGE_API_KEY", "i-one-0000"),
        ]);
        let registry = PoolRegistry::from_config(&config(), lookup);
        registry.get("text").unwrap().record_outcome("t-one-0000", true);
        registry.get("image").unwrap().record_outcome("i-one-0000", true);

        let total = registry.aggregate();
        assert_eq!(total.provider_class, "all");
        assert_eq!(total.key_count, 3);
        assert_eq!(total.total_requests_today, 2);
        assert_eq!(total.total_daily_capacity, 220);
    }

    #[test]
    fn test_missing_credentials_yield_empty_pool() {
        let registry = PoolRegistry::from_config(&config(), env(&[]));
        assert!(registry.get("text").unwrap().is_empty());
        assert_eq!(registry.get("text").unwrap().select_key(), None);
    }
}
