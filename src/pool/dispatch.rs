//! Dispatcher — runs a generation request against a pool with failover.
//!
//! The key is selected under the scheduler lock, the provider call runs
//! with the lock released, and the classified outcome is reported back.
//! Failures that are the key's fault (throttling, exhaustion, bad
//! credentials, provider errors) move on to the next key until every key
//! in the pool has had one attempt. Invalid requests are not retried.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn, Instrument};
use zeroize::Zeroizing;

use super::classifier::{self, CallOutcome};
use super::registry::PoolRegistry;
use super::{mask_key, KeyRotationScheduler};
use crate::adapters::{truncate_body, GenerateRequest, GenerateResponse, GenerationAdapter, ProviderError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown provider class '{0}'")]
    UnknownProvider(String),

    #[error("no adapter registered for provider class '{0}'")]
    NoAdapter(String),

    #[error("no credentials configured for provider class '{0}'")]
    NoCredentials(String),

    #[error("{provider} call failed: {source}")]
    Provider {
        provider: String,
        outcome: CallOutcome,
        #[source]
        source: ProviderError,
    },

    #[error("all {attempts} attempt(s) for '{provider}' failed, last error: {last}")]
    AllKeysFailed {
        provider: String,
        attempts: usize,
        last: ProviderError,
    },
}

pub type AdapterMap = HashMap<String, Box<dyn GenerationAdapter>>;

pub struct Dispatcher {
    registry: Arc<PoolRegistry>,
    adapters: Arc<AdapterMap>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PoolRegistry>, adapters: Arc<AdapterMap>) -> Self {
        Self { registry, adapters }
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Run `req` against the pool for `provider`, failing over across keys.
    pub async fn generate(
        &self,
        provider: &str,
        req: &GenerateRequest,
    ) -> Result<GenerateResponse, DispatchError> {
        let pool = self
            .registry
            .get(provider)
            .ok_or_else(|| DispatchError::UnknownProvider(provider.to_string()))?;
        let adapter = self
            .adapters
            .get(provider)
            .ok_or_else(|| DispatchError::NoAdapter(provider.to_string()))?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("dispatch", %request_id, provider = provider, model = %req.model);

        generate_with_failover(&pool, &**adapter, req)
            .instrument(span)
            .await
    }
}

async fn generate_with_failover(
    pool: &KeyRotationScheduler,
    adapter: &dyn GenerationAdapter,
    req: &GenerateRequest,
) -> Result<GenerateResponse, DispatchError> {
    let provider = pool.provider_class().to_string();
    let single_key = pool.len() <= 1;
    let mut tried: Vec<Zeroizing<String>> = Vec::new();
    let mut last_error = None;

    loop {
        let key = Zeroizing::new(
            pool.select_key()
                .ok_or_else(|| DispatchError::NoCredentials(provider.clone()))?,
        );
        // The scheduler came back around to a key this request already
        // burned; every usable key has had its attempt.
        if tried.iter().any(|k| k.as_str() == key.as_str()) {
            break;
        }
        let attempt = tried.len() + 1;
        let masked = mask_key(&key);

        let result = adapter.generate(req, &key).await;
        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(e) => classifier::classify_error(e),
        };
        pool.report(&key, outcome);

        match result {
            Ok(mut resp) => {
                info!(key = %masked, attempt, latency_ms = resp.latency_ms, "Generation succeeded");
                resp.key = masked;
                return Ok(resp);
            }
            Err(e) => {
                let err_str = e.to_string();
                warn!(
                    key = %masked,
                    attempt,
                    outcome = ?outcome,
                    "Generate failed: {}",
                    truncate_body(&err_str, 200)
                );
                if single_key || !outcome.worth_retrying_on_other_key() {
                    return Err(DispatchError::Provider {
                        provider,
                        outcome,
                        source: e,
                    });
                }
                last_error = Some(e);
                tried.push(key);
            }
        }
    }

    Err(DispatchError::AllKeysFailed {
        provider,
        attempts: tried.len(),
        last: last_error.unwrap_or_else(|| ProviderError::Transport("no attempt made".into())),
    })
}

/// Run one call with a key from `pool` and report its outcome.
///
/// For call sites that talk to a provider directly instead of through a
/// `GenerationAdapter`. No retry: the caller decides whether to call again.
pub async fn with_key<F, Fut, T>(pool: &KeyRotationScheduler, op: F) -> Result<T, DispatchError>
where
    F: FnOnce(Zeroizing<String>) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let key = Zeroizing::new(
        pool.select_key()
            .ok_or_else(|| DispatchError::NoCredentials(pool.provider_class().to_string()))?,
    );

    let result = op(key.clone()).await;
    let outcome = match &result {
        Ok(_) => CallOutcome::Success,
        Err(e) => classifier::classify_error(e),
    };
    pool.report(&key, outcome);

    result.map_err(|source| DispatchError::Provider {
        provider: pool.provider_class().to_string(),
        outcome,
        source,
    })
}
