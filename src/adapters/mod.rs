//! Generation adapter trait — provider-agnostic interface.
//!
//! Any inference provider (text or image) implements this trait. The
//! dispatcher hands adapters a key for one call; adapters never see the
//! pool and never keep the key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod openai;

// ── Core Types ──────────────────────────────────────────────────────

/// A provider-agnostic generation request.
///
/// Chat endpoints read `messages`; image endpoints read `prompt`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Image size, e.g. "1024x1024".
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String, // "user" | "assistant" | "system"
    pub content: String,
}

/// A provider-agnostic generation response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    /// Image URLs or base64 payloads, for image endpoints.
    #[serde(default)]
    pub images: Vec<String>,
    pub model: String,
    pub latency_ms: u64,
    pub provider: String,
    /// Masked form of the key that served the request. Filled by the dispatcher.
    pub key: String,
}

/// Why a provider call failed.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode provider response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

// ── Adapter Trait ───────────────────────────────────────────────────

#[async_trait]
pub trait GenerationAdapter: Send + Sync {
    /// Provider class this adapter serves (matches the pool name).
    fn provider_id(&self) -> &str;

    /// Send a generation request using the provided key.
    /// The adapter must NOT store, log, or cache the key.
    async fn generate(
        &self,
        req: &GenerateRequest,
        key: &str,
    ) -> Result<GenerateResponse, ProviderError>;
}

/// Cut an error body down to something safe to log.
pub fn truncate_body(body: &str, max: usize) -> &str {
    if body.len() <= max {
        return body;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
