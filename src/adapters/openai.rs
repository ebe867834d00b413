//! OpenAI-compatible adapter.
//!
//! Most hosted inference APIs (OpenAI, Together, Groq, DeepInfra, ...)
//! speak the same chat-completions and image-generations dialect, so
//! one adapter covers them, configured with a base URL and an endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

use super::*;

/// Which generation endpoint the adapter targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    #[default]
    Chat,
    Image,
}

pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    provider: String,
    base_url: String,
    endpoint: Endpoint,
}

impl OpenAiCompatAdapter {
    pub fn new(provider: &str, base_url: &str, endpoint: Endpoint, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            provider: provider.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            endpoint,
        }
    }

    fn url(&self) -> String {
        match self.endpoint {
            Endpoint::Chat => format!("{}/chat/completions", self.base_url),
            Endpoint::Image => format!("{}/images/generations", self.base_url),
        }
    }

    fn body(&self, req: &GenerateRequest) -> Value {
        match self.endpoint {
            Endpoint::Chat => chat_body(req),
            Endpoint::Image => image_body(req),
        }
    }
}

fn chat_body(req: &GenerateRequest) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if let Some(sys) = &req.system_prompt {
        messages.push(serde_json::json!({"role": "system", "content": sys}));
    }
    messages.extend(
        req.messages
            .iter()
            .map(|m| serde_json::json!({"role": &m.role, "content": &m.content})),
    );
    if messages.is_empty() {
        if let Some(prompt) = &req.prompt {
            messages.push(serde_json::json!({"role": "user", "content": prompt}));
        }
    }

    let mut body = serde_json::json!({"model": &req.model, "messages": messages});
    if let Some(t) = req.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(m) = req.max_tokens {
        body["max_tokens"] = serde_json::json!(m);
    }
    body
}

fn image_body(req: &GenerateRequest) -> Value {
    let prompt = req
        .prompt
        .clone()
        .or_else(|| req.messages.last().map(|m| m.content.clone()))
        .unwrap_or_default();
    serde_json::json!({
        "model": &req.model,
        "prompt": prompt,
        "n": 1,
        "size": req.size.as_deref().unwrap_or("1024x1024"),
    })
}

fn parse_chat(body: &Value) -> Result<String, ProviderError> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Decode("missing choices[0].message.content".into()))
}

fn parse_images(body: &Value) -> Result<Vec<String>, ProviderError> {
    let images: Vec<String> = body["data"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|img| img["url"].as_str().or_else(|| img["b64_json"].as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if images.is_empty() {
        return Err(ProviderError::Decode("no images in response".into()));
    }
    Ok(images)
}

#[async_trait]
impl GenerationAdapter for OpenAiCompatAdapter {
    fn provider_id(&self) -> &str {
        &self.provider
    }

    async fn generate(
        &self,
        req: &GenerateRequest,
        key: &str,
    ) -> Result<GenerateResponse, ProviderError> {
        let start = Instant::now();
        let resp = self
            .client
            .post(self.url())
            .bearer_auth(key)
            .json(&self.body(req))
            .send()
            .await?;
        let latency = start.elapsed().as_millis() as u64;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status,
                body: truncate_body(&body, 500).to_string(),
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        let (text, images) = match self.endpoint {
            Endpoint::Chat => (parse_chat(&body)?, Vec::new()),
            Endpoint::Image => (String::new(), parse_images(&body)?),
        };

        Ok(GenerateResponse {
            text,
            images,
            model: req.model.clone(),
            latency_ms: latency,
            provider: self.provider.clone(),
            key: String::new(), // Filled by dispatcher
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(endpoint: Endpoint) -> OpenAiCompatAdapter {
        OpenAiCompatAdapter::new("text", "https://api.example.com/v1/", endpoint, Duration::from_secs(5))
    }

    #[test]
    fn test_urls() {
        assert_eq!(adapter(Endpoint::Chat).url(), "https://api.example.com/v1/chat/completions");
        assert_eq!(adapter(Endpoint::Image).url(), "https://api.example.com/v1/images/generations");
    }

    #[test]
    fn test_chat_body_prepends_system_prompt() {
        let req = GenerateRequest {
            model: "m".into(),
            messages: vec![Message { role: "user".into(), content: "hi".into() }],
            system_prompt: Some("be brief".into()),
            max_tokens: Some(64),
            ..Default::default()
        };
        let body = chat_body(&req);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_chat_body_falls_back_to_prompt() {
        let req = GenerateRequest {
            model: "m".into(),
            prompt: Some("write a tagline".into()),
            ..Default::default()
        };
        assert_eq!(chat_body(&req)["messages"][0]["content"], "write a tagline");
    }

    #[test]
    fn test_image_body_defaults_size() {
        let req = GenerateRequest {
            model: "img".into(),
            prompt: Some("a frog in a hat".into()),
            ..Default::default()
        };
        let body = image_body(&req);
        assert_eq!(body["prompt"], "a frog in a hat");
        assert_eq!(body["size"], "1024x1024");
    }

    #[test]
    fn test_parse_responses() {
        let chat = serde_json::json!({"choices":[{"message":{"content":"gm"}}]});
        assert_eq!(parse_chat(&chat).unwrap(), "gm");

        let images = serde_json::json!({"data":[{"url":"https://x/1.png"},{"b64_json":"AAAA"}]});
        assert_eq!(parse_images(&images).unwrap(), vec!["https://x/1.png", "AAAA"]);

        assert!(parse_images(&serde_json::json!({"data":[]})).is_err());
        assert!(parse_chat(&serde_json::json!({})).is_err());
    }
}
