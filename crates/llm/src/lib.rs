//! External language-model collaborators, specified at their interface.
//!
//! The engine only ever sees two capabilities:
//!
//! * [`Generate`] — `generate(prompt, context) -> text`, used for consistency
//!   judgments and session drafting.
//! * [`Embed`] — `embed(text) -> fixed-length float vector`, used whenever a
//!   memory's content changes.
//!
//! [`OllamaClient`] implements both against an Ollama-compatible HTTP API.
//! Failure and timeout handling is deliberately left to callers: a judgment
//! caller forces Inconsistent, a retrieval caller degrades the bundle.

use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;

#[async_trait]
pub trait Generate: Send + Sync {
    /// Produce free text for `prompt`, with `context` prepended as grounding
    /// material.  Errors propagate; callers own the failure policy.
    async fn generate(&self, prompt: &str, context: &str) -> Result<String>;
}

#[async_trait]
pub trait Embed: Send + Sync {
    /// Map `text` to a fixed-length embedding vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ── Ollama-compatible HTTP client ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embed_model: String,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        embed_model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            embed_model: embed_model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Generate for OllamaClient {
    async fn generate(&self, prompt: &str, context: &str) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url);
        let full_prompt = if context.is_empty() {
            prompt.to_string()
        } else {
            format!("{context}\n\n{prompt}")
        };

        let payload = json!({
            "model": self.model,
            "prompt": full_prompt,
            "stream": false
        });

        let response = self.client.post(endpoint).json(&payload).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("generate endpoint returned {status}: {body}");
        }

        match body.get("response").and_then(|value| value.as_str()) {
            Some(content) => Ok(content.to_string()),
            None => bail!("generate response missing text field: {body}"),
        }
    }
}

#[async_trait]
impl Embed for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let endpoint = format!("{}/api/embeddings", self.base_url);
        let payload = json!({
            "model": self.embed_model,
            "prompt": text
        });

        let response = self.client.post(endpoint).json(&payload).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("embeddings endpoint returned {status}: {body}");
        }

        let vector = body
            .get("embedding")
            .and_then(|value| value.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64())
                    .map(|v| v as f32)
                    .collect::<Vec<f32>>()
            });

        match vector {
            Some(v) if !v.is_empty() => Ok(v),
            _ => bail!("embeddings response missing vector: {body}"),
        }
    }
}
