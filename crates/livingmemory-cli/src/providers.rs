//! OpenAI-compatible providers backing the CLI's Embedder and Chatter
//! capabilities.
//!
//! Any endpoint speaking the `/embeddings` and `/chat/completions` wire
//! shape works (OpenAI, a local gateway, a compatible proxy). Settings come
//! from the environment:
//!
//! - `LMEM_API_KEY` (or `OPENAI_API_KEY`)
//! - `LMEM_BASE_URL` (default `https://api.openai.com/v1`)
//! - `LMEM_CHAT_MODEL` (default `gpt-4o-mini`)
//! - `LMEM_EMBED_MODEL` (default `text-embedding-3-small`)
//! - `LMEM_EMBED_DIM` (default `1536`)

use std::sync::Arc;

use async_trait::async_trait;
use livingmemory_core::{Chatter, Embedder, MemoryError, Result};
use serde::{Deserialize, Serialize};

/// Connection settings shared by both providers
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: String,
    pub chat_model: String,
    pub embed_model: String,
    pub embed_dimensions: usize,
}

impl ProviderSettings {
    /// Read settings from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("LMEM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                anyhow::anyhow!(
                    "no API key configured; set LMEM_API_KEY (or OPENAI_API_KEY) to an \
                     OpenAI-compatible endpoint key"
                )
            })?;
        let base_url = std::env::var("LMEM_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let chat_model =
            std::env::var("LMEM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let embed_model = std::env::var("LMEM_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let embed_dimensions = std::env::var("LMEM_EMBED_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1536);

        Ok(Self {
            base_url,
            api_key,
            chat_model,
            embed_model,
            embed_dimensions,
        })
    }
}

/// Build the provider pair the host's `initialize` expects.
pub fn from_env() -> anyhow::Result<(Arc<dyn Embedder>, Arc<dyn Chatter>)> {
    let settings = ProviderSettings::from_env()?;
    let client = reqwest::Client::new();
    Ok((
        Arc::new(OpenAiEmbedder {
            client: client.clone(),
            settings: settings.clone(),
        }),
        Arc::new(OpenAiChatter { client, settings }),
    ))
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

// ============================================================================
// EMBEDDER
// ============================================================================

/// `/embeddings` client
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    settings: ProviderSettings,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.settings.embed_dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(endpoint(&self.settings.base_url, "embeddings"))
            .bearer_auth(&self.settings.api_key)
            .json(&EmbedRequest {
                model: &self.settings.embed_model,
                input: [text],
            })
            .send()
            .await
            .map_err(|e| MemoryError::External(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::External(format!(
                "embedding request failed: status={status}, body={body}"
            )));
        }

        let payload: EmbedResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::External(format!("bad embedding response: {e}")))?;
        let embedding = payload
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| MemoryError::External("embedding response held no vectors".into()))?;

        if embedding.len() != self.settings.embed_dimensions {
            return Err(MemoryError::External(format!(
                "embedding dimension mismatch: expected {}, got {} (set LMEM_EMBED_DIM)",
                self.settings.embed_dimensions,
                embedding.len()
            )));
        }
        Ok(embedding)
    }
}

// ============================================================================
// CHATTER
// ============================================================================

/// `/chat/completions` client
pub struct OpenAiChatter {
    client: reqwest::Client,
    settings: ProviderSettings,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl Chatter for OpenAiChatter {
    async fn chat(&self, prompt: &str, system_prompt: &str, json_mode: bool) -> Result<String> {
        let request = ChatRequest {
            model: &self.settings.chat_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            response_format: json_mode.then(|| serde_json::json!({"type": "json_object"})),
        };

        let response = self
            .client
            .post(endpoint(&self.settings.base_url, "chat/completions"))
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::External(format!("chat request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::External(format!(
                "chat request failed: status={status}, body={body}"
            )));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::External(format!("bad chat response: {e}")))?;
        payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| MemoryError::External("chat response held no content".into()))
    }
}
