//! External capability traits.
//!
//! The engine consumes text embedding and chat completion through these two
//! narrow interfaces. The host runtime supplies the implementations; the
//! engine never talks to a model API directly.

use async_trait::async_trait;

use crate::error::Result;

/// Text embedding capability.
///
/// The same embedder must be used for writes and queries, and must be
/// (approximately) deterministic across a process lifetime: the dense index
/// stores raw output vectors and compares queries against them.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Output dimensionality. Fixed for the lifetime of the process.
    fn dimensions(&self) -> usize;

    /// Embed a single text into a `dimensions()`-length vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Chat completion capability.
///
/// `json_mode = true` asks the model for a JSON object response. Providers
/// may still wrap the payload in Markdown fences; the reflection engine
/// strips those before parsing.
#[async_trait]
pub trait Chatter: Send + Sync {
    /// Run one completion with a user prompt and a system prompt.
    async fn chat(&self, prompt: &str, system_prompt: &str, json_mode: bool) -> Result<String>;
}
