//! Shared test doubles: a deterministic embedder and a scripted chatter.
#![allow(dead_code)] // each integration binary uses a different subset

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use livingmemory_core::{
    Chatter, DocumentStore, Embedder, MemoryManager, Result, VectorIndex,
};

/// Embedding dimensionality used across the integration tests
pub const DIMS: usize = 32;

/// Deterministic bag-of-words embedder.
///
/// Hashes each lowercased word into a bucket and L2-normalizes, so identical
/// texts embed identically and word overlap produces cosine similarity -
/// enough structure for retrieval assertions without a model.
pub struct MockEmbedder;

#[async_trait]
impl Embedder for MockEmbedder {
    fn dimensions(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; DIMS];
        for word in text.to_lowercase().split_whitespace() {
            let mut h: u64 = 1469598103934665603;
            for b in word.bytes() {
                h ^= u64::from(b);
                h = h.wrapping_mul(1099511628211);
            }
            v[(h % DIMS as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        Ok(v.into_iter().map(|x| x / norm).collect())
    }
}

/// Chatter that replays scripted responses in order.
pub struct MockChatter {
    responses: Mutex<VecDeque<String>>,
}

impl MockChatter {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

#[async_trait]
impl Chatter for MockChatter {
    async fn chat(&self, _prompt: &str, _system: &str, _json_mode: bool) -> Result<String> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| livingmemory_core::MemoryError::External("script exhausted".into()))
    }
}

/// A memory manager over fresh stores inside `dir`.
pub fn make_manager(dir: &tempfile::TempDir) -> Arc<MemoryManager> {
    let docs = Arc::new(DocumentStore::open(&dir.path().join("livingmemory.db")).unwrap());
    Arc::new(MemoryManager::new(
        docs,
        VectorIndex::new(DIMS).unwrap(),
        Arc::new(MockEmbedder),
        dir.path().join("livingmemory.index"),
    ))
}
