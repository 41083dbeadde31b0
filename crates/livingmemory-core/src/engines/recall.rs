//! Recall engine - multi-strategy retrieval of relevant memories.
//!
//! Dispatches between hybrid, dense-only, and sparse-only retrieval. In
//! hybrid mode the dense and sparse arms run concurrently with `2·top_k`
//! fan-out; a failure in either arm degrades to an empty list rather than
//! failing the recall. Fused results are reranked by a weighted blend of
//! similarity, importance, and access recency.

use std::sync::{Arc, PoisonError, RwLock};

use crate::config::{FusionConfig, RecallEngineConfig, RecallStrategy, RetrievalMode};
use crate::error::Result;
use crate::memory::{MemoryRecord, ScoredMemory};
use crate::retrieval::fusion::{apply_fusion_param, FusionStrategy, Fuser, QueryInfo, RankedDoc};
use crate::retrieval::sparse::{SparseHit, SparseRetriever};
use crate::storage::memory_manager::MemoryManager;
use crate::util::now_ts;

/// Recency decay constant: half-life ≈ 24 hours.
const RECENCY_LAMBDA: f64 = 0.028;

/// Multi-strategy recall over the memory manager and sparse retriever
pub struct RecallEngine {
    memory: Arc<MemoryManager>,
    sparse: Option<Arc<SparseRetriever>>,
    config: RwLock<RecallEngineConfig>,
    fuser: RwLock<Fuser>,
}

impl RecallEngine {
    /// Wire the engine. `sparse` is `None` when the sparse retriever is
    /// disabled; hybrid mode then degrades to dense.
    pub fn new(
        config: RecallEngineConfig,
        fusion_config: FusionConfig,
        memory: Arc<MemoryManager>,
        sparse: Option<Arc<SparseRetriever>>,
    ) -> Self {
        Self {
            memory,
            sparse,
            config: RwLock::new(config),
            fuser: RwLock::new(Fuser::new(fusion_config)),
        }
    }

    /// Snapshot of the engine configuration.
    pub fn config(&self) -> RecallEngineConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the fusion configuration.
    pub fn fusion_config(&self) -> FusionConfig {
        self.fuser
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .config()
            .clone()
    }

    /// Switch the retrieval mode at runtime.
    pub fn set_retrieval_mode(&self, mode: RetrievalMode) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retrieval_mode = mode;
        tracing::info!("retrieval mode set to {}", mode.as_str());
    }

    /// Switch the fusion strategy, optionally applying one `key=value`
    /// parameter. Validation happens against the target strategy before
    /// anything is applied.
    pub fn set_fusion(&self, strategy: FusionStrategy, param: Option<(&str, &str)>) -> Result<()> {
        let mut fuser = self.fuser.write().unwrap_or_else(PoisonError::into_inner);
        let mut config = fuser.config().clone();
        config.strategy = strategy;
        if let Some((key, value)) = param {
            apply_fusion_param(&mut config, strategy, key, value)?;
        }
        fuser.set_config(config);
        tracing::info!("fusion strategy set to {strategy}");
        Ok(())
    }

    /// Apply one `key=value` fusion parameter under the current strategy.
    pub fn set_fusion_param(&self, key: &str, value: &str) -> Result<()> {
        let mut fuser = self.fuser.write().unwrap_or_else(PoisonError::into_inner);
        let mut config = fuser.config().clone();
        let strategy = config.strategy;
        apply_fusion_param(&mut config, strategy, key, value)?;
        fuser.set_config(config);
        Ok(())
    }

    /// Retrieve the most relevant memories for a query.
    pub async fn recall(
        &self,
        query: &str,
        session_id: Option<&str>,
        persona_id: Option<&str>,
        k: Option<usize>,
    ) -> Result<Vec<ScoredMemory>> {
        let config = self.config();
        let top_k = k.unwrap_or(config.top_k);
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_info = QueryInfo::analyze(query);

        match (config.retrieval_mode, &self.sparse) {
            (RetrievalMode::Hybrid, Some(sparse)) => {
                self.hybrid_search(query, session_id, persona_id, top_k, &query_info, sparse, &config)
                    .await
            }
            (RetrievalMode::Sparse, Some(sparse)) => {
                Ok(self.sparse_search(query, session_id, persona_id, top_k, sparse))
            }
            _ => self.dense_search(query, session_id, persona_id, top_k, &config).await,
        }
    }

    async fn hybrid_search(
        &self,
        query: &str,
        session_id: Option<&str>,
        persona_id: Option<&str>,
        top_k: usize,
        query_info: &QueryInfo,
        sparse: &Arc<SparseRetriever>,
        config: &RecallEngineConfig,
    ) -> Result<Vec<ScoredMemory>> {
        let fetch_k = top_k * 2;

        // Both arms fan out concurrently; either failure degrades to empty.
        let sparse_task = {
            let sparse = Arc::clone(sparse);
            let query = query.to_string();
            let session_id = session_id.map(str::to_string);
            let persona_id = persona_id.map(str::to_string);
            tokio::task::spawn_blocking(move || {
                sparse.search(
                    &query,
                    fetch_k,
                    session_id.as_deref(),
                    persona_id.as_deref(),
                    None,
                )
            })
        };

        let (dense_result, sparse_result) =
            tokio::join!(self.memory.search(query, fetch_k, session_id, persona_id), sparse_task);

        let dense_hits = match dense_result {
            Ok(hits) => hits,
            Err(e) => {
                tracing::error!("dense search failed: {e}");
                Vec::new()
            }
        };
        let sparse_hits: Vec<SparseHit> = match sparse_result {
            Ok(hits) => hits,
            Err(e) => {
                tracing::error!("sparse search task failed: {e}");
                Vec::new()
            }
        };
        tracing::debug!(
            "hybrid recall: {} dense, {} sparse candidates",
            dense_hits.len(),
            sparse_hits.len()
        );

        let dense_docs: Vec<RankedDoc> = dense_hits
            .iter()
            .map(|m| RankedDoc {
                id: m.record.id,
                score: m.similarity,
                content_len: m.record.content.chars().count(),
            })
            .collect();
        let sparse_docs: Vec<RankedDoc> = sparse_hits
            .iter()
            .map(|h| RankedDoc {
                id: h.id,
                score: h.score,
                content_len: h.content.chars().count(),
            })
            .collect();

        let fused = {
            let fuser = self.fuser.read().unwrap_or_else(PoisonError::into_inner);
            fuser.fuse(&dense_docs, &sparse_docs, top_k, query_info)
        };

        // Hydrate fused ids from whichever arm already carries the record.
        let dense_by_id: std::collections::HashMap<i64, &ScoredMemory> =
            dense_hits.iter().map(|m| (m.record.id, m)).collect();
        let sparse_by_id: std::collections::HashMap<i64, &SparseHit> =
            sparse_hits.iter().map(|h| (h.id, h)).collect();

        let mut results: Vec<ScoredMemory> = Vec::with_capacity(fused.len());
        for hit in fused {
            if let Some(mem) = dense_by_id.get(&hit.id) {
                results.push(ScoredMemory {
                    record: mem.record.clone(),
                    similarity: hit.final_score,
                });
            } else if let Some(sp) = sparse_by_id.get(&hit.id) {
                results.push(ScoredMemory {
                    record: MemoryRecord {
                        id: sp.id,
                        content: sp.content.clone(),
                        metadata: sp.metadata.clone(),
                    },
                    similarity: hit.final_score,
                });
            }
        }

        if config.recall_strategy == RecallStrategy::Weighted {
            self.rerank_by_weighted_score(&mut results, config);
        }
        Ok(results)
    }

    async fn dense_search(
        &self,
        query: &str,
        session_id: Option<&str>,
        persona_id: Option<&str>,
        top_k: usize,
        config: &RecallEngineConfig,
    ) -> Result<Vec<ScoredMemory>> {
        let mut results = self.memory.search(query, top_k, session_id, persona_id).await?;
        if config.recall_strategy == RecallStrategy::Weighted {
            self.rerank_by_weighted_score(&mut results, config);
        }
        Ok(results)
    }

    fn sparse_search(
        &self,
        query: &str,
        session_id: Option<&str>,
        persona_id: Option<&str>,
        top_k: usize,
        sparse: &Arc<SparseRetriever>,
    ) -> Vec<ScoredMemory> {
        sparse
            .search(query, top_k, session_id, persona_id, None)
            .into_iter()
            .map(|hit| ScoredMemory {
                record: MemoryRecord {
                    id: hit.id,
                    content: hit.content,
                    metadata: hit.metadata,
                },
                similarity: hit.score,
            })
            .collect()
    }

    /// Rerank in place by `w_sim·sim + w_imp·importance + w_rec·recency`
    /// where recency decays exponentially with hours since last access
    /// (half-life ≈ 24h). The public `similarity` is overwritten with the
    /// blended score.
    fn rerank_by_weighted_score(&self, results: &mut [ScoredMemory], config: &RecallEngineConfig) {
        let now = now_ts();
        for mem in results.iter_mut() {
            let similarity = f64::from(mem.similarity);
            let importance = mem.record.metadata.importance;
            let last_access = if mem.record.metadata.last_access_time > 0.0 {
                mem.record.metadata.last_access_time
            } else {
                now
            };
            let hours_since_access = (now - last_access) / 3600.0;
            let recency = (-RECENCY_LAMBDA * hours_since_access).exp();

            let final_score = similarity * config.similarity_weight
                + importance * config.importance_weight
                + recency * config.recency_weight;
            mem.similarity = final_score as f32;
        }
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.record.id.cmp(&b.record.id))
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SparseRetrieverConfig;
    use crate::memory::MemoryMetadata;
    use crate::provider::Embedder;
    use crate::storage::document_store::DocumentStore;
    use crate::storage::vector_index::VectorIndex;
    use async_trait::async_trait;

    const DIMS: usize = 16;

    struct HashEmbedder;

    #[async_trait]
    impl Embedder for HashEmbedder {
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

    fn scored(id: i64, similarity: f32, importance: f64, last_access: f64) -> ScoredMemory {
        ScoredMemory {
            record: MemoryRecord {
                id,
                content: format!("memory {id}"),
                metadata: MemoryMetadata {
                    importance,
                    last_access_time: last_access,
                    ..Default::default()
                },
            },
            similarity,
        }
    }

    async fn make_engine(dir: &tempfile::TempDir) -> (RecallEngine, Arc<MemoryManager>) {
        let docs = Arc::new(DocumentStore::open(&dir.path().join("lm.db")).unwrap());
        let manager = Arc::new(MemoryManager::new(
            Arc::clone(&docs),
            VectorIndex::new(DIMS).unwrap(),
            Arc::new(HashEmbedder),
            dir.path().join("lm.index"),
        ));
        let sparse = Arc::new(SparseRetriever::new(docs, SparseRetrieverConfig::default()));
        let engine = RecallEngine::new(
            RecallEngineConfig::default(),
            FusionConfig::default(),
            Arc::clone(&manager),
            Some(sparse),
        );
        (engine, manager)
    }

    #[tokio::test]
    async fn test_hybrid_recall_returns_inserted_record() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = make_engine(&dir).await;
        let id = manager.add("user likes jazz", 0.8, "s1", None).await.unwrap();
        manager.add("weather is rainy today", 0.2, "s1", None).await.unwrap();

        let results = engine
            .recall("user likes jazz", Some("s1"), None, Some(3))
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].record.id, id);
    }

    #[tokio::test]
    async fn test_sparse_mode_skips_rerank() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = make_engine(&dir).await;
        manager.add("user plays guitar", 0.9, "s1", None).await.unwrap();

        engine.set_retrieval_mode(RetrievalMode::Sparse);
        let results = engine.recall("guitar", Some("s1"), None, Some(3)).await.unwrap();
        assert_eq!(results.len(), 1);
        // Sparse scores are the min-max normalized BM25 values.
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dense_mode_works_without_sparse() {
        let dir = tempfile::tempdir().unwrap();
        let docs = Arc::new(DocumentStore::open(&dir.path().join("lm.db")).unwrap());
        let manager = Arc::new(MemoryManager::new(
            Arc::clone(&docs),
            VectorIndex::new(DIMS).unwrap(),
            Arc::new(HashEmbedder),
            dir.path().join("lm.index"),
        ));
        // Hybrid configured but no sparse retriever wired: degrade to dense.
        let engine = RecallEngine::new(
            RecallEngineConfig::default(),
            FusionConfig::default(),
            Arc::clone(&manager),
            None,
        );
        manager.add("user likes jazz", 0.8, "s1", None).await.unwrap();

        let results = engine.recall("user likes jazz", None, None, Some(3)).await.unwrap();
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn test_recall_honors_top_k() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = make_engine(&dir).await;
        for i in 0..8 {
            manager
                .add(&format!("jazz fact number {i}"), 0.5, "s1", None)
                .await
                .unwrap();
        }
        let results = engine.recall("jazz fact", Some("s1"), None, Some(3)).await.unwrap();
        assert!(results.len() <= 3);
    }

    #[test]
    fn test_rerank_monotonicity_in_importance() {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (engine, _manager) = rt.block_on(make_engine(&dir));
        let config = engine.config();
        let now = now_ts();

        // Identical except importance; higher importance must not rank lower.
        let mut results = vec![scored(1, 0.5, 0.2, now), scored(2, 0.5, 0.9, now)];
        engine.rerank_by_weighted_score(&mut results, &config);
        assert_eq!(results[0].record.id, 2);

        // Raising importance of the loser flips the order, never the reverse.
        let mut results = vec![scored(1, 0.5, 0.95, now), scored(2, 0.5, 0.9, now)];
        engine.rerank_by_weighted_score(&mut results, &config);
        assert_eq!(results[0].record.id, 1);
    }

    #[test]
    fn test_rerank_prefers_recent_access() {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (engine, _manager) = rt.block_on(make_engine(&dir));
        let config = engine.config();
        let now = now_ts();

        let fresh = scored(1, 0.5, 0.5, now);
        let stale = scored(2, 0.5, 0.5, now - 72.0 * 3600.0);
        let mut results = vec![stale, fresh];
        engine.rerank_by_weighted_score(&mut results, &config);
        assert_eq!(results[0].record.id, 1);
    }

    #[tokio::test]
    async fn test_set_fusion_rejects_bad_param_without_switching() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _manager) = make_engine(&dir).await;

        let err = engine
            .set_fusion(FusionStrategy::Weighted, Some(("rrf_k", "10")))
            .unwrap_err();
        assert!(err.to_string().contains("does not apply"));
        // Strategy unchanged on failed validation.
        assert_eq!(engine.fusion_config().strategy, FusionStrategy::Rrf);

        engine
            .set_fusion(FusionStrategy::Weighted, Some(("dense_weight", "0.6")))
            .unwrap();
        assert_eq!(engine.fusion_config().strategy, FusionStrategy::Weighted);
        assert_eq!(engine.fusion_config().dense_weight, 0.6);
    }
}
