//! Memory manager - the transactional façade over the dense index and the
//! document table.
//!
//! All mutations of [`MemoryRecord`]s go through this type; other components
//! hold read-only results or raw ids. Steps are ordered so the rollbackable
//! store (SQLite) is touched last for adds and first for deletes: the dense
//! index never holds a vector without a committed document row. Cross-store
//! inconsistency that slips past that ordering (commit failure after both
//! stores mutated) is surfaced as a CRITICAL [`MemoryError::StorageConflict`]
//! with a rebuild advisory.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;

use crate::error::{MemoryError, Result};
use crate::memory::{
    EventType, MemoryMetadata, MemoryRecord, MemoryStatus, ScoredMemory, UpdateHistoryEntry,
};
use crate::provider::Embedder;
use crate::storage::document_store::{DocumentRow, DocumentStore, MetadataFilter};
use crate::storage::vector_index::VectorIndex;
use crate::util::now_ts;

/// Query-embedding cache capacity
const QUERY_CACHE_SIZE: usize = 100;

/// Field updates accepted by [`MemoryManager::update`]
#[derive(Debug, Default, Clone)]
pub struct UpdateFields {
    /// New content; triggers re-embedding and a vector swap
    pub content: Option<String>,
    /// New importance in [0, 1]
    pub importance: Option<f64>,
    /// New event classification
    pub event_type: Option<EventType>,
    /// New lifecycle status
    pub status: Option<MemoryStatus>,
}

impl UpdateFields {
    fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.importance.is_none()
            && self.event_type.is_none()
            && self.status.is_none()
    }
}

/// Unified CRUD over dense index + document table
pub struct MemoryManager {
    docs: Arc<DocumentStore>,
    index: Arc<Mutex<VectorIndex>>,
    embedder: Arc<dyn Embedder>,
    index_path: PathBuf,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    index_dirty: AtomicBool,
}

impl MemoryManager {
    /// Wire the manager over an opened document store and vector index.
    pub fn new(
        docs: Arc<DocumentStore>,
        index: VectorIndex,
        embedder: Arc<dyn Embedder>,
        index_path: PathBuf,
    ) -> Self {
        let cache_size = NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero");
        Self {
            docs,
            index: Arc::new(Mutex::new(index)),
            embedder,
            index_path,
            query_cache: Mutex::new(LruCache::new(cache_size)),
            index_dirty: AtomicBool::new(false),
        }
    }

    /// The underlying document store (shared with the sparse retriever).
    pub fn documents(&self) -> Arc<DocumentStore> {
        Arc::clone(&self.docs)
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, VectorIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Embed a query text, serving repeats from the LRU cache.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.query_cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(vector) = cache.get(text) {
                return Ok(vector.clone());
            }
        }
        let vector = self.embedder.embed(text).await?;
        self.query_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Persist the dense index snapshot off the event loop.
    ///
    /// Failure is not fatal: the index is marked dirty and the next
    /// successful save clears the flag.
    pub async fn persist_index(&self) {
        let index = Arc::clone(&self.index);
        let path = self.index_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            index
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .save(&path)
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.index_dirty.store(false, Ordering::SeqCst);
            }
            Ok(Err(e)) => {
                self.index_dirty.store(true, Ordering::SeqCst);
                tracing::warn!("vector index save failed, will retry on next save: {e}");
            }
            Err(e) => {
                self.index_dirty.store(true, Ordering::SeqCst);
                tracing::warn!("vector index save task failed: {e}");
            }
        }
    }

    /// Whether the last index save failed and a retry is pending.
    pub fn index_dirty(&self) -> bool {
        self.index_dirty.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Add a memory with default metadata.
    pub async fn add(
        &self,
        content: &str,
        importance: f64,
        session_id: &str,
        persona_id: Option<&str>,
    ) -> Result<i64> {
        self.add_with_metadata(content, MemoryMetadata::new(importance, session_id, persona_id))
            .await
    }

    /// Add a memory with fully prepared metadata (reflection passes the whole
    /// event payload through here).
    ///
    /// Ordering: embed, then inside one SQL transaction insert the row and
    /// add the vector, then commit. A vector-add failure rolls the row back;
    /// a commit failure removes the just-added vector again.
    pub async fn add_with_metadata(
        &self,
        content: &str,
        metadata: MemoryMetadata,
    ) -> Result<i64> {
        let vector = self.embedder.embed(content).await?;
        let metadata_json = serde_json::to_string(&metadata)?;
        let now = now_ts();

        let id = {
            let mut conn = self.docs.lock();
            let tx = conn.transaction()?;
            let id = DocumentStore::insert_in(&tx, content, &metadata_json, now)?;

            let mut index = self.lock_index();
            index.add(id, &vector)?;

            if let Err(e) = tx.commit() {
                // The vector is in but the row is not; undo to keep the
                // stores joined.
                let _ = index.remove(&[id]);
                return Err(e.into());
            }
            id
        };

        self.persist_index().await;
        tracing::debug!("stored memory {id} ({} chars)", content.len());
        Ok(id)
    }

    /// Update fields of one memory. Returns the names of fields that
    /// actually changed (matching values are a no-op and not reported).
    ///
    /// A content change recomputes the embedding and swaps the vector under
    /// the same id inside the transaction window.
    pub async fn update(
        &self,
        id: i64,
        fields: UpdateFields,
        reason: &str,
    ) -> Result<Vec<String>> {
        if fields.is_empty() {
            return Err(MemoryError::Validation(
                "update requires at least one field".to_string(),
            ));
        }
        if let Some(importance) = fields.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(MemoryError::Validation(format!(
                    "importance {importance} out of range [0, 1]"
                )));
            }
        }

        let row = self.docs.get_by_id(id)?.ok_or(MemoryError::NotFound(id))?;
        let mut metadata: MemoryMetadata = serde_json::from_str(&row.metadata)?;

        let mut changed: Vec<String> = Vec::new();

        let new_content = match &fields.content {
            Some(content) if *content != row.text => Some(content.clone()),
            _ => None,
        };
        // Embed outside the lock; the swap itself happens inside the
        // transaction window below.
        let new_vector = match &new_content {
            Some(content) => Some(self.embedder.embed(content).await?),
            None => None,
        };

        if let Some(importance) = fields.importance {
            if (importance - metadata.importance).abs() > f64::EPSILON {
                metadata.importance = importance;
                changed.push("importance".to_string());
            }
        }
        if let Some(event_type) = fields.event_type {
            if event_type != metadata.event_type {
                metadata.event_type = event_type;
                changed.push("event_type".to_string());
            }
        }
        if let Some(status) = fields.status {
            if status != metadata.status {
                metadata.status = status;
                changed.push("status".to_string());
            }
        }
        if new_content.is_some() {
            changed.push("content".to_string());
        }

        if changed.is_empty() {
            return Ok(changed);
        }

        let now = now_ts();
        metadata.last_updated_time = Some(now);
        metadata.update_history.push(UpdateHistoryEntry {
            timestamp: now,
            reason: if reason.is_empty() {
                "manual update".to_string()
            } else {
                reason.to_string()
            },
            changed_fields: changed.clone(),
        });
        let metadata_json = serde_json::to_string(&metadata)?;

        {
            let mut conn = self.docs.lock();
            let tx = conn.transaction()?;

            if let Some(content) = &new_content {
                DocumentStore::update_text_in(&tx, id, content, now)?;
            }
            DocumentStore::update_metadata_in(&tx, id, &metadata_json, now)?;

            let mut index = self.lock_index();
            let mut vector_swapped = false;
            if let Some(vector) = &new_vector {
                index.add(id, vector)?; // re-add replaces in place
                vector_swapped = true;
            }

            if let Err(e) = tx.commit() {
                if vector_swapped {
                    tracing::error!(
                        "CRITICAL: vector for memory {id} was replaced but the row update failed to commit; \
                         dense index and document table may disagree"
                    );
                    return Err(MemoryError::StorageConflict { ids: vec![id] });
                }
                return Err(e.into());
            }
        }

        if new_vector.is_some() {
            self.persist_index().await;
        }
        tracing::debug!("updated memory {id}: {changed:?} (reason: {reason})");
        Ok(changed)
    }

    /// Delete memories by id. Returns how many rows existed.
    ///
    /// SQL delete runs first (reversible), the dense removal second; a
    /// dense-removal failure rolls the SQL back. A commit failure after both
    /// stores mutated is the unrecoverable corner: logged CRITICAL with the
    /// id set, rebuild advised.
    pub async fn delete(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let deleted = {
            let mut conn = self.docs.lock();
            let tx = conn.transaction()?;
            let deleted = DocumentStore::delete_in(&tx, ids)?;

            let mut index = self.lock_index();
            index.remove(ids)?;

            if let Err(e) = tx.commit() {
                tracing::error!(
                    "CRITICAL: dense vectors removed but SQL delete failed to commit for ids {ids:?}; \
                     run a rebuild to restore consistency ({e})"
                );
                return Err(MemoryError::StorageConflict { ids: ids.to_vec() });
            }
            deleted
        };

        self.persist_index().await;
        tracing::info!("deleted {deleted} memories");
        Ok(deleted)
    }

    /// Dense similarity search with metadata filtering.
    ///
    /// Fetches `2k` candidates for filtering headroom, truncates to `k`, and
    /// batches a `last_access_time` update for the returned ids off the
    /// caller's path.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        session_id: Option<&str>,
        persona_id: Option<&str>,
    ) -> Result<Vec<ScoredMemory>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embed_query(query).await?;

        let fetch_k = k * 2;
        let index = Arc::clone(&self.index);
        let hits = tokio::task::spawn_blocking(move || {
            index
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .search(&vector, fetch_k)
        })
        .await
        .map_err(|e| MemoryError::External(format!("search task failed: {e}")))??;

        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        let rows = self.docs.get_by_ids(&ids)?;
        let by_id: std::collections::HashMap<i64, DocumentRow> =
            rows.into_iter().map(|row| (row.id, row)).collect();

        let mut results = Vec::with_capacity(k);
        for (id, similarity) in hits {
            let Some(row) = by_id.get(&id) else {
                // Dense hit without a row: the stores disagree for this id.
                tracing::warn!("dense index returned id {id} with no document row");
                continue;
            };
            let Some(metadata) = MemoryMetadata::parse_lenient(&row.metadata) else {
                continue;
            };
            if let Some(sid) = session_id {
                if metadata.session_id.as_deref() != Some(sid) {
                    continue;
                }
            }
            if let Some(pid) = persona_id {
                if metadata.persona_id.as_deref() != Some(pid) {
                    continue;
                }
            }
            results.push(ScoredMemory {
                record: MemoryRecord {
                    id,
                    content: row.text.clone(),
                    metadata,
                },
                similarity,
            });
            if results.len() == k {
                break;
            }
        }

        if !results.is_empty() {
            let accessed: Vec<i64> = results.iter().map(|m| m.record.id).collect();
            let docs = Arc::clone(&self.docs);
            tokio::spawn(async move {
                if let Err(e) = Self::touch_access_time(&docs, &accessed, now_ts()) {
                    tracing::warn!("failed to update access times: {e}");
                }
            });
        }

        Ok(results)
    }

    /// Batch-update `last_access_time` for a set of ids in one statement.
    pub(crate) fn touch_access_time(
        docs: &DocumentStore,
        ids: &[i64],
        now: f64,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = docs.lock();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "UPDATE documents SET metadata = json_set(metadata, '$.last_access_time', ?)
             WHERE id IN ({placeholders})"
        );
        let mut values: Vec<rusqlite::types::Value> = vec![rusqlite::types::Value::Real(now)];
        values.extend(ids.iter().map(|&id| rusqlite::types::Value::Integer(id)));
        let updated = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(updated)
    }

    /// Public form of the access-time batch update.
    pub fn update_memory_access_time(&self, ids: &[i64]) -> Result<usize> {
        Self::touch_access_time(&self.docs, ids, now_ts())
    }

    /// Batch metadata rewrite inside one transaction (the forgetting agent's
    /// flush path). Rows whose metadata fails to serialize are skipped by the
    /// caller; this layer is a plain executemany.
    pub fn update_metadata_batch(&self, updates: &[(i64, String)]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let now = now_ts();
        let mut conn = self.docs.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE documents SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            )?;
            for (id, metadata_json) in updates {
                stmt.execute(rusqlite::params![metadata_json, now, id])?;
            }
        }
        tx.commit()?;
        Ok(updates.len())
    }

    /// Fetch one record.
    pub fn get(&self, id: i64) -> Result<Option<MemoryRecord>> {
        let Some(row) = self.docs.get_by_id(id)? else {
            return Ok(None);
        };
        let metadata: MemoryMetadata = serde_json::from_str(&row.metadata)?;
        Ok(Some(MemoryRecord {
            id: row.id,
            content: row.text,
            metadata,
        }))
    }

    /// Stable id-ordered pagination. Rows with unparseable metadata are
    /// skipped with a warning rather than failing the page.
    pub fn paginate(&self, page_size: usize, offset: usize) -> Result<Vec<MemoryRecord>> {
        let rows = self
            .docs
            .get_paginated(page_size, offset, &MetadataFilter::any())?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let metadata = MemoryMetadata::parse_lenient(&row.metadata).or_else(|| {
                    tracing::warn!("skipping memory {} with unparseable metadata", row.id);
                    None
                })?;
                Some(MemoryRecord {
                    id: row.id,
                    content: row.text,
                    metadata,
                })
            })
            .collect())
    }

    /// Total number of memories.
    pub fn count(&self) -> Result<i64> {
        self.docs.count(&MetadataFilter::any())
    }

    /// Memory counts per lifecycle status.
    pub fn count_by_status(&self) -> Result<std::collections::HashMap<String, i64>> {
        self.docs.count_by_status()
    }

    /// Delete every memory. Returns the number removed.
    pub async fn wipe_all(&self) -> Result<usize> {
        let ids = self.docs.all_ids()?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.delete(&ids).await
    }

    /// Rebuild the FTS mirror from the document table.
    pub fn rebuild_sparse_index(&self) -> Result<usize> {
        self.docs.rebuild_fts()
    }

    /// Number of vectors currently in the dense index.
    pub fn index_len(&self) -> usize {
        self.lock_index().len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    const DIMS: usize = 16;

    /// Deterministic bag-of-words embedder: stable across calls, similar
    /// texts land near each other.
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

    fn make_manager() -> (MemoryManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let docs = Arc::new(DocumentStore::open(&dir.path().join("livingmemory.db")).unwrap());
        let index = VectorIndex::new(DIMS).unwrap();
        let manager = MemoryManager::new(
            docs,
            index,
            Arc::new(HashEmbedder),
            dir.path().join("livingmemory.index"),
        );
        (manager, dir)
    }

    #[tokio::test]
    async fn test_add_then_get_roundtrip() {
        let (manager, _dir) = make_manager();
        let id = manager.add("user likes jazz", 0.8, "s1", None).await.unwrap();

        let record = manager.get(id).unwrap().unwrap();
        assert_eq!(record.content, "user likes jazz");
        assert_eq!(record.metadata.importance, 0.8);
        assert_eq!(record.metadata.session_id.as_deref(), Some("s1"));
        assert_eq!(manager.index_len(), 1);
        assert_eq!(manager.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_finds_own_content_and_touches_access_time() {
        let (manager, _dir) = make_manager();
        let start = now_ts();
        let id = manager.add("user likes jazz", 0.8, "s1", None).await.unwrap();
        manager.add("the weather is rainy", 0.3, "s1", None).await.unwrap();

        let results = manager.search("user likes jazz", 3, Some("s1"), None).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].record.id, id);

        // The access-time update is spawned; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let record = manager.get(id).unwrap().unwrap();
        assert!(record.metadata.last_access_time >= start);
    }

    #[tokio::test]
    async fn test_session_filter_excludes_other_sessions() {
        let (manager, _dir) = make_manager();
        manager.add("likes tea", 0.5, "s1", None).await.unwrap();
        manager.add("likes coffee", 0.5, "s2", None).await.unwrap();

        let results = manager.search("likes", 5, Some("s2"), None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.content, "likes coffee");
    }

    #[tokio::test]
    async fn test_update_content_swaps_vector_and_logs_history() {
        let (manager, _dir) = make_manager();
        let id = manager.add("user works at Acme", 0.5, "s1", None).await.unwrap();

        let changed = manager
            .update(
                id,
                UpdateFields {
                    content: Some("user works at Globex".to_string()),
                    ..Default::default()
                },
                "correction",
            )
            .await
            .unwrap();
        assert_eq!(changed, vec!["content".to_string()]);

        let record = manager.get(id).unwrap().unwrap();
        assert_eq!(record.content, "user works at Globex");
        assert_eq!(record.metadata.update_history.len(), 1);
        assert_eq!(record.metadata.update_history[0].changed_fields, vec!["content"]);
        assert_eq!(record.metadata.update_history[0].reason, "correction");

        let results = manager.search("user works at Globex", 1, None, None).await.unwrap();
        assert_eq!(results[0].record.id, id);
    }

    #[tokio::test]
    async fn test_update_with_equal_values_is_noop() {
        let (manager, _dir) = make_manager();
        let id = manager.add("fact", 0.5, "s1", None).await.unwrap();

        let changed = manager
            .update(
                id,
                UpdateFields {
                    importance: Some(0.5),
                    ..Default::default()
                },
                "no-op",
            )
            .await
            .unwrap();
        assert!(changed.is_empty());
        assert!(manager.get(id).unwrap().unwrap().metadata.update_history.is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found() {
        let (manager, _dir) = make_manager();
        let err = manager
            .update(
                999,
                UpdateFields {
                    importance: Some(0.9),
                    ..Default::default()
                },
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(999)));
    }

    #[tokio::test]
    async fn test_delete_removes_from_both_stores() {
        let (manager, _dir) = make_manager();
        let a = manager.add("alpha memory", 0.5, "s1", None).await.unwrap();
        let b = manager.add("beta memory", 0.5, "s1", None).await.unwrap();

        let deleted = manager.delete(&[a]).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(manager.count().unwrap(), 1);
        assert_eq!(manager.index_len(), 1);

        let results = manager.search("alpha memory", 5, None, None).await.unwrap();
        assert!(results.iter().all(|m| m.record.id != a));
        assert!(results.iter().any(|m| m.record.id == b) || results.is_empty());
    }

    #[tokio::test]
    async fn test_wipe_all_and_counts() {
        let (manager, _dir) = make_manager();
        for i in 0..4 {
            manager.add(&format!("memory {i}"), 0.5, "s1", None).await.unwrap();
        }
        assert_eq!(manager.wipe_all().await.unwrap(), 4);
        assert_eq!(manager.count().unwrap(), 0);
        assert_eq!(manager.index_len(), 0);
    }

    #[tokio::test]
    async fn test_paginate_stable_order() {
        let (manager, _dir) = make_manager();
        for i in 0..5 {
            manager.add(&format!("memory {i}"), 0.5, "s1", None).await.unwrap();
        }
        let page = manager.paginate(2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].id < page[1].id);
    }
}
