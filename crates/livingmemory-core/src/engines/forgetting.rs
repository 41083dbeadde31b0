//! Forgetting agent - periodic importance decay and pruning.
//!
//! A background loop wakes every `check_interval_hours` and runs one
//! paginated prune pass: linear importance decay on every record, then
//! deletion of records that are both past retention and below the importance
//! threshold. Manual triggers and the periodic loop serialize on one
//! operation lock; a second manual trigger while a run is in flight gets an
//! immediate busy response instead of a concurrent run.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::ForgettingAgentConfig;
use crate::error::{MemoryError, Result};
use crate::storage::memory_manager::MemoryManager;
use crate::util::now_ts;

/// Deletions run in sub-batches of this size.
const DELETE_BATCH_SIZE: usize = 100;

/// Outcome of one prune pass
#[derive(Debug, Clone, Default)]
pub struct PruneStats {
    /// Records scanned
    pub processed: usize,
    /// Records whose importance decayed
    pub decayed: usize,
    /// Records deleted
    pub deleted: usize,
    /// Records remaining after the pass
    pub remaining: i64,
}

/// Background decay-and-prune loop
pub struct ForgettingAgent {
    config: ForgettingAgentConfig,
    memory: Arc<MemoryManager>,
    operation_lock: Arc<tokio::sync::Mutex<()>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ForgettingAgent {
    /// Wire the agent. Call [`start`](Self::start) to launch the loop.
    pub fn new(config: ForgettingAgentConfig, memory: Arc<MemoryManager>) -> Self {
        tracing::info!(
            "forgetting agent configured: enabled={}, interval={}h, retention={}d, decay={}/day, threshold={}",
            config.enabled,
            config.check_interval_hours,
            config.retention_days,
            config.importance_decay_rate,
            config.importance_threshold,
        );
        Self {
            config,
            memory,
            operation_lock: Arc::new(tokio::sync::Mutex::new(())),
            task: Mutex::new(None),
        }
    }

    /// Launch the periodic loop. No-op when disabled or already running.
    pub fn start(&self) {
        if !self.config.enabled {
            tracing::info!("forgetting agent disabled, background loop not started");
            return;
        }
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let config = self.config.clone();
        let memory = Arc::clone(&self.memory);
        let lock = Arc::clone(&self.operation_lock);
        let interval = Duration::from_secs(u64::from(config.check_interval_hours) * 3600);

        *slot = Some(tokio::spawn(async move {
            tracing::info!(
                "forgetting agent loop started, running every {}h",
                config.check_interval_hours
            );
            loop {
                tokio::time::sleep(interval).await;
                let failed = {
                    let _guard = lock.lock().await;
                    tracing::info!("periodic memory prune starting");
                    match prune(&memory, &config).await {
                        Ok(stats) => {
                            tracing::info!(
                                "periodic prune done: {} processed, {} decayed, {} deleted, {} remaining",
                                stats.processed,
                                stats.decayed,
                                stats.deleted,
                                stats.remaining,
                            );
                            false
                        }
                        Err(e) => {
                            tracing::error!("periodic prune failed: {e}; backing off 60s");
                            true
                        }
                    }
                };
                if failed {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        }));
    }

    /// Stop the loop. Cancellation lands at a sleep or suspension point and
    /// leaves persistent state consistent.
    pub fn stop(&self) {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
            tracing::info!("forgetting agent loop stopped");
        }
    }

    /// Manually trigger one prune pass.
    ///
    /// Returns [`MemoryError::Busy`] immediately when a run (manual or
    /// periodic) is already holding the operation lock.
    pub async fn trigger_manual_run(&self) -> Result<PruneStats> {
        let Ok(_guard) = self.operation_lock.try_lock() else {
            return Err(MemoryError::Busy(
                "forgetting run already in progress".to_string(),
            ));
        };
        tracing::info!("manual memory prune starting");
        prune(&self.memory, &self.config).await
    }
}

/// One paginated decay-and-prune pass.
///
/// Decay is linear in record age: `new = max(0, importance - days · rate)`.
/// A record is deleted when it is older than `retention_days` AND its
/// decayed importance is below `importance_threshold`. Metadata updates are
/// flushed every `2 · page_size` records; deletions run after the scan in
/// sub-batches.
pub async fn prune(memory: &MemoryManager, config: &ForgettingAgentConfig) -> Result<PruneStats> {
    let total = memory.count()?;
    let mut stats = PruneStats::default();
    if total == 0 {
        tracing::info!("no memories stored, nothing to prune");
        return Ok(stats);
    }

    let now = now_ts();
    let page_size = config.forgetting_batch_size;
    let retention_seconds = f64::from(config.retention_days) * 86_400.0;
    let flush_threshold = page_size * 2;

    let mut pending_updates: Vec<(i64, String)> = Vec::new();
    let mut ids_to_delete: Vec<i64> = Vec::new();

    let mut offset = 0usize;
    while (offset as i64) < total {
        let batch = memory.paginate(page_size, offset)?;
        if batch.is_empty() {
            break;
        }

        for mut record in batch {
            stats.processed += 1;

            let create_time = if record.metadata.create_time > 0.0 {
                record.metadata.create_time
            } else {
                now
            };
            let age_seconds = now - create_time;
            let age_days = age_seconds / 86_400.0;

            let original = record.metadata.importance;
            let decayed = (original - age_days * config.importance_decay_rate).max(0.0);

            if decayed < original {
                stats.decayed += 1;
                record.metadata.importance = decayed;
                match serde_json::to_string(&record.metadata) {
                    Ok(json) => pending_updates.push((record.id, json)),
                    Err(e) => {
                        tracing::warn!("skipping metadata update for {}: {e}", record.id)
                    }
                }
            }

            if age_seconds > retention_seconds && decayed < config.importance_threshold {
                tracing::debug!(
                    "marking memory {} for deletion (age {age_days:.1}d, importance {decayed:.3})",
                    record.id
                );
                ids_to_delete.push(record.id);
            }
        }

        if pending_updates.len() >= flush_threshold {
            tracing::debug!("flushing {} metadata updates", pending_updates.len());
            memory.update_metadata_batch(&pending_updates)?;
            pending_updates.clear();
        }

        offset += page_size;
        tracing::debug!("prune progress: {}/{total}", stats.processed);

        // Yield between pages so long scans do not monopolize the loop.
        tokio::task::yield_now().await;
    }

    if !pending_updates.is_empty() {
        memory.update_metadata_batch(&pending_updates)?;
    }

    for chunk in ids_to_delete.chunks(DELETE_BATCH_SIZE) {
        match memory.delete(chunk).await {
            Ok(n) => stats.deleted += n,
            Err(e) => tracing::error!("prune delete batch failed: {e}"),
        }
    }

    stats.remaining = memory.count()?;
    Ok(stats)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::memory::MemoryMetadata;
    use crate::provider::Embedder;
    use crate::storage::document_store::DocumentStore;
    use crate::storage::vector_index::VectorIndex;
    use async_trait::async_trait;

    const DIMS: usize = 8;

    struct HashEmbedder;

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn dimensions(&self) -> usize {
            DIMS
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; DIMS];
            for (i, b) in text.bytes().enumerate() {
                v[(i + b as usize) % DIMS] += 1.0;
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
            Ok(v.into_iter().map(|x| x / norm).collect())
        }
    }

    fn manager(dir: &tempfile::TempDir) -> Arc<MemoryManager> {
        let docs = Arc::new(DocumentStore::open(&dir.path().join("lm.db")).unwrap());
        Arc::new(MemoryManager::new(
            docs,
            VectorIndex::new(DIMS).unwrap(),
            Arc::new(HashEmbedder),
            dir.path().join("lm.index"),
        ))
    }

    async fn seed(memory: &MemoryManager, content: &str, importance: f64, age_days: f64) -> i64 {
        let mut metadata = MemoryMetadata::new(importance, "s1", None);
        metadata.create_time = now_ts() - age_days * 86_400.0;
        metadata.last_access_time = metadata.create_time;
        memory.add_with_metadata(content, metadata).await.unwrap()
    }

    fn config() -> ForgettingAgentConfig {
        ForgettingAgentConfig {
            enabled: true,
            check_interval_hours: 24,
            retention_days: 90,
            importance_decay_rate: 0.01,
            importance_threshold: 0.1,
            forgetting_batch_size: 100,
        }
    }

    #[tokio::test]
    async fn test_decay_never_increases_importance() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        for i in 0..10 {
            seed(&memory, &format!("memory {i}"), 0.1 * i as f64, 10.0).await;
        }
        let before: std::collections::HashMap<i64, f64> = memory
            .paginate(100, 0)
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.metadata.importance))
            .collect();

        prune(&memory, &config()).await.unwrap();

        for record in memory.paginate(100, 0).unwrap() {
            assert!(record.metadata.importance <= before[&record.id]);
            assert!(record.metadata.importance >= 0.0);
        }
    }

    #[tokio::test]
    async fn test_old_unimportant_records_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        // 100 days old, importance 0.5: decays by 1.0 to 0 => deleted.
        let doomed = seed(&memory, "doomed memory", 0.5, 100.0).await;
        // 100 days old but too important to decay under the threshold.
        let survivor_important = seed(&memory, "important memory", 1.0, 5.0).await;
        // Low importance but young: age gate protects it.
        let survivor_young = seed(&memory, "young memory", 0.05, 1.0).await;

        let stats = prune(&memory, &config()).await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.remaining, 2);

        assert!(memory.get(doomed).unwrap().is_none());
        assert!(memory.get(survivor_important).unwrap().is_some());
        assert!(memory.get(survivor_young).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_decay_threshold_properties_over_seeded_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        // Importances spread over [0, 1), all 100 days old.
        for i in 0..20 {
            seed(&memory, &format!("memory {i}"), i as f64 / 20.0, 100.0).await;
        }

        // Decay of 0.2 over 100 days splits the corpus: survivors are
        // exactly the records whose decayed importance stayed at or above
        // the threshold.
        let cfg = ForgettingAgentConfig {
            importance_decay_rate: 0.002,
            ..config()
        };
        let stats = prune(&memory, &cfg).await.unwrap();

        let survivors = memory.paginate(100, 0).unwrap();
        assert!(!survivors.is_empty());
        assert!(stats.deleted > 0);
        for record in survivors {
            assert!(record.metadata.importance >= cfg.importance_threshold);
        }
        assert_eq!(stats.remaining + stats.deleted as i64, 20);
        assert_eq!(memory.count().unwrap(), stats.remaining);
    }

    #[tokio::test]
    async fn test_fresh_records_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        let id = memory.add("fresh memory", 0.8, "s1", None).await.unwrap();

        let stats = prune(&memory, &config()).await.unwrap();
        assert_eq!(stats.deleted, 0);

        let record = memory.get(id).unwrap().unwrap();
        // Sub-day age decays by less than the decay rate.
        assert!(record.metadata.importance > 0.79);
    }

    #[tokio::test]
    async fn test_manual_trigger_busy_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        let agent = Arc::new(ForgettingAgent::new(config(), memory));

        // Hold the operation lock to simulate run A in flight.
        let guard = agent.operation_lock.clone().lock_owned().await;

        let err = agent.trigger_manual_run().await.unwrap_err();
        assert!(matches!(err, MemoryError::Busy(_)));

        drop(guard);
        // Run C succeeds once A released the lock.
        let stats = agent.trigger_manual_run().await.unwrap();
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test]
    async fn test_disabled_agent_does_not_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let memory = manager(&dir);
        let agent = ForgettingAgent::new(
            ForgettingAgentConfig {
                enabled: false,
                ..config()
            },
            memory,
        );
        agent.start();
        assert!(agent.task.lock().unwrap().is_none());
        agent.stop();
    }
}
