//! Plugin host - wires the engines together and exposes the two ingress
//! surfaces: the pre/post LLM hooks and the admin operation set.
//!
//! Initialization is deferred: the host is constructed with a validated
//! config, but the component graph is only built when the runtime signals
//! readiness by calling [`LivingMemory::initialize`] with its capabilities.
//! Hooks wait on the initialized gate with a timeout and degrade to no-ops
//! when it expires, so a slow startup never fails a live turn.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{LivingMemoryConfig, RetrievalMode};
use crate::engines::forgetting::ForgettingAgent;
use crate::engines::recall::RecallEngine;
use crate::engines::reflection::ReflectionEngine;
use crate::error::{MemoryError, Result};
use crate::memory::{EventType, MemoryStatus};
use crate::provider::{Chatter, Embedder};
use crate::retrieval::fusion::{FusionParam, FusionStrategy};
use crate::retrieval::sparse::SparseRetriever;
use crate::session::SessionManager;
use crate::storage::document_store::DocumentStore;
use crate::storage::memory_manager::{MemoryManager, UpdateFields};
use crate::storage::vector_index::VectorIndex;
use crate::util::{format_memories_for_injection, now_in_tz, retry_on_failure};

/// Relational store file inside the data dir
pub const DB_FILE_NAME: &str = "livingmemory.db";

/// Vector index snapshot inside the data dir
pub const INDEX_FILE_NAME: &str = "livingmemory.index";

/// How long hooks wait for initialization before no-opping
const HOOK_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall-clock budget for recall inside the pre-LLM hook; past it the turn
/// proceeds without memory injection
const RECALL_BUDGET: Duration = Duration::from_secs(10);

// ============================================================================
// HOOK / ADMIN TYPES
// ============================================================================

/// The outgoing LLM request as seen by the pre-LLM hook. The hook prepends
/// recalled memories to `system_prompt` in place.
#[derive(Debug, Clone)]
pub struct LlmRequestContext {
    /// Conversation session id
    pub session_id: String,
    /// Active persona, if any
    pub persona_id: Option<String>,
    /// The user's outgoing prompt
    pub prompt: String,
    /// System prompt, mutated by memory injection
    pub system_prompt: String,
}

/// Structured envelope returned by every admin operation
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdminResponse {
    /// Whether the operation succeeded
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
    /// Structured payload, when the operation yields one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl AdminResponse {
    /// Success with a message only.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    /// Success with a payload.
    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Failure with a message.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

impl From<MemoryError> for AdminResponse {
    fn from(e: MemoryError) -> Self {
        AdminResponse::fail(e.to_string())
    }
}

struct Engines {
    memory: Arc<MemoryManager>,
    recall: Arc<RecallEngine>,
    reflection: Arc<ReflectionEngine>,
    forgetting: Arc<ForgettingAgent>,
}

// ============================================================================
// HOST
// ============================================================================

/// The assembled memory plugin
pub struct LivingMemory {
    config: RwLock<LivingMemoryConfig>,
    data_dir: PathBuf,
    sessions: SessionManager,
    engines: OnceLock<Engines>,
    init_tx: watch::Sender<bool>,
    reflection_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LivingMemory {
    /// Validate the config and prepare the host. Components are not built
    /// until [`initialize`](Self::initialize).
    pub fn new(config: LivingMemoryConfig, data_dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let sessions = SessionManager::new(config.session_manager.clone());
        let (init_tx, _) = watch::channel(false);

        Ok(Self {
            config: RwLock::new(config),
            data_dir,
            sessions,
            engines: OnceLock::new(),
            init_tx,
            reflection_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> LivingMemoryConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn config_mut(&self) -> std::sync::RwLockWriteGuard<'_, LivingMemoryConfig> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the component graph once the runtime's capabilities exist.
    ///
    /// Opens the document store and the vector index snapshot as a pair; a
    /// corrupt snapshot fails initialization, while a count mismatch between
    /// the two files is recoverable and logged with a rebuild advisory.
    pub async fn initialize(
        &self,
        embedder: Arc<dyn Embedder>,
        chatter: Arc<dyn Chatter>,
    ) -> Result<()> {
        if self.engines.get().is_some() {
            return Ok(());
        }
        tracing::info!("initializing memory engine in {:?}", self.data_dir);
        let config = self.config();

        let docs = Arc::new(DocumentStore::open(&self.data_dir.join(DB_FILE_NAME))?);
        let index_path = self.data_dir.join(INDEX_FILE_NAME);
        let index = if index_path.exists() {
            VectorIndex::load(&index_path, embedder.dimensions())?
        } else {
            VectorIndex::new(embedder.dimensions())?
        };

        let row_count = docs.count(&crate::storage::document_store::MetadataFilter::any())?;
        if index.len() as i64 != row_count {
            tracing::warn!(
                "vector index holds {} vectors but the document table has {row_count} rows; \
                 the files are from different generations - run a rebuild to reconcile",
                index.len()
            );
        }

        let memory = Arc::new(MemoryManager::new(
            Arc::clone(&docs),
            index,
            embedder,
            index_path,
        ));

        let sparse = if config.sparse_retriever.enabled {
            Some(Arc::new(SparseRetriever::new(
                docs,
                config.sparse_retriever.clone(),
            )))
        } else {
            tracing::info!("sparse retriever disabled");
            None
        };

        let recall = Arc::new(RecallEngine::new(
            config.recall_engine.clone(),
            config.fusion.clone(),
            Arc::clone(&memory),
            sparse,
        ));
        let reflection = Arc::new(ReflectionEngine::new(
            config.reflection_engine.clone(),
            chatter,
            Arc::clone(&memory),
        ));
        let forgetting = Arc::new(ForgettingAgent::new(
            config.forgetting_agent.clone(),
            Arc::clone(&memory),
        ));
        forgetting.start();

        let engines = Engines {
            memory,
            recall,
            reflection,
            forgetting,
        };
        if let Err(lost) = self.engines.set(engines) {
            // A concurrent initialize won the race; tear down the loser's
            // background loop before discarding it.
            lost.forgetting.stop();
            return Ok(());
        }
        let _ = self.init_tx.send(true);
        tracing::info!("memory engine initialized");
        Ok(())
    }

    /// Wait for initialization with a timeout. Returns readiness.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.init_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    fn engines(&self) -> Option<&Engines> {
        self.engines.get()
    }

    fn require_engines(&self) -> std::result::Result<&Engines, AdminResponse> {
        self.engines()
            .ok_or_else(|| AdminResponse::fail("memory engine is not initialized yet"))
    }

    /// The session manager (exposed for host runtimes that surface session
    /// statistics).
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Pre-LLM hook: recall relevant memories, inject them ahead of the
    /// system prompt, and append the user turn to session history.
    ///
    /// Recall retries once with 0.5s backoff; on failure the turn proceeds
    /// without injection.
    pub async fn on_llm_request(&self, request: &mut LlmRequestContext) {
        if !self.wait_ready(HOOK_INIT_TIMEOUT).await {
            tracing::warn!("initialization gate timed out, skipping memory recall");
            return;
        }
        let Some(engines) = self.engines() else { return };
        let config = self.config();

        let session_filter = config
            .filtering_settings
            .use_session_filtering
            .then(|| request.session_id.clone());
        let persona_filter = if config.filtering_settings.use_persona_filtering {
            request.persona_id.clone()
        } else {
            None
        };

        let recalled = tokio::time::timeout(
            RECALL_BUDGET,
            retry_on_failure("memory recall", 1, 0.5, || {
                engines.recall.recall(
                    &request.prompt,
                    session_filter.as_deref(),
                    persona_filter.as_deref(),
                    None,
                )
            }),
        )
        .await
        .unwrap_or_else(|_| {
            Err(MemoryError::External(
                "recall exceeded its wall-clock budget".to_string(),
            ))
        });

        match recalled {
            Ok(memories) if !memories.is_empty() => {
                let block = format_memories_for_injection(&memories);
                request.system_prompt = format!("{block}\n{}", request.system_prompt);
                tracing::info!(
                    "[{}] injected {} memories into the system prompt",
                    request.session_id,
                    memories.len()
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    "[{}] recall failed, continuing without memory injection: {e}",
                    request.session_id
                );
            }
        }

        self.sessions.append_user_turn(&request.session_id, &request.prompt);
    }

    /// Post-LLM hook: append the assistant turn, bump the round counter,
    /// and fire a reflection task when the trigger threshold is reached.
    ///
    /// The history is snapshotted and the counter reset *before* the task
    /// launches; a failed reflection loses that window's history rather than
    /// blocking the live conversation.
    pub async fn on_llm_response(
        &self,
        session_id: &str,
        persona_id: Option<&str>,
        persona_prompt: Option<&str>,
        completion: &str,
    ) {
        if !self.wait_ready(HOOK_INIT_TIMEOUT).await {
            tracing::warn!("initialization gate timed out, skipping reflection bookkeeping");
            return;
        }
        let Some(engines) = self.engines() else { return };

        let rounds = self.sessions.append_assistant_turn(session_id, completion);
        let trigger = self.config().reflection_engine.summary_trigger_rounds;
        tracing::debug!("[{session_id}] round {rounds}/{trigger}");
        if rounds < trigger {
            return;
        }

        tracing::info!("[{session_id}] {trigger} rounds reached, launching reflection");
        let history = self.sessions.snapshot_history(session_id);
        self.sessions.reset(session_id);

        let reflection = Arc::clone(&engines.reflection);
        let session_id = session_id.to_string();
        let persona_id = persona_id.map(str::to_string);
        let persona_prompt = persona_prompt.map(str::to_string);

        let handle = tokio::spawn(async move {
            let result = retry_on_failure("reflection", 2, 1.0, || {
                reflection.reflect_and_store(
                    &history,
                    &session_id,
                    persona_id.as_deref(),
                    persona_prompt.as_deref(),
                )
            })
            .await;
            if let Err(e) = result {
                tracing::error!("[{session_id}] reflection task ultimately failed: {e}");
            }
        });

        let mut tasks = self
            .reflection_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    // ------------------------------------------------------------------
    // Admin operations
    // ------------------------------------------------------------------

    /// Memory-store status: counts, live sessions, active modes.
    pub fn status(&self) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        let config = self.config();

        let total = match engines.memory.count() {
            Ok(n) => n,
            Err(e) => return e.into(),
        };
        let by_status = engines.memory.count_by_status().unwrap_or_default();
        let data = json!({
            "total_memories": total,
            "by_status": by_status,
            "indexed_vectors": engines.memory.index_len(),
            "live_sessions": self.sessions.session_count(),
            "retrieval_mode": engines.recall.config().retrieval_mode.as_str(),
            "fusion_strategy": engines.recall.fusion_config().strategy.as_str(),
            "local_time": now_in_tz(&config.timezone_settings.timezone).to_rfc3339(),
        });
        AdminResponse::ok_with(format!("{total} memories stored"), data)
    }

    /// Reranked search, as the recall path would see it.
    pub async fn search_memories(&self, query: &str, k: usize) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        match engines.recall.recall(query, None, None, Some(k)).await {
            Ok(memories) => {
                let data: Vec<Value> = memories
                    .iter()
                    .map(|m| {
                        json!({
                            "id": m.record.id,
                            "similarity": m.similarity,
                            "content": m.record.content,
                            "importance": m.record.metadata.importance,
                            "event_type": m.record.metadata.event_type.as_str(),
                            "status": m.record.metadata.status.as_str(),
                        })
                    })
                    .collect();
                AdminResponse::ok_with(
                    format!("found {} memories", memories.len()),
                    Value::Array(data),
                )
            }
            Err(e) => e.into(),
        }
    }

    /// Delete one memory by id.
    pub async fn delete_memory(&self, id: i64) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        match engines.memory.delete(&[id]).await {
            Ok(0) => AdminResponse::fail(format!("memory {id} not found")),
            Ok(_) => AdminResponse::ok(format!("memory {id} deleted")),
            Err(e) => e.into(),
        }
    }

    /// Delete every memory. Returns the count removed.
    pub async fn wipe_all(&self) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        match engines.memory.wipe_all().await {
            Ok(n) => AdminResponse::ok_with(format!("deleted {n} memories"), json!({ "deleted": n })),
            Err(e) => e.into(),
        }
    }

    /// Rebuild the FTS mirror from the document table.
    pub fn rebuild_sparse_index(&self) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        match engines.memory.rebuild_sparse_index() {
            Ok(n) => AdminResponse::ok(format!("sparse index rebuilt over {n} documents")),
            Err(e) => e.into(),
        }
    }

    /// Switch the retrieval mode.
    pub fn set_search_mode(&self, mode: &str) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        let Some(parsed) = RetrievalMode::parse_name(mode) else {
            return AdminResponse::fail(format!(
                "unknown retrieval mode {mode:?}; expected hybrid, dense, or sparse"
            ));
        };
        engines.recall.set_retrieval_mode(parsed);
        self.config_mut().recall_engine.retrieval_mode = parsed;
        AdminResponse::ok(format!("retrieval mode set to {}", parsed.as_str()))
    }

    /// Current fusion configuration, with the parameters each strategy
    /// accepts.
    pub fn fusion_show(&self) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        let config = engines.recall.fusion_config();
        let accepted: Vec<&str> = FusionParam::allowed_for(config.strategy)
            .iter()
            .map(|p| p.as_str())
            .collect();
        let data = json!({
            "strategy": config.strategy.as_str(),
            "accepted_params": accepted,
            "config": serde_json::to_value(&config).unwrap_or(Value::Null),
            "strategies": FusionStrategy::ALL.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        });
        AdminResponse::ok_with(
            format!("current fusion strategy: {}", config.strategy.as_str()),
            data,
        )
    }

    /// Switch the fusion strategy and/or tune one `key=value` parameter.
    /// Validation (whitelist, ranges, weight-sum rule) happens before any
    /// change is applied.
    pub fn set_fusion(&self, strategy: &str, param: Option<&str>) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        let Some(parsed) = FusionStrategy::parse_name(strategy) else {
            let known: Vec<&str> = FusionStrategy::ALL.iter().map(|s| s.as_str()).collect();
            return AdminResponse::fail(format!(
                "unknown fusion strategy {strategy:?}; expected one of: {}",
                known.join(", ")
            ));
        };

        let kv = match param {
            Some(raw) => match raw.split_once('=') {
                Some((key, value)) => Some((key.trim(), value.trim())),
                None => {
                    return AdminResponse::fail(format!(
                        "malformed parameter {raw:?}; expected key=value"
                    ))
                }
            },
            None => None,
        };

        let old = engines.recall.fusion_config().strategy;
        match engines.recall.set_fusion(parsed, kv) {
            Ok(()) => {
                self.config_mut().fusion = engines.recall.fusion_config();
                let suffix = kv
                    .map(|(k, v)| format!(" ({k}={v})"))
                    .unwrap_or_default();
                AdminResponse::ok(format!(
                    "fusion strategy changed from {old} to {parsed}{suffix}"
                ))
            }
            Err(e) => e.into(),
        }
    }

    /// Edit one field of a memory. `field` is one of content, importance,
    /// type, status.
    pub async fn edit_memory(
        &self,
        id: i64,
        field: &str,
        value: &str,
        reason: &str,
    ) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };

        let mut fields = UpdateFields::default();
        match field {
            "content" => fields.content = Some(value.to_string()),
            "importance" => match value.parse::<f64>() {
                Ok(v) if (0.0..=1.0).contains(&v) => fields.importance = Some(v),
                _ => {
                    return AdminResponse::fail(format!(
                        "importance must be a number in [0, 1], got {value:?}"
                    ))
                }
            },
            "type" => fields.event_type = Some(EventType::parse_name(value)),
            "status" => match MemoryStatus::parse_name(value) {
                Some(status) => fields.status = Some(status),
                None => {
                    return AdminResponse::fail(format!(
                        "unknown status {value:?}; expected active, archived, or deleted"
                    ))
                }
            },
            other => {
                return AdminResponse::fail(format!(
                    "unknown field {other:?}; expected content, importance, type, or status"
                ))
            }
        }

        match engines.memory.update(id, fields, reason).await {
            Ok(changed) if changed.is_empty() => {
                AdminResponse::ok(format!("memory {id} already up to date, nothing changed"))
            }
            Ok(changed) => AdminResponse::ok_with(
                format!("memory {id} updated: {}", changed.join(", ")),
                json!({ "updated_fields": changed }),
            ),
            Err(MemoryError::NotFound(_)) => {
                AdminResponse::fail(format!("memory {id} not found"))
            }
            Err(e) => e.into(),
        }
    }

    /// Full record view for one memory.
    pub fn memory_details(&self, id: i64) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        match engines.memory.get(id) {
            Ok(Some(record)) => AdminResponse::ok_with(
                format!("memory {id}"),
                serde_json::to_value(&record).unwrap_or(Value::Null),
            ),
            Ok(None) => AdminResponse::fail(format!("memory {id} not found")),
            Err(e) => e.into(),
        }
    }

    /// The update audit trail of one memory.
    pub fn memory_history(&self, id: i64) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        match engines.memory.get(id) {
            Ok(Some(record)) => {
                let history = &record.metadata.update_history;
                AdminResponse::ok_with(
                    format!("memory {id} has {} update(s)", history.len()),
                    serde_json::to_value(history).unwrap_or(Value::Null),
                )
            }
            Ok(None) => AdminResponse::fail(format!("memory {id} not found")),
            Err(e) => e.into(),
        }
    }

    /// Manually trigger one prune pass. Returns immediately with a busy
    /// response when a run is already in flight.
    pub async fn run_forgetting(&self) -> AdminResponse {
        let engines = match self.require_engines() {
            Ok(e) => e,
            Err(resp) => return resp,
        };
        match engines.forgetting.trigger_manual_run().await {
            Ok(stats) => AdminResponse::ok_with(
                format!(
                    "prune finished: {} processed, {} decayed, {} deleted, {} remaining",
                    stats.processed, stats.decayed, stats.deleted, stats.remaining
                ),
                json!({
                    "processed": stats.processed,
                    "decayed": stats.decayed,
                    "deleted": stats.deleted,
                    "remaining": stats.remaining,
                }),
            ),
            Err(MemoryError::Busy(_)) => AdminResponse::fail("busy"),
            Err(e) => e.into(),
        }
    }

    /// The active configuration as structured data.
    pub fn config_summary(&self) -> AdminResponse {
        let config = self.config();
        AdminResponse::ok_with(
            "current configuration",
            serde_json::to_value(&config).unwrap_or(Value::Null),
        )
    }

    /// Stop background work and flush persistent state.
    pub async fn shutdown(&self) {
        if let Some(engines) = self.engines() {
            engines.forgetting.stop();
            let tasks: Vec<JoinHandle<()>> = {
                let mut slot = self
                    .reflection_tasks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                slot.drain(..).collect()
            };
            for task in tasks {
                task.abort();
            }
            engines.memory.persist_index().await;
        }
        tracing::info!("memory engine shut down");
    }
}

// ============================================================================
// TESTS
// ============================================================================
