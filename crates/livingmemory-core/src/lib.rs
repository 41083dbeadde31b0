//! # LivingMemory Core
//!
//! Lifecycle-managed long-term memory engine for conversational agents:
//!
//! - **Ingestion & reflection**: a two-stage LLM pipeline distills scored,
//!   structured memory events out of dialogue history
//! - **Hybrid retrieval**: dense HNSW vectors (USearch) + sparse BM25
//!   (SQLite FTS5) with nine pluggable result-fusion strategies
//! - **Recall reranking**: similarity, importance, and access recency
//!   blended into one score
//! - **Forgetting**: periodic linear importance decay and pruning of stale,
//!   unimportant memories
//! - **Consistency**: one transactional manager keeps the vector index, the
//!   document table, and the full-text mirror joined on a single id space
//!
//! The engine consumes text embedding and chat completion through the
//! [`Embedder`] and [`Chatter`] capability traits and never talks to a model
//! API itself.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use livingmemory_core::{LivingMemory, LivingMemoryConfig, LlmRequestContext};
//!
//! let host = LivingMemory::new(LivingMemoryConfig::default(), "./data")?;
//! host.initialize(embedder, chatter).await?;
//!
//! // Pre-LLM hook: recall + inject + record the user turn
//! let mut request = LlmRequestContext {
//!     session_id: "session-1".into(),
//!     persona_id: None,
//!     prompt: "what music do I like?".into(),
//!     system_prompt: "You are helpful.".into(),
//! };
//! host.on_llm_request(&mut request).await;
//!
//! // Post-LLM hook: record the reply, maybe fire reflection
//! host.on_llm_response("session-1", None, None, "You like jazz!").await;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod engines;
pub mod error;
pub mod host;
pub mod memory;
pub mod provider;
pub mod retrieval;
pub mod session;
pub mod storage;
pub mod util;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{
    FilteringConfig, ForgettingAgentConfig, FusionConfig, LivingMemoryConfig, RecallEngineConfig,
    RecallStrategy, ReflectionEngineConfig, RetrievalMode, SessionManagerConfig,
    SparseRetrieverConfig, TimezoneConfig,
};
pub use engines::{ForgettingAgent, PruneStats, RecallEngine, ReflectionEngine};
pub use error::{MemoryError, Result};
pub use host::{AdminResponse, LivingMemory, LlmRequestContext, DB_FILE_NAME, INDEX_FILE_NAME};
pub use memory::{
    Entity, EventType, MemoryEvent, MemoryMetadata, MemoryRecord, MemoryStatus, ScoredMemory,
    UpdateHistoryEntry,
};
pub use provider::{Chatter, Embedder};
pub use retrieval::{
    FusedHit, FusionParam, FusionStrategy, Fuser, QueryClass, QueryInfo, RankedDoc, SparseHit,
    SparseRetriever,
};
pub use session::{ChatTurn, Role, SessionManager};
pub use storage::{DocumentStore, MemoryManager, MetadataFilter, UpdateFields, VectorIndex};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
