//! Plugin configuration: nested sections, defaults, and range validation.
//!
//! All sections deserialize with defaults so a partial config is always
//! usable; `LivingMemoryConfig::validate` enforces the documented ranges and
//! is fatal at startup. Runtime changes (retrieval mode, fusion parameters)
//! go through the same validators before a new snapshot is swapped in.

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::retrieval::fusion::FusionStrategy;

// ============================================================================
// SECTION: SESSION MANAGER
// ============================================================================

/// Bounds for the per-conversation session map
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// Maximum live sessions before LRU eviction
    pub max_sessions: usize,
    /// Idle seconds before a session is evicted
    pub session_ttl: u64,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_ttl: 3600,
        }
    }
}

// ============================================================================
// SECTION: RECALL ENGINE
// ============================================================================

/// How recall issues searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// Dense + sparse concurrently, fused
    #[default]
    Hybrid,
    /// Dense vectors only
    Dense,
    /// BM25 full-text only
    Sparse,
}

impl RetrievalMode {
    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hybrid" => Some(RetrievalMode::Hybrid),
            "dense" => Some(RetrievalMode::Dense),
            "sparse" => Some(RetrievalMode::Sparse),
            _ => None,
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Hybrid => "hybrid",
            RetrievalMode::Dense => "dense",
            RetrievalMode::Sparse => "sparse",
        }
    }
}

/// Post-retrieval ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallStrategy {
    /// Keep raw similarity order
    Similarity,
    /// Blend similarity, importance, and recency
    #[default]
    Weighted,
}

/// Recall engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallEngineConfig {
    /// Results returned per recall
    pub top_k: usize,
    /// Search fan-out mode
    pub retrieval_mode: RetrievalMode,
    /// Reranking strategy
    pub recall_strategy: RecallStrategy,
    /// Weight of the retrieval score in the weighted rerank
    pub similarity_weight: f64,
    /// Weight of `metadata.importance` in the weighted rerank
    pub importance_weight: f64,
    /// Weight of access recency in the weighted rerank
    pub recency_weight: f64,
}

impl Default for RecallEngineConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            retrieval_mode: RetrievalMode::Hybrid,
            recall_strategy: RecallStrategy::Weighted,
            similarity_weight: 0.6,
            importance_weight: 0.2,
            recency_weight: 0.2,
        }
    }
}

// ============================================================================
// SECTION: FUSION
// ============================================================================

/// Result fusion tuning. All weights live in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Active fusion strategy
    pub strategy: FusionStrategy,
    /// RRF dampening constant K
    pub rrf_k: u32,
    /// Dense-list weight for score-combining strategies
    pub dense_weight: f64,
    /// Sparse-list weight for score-combining strategies
    pub sparse_weight: f64,
    /// λ for the convex combination strategy
    pub convex_lambda: f64,
    /// Dense share for the interleave strategy
    pub interleave_ratio: f64,
    /// Bonus for ids present in both lists (rank_fusion)
    pub rank_bias_factor: f64,
    /// Content-length diversity bonus scale (hybrid_rrf)
    pub diversity_bonus: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::Rrf,
            rrf_k: 60,
            dense_weight: 0.7,
            sparse_weight: 0.3,
            convex_lambda: 0.5,
            interleave_ratio: 0.5,
            rank_bias_factor: 0.1,
            diversity_bonus: 0.1,
        }
    }
}

// ============================================================================
// SECTION: REFLECTION ENGINE
// ============================================================================

/// Reflection pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionEngineConfig {
    /// Assistant turns per session before reflection fires
    pub summary_trigger_rounds: u32,
    /// Minimum evaluated importance for an event to be persisted
    pub importance_threshold: f64,
    /// Override for the stage-A system prompt
    pub event_extraction_prompt: Option<String>,
    /// Override for the stage-B system prompt
    pub evaluation_prompt: Option<String>,
}

impl Default for ReflectionEngineConfig {
    fn default() -> Self {
        Self {
            summary_trigger_rounds: 10,
            importance_threshold: 0.5,
            event_extraction_prompt: None,
            evaluation_prompt: None,
        }
    }
}

// ============================================================================
// SECTION: SPARSE RETRIEVER
// ============================================================================

/// Sparse retriever tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SparseRetrieverConfig {
    /// Whether sparse retrieval participates at all
    pub enabled: bool,
    /// BM25 k1 (term-frequency saturation)
    pub bm25_k1: f64,
    /// BM25 b (length normalization)
    pub bm25_b: f64,
    /// Segment CJK queries with the search-mode segmenter when available
    pub use_cjk_segmenter: bool,
}

impl Default for SparseRetrieverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            use_cjk_segmenter: true,
        }
    }
}

// ============================================================================
// SECTION: FORGETTING AGENT
// ============================================================================

/// Forgetting agent tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgettingAgentConfig {
    /// Whether the background loop runs
    pub enabled: bool,
    /// Hours between periodic prune passes
    pub check_interval_hours: u32,
    /// Minimum age in days before a record may be deleted
    pub retention_days: u32,
    /// Linear importance decay per day of age
    pub importance_decay_rate: f64,
    /// Records below this decayed importance (and past retention) are deleted
    pub importance_threshold: f64,
    /// Pagination size for the prune scan
    pub forgetting_batch_size: usize,
}

impl Default for ForgettingAgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_hours: 24,
            retention_days: 90,
            importance_decay_rate: 0.005,
            importance_threshold: 0.1,
            forgetting_batch_size: 1000,
        }
    }
}

// ============================================================================
// SECTION: FILTERING / TIMEZONE
// ============================================================================

/// Which identity filters recall applies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteringConfig {
    /// Restrict recall to the active persona
    pub use_persona_filtering: bool,
    /// Restrict recall to the active session
    pub use_session_filtering: bool,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            use_persona_filtering: true,
            use_session_filtering: true,
        }
    }
}

/// Timezone used when rendering timestamps for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimezoneConfig {
    /// IANA timezone name
    pub timezone: String,
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
        }
    }
}

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

/// Complete plugin configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LivingMemoryConfig {
    /// Session map bounds
    pub session_manager: SessionManagerConfig,
    /// Recall engine tuning
    pub recall_engine: RecallEngineConfig,
    /// Result fusion tuning
    pub fusion: FusionConfig,
    /// Reflection pipeline tuning
    pub reflection_engine: ReflectionEngineConfig,
    /// Sparse retriever tuning
    pub sparse_retriever: SparseRetrieverConfig,
    /// Forgetting agent tuning
    pub forgetting_agent: ForgettingAgentConfig,
    /// Recall filter switches
    pub filtering_settings: FilteringConfig,
    /// Operator-facing timezone
    pub timezone_settings: TimezoneConfig,
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(MemoryError::InvalidConfig(format!(
            "{name} = {value} out of range [{min}, {max}]"
        )));
    }
    Ok(())
}

impl LivingMemoryConfig {
    /// Validate every section against its documented ranges.
    ///
    /// Range violations are fatal. The rerank weight-sum check is a warning
    /// only: a sum far from 1.0 skews ranking but is not an error.
    pub fn validate(&self) -> Result<()> {
        let s = &self.session_manager;
        check_range("session_manager.max_sessions", s.max_sessions, 1, 10_000)?;
        check_range("session_manager.session_ttl", s.session_ttl, 60, 86_400)?;

        let r = &self.recall_engine;
        check_range("recall_engine.top_k", r.top_k, 1, 50)?;
        check_range("recall_engine.similarity_weight", r.similarity_weight, 0.0, 1.0)?;
        check_range("recall_engine.importance_weight", r.importance_weight, 0.0, 1.0)?;
        check_range("recall_engine.recency_weight", r.recency_weight, 0.0, 1.0)?;
        let weight_sum = r.similarity_weight + r.importance_weight + r.recency_weight;
        if (weight_sum - 1.0).abs() > 0.1 {
            tracing::warn!(
                "recall rerank weights sum to {weight_sum:.2}, which deviates from 1.0 and may skew ranking"
            );
        }

        let f = &self.fusion;
        check_range("fusion.rrf_k", f.rrf_k, 1, 1000)?;
        check_range("fusion.dense_weight", f.dense_weight, 0.0, 1.0)?;
        check_range("fusion.sparse_weight", f.sparse_weight, 0.0, 1.0)?;
        check_range("fusion.convex_lambda", f.convex_lambda, 0.0, 1.0)?;
        check_range("fusion.interleave_ratio", f.interleave_ratio, 0.0, 1.0)?;
        check_range("fusion.rank_bias_factor", f.rank_bias_factor, 0.0, 1.0)?;
        check_range("fusion.diversity_bonus", f.diversity_bonus, 0.0, 1.0)?;

        let refl = &self.reflection_engine;
        check_range(
            "reflection_engine.summary_trigger_rounds",
            refl.summary_trigger_rounds,
            1,
            100,
        )?;
        check_range(
            "reflection_engine.importance_threshold",
            refl.importance_threshold,
            0.0,
            1.0,
        )?;

        let sp = &self.sparse_retriever;
        check_range("sparse_retriever.bm25_k1", sp.bm25_k1, 0.1, 10.0)?;
        check_range("sparse_retriever.bm25_b", sp.bm25_b, 0.0, 1.0)?;

        let fg = &self.forgetting_agent;
        check_range("forgetting_agent.check_interval_hours", fg.check_interval_hours, 1, 168)?;
        check_range("forgetting_agent.retention_days", fg.retention_days, 1, 3650)?;
        check_range(
            "forgetting_agent.importance_decay_rate",
            fg.importance_decay_rate,
            0.0,
            1.0,
        )?;
        check_range(
            "forgetting_agent.importance_threshold",
            fg.importance_threshold,
            0.0,
            1.0,
        )?;
        check_range(
            "forgetting_agent.forgetting_batch_size",
            fg.forgetting_batch_size,
            100,
            10_000,
        )?;

        if self.timezone_settings.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(MemoryError::InvalidConfig(format!(
                "timezone_settings.timezone = {:?} is not a valid IANA timezone",
                self.timezone_settings.timezone
            )));
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
