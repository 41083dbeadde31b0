//! Result fusion - combining dense and sparse result lists.
//!
//! Nine pluggable strategies share one entry point, [`Fuser::fuse`]. Every
//! strategy is pure: two ranked input lists in, at most `k` scored ids out,
//! output ids always a subset of the input ids. Parameter validation lives
//! in a per-strategy whitelist table rather than scattered conditionals.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::error::{MemoryError, Result};

// ============================================================================
// INPUT / OUTPUT TYPES
// ============================================================================

/// One entry of a ranked input list, best-first
#[derive(Debug, Clone)]
pub struct RankedDoc {
    /// Document id
    pub id: i64,
    /// Normalized score in [0, 1] (similarity for dense, BM25 for sparse)
    pub score: f32,
    /// Content length in chars, used by the diversity bonus
    pub content_len: usize,
}

/// One fused output entry
#[derive(Debug, Clone)]
pub struct FusedHit {
    /// Document id
    pub id: i64,
    /// Fusion score; ordering key of the output
    pub final_score: f32,
    /// Dense score if the id appeared in the dense list
    pub dense_score: Option<f32>,
    /// Sparse score if the id appeared in the sparse list
    pub sparse_score: Option<f32>,
}

// ============================================================================
// STRATEGY
// ============================================================================

/// Fusion strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Reciprocal rank fusion with a fixed K
    #[default]
    Rrf,
    /// RRF with query-adaptive K and a content-length diversity bonus
    HybridRrf,
    /// Min-max normalized weighted sum
    Weighted,
    /// Convex combination λ·dense + (1−λ)·sparse
    Convex,
    /// Ratio-controlled round-robin merge
    Interleave,
    /// Reciprocal-rank weighted sum with a both-lists bias
    RankFusion,
    /// Borda count voting
    ScoreFusion,
    /// Sparse prefilter, dense rerank
    Cascade,
    /// Query-class dispatch between weighted and RRF
    Adaptive,
}

impl FusionStrategy {
    /// All strategies, in display order
    pub const ALL: &'static [FusionStrategy] = &[
        FusionStrategy::Rrf,
        FusionStrategy::HybridRrf,
        FusionStrategy::Weighted,
        FusionStrategy::Convex,
        FusionStrategy::Interleave,
        FusionStrategy::RankFusion,
        FusionStrategy::ScoreFusion,
        FusionStrategy::Cascade,
        FusionStrategy::Adaptive,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionStrategy::Rrf => "rrf",
            FusionStrategy::HybridRrf => "hybrid_rrf",
            FusionStrategy::Weighted => "weighted",
            FusionStrategy::Convex => "convex",
            FusionStrategy::Interleave => "interleave",
            FusionStrategy::RankFusion => "rank_fusion",
            FusionStrategy::ScoreFusion => "score_fusion",
            FusionStrategy::Cascade => "cascade",
            FusionStrategy::Adaptive => "adaptive",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }

    /// Whether the strategy combines both weight parameters, making the
    /// weight-sum rule applicable.
    fn uses_both_weights(&self) -> bool {
        FusionParam::allowed_for(*self).contains(&FusionParam::DenseWeight)
            && FusionParam::allowed_for(*self).contains(&FusionParam::SparseWeight)
    }
}

impl std::fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// QUERY ANALYSIS
// ============================================================================

/// Coarse query classification driving adaptive strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    /// Short interrogative lookup
    Keyword,
    /// Long or entity-bearing query
    Semantic,
    /// Everything else
    Mixed,
}

/// Deterministic features of a query string
#[derive(Debug, Clone)]
pub struct QueryInfo {
    /// Length in chars
    pub length: usize,
    /// Whitespace-separated word count
    pub word_count: usize,
    /// Contains an interrogative marker
    pub is_interrogative: bool,
    /// Contains an entity marker (colon, possessive)
    pub has_entities: bool,
    /// Derived class
    pub class: QueryClass,
}

const INTERROGATIVES: &[&str] = &[
    "what", "how", "where", "when", "who", "why", "是", "什么", "哪里", "谁", "什么时候",
];

const ENTITY_MARKERS: &[&str] = &[":", "：", "'s", "的"];

impl QueryInfo {
    /// Analyze a query string. Pure and deterministic.
    pub fn analyze(query: &str) -> Self {
        let lower = query.to_lowercase();
        let length = query.chars().count();
        let word_count = query.split_whitespace().count();

        let is_interrogative = query.contains('?')
            || query.contains('？')
            || INTERROGATIVES.iter().any(|w| lower.contains(w));
        let has_entities = ENTITY_MARKERS.iter().any(|m| query.contains(m));

        let class = if is_interrogative && word_count <= 5 {
            QueryClass::Keyword
        } else if has_entities || length > 100 {
            QueryClass::Semantic
        } else {
            QueryClass::Mixed
        };

        Self {
            length,
            word_count,
            is_interrogative,
            has_entities,
            class,
        }
    }
}

// ============================================================================
// FUSER
// ============================================================================

/// Strategy dispatcher over the shared fusion configuration
#[derive(Debug, Clone, Default)]
pub struct Fuser {
    config: FusionConfig,
}

impl Fuser {
    /// Create a fuser with the given configuration.
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Current configuration
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Replace the configuration (runtime strategy/parameter changes).
    pub fn set_config(&mut self, config: FusionConfig) {
        self.config = config;
    }

    /// Fuse two ranked lists into at most `k` scored hits.
    pub fn fuse(
        &self,
        dense: &[RankedDoc],
        sparse: &[RankedDoc],
        k: usize,
        query_info: &QueryInfo,
    ) -> Vec<FusedHit> {
        if k == 0 || (dense.is_empty() && sparse.is_empty()) {
            return Vec::new();
        }
        match self.config.strategy {
            FusionStrategy::Rrf => self.rrf(dense, sparse, k, self.config.rrf_k as f32),
            FusionStrategy::HybridRrf => self.hybrid_rrf(dense, sparse, k, query_info),
            FusionStrategy::Weighted => self.weighted(
                dense,
                sparse,
                k,
                self.config.dense_weight as f32,
                self.config.sparse_weight as f32,
            ),
            FusionStrategy::Convex => self.convex(dense, sparse, k),
            FusionStrategy::Interleave => self.interleave(dense, sparse, k),
            FusionStrategy::RankFusion => self.rank_fusion(dense, sparse, k),
            FusionStrategy::ScoreFusion => self.score_fusion(dense, sparse, k),
            FusionStrategy::Cascade => self.cascade(dense, sparse, k),
            FusionStrategy::Adaptive => self.adaptive(dense, sparse, k, query_info),
        }
    }

    // ------------------------------------------------------------------
    // Strategies
    // ------------------------------------------------------------------

    fn rrf(&self, dense: &[RankedDoc], sparse: &[RankedDoc], k: usize, rrf_k: f32) -> Vec<FusedHit> {
        let mut scores: HashMap<i64, f32> = HashMap::new();
        for (rank, doc) in dense.iter().enumerate() {
            *scores.entry(doc.id).or_default() += 1.0 / (rrf_k + rank as f32 + 1.0);
        }
        for (rank, doc) in sparse.iter().enumerate() {
            *scores.entry(doc.id).or_default() += 1.0 / (rrf_k + rank as f32 + 1.0);
        }
        self.collect_top(scores, dense, sparse, k)
    }

    fn hybrid_rrf(
        &self,
        dense: &[RankedDoc],
        sparse: &[RankedDoc],
        k: usize,
        query_info: &QueryInfo,
    ) -> Vec<FusedHit> {
        // Short keyword queries lean on sparse ranks; long semantic queries
        // flatten the curve so dense depth matters more.
        let base_k = self.config.rrf_k as f32;
        let adjusted_k = match query_info.class {
            QueryClass::Keyword => (base_k / 2.0).max(1.0),
            QueryClass::Semantic => base_k * 1.5,
            QueryClass::Mixed => base_k,
        };

        let mut hits = self.rrf(dense, sparse, usize::MAX, adjusted_k);

        // Diversity bonus: reward content lengths that deviate from the
        // batch mean, so near-duplicate snippets do not crowd the top.
        let lengths: HashMap<i64, usize> = dense
            .iter()
            .chain(sparse.iter())
            .map(|d| (d.id, d.content_len))
            .collect();
        let mean_len: f32 = if lengths.is_empty() {
            0.0
        } else {
            lengths.values().map(|&l| l as f32).sum::<f32>() / lengths.len() as f32
        };
        if mean_len > 0.0 {
            let bonus_scale = self.config.diversity_bonus as f32;
            for hit in hits.iter_mut() {
                if let Some(&len) = lengths.get(&hit.id) {
                    let deviation = ((len as f32 - mean_len).abs() / mean_len).min(1.0);
                    hit.final_score += bonus_scale * deviation * hit.final_score;
                }
            }
            hits.sort_by(|a, b| {
                b.final_score
                    .partial_cmp(&a.final_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            });
        }
        hits.truncate(k);
        hits
    }

    fn weighted(
        &self,
        dense: &[RankedDoc],
        sparse: &[RankedDoc],
        k: usize,
        dense_weight: f32,
        sparse_weight: f32,
    ) -> Vec<FusedHit> {
        let dense_norm = min_max_normalize(dense);
        let sparse_norm = min_max_normalize(sparse);

        let mut scores: HashMap<i64, f32> = HashMap::new();
        for (id, score) in &dense_norm {
            *scores.entry(*id).or_default() += score * dense_weight;
        }
        for (id, score) in &sparse_norm {
            *scores.entry(*id).or_default() += score * sparse_weight;
        }
        self.collect_top(scores, dense, sparse, k)
    }

    fn convex(&self, dense: &[RankedDoc], sparse: &[RankedDoc], k: usize) -> Vec<FusedHit> {
        let lambda = self.config.convex_lambda as f32;
        let mut scores: HashMap<i64, f32> = HashMap::new();
        for doc in dense {
            *scores.entry(doc.id).or_default() += lambda * doc.score;
        }
        for doc in sparse {
            *scores.entry(doc.id).or_default() += (1.0 - lambda) * doc.score;
        }
        self.collect_top(scores, dense, sparse, k)
    }

    fn interleave(&self, dense: &[RankedDoc], sparse: &[RankedDoc], k: usize) -> Vec<FusedHit> {
        let ratio = self.config.interleave_ratio as f32;
        let dense_scores: HashMap<i64, f32> = dense.iter().map(|d| (d.id, d.score)).collect();
        let sparse_scores: HashMap<i64, f32> = sparse.iter().map(|d| (d.id, d.score)).collect();

        let mut taken: Vec<i64> = Vec::with_capacity(k);
        let mut seen: HashSet<i64> = HashSet::new();
        let mut di = 0;
        let mut si = 0;
        let mut dense_taken = 0usize;

        while taken.len() < k && (di < dense.len() || si < sparse.len()) {
            let want_dense = (dense_taken as f32) < ratio * (taken.len() as f32 + 1.0);
            let pick_dense = if want_dense && di < dense.len() {
                true
            } else if si < sparse.len() {
                false
            } else {
                true // sparse exhausted, drain dense
            };

            let id = if pick_dense {
                let id = dense[di].id;
                di += 1;
                dense_taken += 1;
                id
            } else {
                let id = sparse[si].id;
                si += 1;
                id
            };
            if seen.insert(id) {
                taken.push(id);
            }
        }

        taken
            .into_iter()
            .enumerate()
            .map(|(pos, id)| FusedHit {
                id,
                final_score: 1.0 / (pos as f32 + 1.0),
                dense_score: dense_scores.get(&id).copied(),
                sparse_score: sparse_scores.get(&id).copied(),
            })
            .collect()
    }

    fn rank_fusion(&self, dense: &[RankedDoc], sparse: &[RankedDoc], k: usize) -> Vec<FusedHit> {
        let dense_weight = self.config.dense_weight as f32;
        let sparse_weight = self.config.sparse_weight as f32;
        let bias = self.config.rank_bias_factor as f32;

        let mut scores: HashMap<i64, f32> = HashMap::new();
        let mut in_dense: HashSet<i64> = HashSet::new();
        for (rank, doc) in dense.iter().enumerate() {
            *scores.entry(doc.id).or_default() += dense_weight / (rank as f32 + 1.0);
            in_dense.insert(doc.id);
        }
        for (rank, doc) in sparse.iter().enumerate() {
            let entry = scores.entry(doc.id).or_default();
            *entry += sparse_weight / (rank as f32 + 1.0);
            if in_dense.contains(&doc.id) {
                *entry += bias;
            }
        }
        self.collect_top(scores, dense, sparse, k)
    }

    fn score_fusion(&self, dense: &[RankedDoc], sparse: &[RankedDoc], k: usize) -> Vec<FusedHit> {
        // Borda count: position from the bottom of each list is the vote.
        let dense_weight = self.config.dense_weight as f32;
        let sparse_weight = self.config.sparse_weight as f32;
        let n_dense = dense.len() as f32;
        let n_sparse = sparse.len() as f32;

        let mut scores: HashMap<i64, f32> = HashMap::new();
        for (rank, doc) in dense.iter().enumerate() {
            *scores.entry(doc.id).or_default() += dense_weight * (n_dense - rank as f32);
        }
        for (rank, doc) in sparse.iter().enumerate() {
            *scores.entry(doc.id).or_default() += sparse_weight * (n_sparse - rank as f32);
        }
        self.collect_top(scores, dense, sparse, k)
    }

    fn cascade(&self, dense: &[RankedDoc], sparse: &[RankedDoc], k: usize) -> Vec<FusedHit> {
        if sparse.is_empty() {
            // No prefilter available; fall back to dense order.
            return dense
                .iter()
                .take(k)
                .map(|doc| FusedHit {
                    id: doc.id,
                    final_score: doc.score,
                    dense_score: Some(doc.score),
                    sparse_score: None,
                })
                .collect();
        }

        let candidates: HashSet<i64> = sparse.iter().take(k * 2).map(|d| d.id).collect();
        let sparse_scores: HashMap<i64, f32> = sparse.iter().map(|d| (d.id, d.score)).collect();

        let mut hits: Vec<FusedHit> = dense
            .iter()
            .filter(|doc| candidates.contains(&doc.id))
            .map(|doc| FusedHit {
                id: doc.id,
                final_score: doc.score,
                dense_score: Some(doc.score),
                sparse_score: sparse_scores.get(&doc.id).copied(),
            })
            .collect();

        if hits.len() < k {
            let present: HashSet<i64> = hits.iter().map(|h| h.id).collect();
            for doc in sparse {
                if hits.len() >= k {
                    break;
                }
                if present.contains(&doc.id) {
                    continue;
                }
                hits.push(FusedHit {
                    id: doc.id,
                    final_score: doc.score,
                    dense_score: None,
                    sparse_score: Some(doc.score),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        hits
    }

    fn adaptive(
        &self,
        dense: &[RankedDoc],
        sparse: &[RankedDoc],
        k: usize,
        query_info: &QueryInfo,
    ) -> Vec<FusedHit> {
        match query_info.class {
            QueryClass::Keyword => self.weighted(dense, sparse, k, 0.3, 0.7),
            QueryClass::Semantic => self.weighted(dense, sparse, k, 0.8, 0.2),
            QueryClass::Mixed => self.rrf(dense, sparse, k, self.config.rrf_k as f32),
        }
    }

    /// Sort a score map descending (ties broken by id for determinism) and
    /// attach the per-list source scores.
    fn collect_top(
        &self,
        scores: HashMap<i64, f32>,
        dense: &[RankedDoc],
        sparse: &[RankedDoc],
        k: usize,
    ) -> Vec<FusedHit> {
        let dense_scores: HashMap<i64, f32> = dense.iter().map(|d| (d.id, d.score)).collect();
        let sparse_scores: HashMap<i64, f32> = sparse.iter().map(|d| (d.id, d.score)).collect();

        let mut hits: Vec<FusedHit> = scores
            .into_iter()
            .map(|(id, final_score)| FusedHit {
                id,
                final_score,
                dense_score: dense_scores.get(&id).copied(),
                sparse_score: sparse_scores.get(&id).copied(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        hits
    }
}

/// Min-max normalize a ranked list's scores to [0, 1]. Equal (or single)
/// scores normalize to 1.0.
fn min_max_normalize(docs: &[RankedDoc]) -> Vec<(i64, f32)> {
    if docs.is_empty() {
        return Vec::new();
    }
    let max = docs.iter().map(|d| d.score).fold(f32::MIN, f32::max);
    let min = docs.iter().map(|d| d.score).fold(f32::MAX, f32::min);
    let range = max - min;
    docs.iter()
        .map(|d| {
            let normalized = if range > 0.0 { (d.score - min) / range } else { 1.0 };
            (d.id, normalized)
        })
        .collect()
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// Tunable fusion parameter names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionParam {
    /// `dense_weight`
    DenseWeight,
    /// `sparse_weight`
    SparseWeight,
    /// `rrf_k`
    RrfK,
    /// `convex_lambda`
    ConvexLambda,
    /// `interleave_ratio`
    InterleaveRatio,
    /// `rank_bias_factor`
    RankBiasFactor,
    /// `diversity_bonus`
    DiversityBonus,
}

impl FusionParam {
    /// All parameters, in display order
    pub const ALL: &'static [FusionParam] = &[
        FusionParam::DenseWeight,
        FusionParam::SparseWeight,
        FusionParam::RrfK,
        FusionParam::ConvexLambda,
        FusionParam::InterleaveRatio,
        FusionParam::RankBiasFactor,
        FusionParam::DiversityBonus,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionParam::DenseWeight => "dense_weight",
            FusionParam::SparseWeight => "sparse_weight",
            FusionParam::RrfK => "rrf_k",
            FusionParam::ConvexLambda => "convex_lambda",
            FusionParam::InterleaveRatio => "interleave_ratio",
            FusionParam::RankBiasFactor => "rank_bias_factor",
            FusionParam::DiversityBonus => "diversity_bonus",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == s)
    }

    /// The parameters a strategy actually reads.
    pub fn allowed_for(strategy: FusionStrategy) -> &'static [FusionParam] {
        use FusionParam::*;
        match strategy {
            FusionStrategy::Rrf => &[RrfK],
            FusionStrategy::HybridRrf => &[RrfK, DiversityBonus],
            FusionStrategy::Weighted => &[DenseWeight, SparseWeight],
            FusionStrategy::Convex => &[DenseWeight, SparseWeight, ConvexLambda],
            FusionStrategy::Interleave => &[InterleaveRatio],
            FusionStrategy::RankFusion => &[DenseWeight, SparseWeight, RankBiasFactor],
            FusionStrategy::ScoreFusion => &[DenseWeight, SparseWeight],
            FusionStrategy::Cascade => &[DenseWeight, SparseWeight],
            FusionStrategy::Adaptive => &[DenseWeight, SparseWeight],
        }
    }
}

/// Validate and apply `key=value` to the config under the given strategy.
///
/// Enforces the parameter whitelist, the per-parameter ranges, and the
/// weight-sum rule: for strategies that combine both weights, setting one
/// while the other is configured must keep their sum ≤ 1.0.
pub fn apply_fusion_param(
    config: &mut FusionConfig,
    strategy: FusionStrategy,
    key: &str,
    value: &str,
) -> Result<()> {
    let param = FusionParam::parse_name(key).ok_or_else(|| {
        let supported: Vec<&str> = FusionParam::ALL.iter().map(|p| p.as_str()).collect();
        MemoryError::Validation(format!(
            "unknown fusion parameter {key:?}; supported: {}",
            supported.join(", ")
        ))
    })?;

    if !FusionParam::allowed_for(strategy).contains(&param) {
        return Err(MemoryError::Validation(format!(
            "parameter {key} does not apply to strategy {strategy}"
        )));
    }

    match param {
        FusionParam::RrfK => {
            let parsed: u32 = value.parse().map_err(|_| {
                MemoryError::Validation(format!("rrf_k must be an integer, got {value:?}"))
            })?;
            if !(1..=1000).contains(&parsed) {
                return Err(MemoryError::Validation(format!(
                    "rrf_k = {parsed} out of range [1, 1000]"
                )));
            }
            config.rrf_k = parsed;
        }
        _ => {
            let parsed: f64 = value.parse().map_err(|_| {
                MemoryError::Validation(format!("{key} must be a number, got {value:?}"))
            })?;
            if !(0.0..=1.0).contains(&parsed) {
                return Err(MemoryError::Validation(format!(
                    "{key} = {parsed} out of range [0, 1]"
                )));
            }

            if strategy.uses_both_weights()
                && matches!(param, FusionParam::DenseWeight | FusionParam::SparseWeight)
            {
                let other = match param {
                    FusionParam::DenseWeight => config.sparse_weight,
                    _ => config.dense_weight,
                };
                let sum = parsed + other;
                if sum > 1.0 + 1e-9 {
                    return Err(MemoryError::Validation(format!(
                        "weight sum {sum:.1} > 1.0; lower the other weight first"
                    )));
                }
            }

            match param {
                FusionParam::DenseWeight => config.dense_weight = parsed,
                FusionParam::SparseWeight => config.sparse_weight = parsed,
                FusionParam::ConvexLambda => config.convex_lambda = parsed,
                FusionParam::InterleaveRatio => config.interleave_ratio = parsed,
                FusionParam::RankBiasFactor => config.rank_bias_factor = parsed,
                FusionParam::DiversityBonus => config.diversity_bonus = parsed,
                FusionParam::RrfK => unreachable!(),
            }
        }
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
