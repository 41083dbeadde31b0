//! Sparse retriever - BM25 full-text search over the FTS5 mirror.
//!
//! Queries are tokenized (search-mode CJK segmentation when enabled), then
//! phrase-quoted so FTS5 wildcard, column, and boolean operators cannot leak
//! into the match expression. Scores are min-max normalized to [0, 1] across
//! the returned set, higher = better. A failed or malformed query never
//! raises to the caller: it logs and returns an empty list.

use std::sync::Arc;

use crate::config::SparseRetrieverConfig;
use crate::memory::MemoryMetadata;
use crate::storage::document_store::{DocumentStore, MetadataFilter};

#[cfg(feature = "cjk")]
use std::sync::OnceLock;

/// One sparse hit with its hydrated row
#[derive(Debug, Clone)]
pub struct SparseHit {
    /// Document id
    pub id: i64,
    /// Normalized BM25 score in [0, 1]
    pub score: f32,
    /// Memory content
    pub content: String,
    /// Parsed metadata
    pub metadata: MemoryMetadata,
}

/// BM25 retriever over the documents FTS mirror
pub struct SparseRetriever {
    docs: Arc<DocumentStore>,
    config: SparseRetrieverConfig,
    #[cfg(feature = "cjk")]
    segmenter: OnceLock<jieba_rs::Jieba>,
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}' | '\u{3040}'..='\u{30ff}' | '\u{ac00}'..='\u{d7af}')
}

impl SparseRetriever {
    /// Wire the retriever over the shared document store.
    pub fn new(docs: Arc<DocumentStore>, config: SparseRetrieverConfig) -> Self {
        Self {
            docs,
            config,
            #[cfg(feature = "cjk")]
            segmenter: OnceLock::new(),
        }
    }

    /// Whether sparse retrieval is enabled by configuration.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Tokenize a query containing CJK text with jieba's search-mode
    /// segmentation.
    #[cfg(feature = "cjk")]
    fn segment_cjk(&self, query: &str) -> String {
        let jieba = self.segmenter.get_or_init(jieba_rs::Jieba::new);
        jieba.cut_for_search(query, true).join(" ")
    }

    /// Codepoint fallback: every CJK char becomes its own token, which the
    /// unicode61 tokenizer can match.
    #[cfg(not(feature = "cjk"))]
    fn segment_cjk(&self, query: &str) -> String {
        let mut out = String::with_capacity(query.len() * 2);
        for c in query.chars() {
            if is_cjk(c) {
                out.push(' ');
                out.push(c);
                out.push(' ');
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Trim, segment, and escape a raw query into a safe FTS5 match
    /// expression. The output is a phrase-quoted string, which neutralizes
    /// `*`, `^`, `:`, `AND`/`OR`/`NOT`, and parentheses.
    fn preprocess_query(&self, query: &str) -> String {
        let mut q = query.trim().to_string();

        if self.config.use_cjk_segmenter && q.chars().any(is_cjk) {
            q = self.segment_cjk(&q);
        }

        // Embedded double quotes would terminate the phrase early.
        let cleaned = q.replace('"', " ");
        format!("\"{}\"", cleaned.trim())
    }

    /// Search the mirror. Returns at most `limit` hits after filtering,
    /// scores min-max normalized; failures degrade to empty.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
        session_id: Option<&str>,
        persona_id: Option<&str>,
        metadata_filters: Option<&MetadataFilter>,
    ) -> Vec<SparseHit> {
        if !self.config.enabled || query.trim().is_empty() || limit == 0 {
            return Vec::new();
        }

        let match_query = self.preprocess_query(query);
        tracing::debug!("sparse search query: {match_query}");

        let fts_hits = match self.docs.fts_search(&match_query, limit) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::error!("sparse search failed: {e}");
                return Vec::new();
            }
        };
        if fts_hits.is_empty() {
            return Vec::new();
        }

        let ids: Vec<i64> = fts_hits.iter().map(|(id, _)| *id).collect();
        let rows = match self.docs.get_by_ids(&ids) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("sparse hydration failed: {e}");
                return Vec::new();
            }
        };
        let by_id: std::collections::HashMap<i64, _> =
            rows.into_iter().map(|row| (row.id, row)).collect();

        let mut hits: Vec<SparseHit> = Vec::with_capacity(fts_hits.len());
        for (id, bm25_rank) in fts_hits {
            let Some(row) = by_id.get(&id) else { continue };
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
            if let Some(filter) = metadata_filters {
                let value = match serde_json::from_str(&row.metadata) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if !filter.matches(&value) {
                    continue;
                }
            }
            hits.push(SparseHit {
                id,
                // FTS5 bm25() ranks lower-is-better; negate so higher = better
                // before normalization.
                score: -(bm25_rank as f32),
                content: row.text.clone(),
                metadata,
            });
        }

        normalize_scores(&mut hits);
        tracing::debug!("sparse search returned {} hits", hits.len());
        hits
    }

    /// Rebuild the FTS mirror.
    pub fn rebuild_index(&self) -> crate::error::Result<usize> {
        self.docs.rebuild_fts()
    }
}

/// Min-max normalize hit scores to [0, 1]. A single hit (or all-equal
/// scores) normalizes to 1.0.
fn normalize_scores(hits: &mut [SparseHit]) {
    if hits.is_empty() {
        return;
    }
    let max = hits.iter().map(|h| h.score).fold(f32::MIN, f32::max);
    let min = hits.iter().map(|h| h.score).fold(f32::MAX, f32::min);
    let range = max - min;
    for hit in hits.iter_mut() {
        hit.score = if range > 0.0 {
            (hit.score - min) / range
        } else {
            1.0
        };
    }
}

// ============================================================================
// TESTS
// ============================================================================
