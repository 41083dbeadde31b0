//! Dense vector index.
//!
//! HNSW (USearch) index over the document-store ids. Keys are the external
//! `i64` ids cast to `u64`; there is no separate key mapping, which keeps the
//! dense index and the document table joined on a single id space.

use std::path::Path;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::error::{MemoryError, Result};

/// HNSW connectivity parameter (higher = better recall, more memory)
const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search (higher = better recall, slower)
const DEFAULT_EXPANSION_SEARCH: usize = 64;

fn index_options(dimensions: usize) -> IndexOptions {
    IndexOptions {
        dimensions,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        connectivity: DEFAULT_CONNECTIVITY,
        expansion_add: DEFAULT_EXPANSION_ADD,
        expansion_search: DEFAULT_EXPANSION_SEARCH,
        multi: false,
    }
}

/// Dense ANN index keyed by document id
pub struct VectorIndex {
    index: Index,
    dimensions: usize,
}

impl VectorIndex {
    /// Create an empty index for the given embedding dimensionality.
    pub fn new(dimensions: usize) -> Result<Self> {
        let index = Index::new(&index_options(dimensions))
            .map_err(|e| MemoryError::Index(format!("index creation failed: {e}")))?;
        Ok(Self { index, dimensions })
    }

    /// Load a previously saved snapshot.
    ///
    /// A corrupted or unreadable snapshot is an error; the caller decides how
    /// to recover. Silently reinitializing here would discard the operator's
    /// only signal that the pair of on-disk files diverged.
    pub fn load(path: &Path, dimensions: usize) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| MemoryError::Index("index path is not valid UTF-8".to_string()))?;

        let index = Index::new(&index_options(dimensions))
            .map_err(|e| MemoryError::Index(format!("index creation failed: {e}")))?;
        index
            .load(path_str)
            .map_err(|e| MemoryError::Index(format!("failed to load index snapshot: {e}")))?;

        Ok(Self { index, dimensions })
    }

    /// Number of vectors in the index
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Whether the index holds no vectors
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding dimensionality
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Whether the id has a vector
    pub fn contains(&self, id: i64) -> bool {
        self.index.contains(id as u64)
    }

    /// Add a vector under the given id. Re-adding an id replaces its vector.
    pub fn add(&mut self, id: i64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(MemoryError::Index(format!(
                "dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }

        let key = id as u64;
        if self.index.contains(key) {
            self.index
                .remove(key)
                .map_err(|e| MemoryError::Index(format!("failed to replace vector {id}: {e}")))?;
        }

        // usearch requires reserve() before add() once capacity is exhausted.
        let size = self.index.size();
        if size >= self.index.capacity() {
            let new_capacity = std::cmp::max(self.index.capacity() * 2, 16);
            self.index
                .reserve(new_capacity)
                .map_err(|e| MemoryError::Index(format!("failed to reserve capacity: {e}")))?;
        }

        self.index
            .add(key, vector)
            .map_err(|e| MemoryError::Index(format!("failed to add vector {id}: {e}")))
    }

    /// Remove vectors by id. Missing ids are silently skipped.
    pub fn remove(&mut self, ids: &[i64]) -> Result<()> {
        for &id in ids {
            let key = id as u64;
            if !self.index.contains(key) {
                continue;
            }
            self.index
                .remove(key)
                .map_err(|e| MemoryError::Index(format!("failed to remove vector {id}: {e}")))?;
        }
        Ok(())
    }

    /// Nearest neighbors of `query`, as `(id, similarity)` descending.
    /// Similarity is `1 - cosine distance`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>> {
        if query.len() != self.dimensions {
            return Err(MemoryError::Index(format!(
                "dimension mismatch: expected {}, got {}",
                self.dimensions,
                query.len()
            )));
        }
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let matches = self
            .index
            .search(query, k)
            .map_err(|e| MemoryError::Index(format!("search failed: {e}")))?;

        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(&key, &distance)| (key as i64, 1.0 - distance))
            .collect())
    }

    /// Atomic snapshot to disk: write `<path>.tmp`, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("index.tmp");
        let tmp_str = tmp_path
            .to_str()
            .ok_or_else(|| MemoryError::Index("index path is not valid UTF-8".to_string()))?;

        self.index
            .save(tmp_str)
            .map_err(|e| MemoryError::Index(format!("failed to save index snapshot: {e}")))?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: usize = 8;

    fn test_vector(seed: f32) -> Vec<f32> {
        (0..DIMS)
            .map(|i| ((i as f32 + seed) / DIMS as f32).sin())
            .collect()
    }

    #[test]
    fn test_add_search_remove() {
        let mut index = VectorIndex::new(DIMS).unwrap();
        index.add(1, &test_vector(1.0)).unwrap();
        index.add(2, &test_vector(2.0)).unwrap();
        index.add(3, &test_vector(50.0)).unwrap();
        assert_eq!(index.len(), 3);

        let hits = index.search(&test_vector(1.0), 3).unwrap();
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 >= hits[1].1);

        index.remove(&[1, 999]).unwrap();
        assert!(!index.contains(1));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_re_add_replaces() {
        let mut index = VectorIndex::new(DIMS).unwrap();
        index.add(7, &test_vector(1.0)).unwrap();
        index.add(7, &test_vector(2.0)).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = VectorIndex::new(DIMS).unwrap();
        assert!(index.add(1, &[0.5, 0.5]).is_err());
        assert!(index.search(&[0.5, 0.5], 3).is_err());
    }

    #[test]
    fn test_empty_search_is_empty() {
        let index = VectorIndex::new(DIMS).unwrap();
        assert!(index.search(&test_vector(0.0), 5).unwrap().is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.index");

        let mut index = VectorIndex::new(DIMS).unwrap();
        index.add(1, &test_vector(1.0)).unwrap();
        index.add(2, &test_vector(9.0)).unwrap();
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path, DIMS).unwrap();
        assert_eq!(loaded.len(), 2);
        let hits = loaded.search(&test_vector(9.0), 1).unwrap();
        assert_eq!(hits[0].0, 2);
    }

    #[test]
    fn test_load_missing_snapshot_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.index");
        assert!(VectorIndex::load(&path, DIMS).is_err());
    }
}
