//! Retrieval layer: sparse BM25 search and dense/sparse result fusion.

pub mod fusion;
pub mod sparse;

pub use fusion::{
    apply_fusion_param, FusedHit, FusionParam, FusionStrategy, Fuser, QueryClass, QueryInfo,
    RankedDoc,
};
pub use sparse::{SparseHit, SparseRetriever};
