// src/retrieval/mod.rs
// Context retrieval: hybrid multi-source search with fusion and caching

pub mod analysis;
pub mod cache;
pub mod fusion;
mod retriever;
mod types;
pub mod validate;

pub use analysis::{QueryAnalysis, SourceWeights, analyze_query, fallback_entities, intent_aspects, intent_weights};
pub use cache::{CACHE_MAX_ENTRIES, CACHE_TTL, ContextCache, cache_key};
pub use fusion::{RRF_K, dedup_items, merge_ranked, reciprocal_rank_fusion};
pub use retriever::ContextRetriever;
pub use types::{
    ContextItemType, ItemMetadata, QueryIntent, RetrievalOptions, RetrievedContextItem,
};
pub use validate::{ValidationReport, ai_filter, validate_relevance};
