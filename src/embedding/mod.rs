//! Embedding index for entities and facts

pub mod index;

pub use index::{cosine_similarity, EmbeddingIndex, EmbeddingRecord, Neighbor};
