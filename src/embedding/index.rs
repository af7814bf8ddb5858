//! In-memory vector index keyed by owning node
//!
//! Vectors are produced elsewhere; the index only checks that the owner
//! exists, that the dimension matches, and answers cosine nearest-neighbour
//! lookups by exhaustive scan.

use crate::clock::Clock;
use crate::config::EmbeddingConfig;
use crate::error::{KnowledgeError, Result};
use crate::facts::{FactStore, NodeRef};
use crate::metrics::METRICS;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub owner: NodeRef,
    pub vector: Vec<f32>,
    pub model_id: String,
    pub dimension: usize,
    pub recorded_at: DateTime<Utc>,
}

/// Search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub owner: NodeRef,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(KnowledgeError::DimensionMismatch {
            expected: b.len(),
            actual: a.len(),
        });
    }
    if a.is_empty() {
        return Ok(0.0);
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let xf = f64::from(x);
        let yf = f64::from(y);
        dot += xf * yf;
        norm_a += xf * xf;
        norm_b += yf * yf;
    }

    if norm_a <= 0.0 || norm_b <= 0.0 {
        return Ok(0.0);
    }
    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        Ok(sim as f32)
    } else {
        Ok(0.0)
    }
}

pub struct EmbeddingIndex {
    store: Arc<FactStore>,
    clock: Arc<dyn Clock>,
    dimension: OnceCell<usize>,
    records: DashMap<NodeRef, EmbeddingRecord>,
}

impl EmbeddingIndex {
    pub fn new(store: Arc<FactStore>, config: &EmbeddingConfig) -> Self {
        let dimension = OnceCell::new();
        if let Some(d) = config.dimension {
            let _ = dimension.set(d);
        }
        Self {
            clock: store.clock().clone(),
            store,
            dimension,
            records: DashMap::new(),
        }
    }

    /// Fixed dimension, if configured or learned from the first record
    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn owner_exists(&self, owner: &NodeRef) -> bool {
        let snapshot = self.store.snapshot();
        match owner {
            NodeRef::Entity(id) => snapshot.entity(id).is_some(),
            NodeRef::Fact(id) => snapshot.fact(id).is_some(),
        }
    }

    fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(KnowledgeError::InvalidCandidate("embedding vector is empty".to_string()));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(KnowledgeError::InvalidCandidate(
                "embedding vector contains non-finite values".to_string(),
            ));
        }
        let expected = *self.dimension.get_or_init(|| vector.len());
        if expected != vector.len() {
            return Err(KnowledgeError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert or replace the vector for `owner`
    pub fn upsert(
        &self,
        owner: NodeRef,
        vector: Vec<f32>,
        model_id: impl Into<String>,
    ) -> Result<EmbeddingRecord> {
        if !self.owner_exists(&owner) {
            return Err(KnowledgeError::OrphanEmbedding(owner.to_string()));
        }
        self.check_vector(&vector)?;

        let record = EmbeddingRecord {
            owner,
            dimension: vector.len(),
            vector,
            model_id: model_id.into(),
            recorded_at: self.clock.now(),
        };
        self.records.insert(owner, record.clone());
        METRICS.embeddings_indexed.inc();
        debug!("Embedding indexed for {}", owner);
        Ok(record)
    }

    pub fn get(&self, owner: &NodeRef) -> Option<EmbeddingRecord> {
        self.records.get(owner).map(|r| r.clone())
    }

    pub fn remove(&self, owner: &NodeRef) -> Option<EmbeddingRecord> {
        self.records.remove(owner).map(|(_, r)| r)
    }

    /// Cosine similarity between two indexed owners
    pub fn similarity(&self, a: &NodeRef, b: &NodeRef) -> Option<f32> {
        let left = self.records.get(a)?.vector.clone();
        let right = self.records.get(b)?;
        cosine_similarity(&left, &right.vector).ok()
    }

    /// Top `k` owners by cosine similarity to `query`, optionally filtered
    pub fn search<F>(&self, query: &[f32], k: usize, filter: F) -> Result<Vec<Neighbor>>
    where
        F: Fn(&NodeRef) -> bool,
    {
        if let Some(expected) = self.dimension() {
            if expected != query.len() {
                return Err(KnowledgeError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for record in self.records.iter() {
            if !filter(&record.owner) {
                continue;
            }
            let score = cosine_similarity(query, &record.vector)?;
            hits.push(Neighbor {
                owner: record.owner,
                score,
            });
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Drop records whose owner no longer resolves
    pub fn purge_orphans(&self) -> usize {
        let orphans: Vec<NodeRef> = self
            .records
            .iter()
            .filter(|r| !self.owner_exists(&r.owner))
            .map(|r| r.owner)
            .collect();
        for owner in &orphans {
            self.records.remove(owner);
        }
        if !orphans.is_empty() {
            info!("Purged {} orphan embeddings", orphans.len());
        }
        orphans.len()
    }

    /// All records, for archiving
    pub fn records(&self) -> Vec<EmbeddingRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    /// Load archived records, enforcing the same checks as `upsert`
    pub fn restore(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        for record in records {
            if !self.owner_exists(&record.owner) {
                return Err(KnowledgeError::OrphanEmbedding(record.owner.to_string()));
            }
            self.check_vector(&record.vector)?;
            self.records.insert(record.owner, record);
        }
        Ok(())
    }
}
