//! Conflict records for contradicting candidates

use super::credibility::CredibilityScore;
use crate::facts::{FactCandidate, FactId, FactKey, FactObject, Provenance};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(pub Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    PendingReview,
    AutoResolved,
    ManuallyResolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::PendingReview => "pending_review",
            ConflictStatus::AutoResolved => "auto_resolved",
            ConflictStatus::ManuallyResolved => "manually_resolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepExisting,
    AcceptCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub key: FactKey,
    /// Current fact the candidate contradicted
    pub existing: FactId,
    /// Fact created from the candidate, once accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<FactId>,
    /// Held back, uncommitted, until resolved
    pub candidate: FactCandidate,
    /// Every observation backing the candidate's object
    pub evidence: Vec<Provenance>,
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    pub rationale: String,
    pub existing_score: CredibilityScore,
    pub candidate_score: CredibilityScore,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::PendingReview
    }

    pub fn candidate_object(&self) -> &FactObject {
        &self.candidate.object
    }

    pub fn has_evidence_from(&self, source: &str) -> bool {
        self.evidence.iter().any(|p| p.source == source)
    }

    /// Candidate score minus existing score
    pub fn margin(&self) -> f64 {
        self.candidate_score.total - self.existing_score.total
    }
}

/// SHA-256 over a candidate and the head it was checked against
pub fn conflict_fingerprint(candidate: &FactCandidate, existing: &FactId) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(candidate.fingerprint().as_bytes());
    hasher.update(b"|");
    hasher.update(existing.0.as_bytes());
    hex::encode(hasher.finalize())
}

/// Conflict records with fingerprint lookup for idempotent replays
///
/// Pending records are also indexed by key; the index entry goes away once
/// nothing on that key awaits review.
#[derive(Debug, Default)]
pub struct ConflictLog {
    records: DashMap<ConflictId, ConflictRecord>,
    fingerprints: DashMap<String, ConflictId>,
    pending: DashMap<FactKey, Vec<ConflictId>>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ConflictRecord, fingerprint: String) {
        self.fingerprints.insert(fingerprint, record.id);
        self.update(record);
    }

    fn index(&self, record: &ConflictRecord) {
        let empty = {
            let mut ids = self.pending.entry(record.key.clone()).or_default();
            ids.retain(|id| *id != record.id);
            if record.is_pending() {
                ids.push(record.id);
            }
            ids.is_empty()
        };
        if empty {
            self.pending.remove_if(&record.key, |_, ids| ids.is_empty());
        }
    }

    /// Route another fingerprint to an existing record
    pub fn alias(&self, fingerprint: String, id: ConflictId) {
        self.fingerprints.insert(fingerprint, id);
    }

    pub fn update(&self, record: ConflictRecord) {
        self.index(&record);
        self.records.insert(record.id, record);
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> Option<ConflictRecord> {
        let id = *self.fingerprints.get(fingerprint)?;
        self.get(&id)
    }

    pub fn get(&self, id: &ConflictId) -> Option<ConflictRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Pending record against `existing` holding the same claim as `candidate`
    pub fn pending_matching(
        &self,
        existing: &FactId,
        candidate: &FactCandidate,
    ) -> Option<ConflictRecord> {
        self.pending_for(&candidate.key()).into_iter().find(|r| {
            r.existing == *existing
                && r.candidate.object == candidate.object
                && r.candidate.valid_from == candidate.valid_from
                && r.candidate.valid_to == candidate.valid_to
        })
    }

    pub fn pending_for(&self, key: &FactKey) -> Vec<ConflictRecord> {
        let ids = self.pending.get(key).map(|ids| ids.clone()).unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.get(id))
            .filter(|r| r.is_pending())
            .collect()
    }

    /// Keys with at least one conflict awaiting review
    pub fn pending_keys(&self) -> usize {
        self.pending.len()
    }

    /// Records, optionally filtered by status, oldest first
    pub fn list(&self, status: Option<ConflictStatus>) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = self
            .records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every record with the fingerprints that point to it, for archiving
    pub fn export(&self) -> Vec<(ConflictRecord, Vec<String>)> {
        self.list(None)
            .into_iter()
            .map(|record| {
                let fingerprints = self
                    .fingerprints
                    .iter()
                    .filter(|f| *f.value() == record.id)
                    .map(|f| f.key().clone())
                    .collect();
                (record, fingerprints)
            })
            .collect()
    }
}
