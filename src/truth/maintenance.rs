//! Truth maintenance: reconcile candidates with the current store state
//!
//! Candidates sharing a (subject, predicate) key are serialized through a
//! per-key lock so two contradicting candidates never race the same
//! decision. Distinct keys proceed in parallel.

use super::candidate::RawCandidate;
use super::conflict::*;
use super::credibility::{CredibilityModel, CredibilityScore, SourceReliability};
use crate::config::TruthConfig;
use crate::error::{KnowledgeError, Result};
use crate::facts::{Entity, Fact, FactCandidate, FactId, FactKey, FactStore, NewEntity};
use crate::metrics::METRICS;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// What happened to an ingested candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// No current fact on the key; committed as a new head
    Committed { fact: Fact },
    /// Same object as the head; provenance merged without a new version
    Merged { fact: Fact },
    /// Contradiction resolved in the candidate's favour
    Superseded {
        fact: Fact,
        previous: FactId,
        conflict: ConflictId,
    },
    /// Contradiction resolved in the head's favour
    Rejected { kept: FactId, conflict: ConflictId },
    /// Contradiction within the margin; held for review
    Pending { conflict: ConflictId },
    /// Nothing changed: this evidence was already applied
    Duplicate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fact: Option<FactId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict: Option<ConflictId>,
    },
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Committed { .. } => "committed",
            IngestOutcome::Merged { .. } => "merged",
            IngestOutcome::Superseded { .. } => "superseded",
            IngestOutcome::Rejected { .. } => "rejected",
            IngestOutcome::Pending { .. } => "pending",
            IngestOutcome::Duplicate { .. } => "duplicate",
        }
    }

    /// Fact written or touched by this outcome
    pub fn fact(&self) -> Option<&Fact> {
        match self {
            IngestOutcome::Committed { fact }
            | IngestOutcome::Merged { fact }
            | IngestOutcome::Superseded { fact, .. } => Some(fact),
            _ => None,
        }
    }

    pub fn conflict(&self) -> Option<ConflictId> {
        match self {
            IngestOutcome::Superseded { conflict, .. }
            | IngestOutcome::Rejected { conflict, .. }
            | IngestOutcome::Pending { conflict } => Some(*conflict),
            IngestOutcome::Duplicate { conflict, .. } => *conflict,
            _ => None,
        }
    }
}

pub struct TruthMaintenance {
    store: Arc<FactStore>,
    credibility: CredibilityModel,
    conflicts: ConflictLog,
    key_locks: DashMap<FactKey, Arc<Mutex<()>>>,
    margin: f64,
    max_retries: u32,
}

impl TruthMaintenance {
    pub fn new(
        store: Arc<FactStore>,
        config: &TruthConfig,
        sources: Arc<dyn SourceReliability>,
    ) -> Self {
        Self {
            store,
            credibility: CredibilityModel::new(config, sources),
            conflicts: ConflictLog::new(),
            key_locks: DashMap::new(),
            margin: config.auto_resolve_margin,
            max_retries: config.max_cas_retries,
        }
    }

    pub fn store(&self) -> &Arc<FactStore> {
        &self.store
    }

    pub fn conflict_log(&self) -> &ConflictLog {
        &self.conflicts
    }

    pub fn create_entity(&self, request: NewEntity) -> Result<Entity> {
        self.store.create_entity(request)
    }

    /// Run `f` holding the key's lock; the entry is dropped once idle
    pub(crate) fn with_key_lock<T>(&self, key: &FactKey, f: impl FnOnce() -> T) -> T {
        let lock = self.key_locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(lock);
        // Only the map still holds it: nobody is running or waiting
        self.key_locks
            .remove_if(key, |_, held| Arc::strong_count(held) == 1);
        result
    }

    pub fn locked_keys(&self) -> usize {
        self.key_locks.len()
    }

    /// Parse an ingestion record and process it
    pub fn ingest(&self, raw: &RawCandidate) -> Result<IngestOutcome> {
        let candidate = raw.parse(&self.store.snapshot())?;
        self.process(candidate)
    }

    /// Validate and reconcile a typed candidate
    pub fn process(&self, candidate: FactCandidate) -> Result<IngestOutcome> {
        self.store.validate_candidate(&candidate)?;

        self.with_key_lock(&candidate.key(), || {
            let mut attempt = 0;
            loop {
                match self.reconcile(&candidate) {
                    Err(e) if e.is_retryable() && attempt < self.max_retries => {
                        attempt += 1;
                        debug!(
                            "Retrying ({}, {}) after head moved, attempt {}",
                            candidate.subject, candidate.predicate, attempt
                        );
                    }
                    Ok(outcome) => {
                        METRICS.record_ingest(outcome.label());
                        return Ok(outcome);
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    fn reconcile(&self, candidate: &FactCandidate) -> Result<IngestOutcome> {
        let current = self
            .store
            .get_current_facts(&candidate.subject, Some(&candidate.predicate));

        if let Some(same) = current.iter().find(|f| f.object == candidate.object) {
            return self.merge(same, candidate);
        }
        if self.store.schema().is_multi_valued(&candidate.predicate) {
            return self.commit(candidate);
        }

        // Records sharing an instant with the candidate; a backfill that
        // overlaps none is history, not a contradiction
        let overlapping = self.store.overlapping(candidate);
        if let Some(existing) = displaced(&overlapping, candidate) {
            return self.contradiction(existing.clone(), candidate);
        }
        match overlapping.iter().find(|f| f.object == candidate.object) {
            Some(same) => self.merge(same, candidate),
            None => self.commit(candidate),
        }
    }

    fn commit(&self, candidate: &FactCandidate) -> Result<IngestOutcome> {
        let fact = self.store.assert_fact(candidate.clone(), None)?;
        Ok(IngestOutcome::Committed { fact })
    }

    fn merge(&self, existing: &Fact, candidate: &FactCandidate) -> Result<IngestOutcome> {
        let (fact, changed) = self.store.corroborate(
            existing.id,
            candidate.provenance.clone(),
            candidate.confidence,
        )?;
        if !changed {
            return Ok(IngestOutcome::Duplicate {
                fact: Some(fact.id),
                conflict: None,
            });
        }

        // New support for the head may settle conflicts held against it
        for record in self.conflicts.pending_for(&fact.key()) {
            if record.existing == fact.id {
                self.evaluate(record, &fact)?;
            }
        }
        Ok(IngestOutcome::Merged { fact })
    }

    fn contradiction(&self, head: Fact, candidate: &FactCandidate) -> Result<IngestOutcome> {
        let fingerprint = conflict_fingerprint(candidate, &head.id);
        if let Some(record) = self.conflicts.by_fingerprint(&fingerprint) {
            return Ok(IngestOutcome::Duplicate {
                fact: record.accepted,
                conflict: Some(record.id),
            });
        }

        if let Some(mut record) = self.conflicts.pending_matching(&head.id, candidate) {
            let id = record.id;
            if record.has_evidence_from(&candidate.provenance.source) {
                self.conflicts.alias(fingerprint, id);
                return Ok(IngestOutcome::Duplicate {
                    fact: None,
                    conflict: Some(id),
                });
            }
            record.evidence.push(candidate.provenance.clone());
            let outcome = self.evaluate(record, &head)?;
            self.conflicts.alias(fingerprint, id);
            return Ok(outcome);
        }

        let unscored = CredibilityScore {
            reliability: 0.0,
            recency: 0.0,
            corroboration: 0.0,
            total: 0.0,
        };
        let record = ConflictRecord {
            id: ConflictId::new(),
            key: candidate.key(),
            existing: head.id,
            accepted: None,
            candidate: candidate.clone(),
            evidence: vec![candidate.provenance.clone()],
            status: ConflictStatus::PendingReview,
            resolution: None,
            rationale: String::new(),
            existing_score: unscored,
            candidate_score: unscored,
            created_at: self.store.clock().now(),
            resolved_at: None,
        };
        let id = record.id;
        let outcome = self.evaluate(record, &head)?;
        self.conflicts.alias(fingerprint, id);
        Ok(outcome)
    }

    /// Score a conflict and settle it when the margin allows
    ///
    /// The record is only written back once any commit it implies succeeded.
    fn evaluate(&self, mut record: ConflictRecord, head: &Fact) -> Result<IngestOutcome> {
        let now = self.store.clock().now();
        let known = self.conflicts.get(&record.id).is_some();
        record.existing_score = self.credibility.score(&head.provenance, now);
        record.candidate_score = self.credibility.score(&record.evidence, now);
        let margin = record.margin();
        let id = record.id;

        if margin > self.margin {
            let fact = self.accept(&record, Some(head.id))?;
            record.status = ConflictStatus::AutoResolved;
            record.resolution = Some(Resolution::AcceptCandidate);
            record.accepted = Some(fact.id);
            record.rationale = format!(
                "candidate credibility {:.3} exceeds existing {:.3} by more than {:.3}",
                record.candidate_score.total, record.existing_score.total, self.margin
            );
            record.resolved_at = Some(now);
            self.conflicts.update(record);
            METRICS.record_conflict(ConflictStatus::AutoResolved.as_str());
            info!("Conflict {} auto-resolved: fact {} supersedes {}", id, fact.id, head.id);
            Ok(IngestOutcome::Superseded {
                fact,
                previous: head.id,
                conflict: id,
            })
        } else if -margin > self.margin {
            record.status = ConflictStatus::AutoResolved;
            record.resolution = Some(Resolution::KeepExisting);
            record.rationale = format!(
                "existing credibility {:.3} exceeds candidate {:.3} by more than {:.3}",
                record.existing_score.total, record.candidate_score.total, self.margin
            );
            record.resolved_at = Some(now);
            self.conflicts.update(record);
            METRICS.record_conflict(ConflictStatus::AutoResolved.as_str());
            info!("Conflict {} auto-resolved: fact {} kept", id, head.id);
            Ok(IngestOutcome::Rejected {
                kept: head.id,
                conflict: id,
            })
        } else {
            record.rationale = format!(
                "credibility margin {:.3} within threshold {:.3}",
                margin.abs(),
                self.margin
            );
            self.conflicts.update(record);
            if !known {
                METRICS.record_conflict(ConflictStatus::PendingReview.as_str());
                warn!(
                    "Conflict {} on ({}, {}) pending review",
                    id, head.subject, head.predicate
                );
            }
            Ok(IngestOutcome::Pending { conflict: id })
        }
    }

    /// Commit a held candidate and attach the rest of its evidence
    fn accept(&self, record: &ConflictRecord, supersedes: Option<FactId>) -> Result<Fact> {
        let mut fact = self.store.assert_fact(record.candidate.clone(), supersedes)?;
        // The first entry is the candidate's own provenance
        for provenance in record.evidence.iter().skip(1) {
            let confidence = provenance
                .credibility_hint
                .unwrap_or(record.candidate.confidence);
            let (merged, _) = self.store.corroborate(fact.id, provenance.clone(), confidence)?;
            fact = merged;
        }
        Ok(fact)
    }

    /// Settle a pending conflict from outside (human or external review)
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: Resolution,
        rationale: impl Into<String>,
    ) -> Result<ConflictRecord> {
        let key = self
            .conflicts
            .get(&id)
            .map(|r| r.key)
            .ok_or_else(|| KnowledgeError::NotFound(format!("conflict {}", id)))?;
        let rationale = rationale.into();
        self.with_key_lock(&key, || self.settle(id, resolution, rationale))
    }

    fn settle(
        &self,
        id: ConflictId,
        resolution: Resolution,
        rationale: String,
    ) -> Result<ConflictRecord> {
        let mut record = self
            .conflicts
            .get(&id)
            .ok_or_else(|| KnowledgeError::NotFound(format!("conflict {}", id)))?;
        if !record.is_pending() {
            return Err(KnowledgeError::InvalidCandidate(format!(
                "conflict {} is already {}",
                id,
                record.status.as_str()
            )));
        }

        if resolution == Resolution::AcceptCandidate {
            let overlapping = self.store.overlapping(&record.candidate);
            let same = |f: &&Fact| f.object == record.candidate.object;
            let fact = match overlapping.iter().filter(same).find(|f| f.is_current()) {
                Some(head) => head.clone(),
                None => match displaced(&overlapping, &record.candidate) {
                    Some(existing) => self.accept(&record, Some(existing.id))?,
                    None => match overlapping.iter().find(same) {
                        Some(fact) => fact.clone(),
                        None => self.accept(&record, None)?,
                    },
                },
            };
            record.accepted = Some(fact.id);
        }

        let now = self.store.clock().now();
        record.status = ConflictStatus::ManuallyResolved;
        record.resolution = Some(resolution);
        record.rationale = rationale;
        record.resolved_at = Some(now);
        self.conflicts.update(record.clone());
        METRICS.record_conflict(ConflictStatus::ManuallyResolved.as_str());
        info!("Conflict {} resolved manually: {:?}", id, resolution);
        Ok(record)
    }

    pub fn conflict(&self, id: &ConflictId) -> Option<ConflictRecord> {
        self.conflicts.get(id)
    }

    pub fn conflicts(&self, status: Option<ConflictStatus>) -> Vec<ConflictRecord> {
        self.conflicts.list(status)
    }
}

/// The record a single-valued candidate would replace: the current head when
/// the candidate overlaps it, otherwise the earliest overlapping record with a
/// different object
fn displaced<'a>(overlapping: &'a [Fact], candidate: &FactCandidate) -> Option<&'a Fact> {
    let mut rivals = overlapping.iter().filter(|f| f.object != candidate.object);
    let first = rivals.clone().min_by_key(|f| f.valid_from);
    rivals.find(|f| f.is_current()).or(first)
}
