//! Append-only bitemporal fact store
//!
//! Every write takes the commit lock, checks the (subject, predicate) head,
//! appends records stamped with the next commit sequence and then publishes
//! that sequence as the read watermark. Readers never take the commit lock;
//! they pin the watermark and ignore anything stamped after it, so every read
//! through one [`Snapshot`] sees the same committed state.
//!
//! Records are never edited. Closing a fact or merging provenance swaps in a
//! new `Arc` carrying one more amendment stamped with its own commit sequence
//! and transaction time; a view only applies the amendments its watermark
//! (and, for bitemporal reads, its `known_at`) can see.

use super::models::*;
use crate::clock::Clock;
use crate::error::{KnowledgeError, Result, ValidationError};
use crate::metrics::METRICS;
use crate::schema::{ObjectShape, PredicateDef, SchemaManager};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// End of a fact's validity, recorded when it was superseded or retracted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub valid_to: DateTime<Utc>,
    /// Transaction time of the closure
    pub closed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<FactId>,
}

/// Source attached to a fact after it was asserted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceMerge {
    pub provenance: Provenance,
    /// Fact confidence once this source was combined in
    pub confidence: f64,
    /// Transaction time of the merge
    pub merged_at: DateTime<Utc>,
}

/// Logical record as persisted: the fact as asserted plus its amendments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub fact: Fact,
    /// In commit order; the last one is in force
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub closures: Vec<Closure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merges: Vec<ProvenanceMerge>,
}

#[derive(Debug, Clone)]
struct StoredFact {
    fact: Fact,
    seq: u64,
    closures: Vec<(Closure, u64)>,
    merges: Vec<(ProvenanceMerge, u64)>,
}

impl StoredFact {
    fn new(fact: Fact, seq: u64) -> Self {
        Self {
            fact,
            seq,
            closures: Vec::new(),
            merges: Vec::new(),
        }
    }

    fn render<'a>(
        &self,
        closure: Option<&Closure>,
        merges: impl Iterator<Item = &'a ProvenanceMerge>,
    ) -> Fact {
        let mut fact = self.fact.clone();
        if let Some(closure) = closure {
            fact.valid_to = Some(closure.valid_to);
            fact.superseded_by = closure.superseded_by;
        }
        for merge in merges {
            fact.provenance.push(merge.provenance.clone());
            fact.confidence = merge.confidence;
        }
        fact
    }

    fn view(&self, watermark: u64) -> Option<Fact> {
        if self.seq > watermark {
            return None;
        }
        let closure = self
            .closures
            .iter()
            .rev()
            .find(|(_, seq)| *seq <= watermark)
            .map(|(c, _)| c);
        let merges = self
            .merges
            .iter()
            .filter(|(_, seq)| *seq <= watermark)
            .map(|(m, _)| m);
        Some(self.render(closure, merges))
    }

    /// What was known about this fact at transaction time `known_at`
    fn view_known_at(&self, watermark: u64, known_at: DateTime<Utc>) -> Option<Fact> {
        if self.seq > watermark || self.fact.assertion_time > known_at {
            return None;
        }
        let closure = self
            .closures
            .iter()
            .rev()
            .find(|(c, seq)| *seq <= watermark && c.closed_at <= known_at)
            .map(|(c, _)| c);
        let merges = self
            .merges
            .iter()
            .filter(|(m, seq)| *seq <= watermark && m.merged_at <= known_at)
            .map(|(m, _)| m);
        Some(self.render(closure, merges))
    }

    /// Latest state (only meaningful under the commit lock)
    fn latest(&self) -> Fact {
        self.render(
            self.closures.last().map(|(c, _)| c),
            self.merges.iter().map(|(m, _)| m),
        )
    }

    fn is_open(&self) -> bool {
        self.closures.is_empty() && self.fact.valid_to.is_none()
    }

    fn end(&self) -> Option<DateTime<Utc>> {
        self.closures
            .last()
            .map(|(c, _)| c.valid_to)
            .or(self.fact.valid_to)
    }

    fn overlaps(&self, from: DateTime<Utc>, to: Option<DateTime<Utc>>) -> bool {
        windows_overlap(self.fact.valid_from, self.end(), from, to)
    }

    fn closed(&self, closure: Closure, seq: u64) -> StoredFact {
        let mut next = self.clone();
        next.closures.push((closure, seq));
        next
    }

    fn merged(&self, merge: ProvenanceMerge, seq: u64) -> StoredFact {
        let mut next = self.clone();
        next.merges.push((merge, seq));
        next
    }
}

#[derive(Debug, Default)]
struct FactChain {
    records: Vec<Arc<StoredFact>>,
    next_version: u64,
}

impl FactChain {
    fn open_positions(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_open())
            .map(|(i, _)| i)
            .collect()
    }

    fn position(&self, id: &FactId) -> Option<usize> {
        self.records.iter().position(|r| r.fact.id == *id)
    }

    fn allocate_version(&mut self) -> u64 {
        let version = self.next_version.max(1);
        self.next_version = version + 1;
        version
    }
}

#[derive(Debug, Clone)]
struct EntityRecord {
    entity: Arc<Entity>,
    seq: u64,
}

/// Bitemporal fact store
pub struct FactStore {
    schema: Arc<SchemaManager>,
    clock: Arc<dyn Clock>,
    entities: DashMap<EntityId, EntityRecord>,
    names: DashMap<String, EntityId>,
    chains: DashMap<FactKey, FactChain>,
    fact_index: DashMap<FactId, FactKey>,
    subject_predicates: DashMap<EntityId, BTreeSet<String>>,
    commit: Mutex<u64>,
    watermark: AtomicU64,
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn head_label(id: Option<FactId>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string())
}

impl FactStore {
    pub fn new(schema: Arc<SchemaManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            schema,
            clock,
            entities: DashMap::new(),
            names: DashMap::new(),
            chains: DashMap::new(),
            fact_index: DashMap::new(),
            subject_predicates: DashMap::new(),
            commit: Mutex::new(0),
            watermark: AtomicU64::new(0),
        }
    }

    pub fn schema(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock_commit(&self) -> MutexGuard<'_, u64> {
        self.commit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, guard: &mut MutexGuard<'_, u64>, seq: u64) {
        **guard = seq;
        self.watermark.store(seq, Ordering::Release);
    }

    /// Pin the current commit watermark
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            store: self,
            watermark: self.watermark.load(Ordering::Acquire),
        }
    }

    /// Create an entity after validating its type against the active ontology
    pub fn create_entity(&self, request: NewEntity) -> Result<Entity> {
        if request.canonical_name.trim().is_empty() {
            return Err(KnowledgeError::InvalidCandidate(
                "canonical name cannot be empty".to_string(),
            ));
        }
        let ontology = self.schema.active();
        if let Err(e) = ontology.validate_entity_type(&request.entity_type) {
            METRICS.schema_violations.inc();
            return Err(e.into());
        }

        let mut commit = self.lock_commit();
        let key = name_key(&request.canonical_name);
        if let Some(existing) = self.names.get(&key) {
            return Err(KnowledgeError::InvalidCandidate(format!(
                "entity named '{}' already exists as {}",
                request.canonical_name,
                *existing
            )));
        }

        let seq = *commit + 1;
        let entity = Entity {
            id: EntityId::new(),
            entity_type: request.entity_type,
            canonical_name: request.canonical_name,
            attributes: request.attributes,
            created_at: self.clock.now(),
            schema_version: ontology.number,
        };
        self.names.insert(key, entity.id);
        self.entities.insert(
            entity.id,
            EntityRecord {
                entity: Arc::new(entity.clone()),
                seq,
            },
        );
        self.publish(&mut commit, seq);

        debug!("Entity created: id={}, type={}", entity.id, entity.entity_type);
        Ok(entity)
    }

    pub fn get_entity(&self, id: &EntityId) -> Result<Arc<Entity>> {
        self.snapshot()
            .entity(id)
            .ok_or_else(|| KnowledgeError::NotFound(format!("entity {}", id)))
    }

    pub fn find_entity(&self, name: &str) -> Option<Arc<Entity>> {
        self.snapshot().entity_by_name(name)
    }

    /// Check a candidate against the store and the active ontology
    ///
    /// Returns the predicate definition and the ontology version used.
    pub fn validate_candidate(&self, candidate: &FactCandidate) -> Result<(PredicateDef, u64)> {
        if candidate.predicate.trim().is_empty() {
            return Err(KnowledgeError::InvalidCandidate(
                "predicate cannot be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&candidate.confidence) {
            return Err(KnowledgeError::InvalidCandidate(format!(
                "confidence must be within [0, 1], got {}",
                candidate.confidence
            )));
        }
        if let Some(valid_to) = candidate.valid_to {
            if valid_to <= candidate.valid_from {
                return Err(KnowledgeError::InvalidTemporalRange(format!(
                    "valid_to {} is not after valid_from {}",
                    valid_to, candidate.valid_from
                )));
            }
        }

        let result = self.validate_shape(candidate);
        if result.is_err() {
            METRICS.schema_violations.inc();
        }
        result.map_err(KnowledgeError::from)
    }

    fn validate_shape(
        &self,
        candidate: &FactCandidate,
    ) -> std::result::Result<(PredicateDef, u64), ValidationError> {
        let subject = self
            .entities
            .get(&candidate.subject)
            .map(|r| r.entity.clone())
            .ok_or_else(|| ValidationError::UnknownEntity(candidate.subject.to_string()))?;

        let object_entity = match &candidate.object {
            FactObject::Entity(id) => Some(
                self.entities
                    .get(id)
                    .map(|r| r.entity.clone())
                    .ok_or_else(|| ValidationError::UnknownEntity(id.to_string()))?,
            ),
            FactObject::Literal(_) => None,
        };
        let shape = match (&candidate.object, &object_entity) {
            (FactObject::Literal(lit), _) => ObjectShape::Literal(lit.kind()),
            (FactObject::Entity(_), Some(entity)) => ObjectShape::Entity(&entity.entity_type),
            (FactObject::Entity(id), None) => {
                return Err(ValidationError::UnknownEntity(id.to_string()))
            }
        };

        let ontology = self.schema.active();
        let def = ontology
            .validate_fact(&subject.entity_type, &candidate.predicate, &shape)?
            .clone();
        Ok((def, ontology.number))
    }

    /// Commit a new fact version
    ///
    /// `supersedes` names the record the new fact replaces: the current head,
    /// or a closed record whose validity the new fact overlaps and corrects.
    /// For single-valued predicates omitting it is only allowed when the new
    /// fact's validity window shares no instant with any record on the chain.
    /// Losers of the race get `VersionConflict`.
    pub fn assert_fact(&self, candidate: FactCandidate, supersedes: Option<FactId>) -> Result<Fact> {
        let (def, schema_version) = self.validate_candidate(&candidate)?;
        let key = candidate.key();
        let multi = def.is_multi_valued();

        let mut commit = self.lock_commit();
        let now = self.clock.now();
        let seq = *commit + 1;

        let fact = {
            let mut chain = self.chains.entry(key.clone()).or_default();
            let open = chain.open_positions();
            let head = open.first().map(|&i| chain.records[i].fact.id);

            let prior = match supersedes {
                Some(target) => {
                    let position = chain.position(&target).filter(|&i| {
                        let record = &chain.records[i];
                        // Correcting history must not leave a second current fact
                        open.contains(&i)
                            || (record.overlaps(candidate.valid_from, candidate.valid_to)
                                && (multi || candidate.valid_to.is_some() || open.is_empty()))
                    });
                    match position {
                        Some(i) => Some(i),
                        None => return Err(self.version_conflict(&key, Some(target), head)),
                    }
                }
                None if !multi => {
                    let overlap = chain
                        .records
                        .iter()
                        .find(|r| r.overlaps(candidate.valid_from, candidate.valid_to))
                        .map(|r| r.fact.id);
                    if overlap.is_some() {
                        return Err(self.version_conflict(&key, None, overlap));
                    }
                    None
                }
                None => None,
            };

            let version = chain.allocate_version();
            let hash = compute_hash(&candidate.subject, &candidate.predicate, &candidate.object, None);
            let fact = Fact {
                id: FactId::new(),
                subject: candidate.subject,
                predicate: candidate.predicate,
                object: candidate.object,
                valid_from: candidate.valid_from,
                valid_to: candidate.valid_to,
                assertion_time: now,
                provenance: vec![candidate.provenance],
                confidence: candidate.confidence,
                version,
                supersedes: prior.map(|i| chain.records[i].fact.id),
                superseded_by: None,
                schema_version,
                hash,
            };

            if let Some(i) = prior {
                let previous = &chain.records[i];
                let start = fact.valid_from.max(previous.fact.valid_from);
                let closure = Closure {
                    valid_to: previous.end().map_or(start, |end| start.min(end)),
                    closed_at: now,
                    superseded_by: Some(fact.id),
                };
                let closed = Arc::new(previous.closed(closure, seq));
                chain.records[i] = closed;
            }

            chain.records.push(Arc::new(StoredFact::new(fact.clone(), seq)));
            fact
        };

        self.fact_index.insert(fact.id, key.clone());
        self.subject_predicates
            .entry(key.subject)
            .or_default()
            .insert(key.predicate.clone());
        self.publish(&mut commit, seq);
        drop(commit);

        METRICS.facts_committed.inc();
        match fact.supersedes {
            Some(prev) => info!(
                "Fact {} v{} supersedes {} on ({}, {})",
                fact.id, fact.version, prev, fact.subject, fact.predicate
            ),
            None => info!(
                "Fact {} v{} committed on ({}, {})",
                fact.id, fact.version, fact.subject, fact.predicate
            ),
        }
        Ok(fact)
    }

    fn version_conflict(
        &self,
        key: &FactKey,
        expected: Option<FactId>,
        actual: Option<FactId>,
    ) -> KnowledgeError {
        METRICS.version_conflicts.inc();
        warn!(
            "Version conflict on ({}, {}): expected {}, found {}",
            key.subject,
            key.predicate,
            head_label(expected),
            head_label(actual)
        );
        KnowledgeError::VersionConflict {
            subject: key.subject.to_string(),
            predicate: key.predicate.clone(),
            expected: head_label(expected),
            actual: head_label(actual),
        }
    }

    /// Logically delete a current fact by closing its valid time
    pub fn retract(&self, fact_id: FactId, valid_to: Option<DateTime<Utc>>) -> Result<Fact> {
        let key = self
            .fact_index
            .get(&fact_id)
            .map(|k| k.clone())
            .ok_or_else(|| KnowledgeError::NotFound(format!("fact {}", fact_id)))?;

        let mut commit = self.lock_commit();
        let now = self.clock.now();
        let seq = *commit + 1;

        let retracted = {
            let mut chain = self
                .chains
                .get_mut(&key)
                .ok_or_else(|| KnowledgeError::Internal(format!("missing chain for fact {}", fact_id)))?;
            let i = chain
                .position(&fact_id)
                .ok_or_else(|| KnowledgeError::Internal(format!("fact {} missing from its chain", fact_id)))?;
            if !chain.records[i].is_open() {
                let actual = chain.open_positions().first().map(|&j| chain.records[j].fact.id);
                drop(chain);
                return Err(self.version_conflict(&key, Some(fact_id), actual));
            }

            let previous = chain.records[i].clone();
            let end = valid_to.unwrap_or(now);
            if end < previous.fact.valid_from {
                return Err(KnowledgeError::InvalidTemporalRange(format!(
                    "retraction at {} precedes valid_from {}",
                    end, previous.fact.valid_from
                )));
            }
            let closure = Closure {
                valid_to: end,
                closed_at: now,
                superseded_by: None,
            };
            let closed = Arc::new(previous.closed(closure, seq));
            chain.records[i] = closed.clone();
            closed
        };
        self.publish(&mut commit, seq);
        drop(commit);

        info!("Fact {} retracted on ({}, {})", fact_id, key.subject, key.predicate);
        retracted
            .view(seq)
            .ok_or_else(|| KnowledgeError::Internal(format!("fact {} not visible", fact_id)))
    }

    /// Attach another source to an existing fact without creating a version
    ///
    /// The merge is its own commit: snapshots pinned earlier and reads known
    /// before it keep the provenance they had. Returns the updated fact and
    /// whether anything changed; a source that already backs the fact is a
    /// no-op.
    pub fn corroborate(
        &self,
        fact_id: FactId,
        provenance: Provenance,
        confidence: f64,
    ) -> Result<(Fact, bool)> {
        let key = self
            .fact_index
            .get(&fact_id)
            .map(|k| k.clone())
            .ok_or_else(|| KnowledgeError::NotFound(format!("fact {}", fact_id)))?;

        let mut commit = self.lock_commit();
        let now = self.clock.now();
        let seq = *commit + 1;

        let updated = {
            let mut chain = self
                .chains
                .get_mut(&key)
                .ok_or_else(|| KnowledgeError::Internal(format!("missing chain for fact {}", fact_id)))?;
            let i = chain
                .position(&fact_id)
                .ok_or_else(|| KnowledgeError::Internal(format!("fact {} missing from its chain", fact_id)))?;

            let current = chain.records[i].clone();
            let latest = current.latest();
            if latest.has_source(&provenance.source) {
                return Ok((latest, false));
            }

            // Independent sources combine as a noisy-or
            let merge = ProvenanceMerge {
                provenance,
                confidence: 1.0 - (1.0 - latest.confidence) * (1.0 - confidence.clamp(0.0, 1.0)),
                merged_at: now,
            };
            let updated = Arc::new(current.merged(merge, seq));
            chain.records[i] = updated.clone();
            updated
        };
        self.publish(&mut commit, seq);
        drop(commit);

        METRICS.provenance_merges.inc();
        debug!("Provenance merged into fact {}", fact_id);
        let fact = updated
            .view(seq)
            .ok_or_else(|| KnowledgeError::Internal(format!("fact {} not visible", fact_id)))?;
        Ok((fact, true))
    }

    /// Records on the candidate's key whose validity shares an instant with it
    pub fn overlapping(&self, candidate: &FactCandidate) -> Vec<Fact> {
        self.get_history(&candidate.subject, &candidate.predicate)
            .into_iter()
            .filter(|f| f.overlaps(candidate.valid_from, candidate.valid_to))
            .collect()
    }

    pub fn get_fact(&self, id: &FactId) -> Result<Fact> {
        self.snapshot()
            .fact(id)
            .ok_or_else(|| KnowledgeError::NotFound(format!("fact {}", id)))
    }

    pub fn get_current_facts(&self, subject: &EntityId, predicate: Option<&str>) -> Vec<Fact> {
        self.snapshot().current_facts(subject, predicate)
    }

    pub fn get_facts_as_of(
        &self,
        subject: &EntityId,
        predicate: Option<&str>,
        t: DateTime<Utc>,
    ) -> Vec<Fact> {
        self.snapshot().facts_as_of(subject, predicate, t)
    }

    pub fn facts_bitemporal(
        &self,
        subject: &EntityId,
        predicate: Option<&str>,
        valid_at: DateTime<Utc>,
        known_at: DateTime<Utc>,
    ) -> Vec<Fact> {
        self.snapshot()
            .facts_bitemporal(subject, predicate, valid_at, known_at)
    }

    pub fn get_history(&self, subject: &EntityId, predicate: &str) -> Vec<Fact> {
        self.snapshot().history(subject, predicate)
    }

    /// Current head of a single-valued chain
    pub fn head(&self, subject: &EntityId, predicate: &str) -> Option<Fact> {
        self.snapshot().current_facts(subject, Some(predicate)).into_iter().next()
    }

    pub fn entity_count(&self) -> usize {
        self.snapshot().entities().len()
    }

    pub fn fact_count(&self) -> usize {
        self.fact_index.len()
    }

    /// Structural invariants over the latest state; returns violations
    pub fn check_invariants(&self) -> Vec<String> {
        let ontology = self.schema.active();
        let mut violations = Vec::new();

        for chain in self.chains.iter() {
            let key = chain.key();
            let multi = ontology
                .predicate(&key.predicate)
                .map(|def| def.is_multi_valued())
                .unwrap_or(false);
            let open = chain.open_positions();
            if open.len() > 1 && !multi {
                violations.push(format!(
                    "({}, {}) has {} current facts",
                    key.subject,
                    key.predicate,
                    open.len()
                ));
            }

            let versions: HashMap<FactId, u64> = chain
                .records
                .iter()
                .map(|r| (r.fact.id, r.fact.version))
                .collect();
            for record in &chain.records {
                if let Some(prev) = record.fact.supersedes {
                    match versions.get(&prev) {
                        Some(&v) if v < record.fact.version => {}
                        Some(&v) => violations.push(format!(
                            "fact {} v{} supersedes {} with version {}",
                            record.fact.id, record.fact.version, prev, v
                        )),
                        None => violations.push(format!(
                            "fact {} supersedes {} outside its chain",
                            record.fact.id, prev
                        )),
                    }
                }
            }
        }
        violations
    }

    /// Every entity and fact record, facts ordered by key and version
    pub fn export_records(&self) -> (Vec<Entity>, Vec<FactRecord>) {
        let _commit = self.lock_commit();
        let mut entities: Vec<Entity> = self
            .entities
            .iter()
            .map(|r| r.entity.as_ref().clone())
            .collect();
        entities.sort_by_key(|e| e.created_at);

        let mut records: Vec<FactRecord> = self
            .chains
            .iter()
            .flat_map(|chain| {
                chain
                    .records
                    .iter()
                    .map(|r| FactRecord {
                        fact: r.fact.clone(),
                        closures: r.closures.iter().map(|(c, _)| c.clone()).collect(),
                        merges: r.merges.iter().map(|(m, _)| m.clone()).collect(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        records.sort_by(|a, b| {
            a.fact
                .key()
                .cmp(&b.fact.key())
                .then(a.fact.version.cmp(&b.fact.version))
        });
        (entities, records)
    }

    /// Rebuild a store from exported records
    pub fn restore(
        schema: Arc<SchemaManager>,
        clock: Arc<dyn Clock>,
        entities: Vec<Entity>,
        records: Vec<FactRecord>,
    ) -> Result<Self> {
        let store = Self::new(schema, clock);
        let mut seq = 0u64;

        for entity in entities {
            seq += 1;
            let key = name_key(&entity.canonical_name);
            if store.names.insert(key, entity.id).is_some() {
                return Err(KnowledgeError::Serialization(format!(
                    "duplicate entity name '{}'",
                    entity.canonical_name
                )));
            }
            store.entities.insert(
                entity.id,
                EntityRecord {
                    entity: Arc::new(entity),
                    seq,
                },
            );
        }

        for record in records {
            seq += 1;
            let key = record.fact.key();
            if !store.entities.contains_key(&key.subject) {
                return Err(KnowledgeError::Serialization(format!(
                    "fact {} references missing subject {}",
                    record.fact.id, key.subject
                )));
            }
            if store.fact_index.insert(record.fact.id, key.clone()).is_some() {
                return Err(KnowledgeError::Serialization(format!(
                    "duplicate fact id {}",
                    record.fact.id
                )));
            }
            store
                .subject_predicates
                .entry(key.subject)
                .or_default()
                .insert(key.predicate.clone());

            let mut chain = store.chains.entry(key).or_default();
            chain.next_version = chain.next_version.max(record.fact.version + 1);
            chain.records.push(Arc::new(StoredFact {
                fact: record.fact,
                seq,
                closures: record.closures.into_iter().map(|c| (c, seq)).collect(),
                merges: record.merges.into_iter().map(|m| (m, seq)).collect(),
            }));
        }

        for mut chain in store.chains.iter_mut() {
            chain.records.sort_by_key(|r| r.fact.version);
        }

        let violations = store.check_invariants();
        if !violations.is_empty() {
            return Err(KnowledgeError::Serialization(format!(
                "restored store violates invariants: {}",
                violations.join("; ")
            )));
        }

        *store.lock_commit() = seq;
        store.watermark.store(seq, Ordering::Release);
        info!("Fact store restored at commit {}", seq);
        Ok(store)
    }
}

/// Consistent read view pinned at a commit watermark
pub struct Snapshot<'a> {
    store: &'a FactStore,
    watermark: u64,
}

impl<'a> Snapshot<'a> {
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn entity(&self, id: &EntityId) -> Option<Arc<Entity>> {
        self.store
            .entities
            .get(id)
            .filter(|r| r.seq <= self.watermark)
            .map(|r| r.entity.clone())
    }

    pub fn entity_by_name(&self, name: &str) -> Option<Arc<Entity>> {
        let id = *self.store.names.get(&name_key(name))?;
        self.entity(&id)
    }

    pub fn entities(&self) -> Vec<Arc<Entity>> {
        self.store
            .entities
            .iter()
            .filter(|r| r.seq <= self.watermark)
            .map(|r| r.entity.clone())
            .collect()
    }

    pub fn fact(&self, id: &FactId) -> Option<Fact> {
        let key = self.store.fact_index.get(id).map(|k| k.clone())?;
        self.records(&key)
            .iter()
            .find(|r| r.fact.id == *id)
            .and_then(|r| r.view(self.watermark))
    }

    /// Predicates with at least one record for `subject`
    pub fn predicates_of(&self, subject: &EntityId) -> Vec<String> {
        self.store
            .subject_predicates
            .get(subject)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn records(&self, key: &FactKey) -> Vec<Arc<StoredFact>> {
        self.store
            .chains
            .get(key)
            .map(|chain| chain.records.clone())
            .unwrap_or_default()
    }

    fn keys(&self, subject: &EntityId, predicate: Option<&str>) -> Vec<FactKey> {
        match predicate {
            Some(p) => vec![FactKey::new(*subject, p)],
            None => self
                .predicates_of(subject)
                .into_iter()
                .map(|p| FactKey::new(*subject, p))
                .collect(),
        }
    }

    fn collect<F>(&self, subject: &EntityId, predicate: Option<&str>, mut select: F) -> Vec<Fact>
    where
        F: FnMut(&StoredFact) -> Option<Fact>,
    {
        self.keys(subject, predicate)
            .iter()
            .flat_map(|key| self.records(key))
            .filter_map(|record| select(&record))
            .collect()
    }

    /// Facts with no end of validity
    pub fn current_facts(&self, subject: &EntityId, predicate: Option<&str>) -> Vec<Fact> {
        let watermark = self.watermark;
        self.collect(subject, predicate, |r| {
            r.view(watermark).filter(|fact| fact.is_current())
        })
    }

    /// `valid_from <= t < valid_to` and `assertion_time <= t`
    pub fn facts_as_of(
        &self,
        subject: &EntityId,
        predicate: Option<&str>,
        t: DateTime<Utc>,
    ) -> Vec<Fact> {
        self.facts_bitemporal(subject, predicate, t, t)
    }

    /// Valid at `valid_at` according to what had been recorded by `known_at`
    pub fn facts_bitemporal(
        &self,
        subject: &EntityId,
        predicate: Option<&str>,
        valid_at: DateTime<Utc>,
        known_at: DateTime<Utc>,
    ) -> Vec<Fact> {
        let watermark = self.watermark;
        self.collect(subject, predicate, |r| {
            r.view_known_at(watermark, known_at)
                .filter(|fact| fact.is_valid_at(valid_at))
        })
    }

    /// Every version on the chain, oldest first
    pub fn history(&self, subject: &EntityId, predicate: &str) -> Vec<Fact> {
        let watermark = self.watermark;
        let mut facts = self.collect(subject, Some(predicate), |r| r.view(watermark));
        facts.sort_by_key(|f| f.version);
        facts
    }
}
