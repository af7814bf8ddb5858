//! Bounded hybrid query evaluation
//!
//! Patterns are matched by depth-first traversal over one store snapshot.
//! Traversal stops early on the hop bound, the result cap, the deadline or
//! cancellation; each of those marks the response partial instead of
//! failing it.

use super::pattern::{Anchor, PathStep, QueryRequest, Target};
use super::ranking::{RankingPolicy, ScoreBreakdown};
use crate::cancel::CancelHandle;
use crate::config::QueryConfig;
use crate::embedding::{cosine_similarity, EmbeddingIndex};
use crate::error::{KnowledgeError, Result};
use crate::facts::{EntityId, Fact, FactId, FactObject, FactStore, NodeRef, Snapshot};
use crate::metrics::METRICS;
use crate::schema::OntologyVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    MaxHops,
    ResultCap,
    Deadline,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryStatus {
    Complete,
    Partial { reasons: Vec<TruncationReason> },
}

impl QueryStatus {
    pub fn is_partial(&self) -> bool {
        matches!(self, QueryStatus::Partial { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            QueryStatus::Complete => "complete",
            QueryStatus::Partial { .. } => "partial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOrigin {
    /// Found by pattern traversal
    Symbolic,
    /// Contributed by nearest-neighbour search only
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    pub root: EntityId,
    /// Facts along the matched path, in traversal order
    pub facts: Vec<Fact>,
    pub terminal: NodeRef,
    pub origin: MatchOrigin,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub matches: Vec<QueryMatch>,
    pub status: QueryStatus,
    pub as_of: DateTime<Utc>,
    pub known_at: DateTime<Utc>,
    /// Commit watermark the query read from
    pub watermark: u64,
}

struct PathMatch {
    root: EntityId,
    facts: Vec<Fact>,
    terminal: NodeRef,
}

/// Mutable traversal state for one query
struct Walk<'a> {
    snapshot: Snapshot<'a>,
    ontology: &'a OntologyVersion,
    steps: &'a [PathStep],
    as_of: DateTime<Utc>,
    known_at: DateTime<Utc>,
    max_hops: usize,
    result_cap: usize,
    deadline: Instant,
    cancel: Option<&'a CancelHandle>,
    root: EntityId,
    path: Vec<Fact>,
    found: Vec<PathMatch>,
    reasons: BTreeSet<TruncationReason>,
    stopped: bool,
}

impl<'a> Walk<'a> {
    fn should_stop(&mut self) -> bool {
        if self.stopped {
            return true;
        }
        if self.cancel.map_or(false, CancelHandle::is_cancelled) {
            self.reasons.insert(TruncationReason::Cancelled);
            self.stopped = true;
        } else if Instant::now() >= self.deadline {
            self.reasons.insert(TruncationReason::Deadline);
            self.stopped = true;
        }
        self.stopped
    }

    fn emit(&mut self, terminal: NodeRef) {
        if self.found.len() >= self.result_cap {
            self.reasons.insert(TruncationReason::ResultCap);
            self.stopped = true;
            return;
        }
        self.found.push(PathMatch {
            root: self.root,
            facts: self.path.clone(),
            terminal,
        });
    }

    fn target_matches(&self, target: &Target, object: &FactObject) -> bool {
        match target {
            Target::Any => true,
            Target::Entity { id } => object.as_entity() == Some(*id),
            Target::Type { entity_type } => object
                .as_entity()
                .and_then(|id| self.snapshot.entity(&id))
                .map_or(false, |e| self.ontology.is_subtype(&e.entity_type, entity_type)),
            Target::Literal { value } => matches!(object, FactObject::Literal(l) if l == value),
        }
    }

    fn walk(&mut self, node: EntityId, step: usize) {
        if self.should_stop() {
            return;
        }
        let steps = self.steps;
        if step == steps.len() {
            self.emit(NodeRef::Entity(node));
            return;
        }

        let current = &steps[step];
        let facts = self.snapshot.facts_bitemporal(
            &node,
            current.predicate.as_deref(),
            self.as_of,
            self.known_at,
        );
        if facts.is_empty() {
            return;
        }
        if self.path.len() >= self.max_hops {
            self.reasons.insert(TruncationReason::MaxHops);
            return;
        }

        let last = step + 1 == steps.len();
        for fact in facts {
            if self.should_stop() {
                return;
            }
            if self.path.iter().any(|f| f.id == fact.id) {
                continue;
            }
            let next = fact.object.as_entity();
            let fact_id = fact.id;
            let target_ok = self.target_matches(&current.target, &fact.object);

            self.path.push(fact);
            if target_ok {
                match (last, next) {
                    (true, Some(entity)) => self.emit(NodeRef::Entity(entity)),
                    (true, None) => self.emit(NodeRef::Fact(fact_id)),
                    (false, Some(entity)) => self.walk(entity, step + 1),
                    (false, None) => {}
                }
            }
            if current.repeat {
                if let Some(entity) = next {
                    self.walk(entity, step);
                }
            }
            self.path.pop();
        }
    }
}

pub struct QueryEngine {
    store: Arc<FactStore>,
    embeddings: Arc<EmbeddingIndex>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(store: Arc<FactStore>, embeddings: Arc<EmbeddingIndex>, config: QueryConfig) -> Self {
        Self {
            store,
            embeddings,
            config,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn policy(&self) -> &RankingPolicy {
        &self.config.ranking
    }

    /// Evaluate a query; never blocks past its deadline
    pub fn query(&self, request: &QueryRequest, cancel: Option<&CancelHandle>) -> Result<QueryResponse> {
        let response = crate::time_operation!(
            METRICS.query_duration,
            "query",
            self.evaluate(request, cancel)
        )?;
        METRICS.record_query(response.status.label());
        Ok(response)
    }

    /// Run on the blocking pool so async callers are not stalled
    pub async fn query_async(
        self: Arc<Self>,
        request: QueryRequest,
        cancel: Option<CancelHandle>,
    ) -> Result<QueryResponse> {
        tokio::task::spawn_blocking(move || self.query(&request, cancel.as_ref()))
            .await
            .map_err(|e| KnowledgeError::Internal(format!("query task failed: {}", e)))?
    }

    fn validate(&self, request: &QueryRequest) -> Result<usize> {
        let k = request.k.unwrap_or(self.config.default_k);
        if k == 0 {
            return Err(KnowledgeError::InvalidQuery("k must be at least 1".to_string()));
        }
        for step in &request.pattern.steps {
            if step.predicate.as_deref().map_or(false, |p| p.trim().is_empty()) {
                return Err(KnowledgeError::InvalidQuery(
                    "step predicate cannot be empty".to_string(),
                ));
            }
        }
        if let Some(seed) = &request.semantic_seed {
            if seed.is_empty() || seed.iter().any(|v| !v.is_finite()) {
                return Err(KnowledgeError::InvalidQuery(
                    "semantic seed must be a non-empty finite vector".to_string(),
                ));
            }
            if let Some(expected) = self.embeddings.dimension() {
                if expected != seed.len() {
                    return Err(KnowledgeError::DimensionMismatch {
                        expected,
                        actual: seed.len(),
                    });
                }
            }
        }
        Ok(k)
    }

    fn roots(
        &self,
        snapshot: &Snapshot<'_>,
        ontology: &OntologyVersion,
        anchor: &Anchor,
    ) -> Result<Vec<EntityId>> {
        let mut entities = match anchor {
            Anchor::Entity { id } => vec![snapshot
                .entity(id)
                .ok_or_else(|| KnowledgeError::NotFound(format!("entity {}", id)))?],
            Anchor::Named { name } => vec![snapshot
                .entity_by_name(name)
                .ok_or_else(|| KnowledgeError::NotFound(format!("entity named '{}'", name)))?],
            Anchor::Type { entity_type } => {
                ontology.validate_entity_type(entity_type)?;
                snapshot
                    .entities()
                    .into_iter()
                    .filter(|e| ontology.is_subtype(&e.entity_type, entity_type))
                    .collect()
            }
            Anchor::Any => snapshot.entities(),
        };
        entities.sort_by(|a, b| a.canonical_name.cmp(&b.canonical_name));
        Ok(entities.into_iter().map(|e| e.id).collect())
    }

    fn similarity(&self, seed: Option<&[f32]>, nodes: &[NodeRef]) -> f64 {
        let seed = match seed {
            Some(seed) => seed,
            None => return 0.0,
        };
        nodes
            .iter()
            .find_map(|node| self.embeddings.get(node))
            .and_then(|record| cosine_similarity(seed, &record.vector).ok())
            .map_or(0.0, |s| f64::from(s).max(0.0))
    }

    fn recency(&self, facts: &[Fact], as_of: DateTime<Utc>) -> f64 {
        facts
            .iter()
            .map(|f| f.valid_from)
            .max()
            .map_or(0.0, |newest| {
                let age_days = (as_of - newest).num_seconds() as f64 / 86_400.0;
                self.config.ranking.recency(age_days)
            })
    }

    fn score(&self, breakdown: ScoreBreakdown) -> f64 {
        self.config.ranking.total(&breakdown)
    }

    fn evaluate(&self, request: &QueryRequest, cancel: Option<&CancelHandle>) -> Result<QueryResponse> {
        let k = self.validate(request)?;
        let deadline_ms = request.deadline_ms.unwrap_or(self.config.deadline_ms);
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);

        let as_of = request.as_of.unwrap_or_else(|| self.store.clock().now());
        let known_at = request.known_at.unwrap_or(as_of);
        let snapshot = self.store.snapshot();
        let watermark = snapshot.watermark();
        let ontology = self.store.schema().active();
        let pattern = &request.pattern;
        let roots = self.roots(&snapshot, &ontology, &pattern.anchor)?;

        let mut walk = Walk {
            snapshot,
            ontology: &ontology,
            steps: &pattern.steps,
            as_of,
            known_at,
            max_hops: self.config.max_hops,
            result_cap: self.config.result_cap,
            deadline,
            cancel,
            root: EntityId::default(),
            path: Vec::new(),
            found: Vec::new(),
            reasons: BTreeSet::new(),
            stopped: false,
        };
        for root in roots {
            if walk.should_stop() {
                break;
            }
            walk.root = root;
            walk.walk(root, 0);
        }
        let Walk {
            snapshot,
            found,
            reasons,
            ..
        } = walk;

        let seed = request.semantic_seed.as_deref();
        let pattern_specificity = pattern.specificity();
        let steps = pattern.steps.len().max(1) as f64;
        let mut matches: Vec<QueryMatch> = found
            .into_iter()
            .map(|m| {
                let mut nodes = vec![m.terminal];
                if let Some(last) = m.facts.last() {
                    nodes.push(NodeRef::Fact(last.id));
                }
                let breakdown = ScoreBreakdown {
                    // Longer paths through repeated steps are less specific
                    specificity: pattern_specificity * (steps / m.facts.len().max(1) as f64).min(1.0),
                    recency: self.recency(&m.facts, as_of),
                    similarity: self.similarity(seed, &nodes),
                    confidence: m.facts.iter().map(|f| f.confidence).product(),
                };
                QueryMatch {
                    root: m.root,
                    terminal: m.terminal,
                    facts: m.facts,
                    origin: MatchOrigin::Symbolic,
                    score: self.score(breakdown),
                    breakdown,
                }
            })
            .collect();

        if let Some(seed) = seed {
            let seen: HashSet<NodeRef> = matches.iter().map(|m| m.terminal).collect();
            let visible_fact = |id: &FactId| -> Option<Fact> {
                snapshot.fact(id).and_then(|f| {
                    snapshot
                        .facts_bitemporal(&f.subject, Some(&f.predicate), as_of, known_at)
                        .into_iter()
                        .find(|v| v.id == f.id)
                })
            };
            let neighbors = self.embeddings.search(seed, self.config.semantic_neighbors, |owner| {
                !seen.contains(owner)
                    && match owner {
                        NodeRef::Entity(id) => snapshot.entity(id).is_some(),
                        NodeRef::Fact(id) => visible_fact(id).is_some(),
                    }
            })?;

            for neighbor in neighbors {
                let (root, facts) = match neighbor.owner {
                    NodeRef::Entity(id) => (id, Vec::new()),
                    NodeRef::Fact(id) => match visible_fact(&id) {
                        Some(fact) => (fact.subject, vec![fact]),
                        None => continue,
                    },
                };
                let breakdown = ScoreBreakdown {
                    specificity: 0.0,
                    recency: self.recency(&facts, as_of),
                    similarity: f64::from(neighbor.score).max(0.0),
                    confidence: facts.iter().map(|f| f.confidence).product(),
                };
                matches.push(QueryMatch {
                    root,
                    facts,
                    terminal: neighbor.owner,
                    origin: MatchOrigin::Semantic,
                    score: self.score(breakdown),
                    breakdown,
                });
            }
        }

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        matches.truncate(k);

        let status = if reasons.is_empty() {
            QueryStatus::Complete
        } else {
            let reasons: Vec<TruncationReason> = reasons.into_iter().collect();
            warn!("Query returned partial result: {:?}", reasons);
            QueryStatus::Partial { reasons }
        };
        debug!("Query matched {} results at watermark {}", matches.len(), watermark);

        Ok(QueryResponse {
            matches,
            status,
            as_of,
            known_at,
            watermark,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EmbeddingConfig;
    use crate::facts::{FactCandidate, NewEntity, Provenance};
    use crate::query::{GraphPattern, PathStep};
    use crate::schema::{EntityTypeDef, PredicateDef, RangeSpec, SchemaDiff, SchemaManager};
    use chrono::TimeZone;

    fn ts(year: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<FactStore>,
        embeddings: Arc<EmbeddingIndex>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(ts(2020)));
            let diff = SchemaDiff::new()
                .add_entity_type(EntityTypeDef::new("Company"))
                .add_entity_type(EntityTypeDef::new("Person"))
                .upsert_predicate(PredicateDef::new(
                    "ceo",
                    "Company",
                    RangeSpec::Entity("Person".into()),
                ))
                .upsert_predicate(PredicateDef::new(
                    "subsidiary_of",
                    "Company",
                    RangeSpec::Entity("Company".into()),
                ));
            let schema = Arc::new(SchemaManager::with_initial(clock.clone(), diff).unwrap());
            let store = Arc::new(FactStore::new(schema, clock.clone()));
            let embeddings = Arc::new(EmbeddingIndex::new(store.clone(), &EmbeddingConfig::default()));
            Self {
                store,
                embeddings,
                clock,
            }
        }

        fn entity(&self, ty: &str, name: &str) -> EntityId {
            self.store.create_entity(NewEntity::new(ty, name)).unwrap().id
        }

        fn link(&self, subject: EntityId, predicate: &str, object: EntityId) -> Fact {
            let now = self.clock.now();
            let candidate = FactCandidate::new(
                subject,
                predicate,
                FactObject::Entity(object),
                Provenance::new("S1", now).with_credibility(0.9),
            );
            let head = self.store.head(&subject, predicate).map(|f| f.id);
            self.store.assert_fact(candidate, head).unwrap()
        }

        fn engine(&self, config: QueryConfig) -> QueryEngine {
            QueryEngine::new(self.store.clone(), self.embeddings.clone(), config)
        }
    }

    #[test]
    fn test_single_hop_as_of() {
        let f = Fixture::new();
        let company = f.entity("Company", "CompanyX");
        let alice = f.entity("Person", "Alice");
        let bob = f.entity("Person", "Bob");
        f.link(company, "ceo", alice);
        f.clock.set(ts(2023));
        f.link(company, "ceo", bob);

        let engine = f.engine(QueryConfig::default());
        let pattern = GraphPattern::from_name("CompanyX").step(PathStep::along("ceo"));

        let past = engine
            .query(&QueryRequest::new(pattern.clone()).as_of(ts(2021)), None)
            .unwrap();
        assert_eq!(past.status, QueryStatus::Complete);
        assert_eq!(past.matches.len(), 1);
        assert_eq!(past.matches[0].terminal, NodeRef::Entity(alice));

        let now = engine.query(&QueryRequest::new(pattern), None).unwrap();
        assert_eq!(now.matches[0].terminal, NodeRef::Entity(bob));
    }

    #[test]
    fn test_repeated_step_hits_hop_bound() {
        let f = Fixture::new();
        let chain: Vec<EntityId> = (0..5).map(|i| f.entity("Company", &format!("C{}", i))).collect();
        for pair in chain.windows(2) {
            f.link(pair[0], "subsidiary_of", pair[1]);
        }

        let engine = f.engine(QueryConfig::default());
        let pattern = GraphPattern::from_name("C0").step(PathStep::along("subsidiary_of").repeated());
        let response = engine.query(&QueryRequest::new(pattern), None).unwrap();

        assert_eq!(response.matches.len(), 3);
        assert_eq!(
            response.status,
            QueryStatus::Partial {
                reasons: vec![TruncationReason::MaxHops]
            }
        );
    }

    #[test]
    fn test_result_cap_marks_partial() {
        let f = Fixture::new();
        for i in 0..5 {
            f.entity("Company", &format!("C{}", i));
        }
        let config = QueryConfig {
            result_cap: 2,
            ..QueryConfig::default()
        };
        let response = f
            .engine(config)
            .query(&QueryRequest::new(GraphPattern::from_type("Company")), None)
            .unwrap();
        assert_eq!(response.matches.len(), 2);
        assert!(matches!(
            response.status,
            QueryStatus::Partial { ref reasons } if reasons == &vec![TruncationReason::ResultCap]
        ));
    }

    #[test]
    fn test_cancelled_query_is_partial() {
        let f = Fixture::new();
        f.entity("Company", "CompanyX");
        let cancel = CancelHandle::new();
        cancel.cancel();

        let response = f
            .engine(QueryConfig::default())
            .query(&QueryRequest::new(GraphPattern::anywhere()), Some(&cancel))
            .unwrap();
        assert!(response.matches.is_empty());
        assert_eq!(
            response.status,
            QueryStatus::Partial {
                reasons: vec![TruncationReason::Cancelled]
            }
        );
    }

    #[test]
    fn test_zero_deadline_is_partial() {
        let f = Fixture::new();
        f.entity("Company", "CompanyX");
        let response = f
            .engine(QueryConfig::default())
            .query(
                &QueryRequest::new(GraphPattern::anywhere()).with_deadline_ms(0),
                None,
            )
            .unwrap();
        assert!(response.status.is_partial());
    }

    #[test]
    fn test_unknown_anchor_is_error() {
        let f = Fixture::new();
        let err = f
            .engine(QueryConfig::default())
            .query(&QueryRequest::new(GraphPattern::from_name("Nobody")), None)
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::NotFound(_)));
    }

    #[test]
    fn test_semantic_seed_blends_neighbours() {
        let f = Fixture::new();
        let acme = f.entity("Company", "Acme");
        let globex = f.entity("Company", "Globex");
        let initech = f.entity("Company", "Initech");
        f.embeddings.upsert(NodeRef::Entity(acme), vec![1.0, 0.0], "m").unwrap();
        f.embeddings.upsert(NodeRef::Entity(globex), vec![0.0, 1.0], "m").unwrap();
        f.embeddings.upsert(NodeRef::Entity(initech), vec![0.7, 0.7], "m").unwrap();

        let engine = f.engine(QueryConfig::default());
        let response = engine
            .query(
                &QueryRequest::new(GraphPattern::from_type("Company")).seeded(vec![0.0, 1.0]),
                None,
            )
            .unwrap();
        assert_eq!(response.matches[0].terminal, NodeRef::Entity(globex));
        assert!(response.matches[0].breakdown.similarity > 0.99);

        let err = engine
            .query(&QueryRequest::new(GraphPattern::anywhere()).seeded(vec![1.0]), None)
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_query_async_on_blocking_pool() {
        let f = Fixture::new();
        f.entity("Company", "CompanyX");
        let engine = Arc::new(f.engine(QueryConfig::default()));

        let response = tokio_test::block_on(
            engine.query_async(QueryRequest::new(GraphPattern::from_name("CompanyX")), None),
        )
        .unwrap();
        assert_eq!(response.matches.len(), 1);
        assert_eq!(response.status, QueryStatus::Complete);
    }
}
