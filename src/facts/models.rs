//! Data models for the fact store

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable entity identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable fact identifier, unique per version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactId(pub Uuid);

impl FactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to either kind of node in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NodeRef {
    Entity(EntityId),
    Fact(FactId),
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Entity(id) => write!(f, "entity:{}", id),
            NodeRef::Fact(id) => write!(f, "fact:{}", id),
        }
    }
}

/// Concurrency and history key: one chain per (subject, predicate)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub subject: EntityId,
    pub predicate: String,
}

impl FactKey {
    pub fn new(subject: EntityId, predicate: impl Into<String>) -> Self {
        Self {
            subject,
            predicate: predicate.into(),
        }
    }
}

/// Kind of a literal value, used for range checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralKind {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl fmt::Display for LiteralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LiteralKind::Text => "text",
            LiteralKind::Integer => "integer",
            LiteralKind::Float => "float",
            LiteralKind::Boolean => "boolean",
            LiteralKind::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// Scalar value in object position or in an entity attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

impl Literal {
    pub fn kind(&self) -> LiteralKind {
        match self {
            Literal::Text(_) => LiteralKind::Text,
            Literal::Integer(_) => LiteralKind::Integer,
            Literal::Float(_) => LiteralKind::Float,
            Literal::Boolean(_) => LiteralKind::Boolean,
            Literal::Timestamp(_) => LiteralKind::Timestamp,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Text(s) => write!(f, "{}", s),
            Literal::Integer(i) => write!(f, "{}", i),
            Literal::Float(x) => write!(f, "{}", x),
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::Text(s.to_string())
    }
}

impl From<i64> for Literal {
    fn from(i: i64) -> Self {
        Literal::Integer(i)
    }
}

impl From<f64> for Literal {
    fn from(x: f64) -> Self {
        Literal::Float(x)
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Boolean(b)
    }
}

/// Object position of a fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactObject {
    Entity(EntityId),
    Literal(Literal),
}

impl FactObject {
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            FactObject::Entity(id) => Some(*id),
            FactObject::Literal(_) => None,
        }
    }
}

impl fmt::Display for FactObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactObject::Entity(id) => write!(f, "entity:{}", id),
            FactObject::Literal(lit) => write!(f, "literal:{}", lit),
        }
    }
}

/// Where a fact came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub observed_at: DateTime<Utc>,
    /// Externally supplied reliability for this observation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credibility_hint: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

impl Provenance {
    pub fn new(source: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            observed_at,
            credibility_hint: None,
            doc_id: None,
        }
    }

    pub fn with_credibility(mut self, hint: f64) -> Self {
        self.credibility_hint = Some(hint.clamp(0.0, 1.0));
        self
    }

    pub fn with_doc(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }
}

/// Entity node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    pub canonical_name: String,
    #[serde(default)]
    pub attributes: IndexMap<String, Literal>,
    pub created_at: DateTime<Utc>,
    /// Ontology version the entity was validated against
    pub schema_version: u64,
}

/// Request to create an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntity {
    pub entity_type: String,
    pub canonical_name: String,
    #[serde(default)]
    pub attributes: IndexMap<String, Literal>,
}

impl NewEntity {
    pub fn new(entity_type: impl Into<String>, canonical_name: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            canonical_name: canonical_name.into(),
            attributes: IndexMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Literal>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Strongly typed candidate, ready for validation and commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCandidate {
    pub subject: EntityId,
    pub predicate: String,
    pub object: FactObject,
    pub valid_from: DateTime<Utc>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
    pub provenance: Provenance,
    pub confidence: f64,
}

impl FactCandidate {
    pub fn new(
        subject: EntityId,
        predicate: impl Into<String>,
        object: FactObject,
        provenance: Provenance,
    ) -> Self {
        let valid_from = provenance.observed_at;
        let confidence = provenance.credibility_hint.unwrap_or(0.5);
        Self {
            subject,
            predicate: predicate.into(),
            object,
            valid_from,
            valid_to: None,
            provenance,
            confidence,
        }
    }

    pub fn valid_from(mut self, t: DateTime<Utc>) -> Self {
        self.valid_from = t;
        self
    }

    pub fn valid_until(mut self, t: DateTime<Utc>) -> Self {
        self.valid_to = Some(t);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn key(&self) -> FactKey {
        FactKey::new(self.subject, self.predicate.clone())
    }

    /// Content hash over subject, predicate, object, source and validity window
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        let content = compute_hash(
            &self.subject,
            &self.predicate,
            &self.object,
            Some(self.provenance.source.as_str()),
        );
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hasher.update(b"|");
        hasher.update(self.valid_from.to_rfc3339().as_bytes());
        hasher.update(b"|");
        if let Some(valid_to) = self.valid_to {
            hasher.update(valid_to.to_rfc3339().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Versioned, bitemporal assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub subject: EntityId,
    pub predicate: String,
    pub object: FactObject,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    /// Transaction time
    pub assertion_time: DateTime<Utc>,
    pub provenance: Vec<Provenance>,
    pub confidence: f64,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<FactId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<FactId>,
    pub schema_version: u64,
    pub hash: String,
}

impl Fact {
    pub fn key(&self) -> FactKey {
        FactKey::new(self.subject, self.predicate.clone())
    }

    /// No end of validity recorded
    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    /// `valid_from <= t < valid_to`
    pub fn is_valid_at(&self, t: DateTime<Utc>) -> bool {
        self.valid_from <= t && self.valid_to.map_or(true, |end| t < end)
    }

    /// Shares at least one instant with `[from, to)`
    pub fn overlaps(&self, from: DateTime<Utc>, to: Option<DateTime<Utc>>) -> bool {
        windows_overlap(self.valid_from, self.valid_to, from, to)
    }

    /// Point-in-time visibility: valid at `t` and already asserted at `t`
    pub fn visible_as_of(&self, t: DateTime<Utc>) -> bool {
        self.assertion_time <= t && self.is_valid_at(t)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.provenance.iter().map(|p| p.source.as_str())
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.provenance.iter().any(|p| p.source == source)
    }

    pub fn meets_threshold(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

/// Half-open validity windows sharing an instant; empty windows share none
pub fn windows_overlap(
    a_from: DateTime<Utc>,
    a_to: Option<DateTime<Utc>>,
    b_from: DateTime<Utc>,
    b_to: Option<DateTime<Utc>>,
) -> bool {
    let empty = |from: DateTime<Utc>, to: Option<DateTime<Utc>>| to.map_or(false, |end| end <= from);
    if empty(a_from, a_to) || empty(b_from, b_to) {
        return false;
    }
    a_to.map_or(true, |end| b_from < end) && b_to.map_or(true, |end| a_from < end)
}

/// SHA-256 over the triple (and optionally a source)
pub fn compute_hash(
    subject: &EntityId,
    predicate: &str,
    object: &FactObject,
    source: Option<&str>,
) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(subject.0.as_bytes());
    hasher.update(b"|");
    hasher.update(predicate.as_bytes());
    hasher.update(b"|");
    hasher.update(object.to_string().as_bytes());
    if let Some(source) = source {
        hasher.update(b"|");
        hasher.update(source.as_bytes());
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(year: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap()
    }

    fn sample_fact(valid_from: DateTime<Utc>, valid_to: Option<DateTime<Utc>>) -> Fact {
        let subject = EntityId::new();
        let object = FactObject::Literal(Literal::from("Alice"));
        Fact {
            id: FactId::new(),
            subject,
            predicate: "ceo".to_string(),
            hash: compute_hash(&subject, "ceo", &object, None),
            object,
            valid_from,
            valid_to,
            assertion_time: valid_from,
            provenance: vec![Provenance::new("S1", valid_from)],
            confidence: 0.9,
            version: 1,
            supersedes: None,
            superseded_by: None,
            schema_version: 1,
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let subject = EntityId::new();
        let object = FactObject::Literal(Literal::from("Alice"));

        let a = compute_hash(&subject, "ceo", &object, Some("S1"));
        let b = compute_hash(&subject, "ceo", &object, Some("S1"));
        let c = compute_hash(&subject, "ceo", &object, Some("S2"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_valid_time_window_is_half_open() {
        let fact = sample_fact(ts(2020), Some(ts(2023)));
        assert!(fact.is_valid_at(ts(2020)));
        assert!(fact.is_valid_at(ts(2022)));
        assert!(!fact.is_valid_at(ts(2023)));
        assert!(!fact.is_valid_at(ts(2019)));
        assert!(!fact.is_current());
    }

    #[test]
    fn test_visibility_requires_assertion() {
        let mut fact = sample_fact(ts(2020), None);
        fact.assertion_time = ts(2022);
        assert!(!fact.visible_as_of(ts(2021)));
        assert!(fact.visible_as_of(ts(2022)));
    }

    #[test]
    fn test_candidate_defaults_from_provenance() {
        let provenance = Provenance::new("S1", ts(2021)).with_credibility(1.4);
        let candidate = FactCandidate::new(
            EntityId::new(),
            "ceo",
            FactObject::Literal(Literal::from("Alice")),
            provenance,
        );

        assert_eq!(candidate.valid_from, ts(2021));
        assert_eq!(candidate.confidence, 1.0);
        assert_eq!(candidate.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_covers_validity_window() {
        let candidate = FactCandidate::new(
            EntityId::new(),
            "ceo",
            FactObject::Literal(Literal::from("Alice")),
            Provenance::new("S1", ts(2020)),
        );
        let later = candidate.clone().valid_from(ts(2021));
        let bounded = candidate.clone().valid_until(ts(2022));

        assert_eq!(candidate.fingerprint(), candidate.clone().fingerprint());
        assert_ne!(candidate.fingerprint(), later.fingerprint());
        assert_ne!(candidate.fingerprint(), bounded.fingerprint());
    }

    #[test]
    fn test_window_overlap_is_half_open() {
        assert!(windows_overlap(ts(2020), None, ts(2021), Some(ts(2022))));
        assert!(!windows_overlap(ts(2020), Some(ts(2021)), ts(2021), None));
        assert!(windows_overlap(ts(2015), Some(ts(2018)), ts(2016), Some(ts(2019))));
        // An empty window holds no instant
        assert!(!windows_overlap(ts(2020), Some(ts(2020)), ts(2015), None));
    }
}
