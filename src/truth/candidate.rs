//! Ingestion records and their conversion to typed candidates

use crate::error::{KnowledgeError, Result, ValidationError};
use crate::facts::{EntityId, FactCandidate, FactObject, Literal, Provenance, Snapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Object position as delivered by ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawObject {
    /// `{"entity": "<uuid or canonical name>"}`
    Entity { entity: String },
    /// `{"timestamp": "<rfc3339>"}`
    Timestamp { timestamp: DateTime<Utc> },
    Value(serde_json::Value),
}

/// Candidate-fact record as it arrives from an external connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandidate {
    /// Entity id or canonical name
    pub subject: String,
    pub predicate: String,
    pub object: RawObject,
    pub source: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub credibility_hint: Option<f64>,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub doc_id: Option<String>,
}

fn unit_interval(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) => Err(KnowledgeError::InvalidCandidate(format!(
            "{} must be within [0, 1], got {}",
            name, v
        ))),
        _ => Ok(()),
    }
}

/// Resolve an entity reference given as a UUID or a canonical name
pub fn resolve_entity(snapshot: &Snapshot<'_>, reference: &str) -> Result<EntityId> {
    let reference = reference.trim();
    if let Ok(uuid) = Uuid::parse_str(reference) {
        let id = EntityId(uuid);
        if snapshot.entity(&id).is_some() {
            return Ok(id);
        }
    }
    snapshot
        .entity_by_name(reference)
        .map(|e| e.id)
        .ok_or_else(|| ValidationError::UnknownEntity(reference.to_string()).into())
}

fn parse_object(snapshot: &Snapshot<'_>, object: &RawObject) -> Result<FactObject> {
    let literal = match object {
        RawObject::Entity { entity } => return Ok(FactObject::Entity(resolve_entity(snapshot, entity)?)),
        RawObject::Timestamp { timestamp } => Literal::Timestamp(*timestamp),
        RawObject::Value(serde_json::Value::String(s)) => Literal::Text(s.clone()),
        RawObject::Value(serde_json::Value::Bool(b)) => Literal::Boolean(*b),
        RawObject::Value(serde_json::Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Literal::Integer(i),
            (None, Some(x)) => Literal::Float(x),
            _ => {
                return Err(KnowledgeError::InvalidCandidate(format!(
                    "unsupported number {}",
                    n
                )))
            }
        },
        RawObject::Value(other) => {
            return Err(KnowledgeError::InvalidCandidate(format!(
                "object must be a scalar or an entity reference, got {}",
                other
            )))
        }
    };
    Ok(FactObject::Literal(literal))
}

impl RawCandidate {
    /// Validate the record and convert it against `snapshot`
    pub fn parse(&self, snapshot: &Snapshot<'_>) -> Result<FactCandidate> {
        if self.predicate.trim().is_empty() {
            return Err(KnowledgeError::InvalidCandidate("predicate cannot be empty".to_string()));
        }
        if self.source.trim().is_empty() {
            return Err(KnowledgeError::InvalidCandidate("source cannot be empty".to_string()));
        }
        unit_interval("credibilityHint", self.credibility_hint)?;
        unit_interval("confidence", self.confidence)?;

        let subject = resolve_entity(snapshot, &self.subject)?;
        let object = parse_object(snapshot, &self.object)?;

        let mut provenance = Provenance::new(self.source.trim(), self.observed_at);
        if let Some(hint) = self.credibility_hint {
            provenance = provenance.with_credibility(hint);
        }
        if let Some(doc) = &self.doc_id {
            provenance = provenance.with_doc(doc.clone());
        }

        let mut candidate = FactCandidate::new(subject, self.predicate.trim(), object, provenance);
        if let Some(from) = self.valid_from {
            candidate = candidate.valid_from(from);
        }
        if let Some(to) = self.valid_to {
            if to <= candidate.valid_from {
                return Err(KnowledgeError::InvalidTemporalRange(format!(
                    "validTo {} is not after validFrom {}",
                    to, candidate.valid_from
                )));
            }
            candidate = candidate.valid_until(to);
        }
        if let Some(confidence) = self.confidence {
            candidate = candidate.with_confidence(confidence);
        }
        Ok(candidate)
    }
}
