//! Ontology definitions and versions

use crate::error::ValidationError;
use crate::facts::LiteralKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Upper bound on type-hierarchy depth; deeper chains are treated as cycles
const MAX_TYPE_DEPTH: usize = 64;

/// Whether a predicate may hold several current values per subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    Single,
    Multi,
}

impl Default for Cardinality {
    fn default() -> Self {
        Cardinality::Single
    }
}

/// Allowed object of a predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum RangeSpec {
    Entity(String),
    Literal(LiteralKind),
    Any,
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::Entity(ty) => write!(f, "entity of type '{}'", ty),
            RangeSpec::Literal(kind) => write!(f, "{} literal", kind),
            RangeSpec::Any => f.write_str("any value"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl EntityTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            description: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateDef {
    pub name: String,
    /// Entity type of the subject
    pub domain: String,
    pub range: RangeSpec,
    #[serde(default)]
    pub cardinality: Cardinality,
}

impl PredicateDef {
    pub fn new(name: impl Into<String>, domain: impl Into<String>, range: RangeSpec) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            range,
            cardinality: Cardinality::Single,
        }
    }

    pub fn multi_valued(mut self) -> Self {
        self.cardinality = Cardinality::Multi;
        self
    }

    pub fn is_multi_valued(&self) -> bool {
        self.cardinality == Cardinality::Multi
    }
}

/// Shape of a fact as seen by the validator
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectShape<'a> {
    Entity(&'a str),
    Literal(LiteralKind),
}

impl fmt::Display for ObjectShape<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectShape::Entity(ty) => write!(f, "entity of type '{}'", ty),
            ObjectShape::Literal(kind) => write!(f, "{} literal", kind),
        }
    }
}

/// Change set submitted for approval
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub add_entity_types: Vec<EntityTypeDef>,
    #[serde(default)]
    pub remove_entity_types: Vec<String>,
    /// Added or replaced predicate definitions
    #[serde(default)]
    pub upsert_predicates: Vec<PredicateDef>,
    #[serde(default)]
    pub remove_predicates: Vec<String>,
}

impl SchemaDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn add_entity_type(mut self, def: EntityTypeDef) -> Self {
        self.add_entity_types.push(def);
        self
    }

    pub fn remove_entity_type(mut self, name: impl Into<String>) -> Self {
        self.remove_entity_types.push(name.into());
        self
    }

    pub fn upsert_predicate(mut self, def: PredicateDef) -> Self {
        self.upsert_predicates.push(def);
        self
    }

    pub fn remove_predicate(mut self, name: impl Into<String>) -> Self {
        self.remove_predicates.push(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.add_entity_types.is_empty()
            && self.remove_entity_types.is_empty()
            && self.upsert_predicates.is_empty()
            && self.remove_predicates.is_empty()
    }
}

/// Immutable ontology version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyVersion {
    pub number: u64,
    pub tag: String,
    pub entity_types: BTreeMap<String, EntityTypeDef>,
    pub predicates: BTreeMap<String, PredicateDef>,
    pub effective_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ProposalId>,
}

impl OntologyVersion {
    /// Version 0: nothing is allowed
    pub fn empty(effective_at: DateTime<Utc>) -> Self {
        Self {
            number: 0,
            tag: "v0".to_string(),
            entity_types: BTreeMap::new(),
            predicates: BTreeMap::new(),
            effective_at,
            proposal: None,
        }
    }

    /// Produce the successor version; fails if the result is inconsistent
    pub fn apply(
        &self,
        diff: &SchemaDiff,
        effective_at: DateTime<Utc>,
        proposal: Option<ProposalId>,
    ) -> Result<OntologyVersion, ValidationError> {
        let mut next = self.clone();
        next.number = self.number + 1;
        next.tag = diff
            .tag
            .clone()
            .unwrap_or_else(|| format!("v{}", next.number));
        next.effective_at = effective_at;
        next.proposal = proposal;

        for name in &diff.remove_entity_types {
            if next.entity_types.remove(name).is_none() {
                return Err(ValidationError::UnknownEntityType(name.clone()));
            }
        }
        for name in &diff.remove_predicates {
            if next.predicates.remove(name).is_none() {
                return Err(ValidationError::UnknownPredicate(name.clone()));
            }
        }
        for def in &diff.add_entity_types {
            if def.name.trim().is_empty() {
                return Err(ValidationError::InvalidDefinition(
                    "entity type name cannot be empty".to_string(),
                ));
            }
            next.entity_types.insert(def.name.clone(), def.clone());
        }
        for def in &diff.upsert_predicates {
            if def.name.trim().is_empty() {
                return Err(ValidationError::InvalidDefinition(
                    "predicate name cannot be empty".to_string(),
                ));
            }
            next.predicates.insert(def.name.clone(), def.clone());
        }

        next.check_consistency()?;
        Ok(next)
    }

    /// Every reference resolves and the type hierarchy is acyclic
    pub fn check_consistency(&self) -> Result<(), ValidationError> {
        for def in self.entity_types.values() {
            if let Some(parent) = &def.parent {
                if !self.entity_types.contains_key(parent) {
                    return Err(ValidationError::InvalidDefinition(format!(
                        "entity type '{}' has unknown parent '{}'",
                        def.name, parent
                    )));
                }
            }
            self.ancestry(&def.name)?;
        }
        for def in self.predicates.values() {
            if !self.entity_types.contains_key(&def.domain) {
                return Err(ValidationError::InvalidDefinition(format!(
                    "predicate '{}' has unknown domain '{}'",
                    def.name, def.domain
                )));
            }
            if let RangeSpec::Entity(ty) = &def.range {
                if !self.entity_types.contains_key(ty) {
                    return Err(ValidationError::InvalidDefinition(format!(
                        "predicate '{}' has unknown range '{}'",
                        def.name, ty
                    )));
                }
            }
        }
        Ok(())
    }

    fn ancestry(&self, ty: &str) -> Result<Vec<String>, ValidationError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(ty.to_string());
        while let Some(name) = current {
            if !seen.insert(name.clone()) || chain.len() >= MAX_TYPE_DEPTH {
                return Err(ValidationError::InvalidDefinition(format!(
                    "entity type hierarchy of '{}' contains a cycle",
                    ty
                )));
            }
            current = self
                .entity_types
                .get(&name)
                .and_then(|def| def.parent.clone());
            chain.push(name);
        }
        Ok(chain)
    }

    /// `ty` equals `ancestor` or descends from it
    pub fn is_subtype(&self, ty: &str, ancestor: &str) -> bool {
        self.ancestry(ty)
            .map(|chain| chain.iter().any(|name| name == ancestor))
            .unwrap_or(false)
    }

    pub fn predicate(&self, name: &str) -> Option<&PredicateDef> {
        self.predicates.get(name)
    }

    pub fn validate_entity_type(&self, ty: &str) -> Result<(), ValidationError> {
        if self.entity_types.contains_key(ty) {
            Ok(())
        } else {
            Err(ValidationError::UnknownEntityType(ty.to_string()))
        }
    }

    pub fn validate_fact(
        &self,
        subject_type: &str,
        predicate: &str,
        object: &ObjectShape<'_>,
    ) -> Result<&PredicateDef, ValidationError> {
        self.validate_entity_type(subject_type)?;
        let def = self
            .predicates
            .get(predicate)
            .ok_or_else(|| ValidationError::UnknownPredicate(predicate.to_string()))?;

        if !self.is_subtype(subject_type, &def.domain) {
            return Err(ValidationError::DomainMismatch {
                predicate: predicate.to_string(),
                expected: def.domain.clone(),
                actual: subject_type.to_string(),
            });
        }

        let range_ok = match (&def.range, object) {
            (RangeSpec::Any, ObjectShape::Entity(ty)) => self.entity_types.contains_key(*ty),
            (RangeSpec::Any, ObjectShape::Literal(_)) => true,
            (RangeSpec::Entity(expected), ObjectShape::Entity(ty)) => self.is_subtype(ty, expected),
            (RangeSpec::Literal(expected), ObjectShape::Literal(kind)) => expected == kind,
            _ => false,
        };
        if !range_ok {
            return Err(ValidationError::RangeMismatch {
                predicate: predicate.to_string(),
                expected: def.range.to_string(),
                actual: object.to_string(),
            });
        }

        Ok(def)
    }
}

/// Identifier of a schema change proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved { version: u64 },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub diff: SchemaDiff,
    pub status: ProposalStatus,
    pub proposed_at: DateTime<Utc>,
    /// Active version when the proposal was made
    pub base_version: u64,
}
