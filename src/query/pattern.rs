//! Graph patterns and query requests

use crate::facts::{EntityId, Literal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where traversal starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anchor {
    Entity { id: EntityId },
    /// Canonical name, case-insensitive
    Named { name: String },
    /// Every entity of this type or a subtype
    Type { entity_type: String },
    Any,
}

/// Constraint on the object reached by a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Any,
    Entity { id: EntityId },
    Type { entity_type: String },
    Literal { value: Literal },
}

impl Default for Target {
    fn default() -> Self {
        Target::Any
    }
}

/// One edge of the pattern
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PathStep {
    /// `None` matches any predicate
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub target: Target,
    /// Follow the predicate one or more times
    #[serde(default)]
    pub repeat: bool,
}

impl PathStep {
    pub fn along(predicate: impl Into<String>) -> Self {
        Self {
            predicate: Some(predicate.into()),
            ..Self::default()
        }
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn to(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn repeated(mut self) -> Self {
        self.repeat = true;
        self
    }

    /// Number of constrained positions, out of two
    pub(crate) fn constraint_weight(&self) -> f64 {
        let predicate = if self.predicate.is_some() { 1.0 } else { 0.0 };
        let target = match self.target {
            Target::Any => 0.0,
            Target::Type { .. } => 0.5,
            Target::Entity { .. } | Target::Literal { .. } => 1.0,
        };
        predicate + target
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPattern {
    pub anchor: Anchor,
    #[serde(default)]
    pub steps: Vec<PathStep>,
}

impl GraphPattern {
    pub fn from_entity(id: EntityId) -> Self {
        Self {
            anchor: Anchor::Entity { id },
            steps: Vec::new(),
        }
    }

    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            anchor: Anchor::Named { name: name.into() },
            steps: Vec::new(),
        }
    }

    pub fn from_type(entity_type: impl Into<String>) -> Self {
        Self {
            anchor: Anchor::Type {
                entity_type: entity_type.into(),
            },
            steps: Vec::new(),
        }
    }

    pub fn anywhere() -> Self {
        Self {
            anchor: Anchor::Any,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: PathStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Share of pattern positions that are constrained, in [0, 1]
    pub fn specificity(&self) -> f64 {
        let anchor = match self.anchor {
            Anchor::Entity { .. } | Anchor::Named { .. } => 1.0,
            Anchor::Type { .. } => 0.5,
            Anchor::Any => 0.0,
        };
        let constrained: f64 = self.steps.iter().map(PathStep::constraint_weight).sum();
        (anchor + constrained) / (1.0 + 2.0 * self.steps.len() as f64)
    }
}

/// Query input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub pattern: GraphPattern,
    /// Valid time of interest; now when unset
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
    /// Transaction time of interest; `as_of` when unset
    #[serde(default)]
    pub known_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub semantic_seed: Option<Vec<f32>>,
    /// Overrides the configured deadline
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(pattern: GraphPattern) -> Self {
        Self {
            pattern,
            as_of: None,
            known_at: None,
            k: None,
            semantic_seed: None,
            deadline_ms: None,
        }
    }

    pub fn as_of(mut self, t: DateTime<Utc>) -> Self {
        self.as_of = Some(t);
        self
    }

    pub fn known_at(mut self, t: DateTime<Utc>) -> Self {
        self.known_at = Some(t);
        self
    }

    pub fn top(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn seeded(mut self, seed: Vec<f32>) -> Self {
        self.semantic_seed = Some(seed);
        self
    }

    pub fn with_deadline_ms(mut self, ms: u64) -> Self {
        self.deadline_ms = Some(ms);
        self
    }
}
