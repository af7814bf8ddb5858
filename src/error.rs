//! Error taxonomy for the knowledge substrate
//!
//! Contradictions below the auto-resolution margin, truncated queries and
//! rejected working-memory insertions are not errors; they surface as
//! outcome variants on the respective operations.

use thiserror::Error;

/// Typed schema validation failure
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),

    #[error("unknown predicate '{0}'")]
    UnknownPredicate(String),

    #[error("predicate '{predicate}' expects subject of type '{expected}', got '{actual}'")]
    DomainMismatch {
        predicate: String,
        expected: String,
        actual: String,
    },

    #[error("predicate '{predicate}' expects object {expected}, got {actual}")]
    RangeMismatch {
        predicate: String,
        expected: String,
        actual: String,
    },

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("ontology version {0} does not exist")]
    UnknownVersion(u64),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
}

/// Main error type
#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("Schema violation: {0}")]
    SchemaViolation(#[from] ValidationError),

    #[error("Version conflict on ({subject}, {predicate}): expected head {expected}, found {actual}")]
    VersionConflict {
        subject: String,
        predicate: String,
        expected: String,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Invalid temporal range: {0}")]
    InvalidTemporalRange(String),

    #[error("Embedding owner {0} does not exist")]
    OrphanEmbedding(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KnowledgeError {
    /// Whether the caller should reread the current head and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, KnowledgeError::VersionConflict { .. })
    }

    /// Stable machine-readable code, used by the HTTP surface
    pub fn code(&self) -> &'static str {
        match self {
            KnowledgeError::SchemaViolation(_) => "SCHEMA_VIOLATION",
            KnowledgeError::VersionConflict { .. } => "VERSION_CONFLICT",
            KnowledgeError::NotFound(_) => "NOT_FOUND",
            KnowledgeError::InvalidCandidate(_) => "INVALID_CANDIDATE",
            KnowledgeError::InvalidTemporalRange(_) => "INVALID_TEMPORAL_RANGE",
            KnowledgeError::OrphanEmbedding(_) => "ORPHAN_EMBEDDING",
            KnowledgeError::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            KnowledgeError::InvalidQuery(_) => "INVALID_QUERY",
            KnowledgeError::Configuration(_) => "CONFIGURATION_ERROR",
            KnowledgeError::Cancelled(_) => "CANCELLED",
            KnowledgeError::Serialization(_) => "SERIALIZATION_ERROR",
            KnowledgeError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for KnowledgeError {
    fn from(e: serde_json::Error) -> Self {
        KnowledgeError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for KnowledgeError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        KnowledgeError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for KnowledgeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        KnowledgeError::Serialization(e.to_string())
    }
}

impl From<::config::ConfigError> for KnowledgeError {
    fn from(e: ::config::ConfigError) -> Self {
        KnowledgeError::Configuration(e.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, KnowledgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_is_retryable() {
        let err = KnowledgeError::VersionConflict {
            subject: "s".into(),
            predicate: "p".into(),
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.code(), "VERSION_CONFLICT");
    }

    #[test]
    fn test_schema_violation_wraps_validation_error() {
        let err: KnowledgeError = ValidationError::UnknownPredicate("marketCapUSD".into()).into();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("marketCapUSD"));
    }
}
