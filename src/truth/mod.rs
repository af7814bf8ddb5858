//! Truth maintenance unit
//!
//! Validate-then-convert at the ingestion boundary, credibility scoring,
//! conflict records and the sharded ingestion pipeline.

pub mod candidate;
pub mod conflict;
pub mod credibility;
pub mod maintenance;
pub mod pipeline;

pub use candidate::{resolve_entity, RawCandidate, RawObject};
pub use conflict::{
    conflict_fingerprint, ConflictId, ConflictLog, ConflictRecord, ConflictStatus, Resolution,
};
pub use credibility::{CredibilityModel, CredibilityScore, SourceReliability, StaticReliability};
pub use maintenance::{IngestOutcome, TruthMaintenance};
pub use pipeline::IngestionPipeline;
