//! Ontology version manager
//!
//! Versioned entity types and predicates, change proposals and the
//! curation sweep that flags facts a newer version no longer accepts.

pub mod manager;
pub mod models;
pub mod sweep;

pub use manager::{CurationFlag, SchemaManager};
pub use models::*;
pub use sweep::{run_curation_sweep, CurationReport};
