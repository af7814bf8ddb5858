//! Knowledge substrate
//!
//! A bitemporal fact store kept consistent by a truth maintenance unit,
//! validated against a versioned ontology, queried through bounded hybrid
//! graph/vector retrieval and staged into per-session working memory.

pub mod api;
pub mod archive;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod embedding;
pub mod error;
pub mod facts;
pub mod memory;
pub mod metrics;
pub mod query;
pub mod schema;
pub mod substrate;
pub mod telemetry;
pub mod truth;

pub use error::{KnowledgeError, Result, ValidationError};
pub use substrate::Substrate;

pub mod prelude {
    pub use crate::cancel::CancelHandle;
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::error::{KnowledgeError, Result, ValidationError};
    pub use crate::facts::{
        Entity, EntityId, Fact, FactCandidate, FactId, FactObject, Literal, NewEntity, NodeRef,
        Provenance,
    };
    pub use crate::memory::{GoalContext, SessionId, StageOutcome, StageRequest};
    pub use crate::query::{Anchor, GraphPattern, PathStep, QueryRequest, QueryStatus, Target};
    pub use crate::schema::{EntityTypeDef, PredicateDef, RangeSpec, SchemaDiff};
    pub use crate::substrate::Substrate;
    pub use crate::truth::{IngestOutcome, RawCandidate, RawObject, Resolution};
}
