//! Query engine: bounded graph traversal blended with vector similarity

pub mod engine;
pub mod pattern;
pub mod ranking;

pub use engine::{MatchOrigin, QueryEngine, QueryMatch, QueryResponse, QueryStatus, TruncationReason};
pub use pattern::{Anchor, GraphPattern, PathStep, QueryRequest, Target};
pub use ranking::{RankingPolicy, ScoreBreakdown};
