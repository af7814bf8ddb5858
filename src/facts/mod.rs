//! Bitemporal fact store
//!
//! Entities and versioned facts with:
//! - Valid time and transaction time on every fact
//! - Append-only (subject, predicate) version chains with compare-and-set heads
//! - Provenance tracking and confidence
//! - SHA-256 content hashes

pub mod models;
pub mod store;

pub use models::*;
pub use store::{Closure, FactRecord, FactStore, ProvenanceMerge, Snapshot};
