//! MessagePack archive of the logical store
//!
//! Facts are archived as versioned records keyed by (subject, predicate,
//! version) with their closures, so transaction-time reads survive a round
//! trip. Working memory is session state and is not archived.

use crate::embedding::EmbeddingRecord;
use crate::error::{KnowledgeError, Result};
use crate::facts::{Entity, FactRecord};
use crate::schema::OntologyVersion;
use crate::substrate::Substrate;
use crate::truth::ConflictRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub const ARCHIVE_FORMAT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedConflict {
    pub record: ConflictRecord,
    pub fingerprints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub format: u32,
    pub exported_at: DateTime<Utc>,
    /// Commit watermark at capture time
    pub watermark: u64,
    pub ontology: Vec<OntologyVersion>,
    pub entities: Vec<Entity>,
    pub facts: Vec<FactRecord>,
    pub embeddings: Vec<EmbeddingRecord>,
    #[serde(default)]
    pub conflicts: Vec<ArchivedConflict>,
}

impl Archive {
    pub fn capture(substrate: &Substrate) -> Self {
        let store = substrate.store();
        let watermark = store.snapshot().watermark();
        let (entities, facts) = store.export_records();
        let ontology = substrate
            .schema()
            .history()
            .iter()
            .map(|v| v.as_ref().clone())
            .collect();
        let conflicts = substrate
            .truth()
            .conflict_log()
            .export()
            .into_iter()
            .map(|(record, fingerprints)| ArchivedConflict {
                record,
                fingerprints,
            })
            .collect();

        Self {
            format: ARCHIVE_FORMAT,
            exported_at: substrate.clock().now(),
            watermark,
            ontology,
            entities,
            facts,
            embeddings: substrate.embeddings().records(),
            conflicts,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let archive: Archive = rmp_serde::from_slice(bytes)?;
        if archive.format != ARCHIVE_FORMAT {
            return Err(KnowledgeError::Serialization(format!(
                "unsupported archive format {}",
                archive.format
            )));
        }
        Ok(archive)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), &bytes).map_err(|e| {
            KnowledgeError::Serialization(format!(
                "failed to write {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        info!(
            "Archived {} entities and {} fact versions to {} ({} bytes)",
            self.entities.len(),
            self.facts.len(),
            path.as_ref().display(),
            bytes.len()
        );
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(|e| {
            KnowledgeError::Serialization(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::Config;
    use crate::facts::{FactCandidate, FactObject, NewEntity, NodeRef, Provenance};
    use crate::schema::{EntityTypeDef, PredicateDef, RangeSpec, SchemaDiff};
    use crate::truth::StaticReliability;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    #[test]
    fn test_archive_round_trip_preserves_history() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let substrate = Substrate::with_clock(Config::default(), clock.clone()).unwrap();
        let proposal = substrate
            .schema()
            .propose_change(
                SchemaDiff::new()
                    .add_entity_type(EntityTypeDef::new("Organization"))
                    .add_entity_type(EntityTypeDef::new("Person"))
                    .upsert_predicate(PredicateDef::new(
                        "ceo",
                        "Organization",
                        RangeSpec::Entity("Person".into()),
                    )),
            )
            .unwrap();
        substrate.schema().approve(proposal).unwrap();

        let store = substrate.store();
        let acme = store.create_entity(NewEntity::new("Organization", "Acme")).unwrap();
        let alice = store.create_entity(NewEntity::new("Person", "Alice")).unwrap();
        let bob = store.create_entity(NewEntity::new("Person", "Bob")).unwrap();

        let first = store
            .assert_fact(
                FactCandidate::new(
                    acme.id,
                    "ceo",
                    FactObject::Entity(alice.id),
                    Provenance::new("S1", start),
                )
                .valid_from(start),
                None,
            )
            .unwrap();
        clock.advance(Duration::days(30));
        store
            .assert_fact(
                FactCandidate::new(
                    acme.id,
                    "ceo",
                    FactObject::Entity(bob.id),
                    Provenance::new("S1", clock.now()),
                )
                .valid_from(clock.now()),
                Some(first.id),
            )
            .unwrap();
        substrate
            .embeddings()
            .upsert(NodeRef::Entity(acme.id), vec![1.0, 0.0], "test-model")
            .unwrap();

        let bytes = substrate.archive().to_bytes().unwrap();
        let archive = Archive::from_bytes(&bytes).unwrap();
        let restored = Substrate::from_archive(
            Config::default(),
            clock.clone(),
            Arc::new(StaticReliability::new()),
            archive,
        )
        .unwrap();

        let history = restored.store().get_history(&acme.id, "ceo");
        assert_eq!(history.len(), 2);
        assert_eq!(
            restored.store().head(&acme.id, "ceo").unwrap().object,
            FactObject::Entity(bob.id)
        );
        let earlier = restored
            .store()
            .get_facts_as_of(&acme.id, Some("ceo"), start + Duration::days(1));
        assert_eq!(earlier[0].object, FactObject::Entity(alice.id));
        assert_eq!(restored.embeddings().len(), 1);
        assert_eq!(restored.schema().active_version(), 1);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let substrate = Substrate::new(Config::default()).unwrap();
        let mut archive = substrate.archive();
        archive.format = 99;
        let bytes = archive.to_bytes().unwrap();
        assert!(matches!(
            Archive::from_bytes(&bytes),
            Err(KnowledgeError::Serialization(_))
        ));
    }
}
