//! Background validation of current facts against an ontology version
//!
//! The sweep reads one snapshot and never writes facts. Flags are published
//! to the schema manager only when the sweep finishes; a cancelled sweep
//! publishes nothing.

use super::manager::CurationFlag;
use super::models::ObjectShape;
use crate::cancel::CancelHandle;
use crate::error::{KnowledgeError, Result, ValidationError};
use crate::facts::{FactObject, FactStore};
use crate::metrics::METRICS;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Entities checked between cooperative yields
const SWEEP_BATCH: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationReport {
    pub version: u64,
    pub facts_checked: usize,
    pub flagged: Vec<CurationFlag>,
}

/// Check every current fact against `version` (the active version when `None`)
pub async fn run_curation_sweep(
    store: Arc<FactStore>,
    version: Option<u64>,
    cancel: CancelHandle,
) -> Result<CurationReport> {
    let schema = store.schema().clone();
    let version = version.unwrap_or_else(|| schema.active_version());
    if schema.version(version).is_none() {
        return Err(ValidationError::UnknownVersion(version).into());
    }

    let snapshot = store.snapshot();
    let entities = snapshot.entities();
    let mut facts_checked = 0;
    let mut flagged = Vec::new();

    for (i, entity) in entities.iter().enumerate() {
        if i % SWEEP_BATCH == 0 {
            if cancel.is_cancelled() {
                warn!("Curation sweep against v{} cancelled after {} facts", version, facts_checked);
                return Err(KnowledgeError::Cancelled(format!(
                    "curation sweep against version {}",
                    version
                )));
            }
            tokio::task::yield_now().await;
        }

        for fact in snapshot.current_facts(&entity.id, None) {
            facts_checked += 1;
            let object_type = match &fact.object {
                FactObject::Entity(id) => snapshot.entity(id).map(|e| e.entity_type.clone()),
                FactObject::Literal(_) => None,
            };
            let shape = match (&fact.object, &object_type) {
                (FactObject::Literal(lit), _) => ObjectShape::Literal(lit.kind()),
                (FactObject::Entity(_), Some(ty)) => ObjectShape::Entity(ty),
                (FactObject::Entity(id), None) => {
                    flagged.push(CurationFlag {
                        fact_id: fact.id,
                        asserted_under: fact.schema_version,
                        checked_against: version,
                        error: ValidationError::UnknownEntity(id.to_string()),
                    });
                    continue;
                }
            };

            if let Err(error) =
                schema.validate_fact(&entity.entity_type, &fact.predicate, &shape, Some(version))
            {
                flagged.push(CurationFlag {
                    fact_id: fact.id,
                    asserted_under: fact.schema_version,
                    checked_against: version,
                    error,
                });
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(KnowledgeError::Cancelled(format!(
            "curation sweep against version {}",
            version
        )));
    }

    METRICS.curation_flags.inc_by(flagged.len() as f64);
    schema.publish_flags(flagged.clone());
    info!(
        "Curation sweep against v{} checked {} facts, flagged {}",
        version,
        facts_checked,
        flagged.len()
    );

    Ok(CurationReport {
        version,
        facts_checked,
        flagged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::facts::{FactCandidate, Literal, LiteralKind, NewEntity, Provenance};
    use crate::schema::{EntityTypeDef, PredicateDef, RangeSpec, SchemaDiff, SchemaManager};
    use chrono::Utc;

    fn store_with_ticker() -> Arc<FactStore> {
        let diff = SchemaDiff::new()
            .add_entity_type(EntityTypeDef::new("Company"))
            .upsert_predicate(PredicateDef::new(
                "ticker",
                "Company",
                RangeSpec::Literal(LiteralKind::Text),
            ));
        let clock = Arc::new(SystemClock);
        let schema = Arc::new(SchemaManager::with_initial(clock.clone(), diff).unwrap());
        let store = Arc::new(FactStore::new(schema, clock));
        let company = store.create_entity(NewEntity::new("Company", "CompanyX")).unwrap();
        store
            .assert_fact(
                FactCandidate::new(
                    company.id,
                    "ticker",
                    FactObject::Literal(Literal::from("CPX")),
                    Provenance::new("S1", Utc::now()),
                ),
                None,
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_narrowed_version_flags_without_deleting() {
        let store = store_with_ticker();
        let schema = store.schema().clone();
        let narrowed = SchemaDiff::new().upsert_predicate(PredicateDef::new(
            "ticker",
            "Company",
            RangeSpec::Literal(LiteralKind::Integer),
        ));
        let id = schema.propose_change(narrowed).unwrap();
        schema.approve(id).unwrap();

        let report = run_curation_sweep(store.clone(), None, CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(report.version, 2);
        assert_eq!(report.facts_checked, 1);
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].asserted_under, 1);
        assert_eq!(schema.curation_flags().len(), 1);
        assert_eq!(store.fact_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_publishes_nothing() {
        let store = store_with_ticker();
        let cancel = CancelHandle::new();
        cancel.cancel();

        let result = run_curation_sweep(store.clone(), None, cancel).await;
        assert!(matches!(result, Err(KnowledgeError::Cancelled(_))));
        assert!(store.schema().curation_flags().is_empty());
    }
}
