//! Wiring of the substrate components
//!
//! Ingestion flows through truth maintenance into the fact store; queries
//! read store snapshots plus the embedding index; working memory stages
//! what queries return.

use crate::archive::Archive;
use crate::cancel::CancelHandle;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::embedding::EmbeddingIndex;
use crate::error::Result;
use crate::facts::FactStore;
use crate::memory::WorkingMemoryManager;
use crate::query::QueryEngine;
use crate::schema::{run_curation_sweep, CurationReport, SchemaManager};
use crate::truth::{IngestionPipeline, SourceReliability, StaticReliability, TruthMaintenance};
use std::sync::Arc;
use tracing::info;

pub struct Substrate {
    config: Config,
    clock: Arc<dyn Clock>,
    schema: Arc<SchemaManager>,
    store: Arc<FactStore>,
    embeddings: Arc<EmbeddingIndex>,
    truth: Arc<TruthMaintenance>,
    query: Arc<QueryEngine>,
    memory: Arc<WorkingMemoryManager>,
}

impl Substrate {
    /// Empty substrate on the wall clock
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let schema = Arc::new(SchemaManager::new(clock.clone()));
        Self::with_schema(config, clock, schema, Arc::new(StaticReliability::new()))
    }

    /// Build on an existing schema manager and source reliability registry
    pub fn with_schema(
        config: Config,
        clock: Arc<dyn Clock>,
        schema: Arc<SchemaManager>,
        sources: Arc<dyn SourceReliability>,
    ) -> Result<Self> {
        let store = Arc::new(FactStore::new(schema.clone(), clock.clone()));
        Self::assemble(config, clock, schema, store, sources)
    }

    fn assemble(
        config: Config,
        clock: Arc<dyn Clock>,
        schema: Arc<SchemaManager>,
        store: Arc<FactStore>,
        sources: Arc<dyn SourceReliability>,
    ) -> Result<Self> {
        config.validate()?;
        let embeddings = Arc::new(EmbeddingIndex::new(store.clone(), &config.embedding));
        let truth = Arc::new(TruthMaintenance::new(store.clone(), &config.truth, sources));
        let query = Arc::new(QueryEngine::new(
            store.clone(),
            embeddings.clone(),
            config.query.clone(),
        ));
        let memory = Arc::new(WorkingMemoryManager::new(
            config.working_memory.clone(),
            clock.clone(),
        ));

        Ok(Self {
            config,
            clock,
            schema,
            store,
            embeddings,
            truth,
            query,
            memory,
        })
    }

    /// Rebuild from an archive
    pub fn from_archive(
        config: Config,
        clock: Arc<dyn Clock>,
        sources: Arc<dyn SourceReliability>,
        archive: Archive,
    ) -> Result<Self> {
        let schema = Arc::new(SchemaManager::from_log(clock.clone(), archive.ontology)?);
        let store = Arc::new(FactStore::restore(
            schema.clone(),
            clock.clone(),
            archive.entities,
            archive.facts,
        )?);
        let substrate = Self::assemble(config, clock, schema, store, sources)?;
        substrate.embeddings.restore(archive.embeddings)?;

        let log = substrate.truth.conflict_log();
        for conflict in archive.conflicts {
            let id = conflict.record.id;
            let mut fingerprints = conflict.fingerprints.into_iter();
            match fingerprints.next() {
                Some(first) => log.insert(conflict.record, first),
                None => log.update(conflict.record),
            }
            for fingerprint in fingerprints {
                log.alias(fingerprint, id);
            }
        }

        info!(
            "Restored substrate: {} entities, {} fact versions, ontology v{}",
            substrate.store.entity_count(),
            substrate.store.fact_count(),
            substrate.schema.active_version()
        );
        Ok(substrate)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn schema(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    pub fn store(&self) -> &Arc<FactStore> {
        &self.store
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingIndex> {
        &self.embeddings
    }

    pub fn truth(&self) -> &Arc<TruthMaintenance> {
        &self.truth
    }

    pub fn query_engine(&self) -> &Arc<QueryEngine> {
        &self.query
    }

    pub fn memory(&self) -> &Arc<WorkingMemoryManager> {
        &self.memory
    }

    /// Spawn the sharded ingestion workers; requires a tokio runtime
    pub fn start_pipeline(&self) -> IngestionPipeline {
        IngestionPipeline::start(self.truth.clone(), &self.config.truth)
    }

    /// Check current facts against the active ontology
    pub async fn curation_sweep(&self, cancel: CancelHandle) -> Result<CurationReport> {
        run_curation_sweep(self.store.clone(), None, cancel).await
    }

    pub fn archive(&self) -> Archive {
        Archive::capture(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::NewEntity;

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.working_memory.capacity = 0;
        assert!(Substrate::new(config).is_err());
    }

    #[test]
    fn test_components_share_store() {
        let substrate = Substrate::new(Config::default()).unwrap();
        let schema = substrate.schema();
        let id = schema
            .propose_change(
                crate::schema::SchemaDiff::new()
                    .add_entity_type(crate::schema::EntityTypeDef::new("Person")),
            )
            .unwrap();
        schema.approve(id).unwrap();

        let entity = substrate
            .truth()
            .create_entity(NewEntity::new("Person", "Alice"))
            .unwrap();
        assert!(substrate.store().get_entity(&entity.id).is_ok());
        assert_eq!(substrate.store().entity_count(), 1);
    }
}
