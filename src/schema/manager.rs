//! Versioned ontology registry
//!
//! The version log is append-only. The active version is an `Arc` swapped
//! under a write lock only after the new version is fully built and logged,
//! so readers observe either the old or the new version, never a mix.

use super::models::*;
use crate::clock::Clock;
use crate::error::{KnowledgeError, Result, ValidationError};
use crate::facts::{Entity, FactId};
use crate::metrics::METRICS;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Fact that no longer satisfies a later ontology version
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CurationFlag {
    pub fact_id: FactId,
    /// Version the fact was asserted under
    pub asserted_under: u64,
    /// Version it was checked against
    pub checked_against: u64,
    pub error: ValidationError,
}

pub struct SchemaManager {
    log: RwLock<Vec<Arc<OntologyVersion>>>,
    active: RwLock<Arc<OntologyVersion>>,
    proposals: DashMap<ProposalId, Proposal>,
    approve_lock: Mutex<()>,
    curation: DashMap<FactId, CurationFlag>,
    clock: Arc<dyn Clock>,
}

impl SchemaManager {
    /// Start from the empty ontology (version 0)
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let genesis = Arc::new(OntologyVersion::empty(clock.now()));
        Self {
            log: RwLock::new(vec![genesis.clone()]),
            active: RwLock::new(genesis),
            proposals: DashMap::new(),
            approve_lock: Mutex::new(()),
            curation: DashMap::new(),
            clock,
        }
    }

    /// Start with `diff` already applied as version 1
    pub fn with_initial(clock: Arc<dyn Clock>, diff: SchemaDiff) -> Result<Self> {
        let manager = Self::new(clock);
        let id = manager.propose_change(diff)?;
        manager.approve(id)?;
        Ok(manager)
    }

    /// Rebuild from an archived version log
    pub fn from_log(clock: Arc<dyn Clock>, versions: Vec<OntologyVersion>) -> Result<Self> {
        let mut versions = versions;
        versions.sort_by_key(|v| v.number);
        for (expected, version) in versions.iter().enumerate() {
            if version.number != expected as u64 {
                return Err(KnowledgeError::Serialization(format!(
                    "ontology log has a gap at version {}",
                    expected
                )));
            }
            version.check_consistency()?;
        }
        let log: Vec<Arc<OntologyVersion>> = versions.into_iter().map(Arc::new).collect();
        let active = log
            .last()
            .cloned()
            .ok_or_else(|| KnowledgeError::Serialization("ontology log is empty".to_string()))?;

        Ok(Self {
            log: RwLock::new(log),
            active: RwLock::new(active),
            proposals: DashMap::new(),
            approve_lock: Mutex::new(()),
            curation: DashMap::new(),
            clock,
        })
    }

    /// Currently active version
    pub fn active(&self) -> Arc<OntologyVersion> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_version(&self) -> u64 {
        self.active().number
    }

    pub fn version(&self, number: u64) -> Option<Arc<OntologyVersion>> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(number as usize)
            .cloned()
    }

    /// Full version log, oldest first
    pub fn history(&self) -> Vec<Arc<OntologyVersion>> {
        self.log.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn resolve(&self, version: Option<u64>) -> std::result::Result<Arc<OntologyVersion>, ValidationError> {
        match version {
            None => Ok(self.active()),
            Some(n) => self.version(n).ok_or(ValidationError::UnknownVersion(n)),
        }
    }

    /// Register a pending change; nothing becomes active until `approve`
    pub fn propose_change(&self, diff: SchemaDiff) -> Result<ProposalId> {
        if diff.is_empty() {
            return Err(ValidationError::InvalidDefinition("schema diff is empty".to_string()).into());
        }
        let proposal = Proposal {
            id: ProposalId::new(),
            diff,
            status: ProposalStatus::Pending,
            proposed_at: self.clock.now(),
            base_version: self.active_version(),
        };
        let id = proposal.id;
        debug!("Schema change proposed: id={}, base_version={}", id, proposal.base_version);
        self.proposals.insert(id, proposal);
        Ok(id)
    }

    /// Activate a pending proposal as the next version
    ///
    /// The diff is applied to whatever version is active at approval time.
    pub fn approve(&self, id: ProposalId) -> Result<Arc<OntologyVersion>> {
        let _serial = self.approve_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let diff = {
            let proposal = self
                .proposals
                .get(&id)
                .ok_or_else(|| KnowledgeError::NotFound(format!("schema proposal {}", id)))?;
            if proposal.status != ProposalStatus::Pending {
                return Err(KnowledgeError::Configuration(format!(
                    "schema proposal {} is not pending",
                    id
                )));
            }
            proposal.diff.clone()
        };

        let current = self.active();
        let next = match current.apply(&diff, self.clock.now(), Some(id)) {
            Ok(next) => Arc::new(next),
            Err(e) => {
                warn!("Schema proposal {} failed validation: {}", id, e);
                return Err(e.into());
            }
        };

        self.log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(next.clone());
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = next.clone();

        if let Some(mut proposal) = self.proposals.get_mut(&id) {
            proposal.status = ProposalStatus::Approved {
                version: next.number,
            };
        }
        METRICS.schema_activations.inc();
        info!("Ontology version {} ({}) activated", next.number, next.tag);
        Ok(next)
    }

    pub fn reject(&self, id: ProposalId, reason: impl Into<String>) -> Result<()> {
        let mut proposal = self
            .proposals
            .get_mut(&id)
            .ok_or_else(|| KnowledgeError::NotFound(format!("schema proposal {}", id)))?;
        if proposal.status != ProposalStatus::Pending {
            return Err(KnowledgeError::Configuration(format!(
                "schema proposal {} is not pending",
                id
            )));
        }
        proposal.status = ProposalStatus::Rejected {
            reason: reason.into(),
        };
        info!("Schema proposal {} rejected", id);
        Ok(())
    }

    pub fn proposal(&self, id: ProposalId) -> Option<Proposal> {
        self.proposals.get(&id).map(|p| p.clone())
    }

    pub fn pending_proposals(&self) -> Vec<Proposal> {
        self.proposals
            .iter()
            .filter(|p| p.status == ProposalStatus::Pending)
            .map(|p| p.clone())
            .collect()
    }

    pub fn validate_entity(
        &self,
        entity: &Entity,
        version: Option<u64>,
    ) -> std::result::Result<(), ValidationError> {
        self.resolve(version)?.validate_entity_type(&entity.entity_type)
    }

    /// Validate a fact shape; returns the matching predicate definition
    pub fn validate_fact(
        &self,
        subject_type: &str,
        predicate: &str,
        object: &ObjectShape<'_>,
        version: Option<u64>,
    ) -> std::result::Result<PredicateDef, ValidationError> {
        let ontology = self.resolve(version)?;
        ontology
            .validate_fact(subject_type, predicate, object)
            .map(|def| def.clone())
    }

    /// Cardinality under the active version; unknown predicates count as single-valued
    pub fn is_multi_valued(&self, predicate: &str) -> bool {
        self.active()
            .predicate(predicate)
            .map(|def| def.is_multi_valued())
            .unwrap_or(false)
    }

    pub(crate) fn publish_flags(&self, flags: Vec<CurationFlag>) {
        for flag in flags {
            self.curation.insert(flag.fact_id, flag);
        }
    }

    /// Facts flagged for curation by the last sweeps
    pub fn curation_flags(&self) -> Vec<CurationFlag> {
        self.curation.iter().map(|f| f.clone()).collect()
    }

    pub fn clear_flag(&self, fact_id: &FactId) -> bool {
        self.curation.remove(fact_id).is_some()
    }
}
