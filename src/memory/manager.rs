//! Session registry for working memory
//!
//! Each session owns one `WorkingMemory` behind its own mutex, so stage,
//! focus and release on a session are serialized while sessions proceed
//! independently.

use super::item::WorkingMemoryItem;
use super::session::{GoalContext, StageOutcome, StageRequest, WorkingMemory};
use crate::clock::Clock;
use crate::config::WorkingMemoryConfig;
use crate::error::{KnowledgeError, Result};
use crate::facts::NodeRef;
use crate::query::QueryResponse;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct WorkingMemoryManager {
    config: WorkingMemoryConfig,
    clock: Arc<dyn Clock>,
    sessions: DashMap<SessionId, Arc<Mutex<WorkingMemory>>>,
}

fn lock(memory: &Mutex<WorkingMemory>) -> MutexGuard<'_, WorkingMemory> {
    memory.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkingMemoryManager {
    pub fn new(config: WorkingMemoryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &WorkingMemoryConfig {
        &self.config
    }

    /// Open a session with the configured capacity
    pub fn open_session(&self) -> SessionId {
        let id = SessionId::new();
        let memory = WorkingMemory::new(self.config.clone(), self.clock.clone());
        self.sessions.insert(id, Arc::new(Mutex::new(memory)));
        info!("Opened working memory session {}", id);
        id
    }

    /// Open a session with its own capacity bound
    pub fn open_session_with_capacity(&self, capacity: usize) -> Result<SessionId> {
        if capacity == 0 {
            return Err(KnowledgeError::Configuration(
                "working memory capacity must be at least 1".to_string(),
            ));
        }
        let id = SessionId::new();
        let config = WorkingMemoryConfig {
            capacity,
            ..self.config.clone()
        };
        let memory = WorkingMemory::new(config, self.clock.clone());
        self.sessions.insert(id, Arc::new(Mutex::new(memory)));
        info!("Opened working memory session {} (capacity {})", id, capacity);
        Ok(id)
    }

    pub fn close_session(&self, id: SessionId) -> bool {
        let closed = self.sessions.remove(&id).is_some();
        if closed {
            info!("Closed working memory session {}", id);
        }
        closed
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn session(&self, id: SessionId) -> Result<Arc<Mutex<WorkingMemory>>> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KnowledgeError::NotFound(format!("session {}", id)))
    }

    pub fn stage(
        &self,
        id: SessionId,
        requests: Vec<StageRequest>,
        source_tag: &str,
    ) -> Result<Vec<StageOutcome>> {
        let memory = self.session(id)?;
        let outcomes = lock(&memory).stage(requests, source_tag);
        Ok(outcomes)
    }

    /// Stage the terminals of a query result, scored by match score and path confidence
    pub fn stage_query_results(
        &self,
        id: SessionId,
        response: &QueryResponse,
        source_tag: &str,
    ) -> Result<Vec<StageOutcome>> {
        let requests = response
            .matches
            .iter()
            .map(|m| {
                StageRequest::new(m.terminal)
                    .with_activation(m.score)
                    .with_confidence(m.breakdown.confidence)
            })
            .collect();
        self.stage(id, requests, source_tag)
    }

    pub fn focus(&self, id: SessionId, goal: &GoalContext) -> Result<()> {
        let memory = self.session(id)?;
        lock(&memory).focus(goal);
        Ok(())
    }

    pub fn snapshot(&self, id: SessionId) -> Result<Vec<WorkingMemoryItem>> {
        let memory = self.session(id)?;
        let items = lock(&memory).snapshot();
        Ok(items)
    }

    pub fn release(&self, id: SessionId, node: &NodeRef) -> Result<Option<WorkingMemoryItem>> {
        let memory = self.session(id)?;
        let released = lock(&memory).release(node);
        Ok(released)
    }

    pub fn activation(&self, id: SessionId, node: &NodeRef) -> Result<Option<f64>> {
        let memory = self.session(id)?;
        let activation = lock(&memory).activation(node);
        Ok(activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::facts::EntityId;

    fn manager() -> WorkingMemoryManager {
        WorkingMemoryManager::new(WorkingMemoryConfig::default(), Arc::new(SystemClock))
    }

    #[test]
    fn test_sessions_are_isolated() {
        let manager = manager();
        let a = manager.open_session();
        let b = manager.open_session();
        let node = NodeRef::Entity(EntityId::new());

        manager.stage(a, vec![StageRequest::new(node)], "query").unwrap();
        assert_eq!(manager.snapshot(a).unwrap().len(), 1);
        assert!(manager.snapshot(b).unwrap().is_empty());
    }

    #[test]
    fn test_closed_session_not_found() {
        let manager = manager();
        let id = manager.open_session();
        assert!(manager.close_session(id));
        assert!(!manager.close_session(id));
        assert!(matches!(
            manager.snapshot(id),
            Err(KnowledgeError::NotFound(_))
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(manager().open_session_with_capacity(0).is_err());
    }

    #[test]
    fn test_concurrent_staging_respects_capacity() {
        let manager = Arc::new(manager());
        let id = manager.open_session_with_capacity(8).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        let request = StageRequest::new(NodeRef::Entity(EntityId::new()))
                            .with_activation((t * 20 + i) as f64 / 100.0);
                        manager.stage(id, vec![request], "worker").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(manager.snapshot(id).unwrap().len(), 8);
    }
}
