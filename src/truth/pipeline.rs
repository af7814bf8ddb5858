//! Sharded ingestion queue
//!
//! Candidates are routed to a worker by hashing their (subject, predicate)
//! key, so one key is always handled by one worker in arrival order while
//! distinct keys spread across workers.

use super::candidate::RawCandidate;
use super::maintenance::{IngestOutcome, TruthMaintenance};
use crate::config::TruthConfig;
use crate::error::{KnowledgeError, Result};
use crate::facts::{FactCandidate, FactKey};
use futures::future::join_all;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct Job {
    candidate: FactCandidate,
    reply: oneshot::Sender<Result<IngestOutcome>>,
}

pub struct IngestionPipeline {
    tmu: Arc<TruthMaintenance>,
    shards: Vec<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestionPipeline {
    /// Spawn the workers on the current tokio runtime
    pub fn start(tmu: Arc<TruthMaintenance>, config: &TruthConfig) -> Self {
        let worker_count = config.ingestion_workers.max(1);
        let capacity = (config.queue_capacity / worker_count).max(1);

        let mut shards = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for shard in 0..worker_count {
            let (tx, mut rx) = mpsc::channel::<Job>(capacity);
            let tmu = tmu.clone();
            workers.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    // Key and commit locks block; keep them off the async workers
                    let tmu = tmu.clone();
                    let candidate = job.candidate;
                    let result = tokio::task::spawn_blocking(move || tmu.process(candidate))
                        .await
                        .unwrap_or_else(|e| {
                            Err(KnowledgeError::Internal(format!("ingestion task failed: {}", e)))
                        });
                    let _ = job.reply.send(result);
                }
                debug!("Ingestion worker {} stopped", shard);
            }));
            shards.push(tx);
        }

        info!(
            "Ingestion pipeline started: {} workers, {} slots each",
            worker_count, capacity
        );
        Self {
            tmu,
            shards,
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &FactKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Queue a candidate and wait for its outcome
    pub async fn submit(&self, candidate: FactCandidate) -> Result<IngestOutcome> {
        let shard = self.shard_for(&candidate.key());
        let (reply, outcome) = oneshot::channel();
        self.shards[shard]
            .send(Job { candidate, reply })
            .await
            .map_err(|_| KnowledgeError::Internal("ingestion pipeline is shut down".to_string()))?;
        outcome
            .await
            .map_err(|_| KnowledgeError::Internal("ingestion worker dropped the job".to_string()))?
    }

    /// Parse an ingestion record against the current state, then queue it
    pub async fn submit_raw(&self, raw: RawCandidate) -> Result<IngestOutcome> {
        let candidate = raw.parse(&self.tmu.store().snapshot())?;
        self.submit(candidate).await
    }

    /// Queue several candidates; results come back in input order
    pub async fn submit_batch(&self, candidates: Vec<FactCandidate>) -> Vec<Result<IngestOutcome>> {
        join_all(candidates.into_iter().map(|c| self.submit(c))).await
    }

    /// Stop accepting work and wait for queued jobs to drain
    pub async fn shutdown(self) {
        drop(self.shards);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("Ingestion pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::facts::{FactObject, FactStore, Literal, LiteralKind, NewEntity, Provenance};
    use crate::schema::{EntityTypeDef, PredicateDef, RangeSpec, SchemaDiff, SchemaManager};
    use crate::truth::StaticReliability;
    use chrono::Utc;

    fn tmu() -> Arc<TruthMaintenance> {
        let clock = Arc::new(SystemClock);
        let diff = SchemaDiff::new()
            .add_entity_type(EntityTypeDef::new("Company"))
            .upsert_predicate(
                PredicateDef::new("alias", "Company", RangeSpec::Literal(LiteralKind::Text))
                    .multi_valued(),
            );
        let schema = Arc::new(SchemaManager::with_initial(clock.clone(), diff).unwrap());
        let store = Arc::new(FactStore::new(schema, clock));
        Arc::new(TruthMaintenance::new(
            store,
            &TruthConfig::default(),
            Arc::new(StaticReliability::new()),
        ))
    }

    #[tokio::test]
    async fn test_batch_commits_every_candidate() {
        let tmu = tmu();
        let pipeline = IngestionPipeline::start(tmu.clone(), &TruthConfig::default());
        let mut candidates = Vec::new();
        for i in 0..10 {
            let company = tmu
                .create_entity(NewEntity::new("Company", format!("Company{}", i)))
                .unwrap();
            for alias in ["A", "B"] {
                candidates.push(FactCandidate::new(
                    company.id,
                    "alias",
                    FactObject::Literal(Literal::from(alias)),
                    Provenance::new("S1", Utc::now()),
                ));
            }
        }

        let results = pipeline.submit_batch(candidates).await;
        assert_eq!(results.len(), 20);
        assert!(results.iter().all(|r| r.as_ref().unwrap().label() == "committed"));
        assert_eq!(tmu.store().fact_count(), 20);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_key_replay_is_duplicate() {
        let tmu = tmu();
        let pipeline = IngestionPipeline::start(tmu.clone(), &TruthConfig::default());
        let company = tmu.create_entity(NewEntity::new("Company", "Acme")).unwrap();
        let candidate = FactCandidate::new(
            company.id,
            "alias",
            FactObject::Literal(Literal::from("ACME Corp")),
            Provenance::new("S1", Utc::now()),
        );

        let results = pipeline
            .submit_batch(vec![candidate.clone(), candidate])
            .await;
        assert_eq!(results[0].as_ref().unwrap().label(), "committed");
        assert_eq!(results[1].as_ref().unwrap().label(), "duplicate");

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_blocked_key_leaves_runtime_free() {
        let tmu = tmu();
        let pipeline = IngestionPipeline::start(tmu.clone(), &TruthConfig::default());
        let company = tmu.create_entity(NewEntity::new("Company", "Acme")).unwrap();
        let candidate = FactCandidate::new(
            company.id,
            "alias",
            FactObject::Literal(Literal::from("ACME Corp")),
            Provenance::new("S1", Utc::now()),
        );

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let tmu = tmu.clone();
            let key = candidate.key();
            std::thread::spawn(move || {
                tmu.with_key_lock(&key, || {
                    held_tx.send(()).unwrap();
                    release_rx.recv().ok();
                })
            })
        };
        held_rx.recv().unwrap();

        {
            let submit = pipeline.submit(candidate);
            tokio::pin!(submit);
            // The job waits on the key while timers on this runtime still fire
            let timer_fired = tokio::select! {
                _ = &mut submit => false,
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => true,
            };
            assert!(timer_fired);

            release_tx.send(()).unwrap();
            assert_eq!(submit.await.unwrap().label(), "committed");
        }
        holder.join().unwrap();
        assert_eq!(tmu.locked_keys(), 0);

        pipeline.shutdown().await;
    }
}
