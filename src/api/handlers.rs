//! HTTP handlers

use crate::error::KnowledgeError;
use crate::facts::{Entity, EntityId, Fact, FactId, NewEntity, NodeRef};
use crate::embedding::EmbeddingRecord;
use crate::memory::{GoalContext, SessionId, StageOutcome, StageRequest, WorkingMemoryItem};
use crate::metrics::METRICS;
use crate::query::{QueryRequest, QueryResponse};
use crate::schema::{OntologyVersion, Proposal, ProposalId, SchemaDiff};
use crate::substrate::Substrate;
use crate::truth::{
    ConflictId, ConflictRecord, ConflictStatus, IngestOutcome, IngestionPipeline, RawCandidate,
    Resolution,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub substrate: Arc<Substrate>,
    pub pipeline: Arc<IngestionPipeline>,
}

impl AppState {
    /// Starts the ingestion pipeline; call inside a tokio runtime
    pub fn new(substrate: Arc<Substrate>) -> Self {
        let pipeline = Arc::new(substrate.start_pipeline());
        Self {
            substrate,
            pipeline,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

pub type ApiFailure = (StatusCode, Json<ApiError>);
type ApiResult<T> = Result<Json<T>, ApiFailure>;

fn status_for(e: &KnowledgeError) -> StatusCode {
    match e {
        KnowledgeError::SchemaViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        KnowledgeError::VersionConflict { .. } => StatusCode::CONFLICT,
        KnowledgeError::NotFound(_) => StatusCode::NOT_FOUND,
        KnowledgeError::InvalidCandidate(_)
        | KnowledgeError::InvalidTemporalRange(_)
        | KnowledgeError::OrphanEmbedding(_)
        | KnowledgeError::DimensionMismatch { .. }
        | KnowledgeError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        KnowledgeError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
        KnowledgeError::Configuration(_)
        | KnowledgeError::Serialization(_)
        | KnowledgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a domain error onto the wire
pub fn failure(e: KnowledgeError) -> ApiFailure {
    let status = status_for(&e);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    (status, Json(ApiError::new(e.code(), e.to_string())))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store = state.substrate.store();
    Json(serde_json::json!({
        "status": "ok",
        "entities": store.entity_count(),
        "fact_versions": store.fact_count(),
        "watermark": store.snapshot().watermark(),
        "ontology_version": state.substrate.schema().active_version(),
        "ingestion_workers": state.pipeline.worker_count(),
    }))
}

/// GET /metrics
pub async fn metrics() -> String {
    METRICS.export_prometheus()
}

/// Ingest one candidate record
///
/// POST /api/v1/ingest
pub async fn ingest(
    State(state): State<AppState>,
    Json(raw): Json<RawCandidate>,
) -> ApiResult<IngestOutcome> {
    info!("Ingest request: ({}, {}) from {}", raw.subject, raw.predicate, raw.source);
    state.pipeline.submit_raw(raw).await.map(Json).map_err(failure)
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<IngestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Ingest many records; each entry succeeds or fails independently
///
/// POST /api/v1/ingest/batch
pub async fn ingest_batch(
    State(state): State<AppState>,
    Json(raws): Json<Vec<RawCandidate>>,
) -> ApiResult<Vec<BatchItem>> {
    info!("Batch ingest request: {} records", raws.len());
    let submissions = raws.into_iter().map(|raw| state.pipeline.submit_raw(raw));
    let results = futures::future::join_all(submissions).await;
    let items = results
        .into_iter()
        .map(|result| match result {
            Ok(outcome) => BatchItem {
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => BatchItem {
                outcome: None,
                error: Some(ApiError::new(e.code(), e.to_string())),
            },
        })
        .collect();
    Ok(Json(items))
}

/// POST /api/v1/entities
pub async fn create_entity(
    State(state): State<AppState>,
    Json(request): Json<NewEntity>,
) -> Result<(StatusCode, Json<Entity>), ApiFailure> {
    if request.canonical_name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("VALIDATION_ERROR", "Canonical name cannot be empty")),
        ));
    }
    let entity = state
        .substrate
        .truth()
        .create_entity(request)
        .map_err(failure)?;
    Ok((StatusCode::CREATED, Json(entity)))
}

/// GET /api/v1/entities/:id
pub async fn get_entity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Entity> {
    let entity = state
        .substrate
        .store()
        .get_entity(&EntityId(id))
        .map_err(failure)?;
    Ok(Json(entity.as_ref().clone()))
}

#[derive(Debug, Default, Deserialize)]
pub struct FactsParams {
    pub predicate: Option<String>,
    /// Valid time; current facts when unset
    pub as_of: Option<DateTime<Utc>>,
    /// Transaction time; defaults to `as_of`
    pub known_at: Option<DateTime<Utc>>,
}

/// Current or as-of facts about an entity
///
/// GET /api/v1/entities/:id/facts
pub async fn entity_facts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<FactsParams>,
) -> ApiResult<Vec<Fact>> {
    let store = state.substrate.store();
    let subject = EntityId(id);
    store.get_entity(&subject).map_err(failure)?;
    let predicate = params.predicate.as_deref();

    let facts = match (params.as_of, params.known_at) {
        (None, None) => store.get_current_facts(&subject, predicate),
        (Some(t), None) => store.get_facts_as_of(&subject, predicate, t),
        (valid_at, Some(known_at)) => store.facts_bitemporal(
            &subject,
            predicate,
            valid_at.unwrap_or_else(|| state.substrate.clock().now()),
            known_at,
        ),
    };
    Ok(Json(facts))
}

/// Every version on a (subject, predicate) chain
///
/// GET /api/v1/entities/:id/history/:predicate
pub async fn history(
    State(state): State<AppState>,
    Path((id, predicate)): Path<(Uuid, String)>,
) -> ApiResult<Vec<Fact>> {
    let store = state.substrate.store();
    let subject = EntityId(id);
    store.get_entity(&subject).map_err(failure)?;
    Ok(Json(store.get_history(&subject, &predicate)))
}

/// GET /api/v1/facts/:id
pub async fn get_fact(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Fact> {
    state
        .substrate
        .store()
        .get_fact(&FactId(id))
        .map(Json)
        .map_err(failure)
}

#[derive(Debug, Default, Deserialize)]
pub struct RetractRequest {
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
}

/// POST /api/v1/facts/:id/retract
pub async fn retract_fact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RetractRequest>,
) -> ApiResult<Fact> {
    state
        .substrate
        .store()
        .retract(FactId(id), request.valid_to)
        .map(Json)
        .map_err(failure)
}

/// POST /api/v1/query
pub async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<QueryResponse> {
    let engine = state.substrate.query_engine().clone();
    engine
        .query_async(request, None)
        .await
        .map(Json)
        .map_err(failure)
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub owner: NodeRef,
    pub vector: Vec<f32>,
    pub model_id: String,
}

/// PUT /api/v1/embeddings
pub async fn upsert_embedding(
    State(state): State<AppState>,
    Json(request): Json<EmbeddingRequest>,
) -> ApiResult<EmbeddingRecord> {
    state
        .substrate
        .embeddings()
        .upsert(request.owner, request.vector, request.model_id)
        .map(Json)
        .map_err(failure)
}

/// GET /api/v1/schema
pub async fn active_schema(State(state): State<AppState>) -> Json<OntologyVersion> {
    Json(state.substrate.schema().active().as_ref().clone())
}

/// GET /api/v1/schema/versions/:number
pub async fn schema_version(
    State(state): State<AppState>,
    Path(number): Path<u64>,
) -> ApiResult<OntologyVersion> {
    state
        .substrate
        .schema()
        .version(number)
        .map(|v| Json(v.as_ref().clone()))
        .ok_or_else(|| failure(KnowledgeError::NotFound(format!("ontology version {}", number))))
}

/// POST /api/v1/schema/proposals
pub async fn propose_change(
    State(state): State<AppState>,
    Json(diff): Json<SchemaDiff>,
) -> Result<(StatusCode, Json<Proposal>), ApiFailure> {
    let schema = state.substrate.schema();
    let id = schema.propose_change(diff).map_err(failure)?;
    let proposal = schema
        .proposal(id)
        .ok_or_else(|| failure(KnowledgeError::Internal(format!("proposal {} vanished", id))))?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

/// GET /api/v1/schema/proposals
pub async fn pending_proposals(State(state): State<AppState>) -> Json<Vec<Proposal>> {
    Json(state.substrate.schema().pending_proposals())
}

/// POST /api/v1/schema/proposals/:id/approve
pub async fn approve_proposal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<OntologyVersion> {
    state
        .substrate
        .schema()
        .approve(ProposalId(id))
        .map(|v| Json(v.as_ref().clone()))
        .map_err(failure)
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: String,
}

/// POST /api/v1/schema/proposals/:id/reject
pub async fn reject_proposal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RejectRequest>,
) -> ApiResult<Proposal> {
    let schema = state.substrate.schema();
    let id = ProposalId(id);
    schema.reject(id, request.reason).map_err(failure)?;
    schema
        .proposal(id)
        .map(Json)
        .ok_or_else(|| failure(KnowledgeError::NotFound(format!("proposal {}", id))))
}

#[derive(Debug, Default, Deserialize)]
pub struct ConflictParams {
    pub status: Option<ConflictStatus>,
}

/// GET /api/v1/conflicts
pub async fn list_conflicts(
    State(state): State<AppState>,
    Query(params): Query<ConflictParams>,
) -> Json<Vec<ConflictRecord>> {
    Json(state.substrate.truth().conflicts(params.status))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub resolution: Resolution,
    #[serde(default)]
    pub rationale: String,
}

/// POST /api/v1/conflicts/:id/resolve
pub async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<ConflictRecord> {
    let substrate = state.substrate.clone();
    tokio::task::spawn_blocking(move || {
        substrate
            .truth()
            .resolve_conflict(ConflictId(id), request.resolution, request.rationale)
    })
    .await
    .map_err(|e| failure(KnowledgeError::Internal(format!("resolve task failed: {}", e))))?
    .map(Json)
    .map_err(failure)
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenSessionRequest {
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreated {
    pub id: SessionId,
}

/// POST /api/v1/sessions
pub async fn open_session(
    State(state): State<AppState>,
    Json(request): Json<OpenSessionRequest>,
) -> Result<(StatusCode, Json<SessionCreated>), ApiFailure> {
    let memory = state.substrate.memory();
    let id = match request.capacity {
        Some(capacity) => memory.open_session_with_capacity(capacity).map_err(failure)?,
        None => memory.open_session(),
    };
    Ok((StatusCode::CREATED, Json(SessionCreated { id })))
}

/// DELETE /api/v1/sessions/:id
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiFailure> {
    let id = SessionId(id);
    if state.substrate.memory().close_session(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(failure(KnowledgeError::NotFound(format!("session {}", id))))
    }
}

#[derive(Debug, Deserialize)]
pub struct StageBody {
    pub items: Vec<StageRequest>,
    #[serde(default = "default_source_tag")]
    pub source_tag: String,
}

fn default_source_tag() -> String { "api".to_string() }

/// POST /api/v1/sessions/:id/stage
pub async fn stage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StageBody>,
) -> ApiResult<Vec<StageOutcome>> {
    state
        .substrate
        .memory()
        .stage(SessionId(id), body.items, &body.source_tag)
        .map(Json)
        .map_err(failure)
}

/// POST /api/v1/sessions/:id/focus
pub async fn focus(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(goal): Json<GoalContext>,
) -> ApiResult<Vec<WorkingMemoryItem>> {
    let memory = state.substrate.memory();
    let id = SessionId(id);
    memory.focus(id, &goal).map_err(failure)?;
    memory.snapshot(id).map(Json).map_err(failure)
}

/// GET /api/v1/sessions/:id/snapshot
pub async fn snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<WorkingMemoryItem>> {
    state
        .substrate
        .memory()
        .snapshot(SessionId(id))
        .map(Json)
        .map_err(failure)
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub node: NodeRef,
}

/// POST /api/v1/sessions/:id/release
pub async fn release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<WorkingMemoryItem> {
    state
        .substrate
        .memory()
        .release(SessionId(id), &request.node)
        .map_err(failure)?
        .map(Json)
        .ok_or_else(|| {
            failure(KnowledgeError::NotFound(format!(
                "{} is not in working memory",
                request.node
            )))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&KnowledgeError::SchemaViolation(ValidationError::UnknownPredicate(
                "x".to_string()
            ))),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&KnowledgeError::NotFound("x".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&KnowledgeError::InvalidQuery("x".to_string())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_failure_carries_code() {
        let (status, Json(body)) = failure(KnowledgeError::Internal("boom".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.code, "INTERNAL_ERROR");
    }
}
