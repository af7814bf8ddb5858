//! Router construction

use super::handlers::{self, AppState};
use axum::{
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Build the HTTP router
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.substrate.config().server.body_limit_bytes;

    let api = Router::new()
        // Ingestion
        .route("/ingest", post(handlers::ingest))
        .route("/ingest/batch", post(handlers::ingest_batch))
        // Entities and audit
        .route("/entities", post(handlers::create_entity))
        .route("/entities/:id", get(handlers::get_entity))
        .route("/entities/:id/facts", get(handlers::entity_facts))
        .route("/entities/:id/history/:predicate", get(handlers::history))
        .route("/facts/:id", get(handlers::get_fact))
        .route("/facts/:id/retract", post(handlers::retract_fact))
        // Retrieval
        .route("/query", post(handlers::query))
        .route("/embeddings", put(handlers::upsert_embedding))
        // Schema
        .route("/schema", get(handlers::active_schema))
        .route("/schema/versions/:number", get(handlers::schema_version))
        .route(
            "/schema/proposals",
            get(handlers::pending_proposals).post(handlers::propose_change),
        )
        .route("/schema/proposals/:id/approve", post(handlers::approve_proposal))
        .route("/schema/proposals/:id/reject", post(handlers::reject_proposal))
        // Conflicts
        .route("/conflicts", get(handlers::list_conflicts))
        .route("/conflicts/:id/resolve", post(handlers::resolve_conflict))
        // Working memory
        .route("/sessions", post(handlers::open_session))
        .route("/sessions/:id", axum::routing::delete(handlers::close_session))
        .route("/sessions/:id/stage", post(handlers::stage))
        .route("/sessions/:id/focus", post(handlers::focus))
        .route("/sessions/:id/snapshot", get(handlers::snapshot))
        .route("/sessions/:id/release", post(handlers::release));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
