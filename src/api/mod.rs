//! HTTP surface: ingestion, audit, query, schema authoring and working memory

pub mod handlers;
pub mod routes;

pub use handlers::{ApiError, AppState};
pub use routes::build_router;
