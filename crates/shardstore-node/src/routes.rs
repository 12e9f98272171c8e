//! HTTP route definitions

use crate::{handlers, AppState};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use shardstore_provider::wire;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Administrative routing table endpoint
pub const SHARDS_PATH: &str = "/admin/shards";

/// Create the main router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(wire::HEALTH_PATH, get(handlers::health))
        .route(wire::IDS_PATH, post(handlers::generate_id))
        .route(wire::RECORDS_PATH, post(handlers::create_record))
        .route(
            "/records/{id}",
            get(handlers::get_record)
                .put(handlers::update_record)
                .delete(handlers::delete_record),
        )
        .route(wire::DELETE_QUERY_PATH, post(handlers::delete_records))
        .route(wire::SELECT_PATH, post(handlers::select))
        .route(wire::INDEXES_PATH, post(handlers::create_index))
        .route(SHARDS_PATH, get(handlers::shard_table).put(handlers::assign_shards))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(state.config.max_body_size))
        .with_state(state)
}
