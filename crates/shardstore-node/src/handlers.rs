//! Request handlers serving the provider contract over HTTP

use crate::{ApiError, AppState};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardstore_core::{Query, Record, ShardDescriptor};
use shardstore_provider::wire::{
    AckResponse, DeletedResponse, HealthResponse, IdResponse, SelectRequest, SelectResponse,
};
use shardstore_provider::{DeleteTarget, IndexDefinition, StorageProvider};
use std::sync::Arc;

type Body<T> = Result<Json<T>, JsonRejection>;
type Id = Result<Path<u64>, PathRejection>;

/// Routing table as reported by `GET /admin/shards`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardTableResponse {
    pub bits: u32,
    pub table: Vec<ShardDescriptor>,
    /// Slots routed to this node
    #[serde(default)]
    pub own_slots: Vec<u64>,
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        name: state.storage.name().to_string(),
        provider: state.storage.kind(),
    })
}

/// POST /ids - Reserve the next id of this shard
pub async fn generate_id(State(state): State<Arc<AppState>>) -> Result<Json<IdResponse>, ApiError> {
    let id = state.storage.generate_id().await?;
    Ok(Json(IdResponse { id }))
}

/// POST /records
pub async fn create_record(
    State(state): State<Arc<AppState>>,
    body: Body<Record>,
) -> Result<(StatusCode, Json<IdResponse>), ApiError> {
    let Json(record) = body?;
    let id = state.storage.create(record).await?;
    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

/// GET /records/{id} - Answered from this shard only
pub async fn get_record(
    State(state): State<Arc<AppState>>,
    id: Id,
) -> Result<Json<Record>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.storage.get_local(id).await?))
}

/// PUT /records/{id}
pub async fn update_record(
    State(state): State<Arc<AppState>>,
    id: Id,
    body: Body<Record>,
) -> Result<Json<AckResponse>, ApiError> {
    let Path(id) = id?;
    let Json(mut record) = body?;
    match record.id() {
        Some(carried) if carried != id => {
            return Err(ApiError::BadRequest(format!(
                "record id {} does not match path id {}",
                carried, id
            )))
        }
        Some(_) => {}
        None => record.set_id(id),
    }
    state.storage.update(record).await?;
    Ok(Json(AckResponse::OK))
}

/// DELETE /records/{id}
pub async fn delete_record(
    State(state): State<Arc<AppState>>,
    id: Id,
) -> Result<Json<DeletedResponse>, ApiError> {
    let Path(id) = id?;
    let deleted = state.storage.delete(DeleteTarget::Id(id)).await?;
    Ok(Json(DeletedResponse { deleted }))
}

/// POST /records/delete - Delete every record matching the query
pub async fn delete_records(
    State(state): State<Arc<AppState>>,
    body: Body<Query>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let Json(query) = body?;
    let deleted = state.storage.delete(DeleteTarget::Query(query)).await?;
    Ok(Json(DeletedResponse { deleted }))
}

/// POST /select
pub async fn select(
    State(state): State<Arc<AppState>>,
    body: Body<SelectRequest>,
) -> Result<Json<SelectResponse>, ApiError> {
    let Json(SelectRequest { query, options }) = body?;
    let records = state.storage.select(query, options).await?;
    Ok(Json(SelectResponse { records }))
}

/// POST /indexes
pub async fn create_index(
    State(state): State<Arc<AppState>>,
    body: Body<IndexDefinition>,
) -> Result<Json<AckResponse>, ApiError> {
    let Json(definition) = body?;
    state.storage.index(definition).await?;
    Ok(Json(AckResponse::OK))
}

/// GET /admin/shards
pub async fn shard_table(State(state): State<Arc<AppState>>) -> Json<ShardTableResponse> {
    let response = state
        .storage
        .shard_index()
        .map(|index| ShardTableResponse {
            bits: index.bits(),
            table: index.table().to_vec(),
            own_slots: state.storage.own_slots(),
        })
        .unwrap_or_default();
    Json(response)
}

/// PUT /admin/shards - Replace the routing tree
pub async fn assign_shards(
    State(state): State<Arc<AppState>>,
    body: Body<Value>,
) -> Result<Json<AckResponse>, ApiError> {
    let Json(tree) = body?;
    state.storage.infrastructure_assign(&tree)?;
    Ok(Json(AckResponse::OK))
}
