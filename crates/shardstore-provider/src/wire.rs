//! JSON bodies exchanged between a remote provider and a node

use crate::{ProviderKind, SelectOptions};
use serde::{Deserialize, Serialize};
use shardstore_core::{Query, Record};

pub const HEALTH_PATH: &str = "/health";
pub const IDS_PATH: &str = "/ids";
pub const RECORDS_PATH: &str = "/records";
pub const DELETE_QUERY_PATH: &str = "/records/delete";
pub const SELECT_PATH: &str = "/select";
pub const INDEXES_PATH: &str = "/indexes";

/// Path of a single record
pub fn record_path(id: u64) -> String {
    format!("{}/{}", RECORDS_PATH, id)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub provider: ProviderKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectRequest {
    #[serde(default)]
    pub query: Query,
    #[serde(default)]
    pub options: SelectOptions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectResponse {
    pub records: Vec<Record>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

impl AckResponse {
    pub const OK: Self = Self { ok: true };
}
