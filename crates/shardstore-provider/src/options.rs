//! Provider selection and open options

use crate::{ProviderError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Closed set of storage backends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "fs", alias = "filesystem")]
    FileSystem,
    #[serde(rename = "indexeddb-like", alias = "indexeddb")]
    IndexedDb,
    #[serde(rename = "webstorage", alias = "localstorage")]
    WebStorage,
    #[serde(rename = "mongodb-like", alias = "mongodb", alias = "document")]
    Document,
    #[serde(rename = "remote")]
    Remote,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::FileSystem => "fs",
            Self::IndexedDb => "indexeddb-like",
            Self::WebStorage => "webstorage",
            Self::Document => "mongodb-like",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options a local provider is opened with.
///
/// Unknown keys (including live handle keys such as `client` or `indexedDB`)
/// are ignored; backend handles come from [`crate::Backends`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOptions {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, alias = "db", skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_label: Option<String>,
}

impl OpenOptions {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn fs(path: impl Into<PathBuf>) -> Self {
        Self {
            provider: ProviderKind::FileSystem,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn indexed_db(database: impl Into<String>, store: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::IndexedDb,
            database_name: Some(database.into()),
            store_name: Some(store.into()),
            ..Default::default()
        }
    }

    pub fn web_storage(store: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::WebStorage,
            store_name: Some(store.into()),
            ..Default::default()
        }
    }

    pub fn document(database: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::Document,
            database_name: Some(database.into()),
            ..Default::default()
        }
    }

    pub fn with_id_label(mut self, label: impl Into<String>) -> Self {
        self.id_label = Some(label.into());
        self
    }

    /// Check that the keys the chosen provider needs are present
    pub fn validate(&self) -> Result<()> {
        let missing = |key: &str| {
            Err(ProviderError::Validation(format!(
                "provider '{}' requires option '{}'",
                self.provider, key
            )))
        };
        match self.provider {
            ProviderKind::Memory => Ok(()),
            ProviderKind::FileSystem if self.path.is_none() => missing("path"),
            ProviderKind::IndexedDb if self.database_name.is_none() => missing("databaseName"),
            ProviderKind::IndexedDb | ProviderKind::WebStorage if self.store_name.is_none() => {
                missing("storeName")
            }
            ProviderKind::Document if self.database_name.is_none() => missing("databaseName"),
            ProviderKind::Remote => Err(ProviderError::Validation(
                "remote providers are created with connect, not opened locally".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
