//! Node configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardstore_core::ShardDescriptor;
use shardstore_provider::OpenOptions;
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides, e.g. `SHARDSTORE_PORT` or
/// `SHARDSTORE_STORAGE__PATH`
pub const ENV_PREFIX: &str = "SHARDSTORE";

/// Node configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name; must match this node's leaf in the shard tree
    pub name: String,
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Local provider
    pub storage: OpenOptions,
    /// Routing tree as nested `[left, right]` arrays of shard descriptors
    pub shards: Option<Value>,
    /// Nodes connected at startup
    pub peers: Vec<ShardDescriptor>,
    /// Entries in the local record cache; 0 disables it
    pub cache_capacity: usize,
    /// Timeout for calls to other nodes (seconds)
    pub remote_timeout_secs: u64,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            host: "0.0.0.0".to_string(),
            port: 7070,
            storage: OpenOptions::memory(),
            shards: None,
            peers: Vec::new(),
            cache_capacity: 1024,
            remote_timeout_secs: 30,
            max_body_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl NodeConfig {
    /// Defaults, then `file` (if given), then `SHARDSTORE_*` variables
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_from(file, None)
    }

    /// Like [`NodeConfig::load`] with an explicit environment map in place
    /// of the process environment
    pub fn load_from(
        file: Option<&Path>,
        environment: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&NodeConfig::default())?);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(environment),
            )
            .build()?;
        let config: NodeConfig = settings.try_deserialize()?;
        config.storage.validate()?;
        Ok(config)
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shardstore_provider::ProviderKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn toml_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::load_from(None, env(&[])).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.bind_addr(), "0.0.0.0:7070");
        assert_eq!(config.storage.provider, ProviderKind::Memory);
    }

    #[test]
    fn test_file_then_environment() {
        let file = toml_file(
            r#"
name = "alpha"
port = 8001
shards = [["alpha", "http://10.0.0.2:7070"], "gamma"]

[storage]
provider = "fs"
path = "/var/lib/shardstore"

[[peers]]
name = "beta"
url = "http://10.0.0.2:7070"
"#,
        );

        let config = NodeConfig::load_from(
            Some(file.path()),
            env(&[("SHARDSTORE_PORT", "9001"), ("SHARDSTORE_CACHE_CAPACITY", "0")]),
        )
        .unwrap();

        assert_eq!(config.name, "alpha");
        assert_eq!(config.port, 9001);
        assert_eq!(config.cache_capacity, 0);
        assert_eq!(config.storage.provider, ProviderKind::FileSystem);
        assert_eq!(
            config.shards,
            Some(json!([["alpha", "http://10.0.0.2:7070"], "gamma"]))
        );
        assert_eq!(
            config.peers,
            vec![ShardDescriptor::new("beta").with_url("http://10.0.0.2:7070")]
        );
    }

    #[test]
    fn test_nested_environment_keys() {
        let config = NodeConfig::load_from(
            None,
            env(&[
                ("SHARDSTORE_STORAGE__PROVIDER", "fs"),
                ("SHARDSTORE_STORAGE__PATH", "/tmp/records"),
            ]),
        )
        .unwrap();
        assert_eq!(config.storage, OpenOptions::fs("/tmp/records"));
    }

    #[test]
    fn test_incomplete_storage_is_rejected() {
        let result = NodeConfig::load_from(None, env(&[("SHARDSTORE_STORAGE__PROVIDER", "fs")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = NodeConfig::load_from(Some(Path::new("/nonexistent/node.toml")), env(&[]));
        assert!(result.is_err());
    }
}
