//! Shard configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// CPU core the shard thread is pinned to.
    pub core: usize,
    /// Listen address.
    pub addr: String,
    /// Listen port.
    pub port: u16,
    /// Transport provider: `tcp` or `rdma`.
    pub provider: String,
    /// Backend engine: `mapstore`, `hstore`, or `hstore-cc`.
    pub backend: String,
    /// DAX configuration string for persistent backends.
    pub dax_config: Option<String>,
    /// Secondary-index engine enabled at startup, if any.
    pub index: Option<String>,
    /// Path to the ADO process binary; ADO is disabled when unset.
    pub ado_path: Option<PathBuf>,
    /// Plugins loaded into each ADO process.
    pub ado_plugins: Vec<String>,
    /// Extra `key:value` parameters passed to each ADO process.
    pub ado_params: BTreeMap<String, String>,
    /// Core mask for ADO processes.
    pub ado_cores: Option<String>,
    /// TLS certificate path (consumed by the outer server, not here).
    pub cert_path: Option<PathBuf>,
    /// Exit the shard when its last session closes.
    pub forced_exit: bool,
    /// Profile output path.
    pub profile_file: Option<PathBuf>,
    /// Debug verbosity, 0 = quiet.
    pub debug_level: u32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            core: 0,
            addr: "0.0.0.0".to_string(),
            port: 11911,
            provider: "tcp".to_string(),
            backend: "mapstore".to_string(),
            dax_config: None,
            index: None,
            ado_path: None,
            ado_plugins: Vec::new(),
            ado_params: BTreeMap::new(),
            ado_cores: None,
            cert_path: None,
            forced_exit: false,
            profile_file: None,
            debug_level: 0,
        }
    }
}

impl ShardConfig {
    /// True when this shard should run ADO processes.
    pub fn ado_enabled(&self) -> bool {
        self.ado_path.is_some()
    }
}

/// Top-level configuration file: one entry per shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// The shards this server hosts.
    pub shards: Vec<ShardConfig>,
}

impl ConfigFile {
    /// Parse from JSON text.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let cfg = ConfigFile::from_json(
            r#"{ "shards": [ { "core": 3, "port": 11912, "backend": "mapstore" } ] }"#,
        )
        .unwrap();
        assert_eq!(cfg.shards.len(), 1);
        let s = &cfg.shards[0];
        assert_eq!(s.core, 3);
        assert_eq!(s.port, 11912);
        assert_eq!(s.provider, "tcp");
        assert!(!s.ado_enabled());
    }

    #[test]
    fn test_config_loads_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "shards": [ {{ "core": 1 }}, {{ "core": 2, "forced_exit": true }} ] }}"#
        )
        .unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        let cfg = ConfigFile::from_json(&text).unwrap();
        assert_eq!(cfg.shards.len(), 2);
        assert!(cfg.shards[1].forced_exit);
    }

    #[test]
    fn test_config_ado_fields() {
        let cfg = ConfigFile::from_json(
            r#"{ "shards": [ {
                "ado_path": "/usr/bin/mcas-ado",
                "ado_plugins": ["libado-demo.so"],
                "ado_params": { "mode": "fast" }
            } ] }"#,
        )
        .unwrap();
        let s = &cfg.shards[0];
        assert!(s.ado_enabled());
        assert_eq!(s.ado_plugins, vec!["libado-demo.so"]);
        assert_eq!(s.ado_params.get("mode").map(String::as_str), Some("fast"));
    }
}
