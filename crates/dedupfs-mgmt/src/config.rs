//! Configuration file of the management CLI.

use dedupfs_meta::{EngineConfig, DEFAULT_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::retention::RetentionPolicy;

/// Settings of `dfs-mgmt`, read from a TOML or JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    /// Store file; unset keeps the store in memory for the lifetime of the process.
    pub data_path: Option<PathBuf>,
    /// Block size for a new store; an existing store keeps its own.
    pub block_size: usize,
    /// Compression methods for new blocks, as `name` or `name:level`.
    pub compression: Vec<String>,
    /// Default policy of `subvolume cleanup`.
    pub retention: RetentionPolicy,
    /// Emit logs as JSON lines instead of plain text.
    pub log_json: bool,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            data_path: engine.data_path,
            block_size: DEFAULT_BLOCK_SIZE,
            compression: engine.compression,
            retention: RetentionPolicy::default(),
            log_json: false,
        }
    }
}

impl MgmtConfig {
    /// Loads the file at `path`; the extension picks the format.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: MgmtConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: MgmtConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Options for opening the engine.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            data_path: self.data_path.clone(),
            block_size: self.block_size,
            compression: self.compression.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MgmtConfig::default();
        assert!(config.data_path.is_none());
        assert_eq!(config.block_size, 131072);
        assert_eq!(config.compression, vec!["zstd:3", "lz4"]);
        assert_eq!(config.retention, RetentionPolicy::new(7, 4, 2, 1));
        assert!(!config.log_json);
        assert_eq!(config.engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "data_path": "/var/lib/dedupfs/store.ddfs",
                "block_size": 65536,
                "compression": ["lz4"],
                "retention": {{ "daily": 14 }}
            }}"#
        )
        .unwrap();

        let config = MgmtConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.data_path,
            Some(PathBuf::from("/var/lib/dedupfs/store.ddfs"))
        );
        assert_eq!(config.block_size, 65536);
        assert_eq!(config.compression, vec!["lz4"]);
        assert_eq!(config.retention, RetentionPolicy::new(14, 4, 2, 1));
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
data_path = "/tmp/store.ddfs"
compression = ["zstd:9"]
log_json = true

[retention]
daily = 3
yearly = 0
"#
        )
        .unwrap();

        let config = MgmtConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_path, Some(PathBuf::from("/tmp/store.ddfs")));
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.compression, vec!["zstd:9"]);
        assert!(config.log_json);
        assert_eq!(config.retention, RetentionPolicy::new(3, 4, 2, 0));
        config.engine_config().validate().unwrap();
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(MgmtConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_negative_retention_rejected() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[retention]\ndaily = -1").unwrap();
        assert!(MgmtConfig::from_file(file.path()).is_err());
    }
}
