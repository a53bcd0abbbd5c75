//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use dedupfs_reduce::{CompressionPlan, CompressionRegistry, MethodSpec};

use crate::types::MetaError;

/// Default size of a file block in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 128 * 1024;

/// Options of one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Store file; `None` keeps everything in memory.
    pub data_path: Option<PathBuf>,
    /// Size of the fixed blocks files are split into.
    pub block_size: usize,
    /// Compression methods tried for new blocks, as `name` or `name:level`.
    pub compression: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            block_size: DEFAULT_BLOCK_SIZE,
            compression: vec!["zstd:3".to_string(), "lz4".to_string()],
        }
    }
}

impl EngineConfig {
    /// Parses the method list.
    pub fn method_specs(&self) -> Result<Vec<MethodSpec>, MetaError> {
        self.compression
            .iter()
            .map(|s| s.parse::<MethodSpec>().map_err(MetaError::from))
            .collect()
    }

    /// Validates the method list against `registry`.
    pub fn compression_plan(&self, registry: &CompressionRegistry) -> Result<CompressionPlan, MetaError> {
        Ok(CompressionPlan::new(registry, &self.method_specs()?)?)
    }

    /// Checks every option without opening anything.
    pub fn validate(&self) -> Result<(), MetaError> {
        if self.block_size == 0 {
            return Err(MetaError::InvalidConfig("block_size must be positive".to_string()));
        }
        self.compression_plan(&CompressionRegistry::builtin())?;
        Ok(())
    }
}
