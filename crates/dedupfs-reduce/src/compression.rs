//! Compression method registry and LZ4/Zstd codecs for the block write path.
//!
//! Every method is described by a static [`MethodDescriptor`] registered at
//! startup. Deprecated methods stay resolvable so legacy blocks can still be
//! decoded, but a [`CompressionPlan`] refuses to use them for new writes.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ReduceError;

/// Codec backing a registered method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// Stored as-is
    None,
    /// LZ4 frame format
    Lz4,
    /// LZ4 block with a 4-byte little-endian size prefix, as written by old stores
    Lz4Legacy,
    /// Zstandard with an adjustable level
    Zstd,
}

/// Static description of a compression method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Name persisted alongside every block compressed with this method
    pub name: &'static str,
    /// Codec implementation
    pub algorithm: CompressionAlgorithm,
    /// Payloads shorter than this are never compressed with this method
    pub minimal_size: usize,
    /// Whether a `:level` suffix is accepted
    pub supports_level: bool,
    /// Readable but never offered for new writes
    pub deprecated: bool,
    /// Inclusive range of accepted levels
    pub level_range: Option<(i32, i32)>,
    /// Level used when none is configured
    pub default_level: Option<i32>,
}

/// Name of the passthrough method.
pub const METHOD_NONE: &str = "none";

static BUILTIN_METHODS: [MethodDescriptor; 4] = [
    MethodDescriptor {
        name: METHOD_NONE,
        algorithm: CompressionAlgorithm::None,
        minimal_size: 0,
        supports_level: false,
        deprecated: false,
        level_range: None,
        default_level: None,
    },
    MethodDescriptor {
        name: "lz4",
        algorithm: CompressionAlgorithm::Lz4,
        minimal_size: 15,
        supports_level: false,
        deprecated: false,
        level_range: None,
        default_level: None,
    },
    MethodDescriptor {
        name: "lz4r07",
        algorithm: CompressionAlgorithm::Lz4Legacy,
        minimal_size: 15,
        supports_level: false,
        deprecated: true,
        level_range: None,
        default_level: None,
    },
    MethodDescriptor {
        name: "zstd",
        algorithm: CompressionAlgorithm::Zstd,
        minimal_size: 16,
        supports_level: true,
        deprecated: false,
        level_range: Some((1, 22)),
        default_level: Some(3),
    },
];

impl MethodDescriptor {
    /// True when a payload of `payload_len` bytes is large enough for this method.
    pub fn should_compress(&self, payload_len: usize) -> bool {
        payload_len >= self.minimal_size
    }

    fn check_level(&self, level: i32) -> Result<(), ReduceError> {
        match self.level_range {
            Some((lo, hi)) if self.supports_level && (lo..=hi).contains(&level) => Ok(()),
            _ => Err(ReduceError::InvalidLevel {
                method: self.name.to_string(),
                level,
            }),
        }
    }

    /// Compress `data`. `level` falls back to the method default.
    pub fn compress(&self, data: &[u8], level: Option<i32>) -> Result<Vec<u8>, ReduceError> {
        if let Some(level) = level {
            self.check_level(level)?;
        }
        match self.algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
                encoder
                    .write_all(data)
                    .map_err(|e| ReduceError::CompressionFailed(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| ReduceError::CompressionFailed(e.to_string()))
            }
            CompressionAlgorithm::Lz4Legacy => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionAlgorithm::Zstd => {
                let level = level.or(self.default_level).unwrap_or(3);
                zstd::encode_all(data, level)
                    .map_err(|e| ReduceError::CompressionFailed(e.to_string()))
            }
        }
    }

    /// Decompress data produced by this method.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        match self.algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => {
                let mut out = Vec::new();
                lz4_flex::frame::FrameDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| ReduceError::DecompressionFailed(e.to_string()))?;
                Ok(out)
            }
            CompressionAlgorithm::Lz4Legacy => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| ReduceError::DecompressionFailed(e.to_string())),
            CompressionAlgorithm::Zstd => {
                zstd::decode_all(data).map_err(|e| ReduceError::DecompressionFailed(e.to_string()))
            }
        }
    }
}

/// Lookup table of compression methods, populated once at startup.
#[derive(Debug, Clone, Copy)]
pub struct CompressionRegistry {
    methods: &'static [MethodDescriptor],
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CompressionRegistry {
    /// Registry with every built-in method.
    pub fn builtin() -> Self {
        Self {
            methods: &BUILTIN_METHODS,
        }
    }

    /// Look up a method by name. Deprecated methods resolve too.
    pub fn resolve(&self, name: &str) -> Result<&'static MethodDescriptor, ReduceError> {
        self.methods
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ReduceError::UnknownMethod(name.to_string()))
    }

    /// Methods that may be used for new writes.
    pub fn offered_for_write(&self) -> impl Iterator<Item = &'static MethodDescriptor> {
        self.methods.iter().filter(|m| !m.deprecated)
    }

    /// Every registered method, deprecated ones included.
    pub fn all(&self) -> &'static [MethodDescriptor] {
        self.methods
    }

    /// Decompress a block stored with the method called `name`.
    pub fn decompress(&self, name: &str, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        self.resolve(name)?.decompress(data)
    }
}

/// A configured method: `zstd:9`, `lz4`, `none`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Registered method name
    pub name: String,
    /// Optional level
    pub level: Option<i32>,
}

impl MethodSpec {
    /// Spec without an explicit level.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level: None,
        }
    }

    /// Spec with an explicit level.
    pub fn with_level(name: impl Into<String>, level: i32) -> Self {
        Self {
            name: name.into(),
            level: Some(level),
        }
    }
}

impl FromStr for MethodSpec {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, level) = match s.split_once(':') {
            Some((name, level)) => {
                let level = level
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| ReduceError::InvalidMethodSpec(s.to_string()))?;
                (name.trim(), Some(level))
            }
            None => (s, None),
        };
        if name.is_empty() {
            return Err(ReduceError::InvalidMethodSpec(s.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            level,
        })
    }
}

impl fmt::Display for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            Some(level) => write!(f, "{}:{}", self.name, level),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Output of [`CompressionPlan::compress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlock {
    /// Name of the method that produced `data`
    pub method: &'static str,
    /// Bytes to store
    pub data: Vec<u8>,
}

impl CompressedBlock {
    fn raw(data: &[u8]) -> Self {
        Self {
            method: METHOD_NONE,
            data: data.to_vec(),
        }
    }
}

/// Validated list of methods tried, in order, for every new block.
#[derive(Debug, Clone)]
pub struct CompressionPlan {
    methods: Vec<(&'static MethodDescriptor, Option<i32>)>,
}

impl CompressionPlan {
    /// Validate `specs` against the registry. Deprecated methods and bad levels are rejected.
    pub fn new(registry: &CompressionRegistry, specs: &[MethodSpec]) -> Result<Self, ReduceError> {
        let mut methods = Vec::with_capacity(specs.len());
        for spec in specs {
            let desc = registry.resolve(&spec.name)?;
            if desc.deprecated {
                return Err(ReduceError::DeprecatedMethod(desc.name.to_string()));
            }
            if let Some(level) = spec.level {
                desc.check_level(level)?;
            }
            methods.push((desc, spec.level));
        }
        Ok(Self { methods })
    }

    /// Plan that stores every block raw.
    pub fn store_raw() -> Self {
        Self {
            methods: Vec::new(),
        }
    }

    /// Methods in this plan, in try order.
    pub fn specs(&self) -> Vec<MethodSpec> {
        self.methods
            .iter()
            .map(|(desc, level)| MethodSpec {
                name: desc.name.to_string(),
                level: *level,
            })
            .collect()
    }

    /// Compress `data` with every applicable method and keep the smallest
    /// result. Falls back to the raw payload when the block is too small for
    /// every method or no method shrinks it.
    pub fn compress(&self, data: &[u8]) -> Result<CompressedBlock, ReduceError> {
        let mut best: Option<CompressedBlock> = None;
        for (desc, level) in &self.methods {
            if desc.algorithm == CompressionAlgorithm::None || !desc.should_compress(data.len()) {
                continue;
            }
            let out = desc.compress(data, *level)?;
            trace!(method = desc.name, input = data.len(), output = out.len(), "compression attempt");
            if out.len() >= data.len() {
                continue;
            }
            if best.as_ref().map_or(true, |b| out.len() < b.data.len()) {
                best = Some(CompressedBlock {
                    method: desc.name,
                    data: out,
                });
            }
        }
        Ok(best.unwrap_or_else(|| CompressedBlock::raw(data)))
    }
}

impl Default for CompressionPlan {
    fn default() -> Self {
        Self::new(
            &CompressionRegistry::builtin(),
            &[MethodSpec::with_level("zstd", 3), MethodSpec::new("lz4")],
        )
        .unwrap_or_else(|_| Self::store_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn repetitive(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 7) as u8).collect()
    }

    #[test]
    fn resolve_builtin_methods() {
        let reg = CompressionRegistry::builtin();
        for name in ["none", "lz4", "lz4r07", "zstd"] {
            assert_eq!(reg.resolve(name).unwrap().name, name);
        }
    }

    #[test]
    fn resolve_unknown_method() {
        let reg = CompressionRegistry::builtin();
        match reg.resolve("brotli") {
            Err(ReduceError::UnknownMethod(name)) => assert_eq!(name, "brotli"),
            other => panic!("expected UnknownMethod, got {:?}", other),
        }
    }

    #[test]
    fn deprecated_methods_not_offered() {
        let reg = CompressionRegistry::builtin();
        let offered: Vec<&str> = reg.offered_for_write().map(|m| m.name).collect();
        assert!(!offered.contains(&"lz4r07"));
        assert!(offered.contains(&"lz4"));
        assert!(reg.resolve("lz4r07").unwrap().deprecated);
    }

    #[test]
    fn should_compress_respects_minimal_size() {
        let lz4 = CompressionRegistry::builtin().resolve("lz4").unwrap();
        assert!(!lz4.should_compress(14));
        assert!(lz4.should_compress(15));
    }

    #[test]
    fn plan_rejects_deprecated_method() {
        let reg = CompressionRegistry::builtin();
        match CompressionPlan::new(&reg, &[MethodSpec::new("lz4r07")]) {
            Err(ReduceError::DeprecatedMethod(name)) => assert_eq!(name, "lz4r07"),
            other => panic!("expected DeprecatedMethod, got {:?}", other),
        }
    }

    #[test]
    fn plan_rejects_level_on_levelless_method() {
        let reg = CompressionRegistry::builtin();
        assert!(matches!(
            CompressionPlan::new(&reg, &[MethodSpec::with_level("lz4", 5)]),
            Err(ReduceError::InvalidLevel { .. })
        ));
        assert!(matches!(
            CompressionPlan::new(&reg, &[MethodSpec::with_level("zstd", 40)]),
            Err(ReduceError::InvalidLevel { .. })
        ));
    }

    #[test]
    fn method_spec_parsing() {
        assert_eq!("zstd:9".parse::<MethodSpec>().unwrap(), MethodSpec::with_level("zstd", 9));
        assert_eq!("lz4".parse::<MethodSpec>().unwrap(), MethodSpec::new("lz4"));
        assert!("zstd:fast".parse::<MethodSpec>().is_err());
        assert!(":3".parse::<MethodSpec>().is_err());
        assert_eq!(MethodSpec::with_level("zstd", 9).to_string(), "zstd:9");
    }

    #[test]
    fn small_block_stored_raw() {
        let plan = CompressionPlan::default();
        let out = plan.compress(b"tiny").unwrap();
        assert_eq!(out.method, METHOD_NONE);
        assert_eq!(out.data, b"tiny");
    }

    #[test]
    fn incompressible_block_stored_raw() {
        // Pseudo-random bytes from an LCG do not shrink.
        let mut x: u32 = 0x1234_5678;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (x >> 24) as u8
            })
            .collect();
        let out = CompressionPlan::default().compress(&data).unwrap();
        assert_eq!(out.method, METHOD_NONE);
        assert_eq!(out.data, data);
    }

    #[test]
    fn compressible_block_picks_smaller_output() {
        let data = repetitive(64 * 1024);
        let out = CompressionPlan::default().compress(&data).unwrap();
        assert_ne!(out.method, METHOD_NONE);
        assert!(out.data.len() < data.len());
        let reg = CompressionRegistry::builtin();
        assert_eq!(reg.decompress(out.method, &out.data).unwrap(), data);
    }

    #[test]
    fn legacy_lz4_still_decodes() {
        let data = repetitive(1024);
        let legacy = lz4_flex::compress_prepend_size(&data);
        let reg = CompressionRegistry::builtin();
        assert_eq!(reg.decompress("lz4r07", &legacy).unwrap(), data);
    }

    #[test]
    fn empty_roundtrips() {
        let reg = CompressionRegistry::builtin();
        for desc in reg.all() {
            let c = desc.compress(&[], None).unwrap();
            let d = desc.decompress(&c).unwrap();
            assert_eq!(d, b"", "method {}", desc.name);
        }
    }

    proptest! {
        #[test]
        fn prop_plan_output_decodes(data in prop::collection::vec(0u8..=255, 0..20_000)) {
            let out = CompressionPlan::default().compress(&data).unwrap();
            prop_assert!(out.data.len() <= data.len());
            let reg = CompressionRegistry::builtin();
            prop_assert_eq!(reg.decompress(out.method, &out.data).unwrap(), data);
        }
    }
}
