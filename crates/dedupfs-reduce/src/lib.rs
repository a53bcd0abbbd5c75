#![warn(missing_docs)]

//! dedupfs reduction subsystem: block fingerprinting (BLAKE3) and the compression method registry
//!
//! Write path: Block → Fingerprint (BLAKE3) → Dedupe lookup → Compress (best of configured methods) → Store
//! Read path:  Store → Decompress (method recorded per hash) → Block

pub mod compression;
pub mod error;
pub mod fingerprint;

pub use compression::{
    CompressedBlock, CompressionAlgorithm, CompressionPlan, CompressionRegistry, MethodDescriptor,
    MethodSpec,
};
pub use error::ReduceError;
pub use fingerprint::{blake3_hash, BlockHash};
