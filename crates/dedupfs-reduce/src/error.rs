//! Error types for the dedupfs-reduce subsystem

/// All errors that can occur during block reduction
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// No compression method is registered under this name
    #[error("Unknown compression method: {0}")]
    UnknownMethod(String),
    /// Method is kept for reading legacy blocks only
    #[error("Compression method {0} is deprecated and cannot be used for new writes")]
    DeprecatedMethod(String),
    /// Level given for a method that does not take one, or outside its range
    #[error("Invalid level {level} for compression method {method}")]
    InvalidLevel {
        /// Method name
        method: String,
        /// Rejected level
        level: i32,
    },
    /// A `name[:level]` method string could not be parsed
    #[error("Invalid compression method spec: {0:?}")]
    InvalidMethodSpec(String),
}
