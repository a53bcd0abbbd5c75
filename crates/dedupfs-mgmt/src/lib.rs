#![warn(missing_docs)]

//! dedupfs management subsystem: retention planner, configuration, reports, CLI

pub mod cli;
pub mod config;
pub mod format;
pub mod retention;

pub use config::MgmtConfig;
pub use retention::{Granularity, Interval, RetentionError, RetentionPlan, RetentionPolicy};
