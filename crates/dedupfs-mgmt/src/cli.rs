//! `dfs-mgmt` command line and command execution.

use crate::config::MgmtConfig;
use crate::format::{format_gc_stats, format_listing, format_remove_report, format_usage, to_datetime};
use crate::retention::{RetentionError, RetentionPolicy};
use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use dedupfs_meta::{Engine, ErrorKind, MetaError};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;
use tracing::{info, warn};

/// Success
pub const EXIT_OK: i32 = 0;
/// Backend or unexpected failure
pub const EXIT_FAILURE: i32 = 1;
/// Subvolume or entry not found
pub const EXIT_NOT_FOUND: i32 = 2;
/// Conflict or invalid input
pub const EXIT_INVALID: i32 = 3;

/// Command line of `dfs-mgmt`.
#[derive(Parser)]
#[command(name = "dfs-mgmt")]
#[command(about = "dedupfs subvolume management CLI", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "DFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Store file, overriding the configuration
    #[arg(short, long, env = "DFS_DATA")]
    pub data: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command to run
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Command {
    /// Manage subvolumes and snapshots
    Subvolume {
        /// Subvolume operation
        #[command(subcommand)]
        cmd: SubvolumeCmd,
    },
    /// Delete names and blocks no subvolume references
    Gc,
}

/// Subvolume operations.
#[derive(Subcommand, Clone)]
pub enum SubvolumeCmd {
    /// Create an empty subvolume
    Create {
        /// Subvolume name
        name: String,
    },
    /// List subvolumes with their sizes and timestamps
    List,
    /// Remove a subvolume and release its blocks
    Remove {
        /// Subvolume name
        name: String,
    },
    /// Show or change the read-only flag
    Readonly {
        /// Subvolume name
        name: String,
        /// New state; omitted shows the current one
        state: Option<Switch>,
    },
    /// Report sizes and deduplication of a subvolume
    Usage {
        /// Subvolume name
        name: String,
        /// Also break blocks down by compression method
        #[arg(long)]
        types: bool,
    },
    /// Copy a subvolume, sharing its blocks
    Snapshot {
        /// Subvolume to copy
        source: String,
        /// Name of the copy
        target: String,
        /// Mark the copy read-only
        #[arg(long)]
        readonly: bool,
    },
    /// Remove read-only subvolumes the retention policy does not keep
    Cleanup {
        /// Daily slots to keep
        #[arg(long, allow_negative_numbers = true)]
        daily: Option<i64>,
        /// Weekly slots to keep
        #[arg(long, allow_negative_numbers = true)]
        weekly: Option<i64>,
        /// Monthly slots to keep
        #[arg(long, allow_negative_numbers = true)]
        monthly: Option<i64>,
        /// Yearly slots to keep
        #[arg(long, allow_negative_numbers = true)]
        yearly: Option<i64>,
        /// Full policy as daily=N,weekly=N,monthly=N,yearly=N
        #[arg(long)]
        policy: Option<String>,
        /// Only consider subvolumes whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Print the plan without removing anything
        #[arg(long)]
        dry_run: bool,
        /// Reference time of the plan
        #[arg(long, hide = true)]
        now: Option<DateTime<Utc>>,
    },
}

/// Read-only state argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    /// Read-only
    On,
    /// Writable
    Off,
}

/// Maps a failure onto the process exit code.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<MetaError>() {
            return match e.kind() {
                ErrorKind::NotFound => EXIT_NOT_FOUND,
                ErrorKind::Conflict | ErrorKind::Validation => EXIT_INVALID,
                ErrorKind::Backend => EXIT_FAILURE,
            };
        }
        if cause.downcast_ref::<RetentionError>().is_some() {
            return EXIT_INVALID;
        }
    }
    EXIT_FAILURE
}

impl Cli {
    /// Configuration file merged with command-line overrides.
    pub fn load_config(&self) -> Result<MgmtConfig> {
        let mut config = match &self.config {
            Some(path) => MgmtConfig::from_file(path)?,
            None => MgmtConfig::default(),
        };
        if let Some(data) = &self.data {
            config.data_path = Some(data.clone());
        }
        Ok(config)
    }

    /// Runs the command against `engine` and returns what to print.
    pub fn execute(&self, engine: &Engine, config: &MgmtConfig) -> Result<String> {
        match &self.command {
            Command::Subvolume { cmd } => Self::subvolume(cmd, engine, config),
            Command::Gc => {
                let stats = engine.gc()?.run()?;
                Ok(format_gc_stats(&stats))
            }
        }
    }

    fn subvolume(cmd: &SubvolumeCmd, engine: &Engine, config: &MgmtConfig) -> Result<String> {
        let subvolumes = engine.subvolumes();
        match cmd {
            SubvolumeCmd::Create { name } => {
                let record = subvolumes.create(name.as_bytes())?;
                Ok(format!("Subvolume {} ready (id {}).\n", record.display_name(), record.id))
            }
            SubvolumeCmd::List => Ok(format_listing(&subvolumes.list()?)?),
            SubvolumeCmd::Remove { name } => {
                let report = subvolumes.remove(name.as_bytes())?;
                let text = format_remove_report(&report)?;
                if !report.is_complete() {
                    anyhow::bail!("{}", text.trim_end());
                }
                Ok(text)
            }
            SubvolumeCmd::Readonly { name, state } => {
                let record = subvolumes.get(name.as_bytes())?;
                let Some(state) = state else {
                    return Ok(format!(
                        "Subvolume {} is {}.\n",
                        record.display_name(),
                        if record.readonly { "read-only" } else { "writable" }
                    ));
                };
                let flag = *state == Switch::On;
                let changed = subvolumes.readonly(name.as_bytes(), flag)?;
                let mode = if flag { "read-only" } else { "writable" };
                Ok(if changed {
                    format!("Subvolume {} is now {}.\n", record.display_name(), mode)
                } else {
                    format!("Subvolume {} was already {}.\n", record.display_name(), mode)
                })
            }
            SubvolumeCmd::Usage { name, types } => {
                let usage = subvolumes.get_usage(name.as_bytes(), *types)?;
                Ok(format_usage(&usage)?)
            }
            SubvolumeCmd::Snapshot {
                source,
                target,
                readonly,
            } => {
                let record = subvolumes.snapshot(source.as_bytes(), target.as_bytes(), *readonly)?;
                Ok(format!(
                    "Snapshot {} of {} created{}.\n",
                    record.display_name(),
                    source,
                    if record.readonly { " (read-only)" } else { "" }
                ))
            }
            SubvolumeCmd::Cleanup {
                daily,
                weekly,
                monthly,
                yearly,
                policy,
                prefix,
                dry_run,
                now,
            } => {
                let mut retention = match policy {
                    Some(text) => text.parse::<RetentionPolicy>()?,
                    None => config.retention,
                };
                if let Some(v) = daily {
                    retention.set_daily(*v)?;
                }
                if let Some(v) = weekly {
                    retention.set_weekly(*v)?;
                }
                if let Some(v) = monthly {
                    retention.set_monthly(*v)?;
                }
                if let Some(v) = yearly {
                    retention.set_yearly(*v)?;
                }
                Self::cleanup(
                    engine,
                    &retention,
                    prefix.as_deref(),
                    *dry_run,
                    now.unwrap_or_else(Utc::now),
                )
            }
        }
    }

    fn cleanup(
        engine: &Engine,
        retention: &RetentionPolicy,
        prefix: Option<&str>,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let mut by_date: BTreeMap<DateTime<Utc>, Vec<String>> = BTreeMap::new();
        for listing in engine.subvolumes().list()? {
            let record = listing.record;
            let name = record.display_name();
            if !record.readonly || prefix.is_some_and(|p| !name.starts_with(p)) {
                continue;
            }
            match to_datetime(record.created_at) {
                Some(date) => by_date.entry(date).or_default().push(name),
                None => warn!(name = %name, "creation time out of range, skipped"),
            }
        }
        let dates: Vec<DateTime<Utc>> = by_date.keys().copied().collect();
        let plan = retention.plan(now, &dates);
        info!(%retention, keep = plan.keep.len(), remove = plan.remove.len(), dry_run, "cleanup plan");

        let mut out = String::new();
        writeln!(out, "Retention policy: {}", retention)?;
        for date in &plan.keep {
            for name in by_date.get(date).into_iter().flatten() {
                writeln!(out, "keep    {} ({})", name, date.format("%Y-%m-%d %H:%M:%S"))?;
            }
        }
        let mut failures = 0;
        for date in &plan.remove {
            for name in by_date.get(date).into_iter().flatten() {
                writeln!(out, "remove  {} ({})", name, date.format("%Y-%m-%d %H:%M:%S"))?;
                if dry_run {
                    continue;
                }
                let report = engine.subvolumes().remove(name.as_bytes())?;
                if !report.is_complete() {
                    failures += 1;
                    out.push_str(&format_remove_report(&report)?);
                }
            }
        }
        if dry_run {
            writeln!(out, "Dry run, nothing removed.")?;
        }
        if failures > 0 {
            anyhow::bail!("{}{} subvolume(s) only partially removed", out, failures);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_subvolume_create() {
        let cli = Cli::parse_from(["dfs-mgmt", "subvolume", "create", "@main"]);
        match &cli.command {
            Command::Subvolume {
                cmd: SubvolumeCmd::Create { name },
            } => assert_eq!(name, "@main"),
            _ => panic!("Expected subvolume create"),
        }
    }

    #[test]
    fn test_cli_readonly_switch() {
        let cli = Cli::parse_from(["dfs-mgmt", "subvolume", "readonly", "snap", "off"]);
        match &cli.command {
            Command::Subvolume {
                cmd: SubvolumeCmd::Readonly { name, state },
            } => {
                assert_eq!(name, "snap");
                assert_eq!(*state, Some(Switch::Off));
            }
            _ => panic!("Expected subvolume readonly"),
        }
    }

    #[test]
    fn test_cli_usage_types_flag() {
        let cli = Cli::parse_from(["dfs-mgmt", "subvolume", "usage", "snap", "--types"]);
        match &cli.command {
            Command::Subvolume {
                cmd: SubvolumeCmd::Usage { types, .. },
            } => assert!(*types),
            _ => panic!("Expected subvolume usage"),
        }
    }

    #[test]
    fn test_cli_cleanup_negative_count_parses() {
        let cli = Cli::parse_from(["dfs-mgmt", "subvolume", "cleanup", "--daily", "-1", "--dry-run"]);
        match &cli.command {
            Command::Subvolume {
                cmd: SubvolumeCmd::Cleanup { daily, dry_run, .. },
            } => {
                assert_eq!(*daily, Some(-1));
                assert!(*dry_run);
            }
            _ => panic!("Expected subvolume cleanup"),
        }
    }

    #[test]
    fn test_cli_gc_and_globals() {
        let cli = Cli::parse_from(["dfs-mgmt", "-vv", "--data", "/tmp/x.ddfs", "gc"]);
        assert!(matches!(cli.command, Command::Gc));
        assert_eq!(cli.verbose, 2);
        let config = cli.load_config().unwrap();
        assert_eq!(config.data_path, Some(PathBuf::from("/tmp/x.ddfs")));
    }

    #[test]
    fn test_exit_codes() {
        let not_found = anyhow::Error::new(MetaError::SubvolumeNotFound("x".into()));
        assert_eq!(exit_code(&not_found), EXIT_NOT_FOUND);
        let conflict = anyhow::Error::new(MetaError::SubvolumeExists("x".into()));
        assert_eq!(exit_code(&conflict), EXIT_INVALID);
        let invalid = anyhow::Error::new(RetentionError::UnknownGranularity("hourly".into()));
        assert_eq!(exit_code(&invalid), EXIT_INVALID);
        let wrapped = anyhow::Error::new(MetaError::InvalidName("empty".into())).context("create");
        assert_eq!(exit_code(&wrapped), EXIT_INVALID);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), EXIT_FAILURE);
    }
}
