#![warn(missing_docs)]

//! `dfs-mgmt`: subvolume administration for a dedupfs store.

use clap::Parser;
use dedupfs_meta::Engine;
use dedupfs_mgmt::cli::{exit_code, Cli, EXIT_OK};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(exit_code(&e) as u8);
        }
    };

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with((!config.log_json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(config.log_json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .init();

    tracing::info!("dedupfs management CLI starting...");
    if config.data_path.is_none() {
        tracing::warn!("no data path configured, using a throwaway in-memory store");
    }

    let result = Engine::open(config.engine_config())
        .map_err(anyhow::Error::from)
        .and_then(|engine| cli.execute(&engine, &config));
    match result {
        Ok(output) => {
            print!("{}", output);
            ExitCode::from(EXIT_OK as u8)
        }
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e) as u8)
        }
    }
}
