//! kvsync CLI
//!
//! Command-line interface for kvsync - configuration management and an
//! offline simulator for pattern subscriptions.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kvsync_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "kvsync")]
#[command(about = "kvsync - client for hierarchical key-value pub/sub stores")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Replay a script of store operations and show the resulting state
    Simulate {
        /// JSON-lines script of set/publish/delete operations
        script: PathBuf,
        /// Pattern to subscribe to
        #[arg(short, long, default_value = "#")]
        pattern: String,
        /// Show the key tree instead of the key/value map
        #[arg(long)]
        tree: bool,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (hosts, port, auth_token, cache.max_age_secs, ...)
        key: String,
        /// Configuration value ("none" clears optional values)
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.unwrap_or_else(Config::config_file_path);

    match cli.command {
        Commands::Config { command } => handle_config_command(command, &config_path, &output),
        Commands::Simulate {
            script,
            pattern,
            tree,
        } => {
            let config =
                Config::load_from_path(&config_path).context("Failed to load configuration")?;
            init_logging(&config, cli.verbose);
            commands::simulate::run(&config, &script, &pattern, tree, &output).await
        }
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: &Path,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize logging
///
/// Logs go to stderr, or to `log_file` when configured. RUST_LOG overrides
/// the default filter.
fn init_logging(config: &Config, verbose: bool) {
    let log_level = if verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("kvsync_core={},kvsync_cli={}", log_level, log_level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let Some(log_path) = &config.log_file else {
        let _ = builder.with_writer(std::io::stderr).try_init();
        return;
    };

    match File::create(log_path) {
        Ok(log_file) => {
            // Ignore error if already initialized
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(log_file))
                .try_init();
            info!("Logging initialized to {:?}", log_path);
        }
        Err(e) => {
            eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
