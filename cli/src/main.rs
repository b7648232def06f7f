// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # MIG Scheduler
//!
//! The `mig-scheduler` binary runs the coordinator that sits between
//! investigators and the agent fleet.
//!
//! ## Commands
//!
//! - `mig-scheduler run` - Start the coordinator and block until shutdown
//! - `mig-scheduler config show|validate` - Configuration management
//! - `mig-scheduler key generate` - Create an ed25519 signing key
//! - `mig-scheduler action sign|verify` - Sign actions and check them against an ACL

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use mig_coordinator_core::domain::scheduler_config::{LoggingConfig, SchedulerConfigManifest};
use mig_scheduler::commands::{self, ActionCommand, ConfigCommand, KeyCommand};

/// MIG Scheduler - Dispatch signed actions to the agent fleet
#[derive(Parser)]
#[command(name = "mig-scheduler")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "MIG_SCHEDULER_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to `logging.level`
    #[arg(long, global = true, env = "MIG_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format (compact, json); defaults to `logging.format`
    #[arg(long, global = true, env = "MIG_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator
    #[command(name = "run")]
    Run,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Signing key management
    #[command(name = "key")]
    Key {
        #[command(subcommand)]
        command: KeyCommand,
    },

    /// Sign and verify action files
    #[command(name = "action")]
    Action {
        #[command(subcommand)]
        command: ActionCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The coordinator takes its logging defaults from the config file; the
    // operator helpers only log on request.
    let mut logging = match cli.command {
        Commands::Run => SchedulerConfigManifest::load_or_default(cli.config.clone())
            .map(|c| c.spec.logging)
            .unwrap_or_default(),
        _ => LoggingConfig {
            level: "warn".to_string(),
            ..LoggingConfig::default()
        },
    };
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    init_logging(&logging)?;

    match cli.command {
        Commands::Run => commands::run::execute(cli.config).await,
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
        Commands::Key { command } => commands::key::handle_command(command).await,
        Commands::Action { command } => commands::action::handle_command(command, cli.config).await,
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match logging.format.as_str() {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        other => anyhow::bail!("Unknown log format '{}': expected compact or json", other),
    }

    Ok(())
}
