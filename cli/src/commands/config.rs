// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;

use mig_coordinator_core::domain::acl::Acl;
use mig_coordinator_core::domain::scheduler_config::SchedulerConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate a configuration file and the files it references
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config =
        SchedulerConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("Configuration discovery paths:");
        match &config_override {
            Some(path) => println!("  1. --config flag / MIG_SCHEDULER_CONFIG: {}", path.display()),
            None => println!("  1. --config flag / MIG_SCHEDULER_CONFIG: (not set)"),
        }
        println!("  2. ./mig-scheduler.yaml");
        println!("  3. ~/.mig/scheduler.yaml");
        println!("  4. /etc/mig/scheduler.yaml");
        match SchedulerConfigManifest::discover_config() {
            Some(found) if config_override.is_none() => println!("  using: {}", found.display()),
            _ if config_override.is_none() => println!("  using: built-in defaults"),
            _ => {}
        }
        println!();
    }

    print!("{}", config.to_yaml_string()?);
    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = SchedulerConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    validate_referenced_files(&config)?;

    println!("✓ Configuration is valid");
    Ok(())
}

/// Parses the ACL and whitelist the coordinator would load at startup.
pub fn validate_referenced_files(config: &SchedulerConfigManifest) -> Result<()> {
    let spec = &config.spec;
    if let Some(path) = &spec.signing.acl {
        let acl = Acl::from_file(path).with_context(|| format!("Failed to load ACL {:?}", path))?;
        for permission in &acl.permissions {
            anyhow::ensure!(
                permission.minimum_weight >= 1,
                "ACL entry '{}' has minimum weight {}, must be at least 1",
                permission.module,
                permission.minimum_weight
            );
        }
    }
    if let Some(path) = &spec.agent.whitelist {
        crate::commands::run::load_whitelist(path)?;
    }
    if let Some(path) = &spec.signing.secret_keyring {
        crate::commands::run::load_scheduler_key(path, &spec.signing.key_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_acl_with_zero_weight() {
        let dir = tempfile::tempdir().unwrap();
        let acl_path = dir.path().join("acl.yaml");
        std::fs::write(
            &acl_path,
            "permissions:\n  - module: default\n    minimumweight: 0\n    investigators: []\n",
        )
        .unwrap();

        let mut config = SchedulerConfigManifest::default();
        config.spec.signing.acl = Some(acl_path);
        let err = validate_referenced_files(&config).unwrap_err();
        assert!(err.to_string().contains("minimum weight 0"));
    }

    #[test]
    fn test_rejects_bad_whitelist_regex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whitelist");
        std::fs::write(&path, "linux.host1\nre:linux.(unclosed\n").unwrap();

        let mut config = SchedulerConfigManifest::default();
        config.spec.agent.whitelist = Some(path);
        assert!(validate_referenced_files(&config).is_err());
    }
}
