// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Action file commands
//!
//! Investigators sign an action before dropping it in the spool; `verify`
//! runs the same checks the coordinator applies on intake.

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};

use mig_coordinator_core::domain::acl::{verify_acl, Acl};
use mig_coordinator_core::domain::action::Action;
use mig_coordinator_core::domain::scheduler_config::SchedulerConfigManifest;
use mig_coordinator_core::domain::signature::sign_action;
use mig_coordinator_core::infrastructure::keyring::{Ed25519PublicKeyring, Ed25519SecretKeyring};

#[derive(Subcommand)]
pub enum ActionCommand {
    /// Compress requested operations and append a signature
    Sign {
        /// Action JSON file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Secret keyring holding the signing key
        #[arg(short = 'k', long, value_name = "FILE")]
        secret_keyring: PathBuf,

        /// Fingerprint of the signing key (default: the only key in the keyring)
        #[arg(long)]
        key_id: Option<String>,

        /// Write the signed action here instead of overwriting FILE
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Verify the signatures on an action and check it against an ACL
    Verify {
        /// Action JSON file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Public keyring of the investigators
        #[arg(short = 'p', long, value_name = "FILE")]
        public_keyring: PathBuf,

        /// ACL file (default: `signing.acl` from the configuration)
        #[arg(long, value_name = "FILE")]
        acl: Option<PathBuf>,
    },
}

pub async fn handle_command(command: ActionCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ActionCommand::Sign {
            file,
            secret_keyring,
            key_id,
            output,
        } => {
            let signed = sign(&file, &secret_keyring, key_id.as_deref())?;
            let dest = output.unwrap_or(file);
            let body = signed.to_json().context("Failed to serialize action")?;
            std::fs::write(&dest, body).with_context(|| format!("Failed to write {:?}", dest))?;
            println!("✓ action signed ({} signature(s)): {}", signed.signatures.len(), dest.display());
            Ok(())
        }
        ActionCommand::Verify {
            file,
            public_keyring,
            acl,
        } => {
            let config = SchedulerConfigManifest::load_or_default(config_override)
                .context("Failed to load configuration")?;
            let acl_path = acl.or(config.spec.signing.acl);
            let signers = verify(&file, &public_keyring, acl_path.as_deref(), config.spec.signing.only_verify_pubkey)?;
            println!("✓ action is valid, signed by:");
            for fingerprint in signers {
                println!("  {}", fingerprint);
            }
            Ok(())
        }
    }
}

fn read_action(path: &Path) -> Result<Action> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read action {:?}", path))?;
    Action::from_json(&data).with_context(|| format!("Failed to parse action {:?}", path))
}

/// Returns the action at `path` with requested operations compressed and
/// one more signature appended.
pub fn sign(path: &Path, secret_keyring: &Path, key_id: Option<&str>) -> Result<Action> {
    let mut action = read_action(path)?;
    anyhow::ensure!(!action.operations.is_empty(), "Action {:?} has no operations", path);
    action
        .compress_requested_operations()
        .context("Failed to compress operations")?;

    let file = std::fs::File::open(secret_keyring)
        .with_context(|| format!("Failed to open secret keyring {:?}", secret_keyring))?;
    let keyring = Ed25519SecretKeyring::from_reader(file)?;
    let key_id = match key_id {
        Some(id) => id.to_uppercase(),
        None => match keyring.fingerprints().as_slice() {
            [only] => only.clone(),
            _ => anyhow::bail!("keyring {:?} does not hold exactly one key, use --key-id", secret_keyring),
        },
    };

    let signature = sign_action(&action, &key_id, &keyring).context("Failed to sign action")?;
    action.signatures.push(signature);
    Ok(action)
}

/// Verifies the action at `path` and returns its signer fingerprints.
pub fn verify(path: &Path, public_keyring: &Path, acl: Option<&Path>, pubkey_only: bool) -> Result<Vec<String>> {
    let action = read_action(path)?;
    action.validate().context("Action is not valid")?;

    let file = std::fs::File::open(public_keyring)
        .with_context(|| format!("Failed to open public keyring {:?}", public_keyring))?;
    let keyring = Ed25519PublicKeyring::from_reader(file)?;

    let acl = match acl {
        Some(path) => Acl::from_file(path).with_context(|| format!("Failed to load ACL {:?}", path))?,
        None if pubkey_only => Acl::default(),
        None => anyhow::bail!("no ACL given and signing.acl is not configured"),
    };
    let signers = verify_acl(&action, &acl, &keyring, pubkey_only).context("Action rejected")?;
    Ok(signers)
}
