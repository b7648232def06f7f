// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Signing key commands

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::Subcommand;
use std::io::Write;
use std::path::{Path, PathBuf};

use mig_coordinator_core::infrastructure::keyring::{fingerprint, Ed25519SecretKeyring};

#[derive(Subcommand)]
pub enum KeyCommand {
    /// Generate an ed25519 key pair
    Generate {
        /// Append the secret key to this keyring (created if missing)
        #[arg(short, long, value_name = "FILE")]
        secret_keyring: Option<PathBuf>,

        /// Append the public key to this keyring (created if missing)
        #[arg(short, long, value_name = "FILE")]
        public_keyring: Option<PathBuf>,
    },
}

pub async fn handle_command(command: KeyCommand) -> Result<()> {
    match command {
        KeyCommand::Generate {
            secret_keyring,
            public_keyring,
        } => generate(secret_keyring.as_deref(), public_keyring.as_deref()),
    }
}

pub struct GeneratedKey {
    pub fingerprint: String,
    pub secret_line: String,
    pub public_line: String,
}

pub fn new_key() -> GeneratedKey {
    let (key, secret_line) = Ed25519SecretKeyring::generate();
    GeneratedKey {
        fingerprint: fingerprint(&key.verifying_key()),
        secret_line,
        public_line: STANDARD.encode(key.verifying_key().as_bytes()),
    }
}

fn generate(secret_keyring: Option<&Path>, public_keyring: Option<&Path>) -> Result<()> {
    let key = new_key();

    match secret_keyring {
        Some(path) => {
            append_line(path, &key.secret_line, true)?;
            println!("secret key appended to {}", path.display());
        }
        None => println!("secret key:  {}", key.secret_line),
    }
    if let Some(path) = public_keyring {
        append_line(path, &key.public_line, false)?;
        println!("public key appended to {}", path.display());
    }
    println!("public key:  {}", key.public_line);
    println!("fingerprint: {}", key.fingerprint);
    Ok(())
}

fn append_line(path: &Path, line: &str, secret: bool) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = secret;

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to open keyring {:?}", path))?;
    writeln!(file, "{}", line).with_context(|| format!("Failed to write keyring {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mig_coordinator_core::infrastructure::keyring::Ed25519PublicKeyring;

    #[test]
    fn test_generated_keys_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let secring = dir.path().join("secring");
        let pubring = dir.path().join("pubring");

        let first = new_key();
        let second = new_key();
        for key in [&first, &second] {
            append_line(&secring, &key.secret_line, true).unwrap();
            append_line(&pubring, &key.public_line, false).unwrap();
        }

        let secret = Ed25519SecretKeyring::from_reader(std::fs::File::open(&secring).unwrap()).unwrap();
        let mut fingerprints = secret.fingerprints();
        fingerprints.sort();
        let mut expected = vec![first.fingerprint.clone(), second.fingerprint.clone()];
        expected.sort();
        assert_eq!(fingerprints, expected);

        let public = Ed25519PublicKeyring::from_reader(std::fs::File::open(&pubring).unwrap()).unwrap();
        assert_eq!(public.len(), 2);
    }
}
