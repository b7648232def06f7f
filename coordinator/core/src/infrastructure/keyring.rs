// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Ed25519 Keyrings
//!
//! Concrete [`Signer`] and [`SignatureVerifier`] backed by ed25519 keys.
//!
//! Keyrings are read from text streams, one base64 key per line. Blank lines
//! and lines starting with `#` are ignored. A secret keyring holds 32-byte
//! seeds; a public keyring holds 32-byte verifying keys.
//!
//! A key's fingerprint is the uppercase hex of the first 20 bytes of
//! SHA-256 over its public key. Signatures travel as
//! `<FINGERPRINT>:<base64 signature>` so the verifier knows which key to try.

use std::collections::HashMap;
use std::io::Read;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::domain::investigator::Investigator;
use crate::domain::signature::{SignatureError, SignatureVerifier, Signer};

pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode_upper(&digest[..20])
}

fn decode_key(line: &str) -> Result<[u8; 32], SignatureError> {
    let bytes = STANDARD
        .decode(line)
        .map_err(|e| SignatureError::MalformedKeyring(format!("invalid base64 key: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| SignatureError::MalformedKeyring("key must be 32 bytes".to_string()))
}

fn read_lines(mut stream: impl Read) -> Result<Vec<String>, SignatureError> {
    let mut content = String::new();
    stream
        .read_to_string(&mut content)
        .map_err(|e| SignatureError::MalformedKeyring(e.to_string()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

pub struct Ed25519SecretKeyring {
    keys: HashMap<String, SigningKey>,
}

impl Ed25519SecretKeyring {
    pub fn from_reader(stream: impl Read) -> Result<Self, SignatureError> {
        let mut keys = HashMap::new();
        for line in read_lines(stream)? {
            let key = SigningKey::from_bytes(&decode_key(&line)?);
            keys.insert(fingerprint(&key.verifying_key()), key);
        }
        Ok(Self { keys })
    }

    pub fn from_keys(keys: impl IntoIterator<Item = SigningKey>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|k| (fingerprint(&k.verifying_key()), k))
                .collect(),
        }
    }

    /// Generates a fresh key and returns it with its secret keyring line.
    pub fn generate() -> (SigningKey, String) {
        let key = SigningKey::generate(&mut OsRng);
        let line = STANDARD.encode(key.to_bytes());
        (key, line)
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }

    pub fn public_key(&self, key_id: &str) -> Option<VerifyingKey> {
        self.keys
            .get(&key_id.to_uppercase())
            .map(|k| k.verifying_key())
    }
}

impl Signer for Ed25519SecretKeyring {
    fn sign(&self, message: &str, key_id: &str) -> Result<String, SignatureError> {
        let key_id = key_id.to_uppercase();
        let key = self
            .keys
            .get(&key_id)
            .ok_or_else(|| SignatureError::KeyNotFound(key_id.clone()))?;
        let signature = key.sign(message.as_bytes());
        Ok(format!("{}:{}", key_id, STANDARD.encode(signature.to_bytes())))
    }
}

pub struct Ed25519PublicKeyring {
    keys: HashMap<String, VerifyingKey>,
}

impl Ed25519PublicKeyring {
    pub fn from_reader(stream: impl Read) -> Result<Self, SignatureError> {
        let mut keys = HashMap::new();
        for line in read_lines(stream)? {
            let key = VerifyingKey::from_bytes(&decode_key(&line)?)
                .map_err(|e| SignatureError::MalformedKeyring(format!("invalid public key: {}", e)))?;
            keys.insert(fingerprint(&key), key);
        }
        Ok(Self { keys })
    }

    /// Builds a keyring from the public keys of active investigators.
    /// Investigators whose stored key does not match their fingerprint are
    /// left out.
    pub fn from_investigators(investigators: &[Investigator]) -> Self {
        let mut keys = HashMap::new();
        for inv in investigators.iter().filter(|i| i.is_active()) {
            let Ok(bytes) = decode_key(&inv.public_key) else {
                tracing::warn!(investigator = %inv.name, "investigator public key is not a valid ed25519 key");
                continue;
            };
            let Ok(key) = VerifyingKey::from_bytes(&bytes) else {
                continue;
            };
            let fp = fingerprint(&key);
            if !fp.eq_ignore_ascii_case(&inv.fingerprint) {
                tracing::warn!(investigator = %inv.name, "investigator fingerprint does not match public key");
                continue;
            }
            keys.insert(fp, key);
        }
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl SignatureVerifier for Ed25519PublicKeyring {
    fn signer_fingerprint(&self, message: &str, signature: &str) -> Result<String, SignatureError> {
        let (fp, encoded) = signature
            .split_once(':')
            .ok_or_else(|| SignatureError::MalformedSignature("missing key fingerprint".to_string()))?;
        let fp = fp.trim().to_uppercase();
        let key = self
            .keys
            .get(&fp)
            .ok_or_else(|| SignatureError::KeyNotFound(fp.clone()))?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SignatureError::MalformedSignature(format!("invalid base64 signature: {}", e)))?;
        let sig_bytes: [u8; 64] = decoded
            .try_into()
            .map_err(|_| SignatureError::MalformedSignature("signature must be 64 bytes".to_string()))?;
        key.verify(message.as_bytes(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SignatureError::InvalidSignature(fp.clone()))?;
        Ok(fp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::acl::{verify_acl, Acl, Permission, SignerEntry};
    use crate::domain::action::{Action, ActionId, Operation};
    use crate::domain::signature::{sign_action, verify_signatures};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn keyrings(n: usize) -> (Ed25519SecretKeyring, Ed25519PublicKeyring, Vec<String>) {
        let mut secret = String::new();
        let mut public = String::new();
        for _ in 0..n {
            let (key, line) = Ed25519SecretKeyring::generate();
            secret.push_str(&line);
            secret.push('\n');
            public.push_str(&STANDARD.encode(key.verifying_key().as_bytes()));
            public.push('\n');
        }
        let sec = Ed25519SecretKeyring::from_reader(secret.as_bytes()).unwrap();
        let publ = Ed25519PublicKeyring::from_reader(public.as_bytes()).unwrap();
        let mut fps = sec.fingerprints();
        fps.sort();
        (sec, publ, fps)
    }

    fn action() -> Action {
        let now = Utc::now();
        Action::new(
            ActionId(1),
            "check openssl",
            "os='linux'",
            now,
            now + Duration::hours(1),
            vec![Operation::new("pkg", json!({"name": "openssl"}))],
        )
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let (sec, publ, fps) = keyrings(1);
        let mut a = action();
        a.signatures.push(sign_action(&a, &fps[0], &sec).unwrap());
        let signers = verify_signatures(&a, 1, &publ).unwrap();
        assert_eq!(signers, fps);
    }

    #[test]
    fn test_tampered_action_fails_verification() {
        let (sec, publ, fps) = keyrings(1);
        let mut a = action();
        a.signatures.push(sign_action(&a, &fps[0], &sec).unwrap());
        a.target = "os='darwin'".to_string();
        assert!(matches!(
            verify_signatures(&a, 1, &publ),
            Err(SignatureError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_mutable_fields_do_not_break_signature() {
        let (sec, publ, fps) = keyrings(1);
        let mut a = action();
        a.signatures.push(sign_action(&a, &fps[0], &sec).unwrap());
        a.counters.sent = 12;
        a.last_update_time = Some(Utc::now());
        assert!(verify_signatures(&a, 1, &publ).is_ok());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let (sec, _, fps) = keyrings(1);
        let (_, other_public, _) = keyrings(1);
        let mut a = action();
        a.signatures.push(sign_action(&a, &fps[0], &sec).unwrap());
        assert!(matches!(
            verify_signatures(&a, 1, &other_public),
            Err(SignatureError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_signing_with_missing_key_fails() {
        let (sec, _, _) = keyrings(1);
        assert!(matches!(
            sec.sign("message", "0000"),
            Err(SignatureError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_malformed_keyring_is_rejected() {
        assert!(Ed25519SecretKeyring::from_reader("not base64!!".as_bytes()).is_err());
        assert!(Ed25519PublicKeyring::from_reader("# comment only\n".as_bytes())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_required_signature_count() {
        let (sec, publ, fps) = keyrings(1);
        let mut a = action();
        a.signatures.push(sign_action(&a, &fps[0], &sec).unwrap());
        assert!(matches!(
            verify_signatures(&a, 2, &publ),
            Err(SignatureError::NotEnoughSignatures { required: 2, found: 1 })
        ));
    }

    #[test]
    fn test_acl_with_two_cosigners() {
        let (sec, publ, fps) = keyrings(2);
        let acl = Acl {
            name: "two-man".to_string(),
            target: String::new(),
            permissions: vec![Permission {
                module: "pkg".to_string(),
                minimum_weight: 2,
                investigators: fps
                    .iter()
                    .map(|fp| SignerEntry { name: String::new(), fingerprint: fp.to_lowercase(), weight: 1 })
                    .collect(),
            }],
        };

        let mut a = action();
        for fp in &fps {
            a.signatures.push(sign_action(&a, fp, &sec).unwrap());
        }
        assert!(verify_acl(&a, &acl, &publ, false).is_ok());

        let mut dup = action();
        let sig = sign_action(&dup, &fps[0], &sec).unwrap();
        dup.signatures = vec![sig.clone(), sig];
        assert!(verify_acl(&dup, &acl, &publ, false).is_err());

        let mut single = action();
        single.signatures.push(sign_action(&single, &fps[0], &sec).unwrap());
        assert!(verify_acl(&single, &acl, &publ, false).is_err());
        assert!(verify_acl(&single, &acl, &publ, true).is_ok());
    }
}
