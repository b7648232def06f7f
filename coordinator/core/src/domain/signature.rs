// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Signature Service Boundary
//!
//! The signing primitive is an opaque collaborator: something that can sign a
//! canonical string with a named key, and something that can tell which key
//! produced a signature. Everything above that boundary (which strings get
//! signed, how many signers are required, who may sign what) lives here and
//! in [`crate::domain::acl`].
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** `Signer` / `SignatureVerifier` traits, action signing and
//!   multi-signature verification.
//! - **Implementations:** `crate::infrastructure::keyring`

use std::collections::HashSet;

use thiserror::Error;

use crate::domain::action::{Action, ActionError};

/// Produces signatures with keys held in a secret keyring.
pub trait Signer: Send + Sync {
    /// Signs `message` with the key whose fingerprint is `key_id`.
    fn sign(&self, message: &str, key_id: &str) -> Result<String, SignatureError>;
}

/// Resolves signatures against a public keyring.
pub trait SignatureVerifier: Send + Sync {
    /// Returns the fingerprint of the key that produced `signature` over
    /// `message`, or an error when the signature does not verify.
    fn signer_fingerprint(&self, message: &str, signature: &str) -> Result<String, SignatureError>;
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signing key {0} not found in keyring")]
    KeyNotFound(String),

    #[error("malformed keyring: {0}")]
    MalformedKeyring(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature verification failed for key {0}")]
    InvalidSignature(String),

    #[error("key {0} signed more than once")]
    DuplicateSigner(String),

    #[error("not enough valid signatures: need {required}, got {found}")]
    NotEnoughSignatures { required: usize, found: usize },

    #[error("cannot canonicalize action: {0}")]
    Canonical(#[from] ActionError),
}

/// Signs the canonical form of `action`. The caller appends the result to
/// `action.signatures`.
pub fn sign_action(action: &Action, key_id: &str, signer: &dyn Signer) -> Result<String, SignatureError> {
    let canonical = action.canonical_string()?;
    signer.sign(&canonical, key_id)
}

/// Verifies every signature on `action` and returns the signer fingerprints,
/// uppercased, in signature order.
///
/// Fails when any signature is invalid, when one key signed twice, or when
/// fewer than `required` signatures are present.
pub fn verify_signatures(
    action: &Action,
    required: usize,
    verifier: &dyn SignatureVerifier,
) -> Result<Vec<String>, SignatureError> {
    let canonical = action.canonical_string()?;
    let mut seen = HashSet::new();
    let mut fingerprints = Vec::with_capacity(action.signatures.len());
    for signature in &action.signatures {
        let fingerprint = verifier.signer_fingerprint(&canonical, signature)?.to_uppercase();
        if !seen.insert(fingerprint.clone()) {
            return Err(SignatureError::DuplicateSigner(fingerprint));
        }
        fingerprints.push(fingerprint);
    }
    if fingerprints.len() < required {
        return Err(SignatureError::NotEnoughSignatures {
            required,
            found: fingerprints.len(),
        });
    }
    Ok(fingerprints)
}
