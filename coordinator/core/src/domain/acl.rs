// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Weighted Multi-Signer ACL
//!
//! An ACL lists one [`Permission`] per module. Each permission names the
//! investigators allowed to authorize that module, the weight each of them
//! carries, and the minimum total weight required. An action is authorized
//! only if every one of its operations is.
//!
//! A permission named [`DEFAULT_PERMISSION`] applies to modules that have no
//! entry of their own. With neither, the operation is denied.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** ACL document shape and authorization decisions.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::action::Action;
use crate::domain::signature::{verify_signatures, SignatureError, SignatureVerifier};

pub const DEFAULT_PERMISSION: &str = "default";

/// One investigator's standing within a permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerEntry {
    #[serde(default)]
    pub name: String,
    pub fingerprint: String,
    pub weight: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub module: String,
    #[serde(rename = "minimumweight")]
    pub minimum_weight: i64,
    #[serde(default)]
    pub investigators: Vec<SignerEntry>,
}

impl Permission {
    /// Sums the weight of the distinct signers in `fingerprints`.
    ///
    /// A fingerprint seen twice is a violation. Each ACL entry contributes
    /// at most once even if it is listed twice.
    pub fn signatures_weight(&self, fingerprints: &[String]) -> Result<i64, AclError> {
        let mut seen = HashSet::new();
        let mut used = HashSet::new();
        let mut total = 0;
        for fp in fingerprints {
            let fp = fp.to_uppercase();
            if !seen.insert(fp.clone()) {
                return Err(AclError::DuplicateSigner(fp));
            }
            if let Some((idx, signer)) = self
                .investigators
                .iter()
                .enumerate()
                .find(|(_, s)| s.fingerprint.eq_ignore_ascii_case(&fp))
            {
                if used.insert(idx) {
                    total += signer.weight;
                }
            }
        }
        Ok(total)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl Acl {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AclError> {
        serde_yaml::from_str(yaml).map_err(|e| AclError::Malformed(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AclError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| AclError::Malformed(e.to_string()))?;
        Self::from_yaml_str(&content)
    }

    /// The permission governing `module`, falling back to `default`.
    pub fn permission_for(&self, module: &str) -> Option<&Permission> {
        self.permissions
            .iter()
            .find(|p| p.module == module)
            .or_else(|| self.permissions.iter().find(|p| p.module == DEFAULT_PERMISSION))
    }

    /// Checks that `fingerprints` carry enough weight to run `module`.
    pub fn verify_permission(&self, module: &str, fingerprints: &[String]) -> Result<(), AclError> {
        let permission = self
            .permission_for(module)
            .ok_or_else(|| AclError::NoPermission(module.to_string()))?;
        if permission.minimum_weight < 1 {
            return Err(AclError::InvalidPermission {
                module: permission.module.clone(),
                weight: permission.minimum_weight,
            });
        }
        let weight = permission.signatures_weight(fingerprints)?;
        if weight < permission.minimum_weight {
            return Err(AclError::InsufficientWeight {
                module: module.to_string(),
                need: permission.minimum_weight,
                got: weight,
            });
        }
        Ok(())
    }
}

/// Verifies the signatures on `action` and, unless `pubkey_only` is set,
/// checks every operation against `acl`. Any failure denies.
pub fn verify_acl(
    action: &Action,
    acl: &Acl,
    verifier: &dyn SignatureVerifier,
    pubkey_only: bool,
) -> Result<Vec<String>, AclError> {
    let fingerprints = verify_signatures(action, 1, verifier)?;
    if pubkey_only {
        return Ok(fingerprints);
    }
    if action.operations.is_empty() {
        return Err(AclError::NoPermission("<no operations>".to_string()));
    }
    for operation in &action.operations {
        acl.verify_permission(&operation.module, &fingerprints)?;
    }
    Ok(fingerprints)
}

#[derive(Debug, Error)]
pub enum AclError {
    #[error("no ACL entry found for module {0}, and no default present")]
    NoPermission(String),

    #[error("invalid ACL entry {module}: minimum weight must be > 0, has {weight}")]
    InvalidPermission { module: String, weight: i64 },

    #[error("permission violation: key {0} used to sign multiple times")]
    DuplicateSigner(String),

    #[error("permission denied for operation {module}: insufficient signatures weight (need {need}, got {got})")]
    InsufficientWeight { module: String, need: i64, got: i64 },

    #[error("malformed ACL: {0}")]
    Malformed(String),

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl() -> Acl {
        Acl {
            name: "ops".to_string(),
            target: "status='online'".to_string(),
            permissions: vec![
                Permission {
                    module: "pkg".to_string(),
                    minimum_weight: 2,
                    investigators: vec![
                        SignerEntry { name: "alice".into(), fingerprint: "aaaa".into(), weight: 1 },
                        SignerEntry { name: "bob".into(), fingerprint: "BBBB".into(), weight: 1 },
                        SignerEntry { name: "carol".into(), fingerprint: "CCCC".into(), weight: 2 },
                    ],
                },
                Permission {
                    module: DEFAULT_PERMISSION.to_string(),
                    minimum_weight: 1,
                    investigators: vec![SignerEntry {
                        name: "alice".into(),
                        fingerprint: "AAAA".into(),
                        weight: 1,
                    }],
                },
            ],
        }
    }

    fn fps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_two_light_signers_meet_threshold() {
        assert!(acl().verify_permission("pkg", &fps(&["AAAA", "bbbb"])).is_ok());
    }

    #[test]
    fn test_one_light_signer_is_insufficient() {
        let err = acl().verify_permission("pkg", &fps(&["AAAA"])).unwrap_err();
        assert!(matches!(err, AclError::InsufficientWeight { need: 2, got: 1, .. }));
    }

    #[test]
    fn test_heavy_signer_alone_is_enough() {
        assert!(acl().verify_permission("pkg", &fps(&["cccc"])).is_ok());
    }

    #[test]
    fn test_repeated_fingerprint_is_a_violation() {
        let err = acl().verify_permission("pkg", &fps(&["AAAA", "aaaa"])).unwrap_err();
        assert!(matches!(err, AclError::DuplicateSigner(_)));
    }

    #[test]
    fn test_unknown_signers_carry_no_weight() {
        assert!(acl().verify_permission("pkg", &fps(&["DDDD", "EEEE"])).is_err());
    }

    #[test]
    fn test_default_permission_applies_to_unlisted_modules() {
        assert!(acl().verify_permission("file", &fps(&["AAAA"])).is_ok());
        assert!(acl().verify_permission("file", &fps(&["BBBB"])).is_err());
    }

    #[test]
    fn test_missing_entry_and_default_denies() {
        let mut acl = acl();
        acl.permissions.retain(|p| p.module != DEFAULT_PERMISSION);
        let err = acl.verify_permission("file", &fps(&["AAAA"])).unwrap_err();
        assert!(matches!(err, AclError::NoPermission(_)));
    }

    #[test]
    fn test_zero_minimum_weight_is_invalid() {
        let mut acl = acl();
        acl.permissions[0].minimum_weight = 0;
        assert!(matches!(
            acl.verify_permission("pkg", &fps(&["CCCC"])),
            Err(AclError::InvalidPermission { .. })
        ));
    }

    #[test]
    fn test_acl_parses_from_yaml() {
        let yaml = r#"
name: ops
target: "status='online'"
permissions:
  - module: pkg
    minimumweight: 1
    investigators:
      - name: alice
        fingerprint: AAAA
        weight: 1
"#;
        let acl = Acl::from_yaml_str(yaml).unwrap();
        assert_eq!(acl.permissions[0].investigators[0].weight, 1);
    }
}
