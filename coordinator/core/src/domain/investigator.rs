// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Investigators are the humans (and the coordinator itself) whose keys sign
//! actions. Only the public half of a key is ever held here.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvestigatorId(pub u64);

impl fmt::Display for InvestigatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestigatorStatus {
    #[default]
    Active,
    Disabled,
}

impl InvestigatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigatorStatus::Active => "active",
            InvestigatorStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => InvestigatorStatus::Active,
            _ => InvestigatorStatus::Disabled,
        }
    }
}

/// Bitmask of administrative rights held by an investigator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub i64);

impl Permissions {
    pub const LOADERS: Permissions = Permissions(1);
    pub const MANIFESTS: Permissions = Permissions(1 << 1);
    pub const ADMIN: Permissions = Permissions(1 << 2);

    const NAMED: [(&'static str, Permissions); 3] = [
        ("PermLoaders", Permissions::LOADERS),
        ("PermManifests", Permissions::MANIFESTS),
        ("PermAdmin", Permissions::ADMIN),
    ];

    pub fn all() -> Self {
        Permissions(Self::LOADERS.0 | Self::MANIFESTS.0 | Self::ADMIN.0)
    }

    pub fn contains(&self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parses names such as `PermAdmin` (case-insensitive) into a mask.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, InvestigatorError> {
        let mut mask = 0;
        for name in names {
            let name = name.as_ref();
            let (_, perm) = Self::NAMED
                .iter()
                .find(|(text, _)| text.eq_ignore_ascii_case(name))
                .ok_or_else(|| InvestigatorError::UnknownPermission(name.to_string()))?;
            mask |= perm.0;
        }
        Ok(Permissions(mask))
    }

    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(_, perm)| self.contains(*perm))
            .map(|(text, _)| *text)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investigator {
    #[serde(default)]
    pub id: InvestigatorId,
    pub name: String,
    #[serde(alias = "pgpfingerprint")]
    pub fingerprint: String,
    #[serde(rename = "publickey", default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    #[serde(default)]
    pub status: InvestigatorStatus,
    #[serde(rename = "createdat", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastmodified", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub permissions: Permissions,
}

impl Default for InvestigatorId {
    fn default() -> Self {
        InvestigatorId(0)
    }
}

impl Investigator {
    pub fn is_active(&self) -> bool {
        self.status == InvestigatorStatus::Active
    }

    pub fn has_permission(&self, perm: Permissions) -> bool {
        self.permissions.contains(perm)
    }
}

#[derive(Debug, Error)]
pub enum InvestigatorError {
    #[error("invalid permission '{0}'")]
    UnknownPermission(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_names_round_trip() {
        let perms = Permissions::from_names(&["permadmin", "PermLoaders"]).unwrap();
        assert!(perms.contains(Permissions::ADMIN));
        assert!(perms.contains(Permissions::LOADERS));
        assert!(!perms.contains(Permissions::MANIFESTS));
        assert_eq!(perms.names(), vec!["PermLoaders", "PermAdmin"]);
        assert!(Permissions::from_names(&["PermRoot"]).is_err());
    }

    #[test]
    fn test_all_permissions() {
        assert_eq!(Permissions::all().0, 7);
    }
}
