// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Action Aggregate
//!
//! An [`Action`] is a signed request, authored by one or more investigators,
//! to run an ordered list of [`Operation`]s against every agent matching a
//! target predicate during a validity window.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Action document shape, syntactic validation, canonical
//!   signable form, lifecycle transitions and operation compression.
//!
//! Signatures cover [`Action::canonical_string`] only. Counters, timestamps
//! and status can change during flight without invalidating them.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::investigator::Investigator;

/// Version of the action document syntax accepted by this coordinator.
pub const ACTION_SYNTAX_VERSION: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an action. Transitions only ever move forward:
/// `pending -> scheduled -> preparing -> inflight -> {done, invalid}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    #[default]
    Pending,
    Scheduled,
    Preparing,
    Inflight,
    Done,
    Invalid,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Scheduled => "scheduled",
            ActionStatus::Preparing => "preparing",
            ActionStatus::Inflight => "inflight",
            ActionStatus::Done => "done",
            ActionStatus::Invalid => "invalid",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ActionStatus::Pending => 0,
            ActionStatus::Scheduled => 1,
            ActionStatus::Preparing => 2,
            ActionStatus::Inflight => 3,
            ActionStatus::Done | ActionStatus::Invalid => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Done | ActionStatus::Invalid)
    }

    /// In flight or final: the action has left the dispatcher for good.
    pub fn is_dispatched(&self) -> bool {
        self.rank() >= ActionStatus::Inflight.rank()
    }

    /// Whether moving from `self` to `next` respects forward-only ordering.
    /// Any non-terminal state may be abandoned as invalid.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == ActionStatus::Invalid {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "pending" => Ok(ActionStatus::Pending),
            "scheduled" => Ok(ActionStatus::Scheduled),
            "preparing" => Ok(ActionStatus::Preparing),
            "inflight" => Ok(ActionStatus::Inflight),
            "done" | "completed" => Ok(ActionStatus::Done),
            "invalid" => Ok(ActionStatus::Invalid),
            other => Err(ActionError::UnknownStatus(other.to_string())),
        }
    }
}

/// Completion counters, rolled up from the status of every command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounters {
    #[serde(default)]
    pub sent: i64,
    #[serde(default)]
    pub done: i64,
    #[serde(default)]
    pub inflight: i64,
    #[serde(default)]
    pub success: i64,
    #[serde(default)]
    pub cancelled: i64,
    #[serde(default)]
    pub expired: i64,
    #[serde(default)]
    pub failed: i64,
    #[serde(default)]
    pub timeout: i64,
}

impl ActionCounters {
    /// The only completion predicate: every sent command has come back.
    pub fn is_complete(&self) -> bool {
        self.sent > 0 && self.done == self.sent
    }

    /// Human readable progress line, e.g. `12 sent, 10 done, 2 inflight, 10 succeeded`.
    pub fn summary(&self) -> String {
        let mut out = format!("{} sent, {} done", self.sent, self.done);
        let extras = [
            (self.inflight, "inflight"),
            (self.success, "succeeded"),
            (self.cancelled, "cancelled"),
            (self.expired, "expired"),
            (self.failed, "failed"),
            (self.timeout, "timed out"),
        ];
        for (count, label) in extras {
            if count > 0 {
                out.push_str(&format!(", {} {}", count, label));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Description {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default)]
    pub revision: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Threat {
    #[serde(default, rename = "ref", skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub level: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub family: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

/// One module invocation. Parameters stay opaque to the coordinator; the
/// module set is extensible on the agent side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub module: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_compressed: bool,
    /// Requests compression before the action is submitted.
    #[serde(default, skip_serializing_if = "is_false")]
    pub want_compressed: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Operation {
    pub fn new(module: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            module: module.into(),
            parameters,
            is_compressed: false,
            want_compressed: false,
        }
    }

    /// Replaces the parameters with `base64(gzip(json(parameters)))`.
    pub fn compress(&mut self) -> Result<(), ActionError> {
        if self.is_compressed {
            return Ok(());
        }
        let json = serde_json::to_vec(&self.parameters)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| ActionError::Compression(e.to_string()))?;
        let gz = encoder
            .finish()
            .map_err(|e| ActionError::Compression(e.to_string()))?;
        self.parameters = serde_json::Value::String(STANDARD.encode(gz));
        self.is_compressed = true;
        Ok(())
    }

    /// Reverses [`Operation::compress`]. No-op on plain parameters.
    pub fn decompress(&mut self) -> Result<(), ActionError> {
        if !self.is_compressed {
            return Ok(());
        }
        let encoded = self.parameters.as_str().ok_or_else(|| {
            ActionError::Compression("compressed parameters are not a string".to_string())
        })?;
        let gz = STANDARD
            .decode(encoded)
            .map_err(|e| ActionError::Compression(e.to_string()))?;
        let mut json = Vec::new();
        GzDecoder::new(gz.as_slice())
            .read_to_end(&mut json)
            .map_err(|e| ActionError::Compression(e.to_string()))?;
        self.parameters = serde_json::from_slice(&json)?;
        self.is_compressed = false;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub description: Description,
    #[serde(default)]
    pub threat: Threat,
    #[serde(rename = "validfrom")]
    pub valid_from: DateTime<Utc>,
    #[serde(rename = "expireafter")]
    pub expire_after: DateTime<Utc>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default, alias = "pgpsignatures")]
    pub signatures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub investigators: Vec<Investigator>,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(rename = "starttime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "finishtime", default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(rename = "lastupdatetime", default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub counters: ActionCounters,
    #[serde(rename = "syntaxversion", default)]
    pub syntax_version: u16,
}

impl Action {
    pub fn new(
        id: ActionId,
        name: impl Into<String>,
        target: impl Into<String>,
        valid_from: DateTime<Utc>,
        expire_after: DateTime<Utc>,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            target: target.into(),
            description: Description::default(),
            threat: Threat::default(),
            valid_from,
            expire_after,
            operations,
            signatures: Vec::new(),
            investigators: Vec::new(),
            status: ActionStatus::Pending,
            start_time: None,
            finish_time: None,
            last_update_time: None,
            counters: ActionCounters::default(),
            syntax_version: ACTION_SYNTAX_VERSION,
        }
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ActionError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ActionError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The string investigators sign. Only security relevant fields take part.
    pub fn canonical_string(&self) -> Result<String, ActionError> {
        let operations = serde_json::to_string(&self.operations)?;
        Ok(format!(
            "name={};target={};validfrom={};expireafter={};operations={};",
            self.name,
            self.target,
            self.valid_from.timestamp(),
            self.expire_after.timestamp(),
            operations
        ))
    }

    pub fn validate(&self) -> Result<(), ActionError> {
        self.validate_at(Utc::now())
    }

    /// Syntactic validation only; signatures are counted, not verified.
    pub fn validate_at(&self, now: DateTime<Utc>) -> Result<(), ActionError> {
        if self.name.is_empty() {
            return Err(ActionError::Syntax("action name is empty".to_string()));
        }
        if self.target.is_empty() {
            return Err(ActionError::Syntax("action target is empty".to_string()));
        }
        if self.syntax_version != ACTION_SYNTAX_VERSION {
            return Err(ActionError::Syntax(format!(
                "wrong syntax version {}, expected {}",
                self.syntax_version, ACTION_SYNTAX_VERSION
            )));
        }
        if self.valid_from > self.expire_after {
            return Err(ActionError::Syntax(
                "expireafter is set before validfrom".to_string(),
            ));
        }
        if now > self.expire_after {
            return Err(ActionError::Syntax("action has expired".to_string()));
        }
        if self.operations.is_empty() {
            return Err(ActionError::Syntax("action has no operations".to_string()));
        }
        if self.signatures.is_empty() {
            return Err(ActionError::Syntax("action has no signatures".to_string()));
        }
        Ok(())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_after < now
    }

    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now
    }

    /// Time left before the action expires, measured from the later of `now`
    /// and the start of the window. Zero once expired.
    pub fn remaining_validity(&self, now: DateTime<Utc>) -> Duration {
        let from = if self.valid_from > now { self.valid_from } else { now };
        let left = self.expire_after - from;
        if left < Duration::zero() {
            Duration::zero()
        } else {
            left
        }
    }

    /// Moves the action forward in its lifecycle.
    pub fn transition(&mut self, next: ActionStatus) -> Result<(), ActionError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(ActionError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Compresses every operation that asked for it.
    pub fn compress_requested_operations(&mut self) -> Result<(), ActionError> {
        for op in self.operations.iter_mut().filter(|op| op.want_compressed) {
            op.compress()?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid action: {0}")]
    Syntax(String),

    #[error("action {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ActionId,
        from: ActionStatus,
        to: ActionStatus,
    },

    #[error("unknown action status '{0}'")]
    UnknownStatus(String),

    #[error("operation compression failed: {0}")]
    Compression(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(now: DateTime<Utc>) -> Action {
        let mut action = Action::new(
            ActionId(42),
            "list processes",
            "status='online'",
            now - Duration::minutes(1),
            now + Duration::hours(1),
            vec![Operation::new("pkg", json!({"name": "openssl"}))],
        );
        action.signatures.push("sig".to_string());
        action
    }

    #[test]
    fn test_validate_accepts_well_formed_action() {
        let now = Utc::now();
        assert!(sample(now).validate_at(now).is_ok());
    }

    #[test]
    fn test_validate_rejects_each_missing_piece() {
        let now = Utc::now();

        let mut a = sample(now);
        a.name.clear();
        assert!(a.validate_at(now).is_err());

        let mut a = sample(now);
        a.target.clear();
        assert!(a.validate_at(now).is_err());

        let mut a = sample(now);
        a.syntax_version = 1;
        assert!(a.validate_at(now).is_err());

        let mut a = sample(now);
        a.valid_from = a.expire_after + Duration::seconds(1);
        assert!(a.validate_at(now).is_err());

        let mut a = sample(now);
        a.operations.clear();
        assert!(a.validate_at(now).is_err());

        let mut a = sample(now);
        a.signatures.clear();
        assert!(a.validate_at(now).is_err());
    }

    #[test]
    fn test_validate_rejects_expired_action() {
        let now = Utc::now();
        let a = sample(now);
        assert!(a.validate_at(a.expire_after + Duration::seconds(1)).is_err());
    }

    #[test]
    fn test_canonical_string_ignores_mutable_fields() {
        let now = Utc::now();
        let mut a = sample(now);
        let before = a.canonical_string().unwrap();
        a.counters.sent = 10;
        a.status = ActionStatus::Inflight;
        a.last_update_time = Some(now);
        assert_eq!(before, a.canonical_string().unwrap());
        assert!(before.starts_with("name=list processes;target=status='online';validfrom="));
        assert!(before.ends_with(r#"operations=[{"module":"pkg","parameters":{"name":"openssl"}}];"#));
    }

    #[test]
    fn test_status_moves_forward_only() {
        let now = Utc::now();
        let mut a = sample(now);
        a.transition(ActionStatus::Scheduled).unwrap();
        a.transition(ActionStatus::Preparing).unwrap();
        a.transition(ActionStatus::Inflight).unwrap();
        assert!(a.transition(ActionStatus::Preparing).is_err());
        a.transition(ActionStatus::Done).unwrap();
        assert!(a.transition(ActionStatus::Invalid).is_err());
    }

    #[test]
    fn test_compression_round_trip() {
        let params = json!({"search": {"paths": ["/etc"], "contents": ["root"]}, "n": 3});
        let mut op = Operation::new("file", params.clone());
        op.compress().unwrap();
        assert!(op.is_compressed);
        assert!(op.parameters.is_string());
        op.decompress().unwrap();
        assert!(!op.is_compressed);
        assert_eq!(op.parameters, params);
    }

    #[test]
    fn test_decompress_plain_operation_is_noop() {
        let params = json!({"a": 1});
        let mut op = Operation::new("file", params.clone());
        op.decompress().unwrap();
        assert_eq!(op.parameters, params);
        assert!(!op.is_compressed);
    }

    #[test]
    fn test_counters_completion_and_summary() {
        let counters = ActionCounters {
            sent: 3,
            done: 3,
            success: 2,
            failed: 1,
            ..Default::default()
        };
        assert!(counters.is_complete());
        assert_eq!(counters.summary(), "3 sent, 3 done, 2 succeeded, 1 failed");
        assert!(!ActionCounters::default().is_complete());
    }

    #[test]
    fn test_remaining_validity_is_clamped() {
        let now = Utc::now();
        let a = sample(now);
        assert!(a.remaining_validity(now) <= Duration::hours(1));
        assert_eq!(
            a.remaining_validity(a.expire_after + Duration::minutes(5)),
            Duration::zero()
        );
    }

    #[test]
    fn test_legacy_signature_field_is_accepted() {
        let now = Utc::now();
        let mut value = serde_json::to_value(sample(now)).unwrap();
        let sigs = value["signatures"].take();
        value.as_object_mut().unwrap().remove("signatures");
        value["pgpsignatures"] = sigs;
        let parsed: Action = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.signatures, vec!["sig".to_string()]);
    }
}
