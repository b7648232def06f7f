// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Command Aggregate
//!
//! A command binds one [`Action`] to one [`Agent`]. It is created by the
//! dispatcher with status `sent`, travels to the agent, and comes back with
//! one [`ModuleResult`] per operation.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Per-agent execution record, status vocabulary, syntax
//!   checks and decoding of agent-compressed actions and results.

use std::fmt;
use std::io::Read;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::action::Action;
use crate::domain::agent::Agent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Sent,
    Success,
    Cancelled,
    Expired,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Sent => "sent",
            CommandStatus::Success => "success",
            CommandStatus::Cancelled => "cancelled",
            CommandStatus::Expired => "expired",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CommandError> {
        match s {
            "sent" => Ok(CommandStatus::Sent),
            "success" => Ok(CommandStatus::Success),
            "cancelled" => Ok(CommandStatus::Cancelled),
            "expired" => Ok(CommandStatus::Expired),
            "failed" => Ok(CommandStatus::Failed),
            "timeout" => Ok(CommandStatus::Timeout),
            other => Err(CommandError::Syntax(format!("unknown command status '{}'", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Sent)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one module run on the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleResult {
    #[serde(rename = "foundanything", default)]
    pub found_anything: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub elements: serde_json::Value,
    #[serde(default)]
    pub statistics: serde_json::Value,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ModuleResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            ..Default::default()
        }
    }

    /// A slot the agent never filled in.
    pub fn is_empty(&self) -> bool {
        !self.success && !self.found_anything && self.errors.is_empty() && self.elements.is_null()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub agent: Agent,
    pub action: Action,
    /// base64(gzip(json(action))) when the action travels compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_action: Option<String>,
    pub status: CommandStatus,
    #[serde(default)]
    pub results: Vec<ModuleResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compressed_results: Vec<String>,
    #[serde(rename = "starttime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "finishtime", default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
}

impl Command {
    /// Builds the `sent` command for one agent. The results vector always has
    /// one slot per operation so positions line up even when a module never
    /// answers.
    pub fn new(id: CommandId, action: Action, agent: Agent, now: DateTime<Utc>) -> Self {
        let results = vec![ModuleResult::default(); action.operations.len()];
        Self {
            id,
            agent,
            action,
            compressed_action: None,
            status: CommandStatus::Sent,
            results,
            compressed_results: Vec::new(),
            start_time: now,
            finish_time: None,
        }
    }

    /// Spool filename, `<action id>-<command id>.json`.
    pub fn file_name(&self) -> String {
        format!("{}-{}.json", self.action.id, self.id)
    }

    /// Parses a command document, decompressing it if needed, and checks it.
    pub fn from_json(data: &[u8]) -> Result<Self, CommandError> {
        let mut cmd: Command = serde_json::from_slice(data)?;
        cmd.decompress()?;
        cmd.check()?;
        Ok(cmd)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CommandError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn check(&self) -> Result<(), CommandError> {
        if self.agent.name.is_empty() {
            return Err(CommandError::Syntax("command agent name is empty".to_string()));
        }
        if self.agent.queue_loc.is_empty() {
            return Err(CommandError::Syntax(
                "command agent queue location is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Terminates the command as expired, marking every unanswered result.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.status = CommandStatus::Expired;
        self.finish_time = Some(now);
        self.results
            .resize(self.action.operations.len(), ModuleResult::default());
        for slot in self.results.iter_mut().filter(|r| r.is_empty()) {
            *slot = ModuleResult::failure("action expired before the agent returned results");
        }
    }

    /// Gives a returned command exactly one result per operation. Slots the
    /// agent left out are recorded as failures; extra slots are dropped.
    pub fn align_results(&mut self) {
        let expected = self.action.operations.len();
        if self.results.len() != expected {
            self.results
                .resize_with(expected, || ModuleResult::failure("agent returned no result for this operation"));
        }
    }

    pub fn decompress(&mut self) -> Result<(), CommandError> {
        if let Some(packed) = self.compressed_action.take() {
            self.action = serde_json::from_slice(&gunzip_b64(&packed)?)?;
        }
        if !self.compressed_results.is_empty() {
            let mut results = Vec::with_capacity(self.compressed_results.len());
            for packed in &self.compressed_results {
                results.push(serde_json::from_slice(&gunzip_b64(packed)?)?);
            }
            self.results = results;
            self.compressed_results.clear();
        }
        Ok(())
    }
}

fn gunzip_b64(data: &str) -> Result<Vec<u8>, CommandError> {
    let gz = STANDARD
        .decode(data)
        .map_err(|e| CommandError::Compression(e.to_string()))?;
    let mut out = Vec::new();
    GzDecoder::new(gz.as_slice())
        .read_to_end(&mut out)
        .map_err(|e| CommandError::Compression(e.to_string()))?;
    Ok(out)
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command: {0}")]
    Syntax(String),

    #[error("command compression failed: {0}")]
    Compression(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
