// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent (Fleet Endpoint) Aggregate
//!
//! An agent is one running instance of the endpoint daemon. Several instances
//! may share one queue location (the endpoint's broker queue); the janitor
//! treats more than one live instance per location as a duplicate.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Agent record as reported by heartbeats, status lifecycle,
//!   heartbeat field limits and fleet statistics snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest agent name accepted from a heartbeat.
pub const MAX_AGENT_NAME_LEN: usize = 1024;
/// Longest agent version string accepted from a heartbeat.
pub const MAX_AGENT_VERSION_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Online,
    Idle,
    Offline,
    Upgraded,
    Destroyed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Idle => "idle",
            AgentStatus::Offline => "offline",
            AgentStatus::Upgraded => "upgraded",
            AgentStatus::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AgentError> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "idle" => Ok(AgentStatus::Idle),
            "offline" => Ok(AgentStatus::Offline),
            "upgraded" => Ok(AgentStatus::Upgraded),
            "destroyed" => Ok(AgentStatus::Destroyed),
            other => Err(AgentError::UnknownStatus(other.to_string())),
        }
    }

    /// Online and idle agents are eligible to receive commands.
    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Online | AgentStatus::Idle)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEnvAws {
    #[serde(rename = "instanceid", default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(rename = "localipv4", default, skip_serializing_if = "String::is_empty")]
    pub local_ipv4: String,
    #[serde(rename = "amiid", default, skip_serializing_if = "String::is_empty")]
    pub ami_id: String,
    #[serde(rename = "instancetype", default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
}

/// Environment snapshot reported by the agent at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEnv {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub init: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ident: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(rename = "isproxied", default)]
    pub is_proxied: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(rename = "publicip", default, skip_serializing_if = "String::is_empty")]
    pub public_ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
    #[serde(default)]
    pub aws: AgentEnvAws,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default)]
    pub id: AgentId,
    pub name: String,
    #[serde(rename = "queueloc")]
    pub queue_loc: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(rename = "starttime", default)]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "destructiontime", default, skip_serializing_if = "Option::is_none")]
    pub destruction_time: Option<DateTime<Utc>>,
    #[serde(rename = "heartbeatts", default)]
    pub heartbeat_ts: DateTime<Utc>,
    #[serde(rename = "refreshts", default, skip_serializing_if = "Option::is_none")]
    pub refresh_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "is_false")]
    pub authorized: bool,
    #[serde(rename = "environment", default)]
    pub env: AgentEnv,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub tags: serde_json::Value,
    #[serde(rename = "loadername", default, skip_serializing_if = "String::is_empty")]
    pub loader_name: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Agent {
    pub fn new(name: impl Into<String>, queue_loc: impl Into<String>, pid: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: AgentId::default(),
            name: name.into(),
            queue_loc: queue_loc.into(),
            mode: "daemon".to_string(),
            version: String::new(),
            pid,
            start_time: now,
            destruction_time: None,
            heartbeat_ts: now,
            refresh_ts: None,
            status: AgentStatus::Online,
            authorized: false,
            env: AgentEnv::default(),
            tags: serde_json::Value::Null,
            loader_name: String::new(),
        }
    }

    /// Field limits enforced on every heartbeat before it touches the store.
    pub fn check_heartbeat(&self) -> Result<(), AgentError> {
        if self.name.is_empty() {
            return Err(AgentError::InvalidHeartbeat("agent name is empty".to_string()));
        }
        if self.queue_loc.is_empty() {
            return Err(AgentError::InvalidHeartbeat("agent queue location is empty".to_string()));
        }
        match self.mode.as_str() {
            "" | "daemon" | "checkin" => {}
            other => {
                return Err(AgentError::InvalidHeartbeat(format!("invalid agent mode '{}'", other)))
            }
        }
        if self.name.len() > MAX_AGENT_NAME_LEN {
            return Err(AgentError::InvalidHeartbeat(format!(
                "agent name longer than {} characters",
                MAX_AGENT_NAME_LEN
            )));
        }
        if self.version.len() > MAX_AGENT_VERSION_LEN {
            return Err(AgentError::InvalidHeartbeat(format!(
                "agent version longer than {} characters",
                MAX_AGENT_VERSION_LEN
            )));
        }
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.status == AgentStatus::Destroyed
    }
}

/// Per-version agent count inside a stats snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentsVersionsSum {
    pub version: String,
    pub count: i64,
}

/// Fleet statistics computed by each janitor pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsStats {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "onlineagents")]
    pub online_agents: i64,
    #[serde(rename = "onlineagentsbyversion")]
    pub online_agents_by_version: Vec<AgentsVersionsSum>,
    #[serde(rename = "onlineendpoints")]
    pub online_endpoints: i64,
    #[serde(rename = "idleagents")]
    pub idle_agents: i64,
    #[serde(rename = "idleagentsbyversion")]
    pub idle_agents_by_version: Vec<AgentsVersionsSum>,
    #[serde(rename = "idleendpoints")]
    pub idle_endpoints: i64,
    #[serde(rename = "newendpoints")]
    pub new_endpoints: i64,
    #[serde(rename = "multiagentsendpoints")]
    pub multi_agents_endpoints: i64,
    #[serde(rename = "disappearedendpoints")]
    pub disappeared_endpoints: i64,
    #[serde(rename = "flappingendpoints")]
    pub flapping_endpoints: i64,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid heartbeat: {0}")]
    InvalidHeartbeat(String),

    #[error("unknown agent status '{0}'")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_limits() {
        let now = Utc::now();
        let agent = Agent::new("host1.example.net", "linux.host1.abc", 1234, now);
        assert!(agent.check_heartbeat().is_ok());

        let mut bad = agent.clone();
        bad.mode = "service".to_string();
        assert!(bad.check_heartbeat().is_err());

        let mut bad = agent.clone();
        bad.name = "a".repeat(MAX_AGENT_NAME_LEN + 1);
        assert!(bad.check_heartbeat().is_err());

        let mut bad = agent.clone();
        bad.version = "v".repeat(MAX_AGENT_VERSION_LEN + 1);
        assert!(bad.check_heartbeat().is_err());

        let mut checkin = agent;
        checkin.mode = "checkin".to_string();
        assert!(checkin.check_heartbeat().is_ok());
    }

    #[test]
    fn test_heartbeat_document_parses() {
        let body = r#"{
            "name": "host1", "queueloc": "linux.host1.abc", "mode": "daemon",
            "version": "20260101-0.abc", "pid": 99,
            "heartbeatts": "2026-10-01T10:00:00Z",
            "environment": {"os": "linux", "arch": "amd64", "isproxied": false}
        }"#;
        let agent: Agent = serde_json::from_str(body).unwrap();
        assert_eq!(agent.queue_loc, "linux.host1.abc");
        assert_eq!(agent.env.os, "linux");
        assert_eq!(agent.status, AgentStatus::Online);
    }

    #[test]
    fn test_active_statuses() {
        assert!(AgentStatus::Online.is_active());
        assert!(AgentStatus::Idle.is_active());
        assert!(!AgentStatus::Offline.is_active());
        assert!(!AgentStatus::Destroyed.is_active());
        assert_eq!(AgentStatus::parse("idle").unwrap(), AgentStatus::Idle);
    }
}
