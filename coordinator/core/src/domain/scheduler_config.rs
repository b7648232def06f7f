// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Scheduler Configuration Types
//
// Defines the configuration schema for a coordinator (scheduler) instance:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Agent liveness thresholds and duplicate handling
// - Collector, janitor and queue cleanup frequencies
// - Spool directories, database and broker endpoints
// - Signing keys and the action ACL
// - Logging and debug switches

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "mig.ninja/v1";
pub const KIND: &str = "SchedulerConfig";

/// Top-level scheduler configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfigManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: SchedulerConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Instance name, used in logs and the self heartbeat
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfigSpec {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub periodic: PeriodicConfig,

    #[serde(default)]
    pub directories: DirectoriesConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub batching: BatchingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Idle agents silent for longer than this are marked offline
    #[serde(with = "humantime_serde", default = "default_agent_timeout")]
    pub timeout: Duration,

    /// Expected interval between two agent heartbeats
    #[serde(with = "humantime_serde", default = "default_heartbeat_freq")]
    pub heartbeat_freq: Duration,

    /// Optional file of authorized queue locations (exact lines or `re:<regex>`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub detect_multi_agents: bool,

    #[serde(default)]
    pub kill_dup_agents: bool,
}

impl AgentConfig {
    /// Online agents silent for longer than this become idle.
    pub fn idle_after(&self) -> Duration {
        self.heartbeat_freq * 5
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout: default_agent_timeout(),
            heartbeat_freq: default_heartbeat_freq(),
            whitelist: None,
            detect_multi_agents: true,
            kill_dup_agents: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(with = "humantime_serde", default = "default_collector_freq")]
    pub freq: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { freq: default_collector_freq() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    #[serde(with = "humantime_serde", default = "default_periodic_freq")]
    pub freq: Duration,

    /// Done and invalid action files older than this are deleted
    #[serde(with = "humantime_serde", default = "default_delete_after")]
    pub delete_after: Duration,

    #[serde(with = "humantime_serde", default = "default_queues_cleanup_freq")]
    pub queues_cleanup_freq: Duration,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            freq: default_periodic_freq(),
            delete_after: default_delete_after(),
            queues_cleanup_freq: default_queues_cleanup_freq(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoriesConfig {
    #[serde(default = "default_spool_dir")]
    pub spool: PathBuf,

    /// Scratch directory for atomic writes. Must live on the same filesystem
    /// as the spool; defaults to `<spool>/tmp`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmp: Option<PathBuf>,
}

impl DirectoriesConfig {
    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp.clone().unwrap_or_else(|| self.spool.join("tmp"))
    }
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            spool: default_spool_dir(),
            tmp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string; in-memory storage when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(with = "humantime_serde", default = "default_broker_timeout")]
    pub timeout: Duration,

    /// Publish attempts before a delivery path gives up
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: default_broker_timeout(),
            publish_retries: default_publish_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Secret keyring holding the scheduler key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_keyring: Option<PathBuf>,

    /// Fingerprint of the scheduler key inside `secret_keyring`
    #[serde(default)]
    pub key_id: String,

    /// ACL applied to every incoming action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl: Option<PathBuf>,

    /// Only check that signatures come from known investigators
    #[serde(default)]
    pub only_verify_pubkey: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    #[serde(with = "humantime_serde", default = "default_flush_after")]
    pub flush_after: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            flush_after: default_flush_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Log every heartbeat received
    #[serde(default)]
    pub heartbeats: bool,
}

fn default_true() -> bool {
    true
}

fn default_agent_timeout() -> Duration {
    Duration::from_secs(12 * 3600)
}

fn default_heartbeat_freq() -> Duration {
    Duration::from_secs(300)
}

fn default_collector_freq() -> Duration {
    Duration::from_secs(10)
}

fn default_periodic_freq() -> Duration {
    Duration::from_secs(87)
}

fn default_delete_after() -> Duration {
    Duration::from_secs(72 * 3600)
}

fn default_queues_cleanup_freq() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/cache/mig")
}

fn default_max_connections() -> u32 {
    10
}

fn default_broker_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_publish_retries() -> u32 {
    3
}

fn default_max_batch() -> usize {
    1024
}

fn default_flush_after() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for SchedulerConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "mig-scheduler".to_string(),
                labels: None,
            },
            spec: SchedulerConfigSpec::default(),
        }
    }
}

impl SchedulerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. MIG_SCHEDULER_CONFIG environment variable
    /// 2. ./mig-scheduler.yaml (working directory)
    /// 3. ~/.mig/scheduler.yaml (user home)
    /// 4. /etc/mig/scheduler.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MIG_SCHEDULER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./mig-scheduler.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mig").join("scheduler.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/mig/scheduler.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("MIG_DATABASE_URL") {
            tracing::info!("Environment override: MIG_DATABASE_URL");
            self.spec.database.url = Some(url);
        }

        if let Ok(dir) = std::env::var("MIG_SPOOL_DIR") {
            tracing::info!("Environment override: MIG_SPOOL_DIR={}", dir);
            self.spec.directories.spool = PathBuf::from(dir);
        }

        if let Ok(val) = std::env::var("MIG_KILL_DUP_AGENTS") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: MIG_KILL_DUP_AGENTS=true");
                    self.spec.agent.kill_dup_agents = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: MIG_KILL_DUP_AGENTS=false");
                    self.spec.agent.kill_dup_agents = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for MIG_KILL_DUP_AGENTS: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.agent.heartbeat_freq.is_zero() {
            anyhow::bail!("spec.agent.heartbeat_freq must be greater than zero");
        }
        if spec.agent.timeout.is_zero() {
            anyhow::bail!("spec.agent.timeout must be greater than zero");
        }
        if spec.collector.freq.is_zero() || spec.periodic.freq.is_zero() {
            anyhow::bail!("collector and periodic frequencies must be greater than zero");
        }
        if spec.periodic.queues_cleanup_freq.is_zero() {
            anyhow::bail!("spec.periodic.queues_cleanup_freq must be greater than zero");
        }
        if spec.directories.spool.as_os_str().is_empty() {
            anyhow::bail!("spec.directories.spool cannot be empty");
        }
        if spec.batching.max_batch == 0 || spec.batching.flush_after.is_zero() {
            anyhow::bail!("spec.batching values must be greater than zero");
        }
        if spec.broker.publish_retries == 0 {
            anyhow::bail!("spec.broker.publish_retries must be at least 1");
        }
        if spec.agent.kill_dup_agents && spec.signing.key_id.is_empty() {
            anyhow::bail!("spec.signing.key_id is required when kill_dup_agents is enabled");
        }
        if spec.signing.acl.is_none() && !spec.signing.only_verify_pubkey {
            anyhow::bail!("spec.signing.acl is required unless only_verify_pubkey is set");
        }
        if !matches!(spec.logging.format.as_str(), "compact" | "json") {
            anyhow::bail!("spec.logging.format must be 'compact' or 'json'");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let config = SchedulerConfigManifest::default();
        assert_eq!(config.api_version, API_VERSION);
        assert_eq!(config.spec.agent.heartbeat_freq, Duration::from_secs(300));
        assert_eq!(config.spec.agent.idle_after(), Duration::from_secs(1500));
        assert_eq!(config.spec.batching.max_batch, 1024);
        // no ACL configured and pubkey-only off
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_parsing_with_durations() {
        let yaml = r#"
apiVersion: mig.ninja/v1
kind: SchedulerConfig
metadata:
  name: scheduler-1
spec:
  agent:
    timeout: 2h
    heartbeat_freq: 30s
    kill_dup_agents: true
  periodic:
    freq: 1m
    delete_after: 3days
  directories:
    spool: /tmp/mig-spool
  signing:
    key_id: ABCDEF
    acl: /etc/mig/acl.yaml
"#;
        let config = SchedulerConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(config.spec.agent.timeout, Duration::from_secs(7200));
        assert_eq!(config.spec.agent.heartbeat_freq, Duration::from_secs(30));
        assert_eq!(config.spec.periodic.delete_after, Duration::from_secs(3 * 86400));
        assert_eq!(config.spec.collector.freq, Duration::from_secs(10));
        assert!(config.spec.agent.detect_multi_agents);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = SchedulerConfigManifest::default();
        config.spec.signing.only_verify_pubkey = true;
        assert!(config.validate().is_ok());

        config.spec.agent.kill_dup_agents = true;
        assert!(config.validate().is_err());
        config.spec.signing.key_id = "ABCDEF".to_string();
        assert!(config.validate().is_ok());

        config.kind = "NodeConfig".to_string();
        assert!(config.validate().is_err());
        config.kind = KIND.to_string();

        config.spec.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
