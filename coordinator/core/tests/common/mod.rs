// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures for the coordinator integration tests: a temporary
//! spool, the in-memory store and broker, deterministic ids and a couple of
//! registered investigators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde_json::json;
use tempfile::TempDir;

use mig_coordinator_core::application::context::{ChannelReceivers, Channels, CoordinatorContext, SchedulerKey};
use mig_coordinator_core::application::repository_factory::Repositories;
use mig_coordinator_core::domain::acl::{Acl, Permission, SignerEntry};
use mig_coordinator_core::domain::action::{Action, ActionId, Operation};
use mig_coordinator_core::domain::agent::{Agent, AgentId, AgentStatus};
use mig_coordinator_core::domain::id::SequentialIdGenerator;
use mig_coordinator_core::domain::investigator::{Investigator, InvestigatorId, InvestigatorStatus, Permissions};
use mig_coordinator_core::domain::repository::{AgentRepository, InvestigatorRepository};
use mig_coordinator_core::domain::scheduler_config::SchedulerConfigSpec;
use mig_coordinator_core::domain::signature::sign_action;
use mig_coordinator_core::infrastructure::broker::memory::InMemoryBroker;
use mig_coordinator_core::infrastructure::keyring::{fingerprint, Ed25519SecretKeyring};
use mig_coordinator_core::infrastructure::repositories::InMemoryStore;
use mig_coordinator_core::infrastructure::spool::Spool;

pub struct Signer {
    pub fingerprint: String,
    pub keyring: Arc<Ed25519SecretKeyring>,
}

impl Signer {
    pub fn sign(&self, action: &mut Action) {
        let signature = sign_action(action, &self.fingerprint, self.keyring.as_ref()).unwrap();
        action.signatures.push(signature);
    }
}

pub struct Harness {
    pub ctx: Arc<CoordinatorContext>,
    pub store: Arc<InMemoryStore>,
    pub broker: Arc<InMemoryBroker>,
    pub receivers: Option<ChannelReceivers>,
    pub alice: Signer,
    pub bob: Signer,
    pub scheduler: Signer,
    pub dir: TempDir,
}

pub struct HarnessOptions {
    pub config: SchedulerConfigSpec,
    pub acl: Acl,
    pub with_scheduler_key: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        let mut config = SchedulerConfigSpec::default();
        config.broker.publish_retries = 1;
        config.batching.flush_after = Duration::from_millis(20);
        config.collector.freq = Duration::from_millis(50);
        Self {
            config,
            acl: Acl::default(),
            with_scheduler_key: true,
        }
    }
}

fn new_signer() -> (Signer, SigningKey) {
    let (key, _) = Ed25519SecretKeyring::generate();
    let fp = fingerprint(&key.verifying_key());
    let keyring = Arc::new(Ed25519SecretKeyring::from_keys([key.clone()]));
    (
        Signer {
            fingerprint: fp,
            keyring,
        },
        key,
    )
}

fn investigator(id: u64, name: &str, key: &SigningKey) -> Investigator {
    Investigator {
        id: InvestigatorId(id),
        name: name.to_string(),
        fingerprint: fingerprint(&key.verifying_key()),
        public_key: STANDARD.encode(key.verifying_key().as_bytes()),
        status: InvestigatorStatus::Active,
        created_at: Some(Utc::now()),
        last_modified: Some(Utc::now()),
        permissions: Permissions::all(),
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    /// Alice and Bob each weigh 1 on `pkg` (minimum 1), `file` (minimum 2)
    /// and `default` (minimum 1).
    pub async fn with_standard_acl() -> Self {
        let mut harness = Self::new().await;
        let acl = harness.standard_acl();
        Arc::get_mut(&mut harness.ctx).unwrap().acl = acl;
        harness
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let dir = TempDir::new().unwrap();
        let ids = Arc::new(SequentialIdGenerator::starting_at(1000));
        let spool = Spool::open(dir.path().join("spool"), dir.path().join("tmp"), ids.clone())
            .await
            .unwrap();
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let (channels, receivers) = Channels::new();

        let (alice, alice_key) = new_signer();
        let (bob, bob_key) = new_signer();
        let (scheduler, scheduler_key) = new_signer();
        store.insert_investigator(&investigator(1, "alice", &alice_key)).await.unwrap();
        store.insert_investigator(&investigator(2, "bob", &bob_key)).await.unwrap();
        store
            .insert_investigator(&investigator(3, "mig-scheduler", &scheduler_key))
            .await
            .unwrap();

        let key = options.with_scheduler_key.then(|| SchedulerKey {
            signer: scheduler.keyring.clone(),
            key_id: scheduler.fingerprint.clone(),
        });

        let mut config = options.config;
        config.directories.spool = dir.path().join("spool");

        let ctx = Arc::new(CoordinatorContext {
            name: "test-scheduler".to_string(),
            config,
            repos: Repositories::in_memory(store.clone()),
            spool: Arc::new(spool),
            broker: broker.clone(),
            ids,
            key,
            acl: options.acl,
            whitelist: None,
            channels,
        });

        Self {
            ctx,
            store,
            broker,
            receivers: Some(receivers),
            alice,
            bob,
            scheduler,
            dir,
        }
    }

    pub fn standard_acl(&self) -> Acl {
        let signers = vec![
            SignerEntry {
                name: "alice".to_string(),
                fingerprint: self.alice.fingerprint.clone(),
                weight: 1,
            },
            SignerEntry {
                name: "bob".to_string(),
                fingerprint: self.bob.fingerprint.clone(),
                weight: 1,
            },
            SignerEntry {
                name: "mig-scheduler".to_string(),
                fingerprint: self.scheduler.fingerprint.clone(),
                weight: 1,
            },
        ];
        let permission = |module: &str, minimum_weight| Permission {
            module: module.to_string(),
            minimum_weight,
            investigators: signers.clone(),
        };
        Acl {
            name: "test".to_string(),
            target: String::new(),
            permissions: vec![permission("pkg", 1), permission("file", 2), permission("default", 1)],
        }
    }

    /// Registers an online agent with the given id, queue location and pid.
    pub async fn add_agent(&self, id: u64, queue_loc: &str, pid: i64, start: DateTime<Utc>) -> Agent {
        let mut agent = Agent::new(format!("agent{}", id), queue_loc, pid, start);
        agent.id = AgentId(id);
        agent.status = AgentStatus::Online;
        agent.heartbeat_ts = Utc::now();
        agent.version = "20260101-0.abc".to_string();
        agent.env.os = "linux".to_string();
        self.store.insert_agent(&agent).await.unwrap();
        agent
    }

    pub fn action(&self, id: u64, module: &str, target: &str) -> Action {
        let now = Utc::now();
        Action::new(
            ActionId(id),
            format!("test action {}", id),
            target,
            now - chrono::Duration::minutes(1),
            now + chrono::Duration::hours(1),
            vec![Operation::new(module, json!({"names": ["openssl"]}))],
        )
    }

    /// Writes `action` to `action/new/` and returns its path.
    pub async fn submit(&self, action: &Action) -> std::path::PathBuf {
        use mig_coordinator_core::infrastructure::spool::SpoolDir;
        self.ctx.spool.write_action(SpoolDir::ActionNew, action).await.unwrap()
    }

    pub fn take_receivers(&mut self) -> ChannelReceivers {
        self.receivers.take().unwrap()
    }
}
