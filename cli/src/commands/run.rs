// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `mig-scheduler run`: boots the coordinator and blocks until a signal or a
//! fatal error stops it.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use mig_coordinator_core::application::context::{Channels, CoordinatorContext, SchedulerKey, Whitelist};
use mig_coordinator_core::application::repository_factory::Repositories;
use mig_coordinator_core::application::runtime::CoordinatorRuntime;
use mig_coordinator_core::domain::acl::Acl;
use mig_coordinator_core::domain::id::{EpochIdGenerator, IdGenerator};
use mig_coordinator_core::domain::investigator::{Investigator, InvestigatorId, InvestigatorStatus, Permissions};
use mig_coordinator_core::domain::scheduler_config::{BrokerConfig, SchedulerConfigManifest, SigningConfig};
use mig_coordinator_core::infrastructure::broker::amqp::AmqpBroker;
use mig_coordinator_core::infrastructure::broker::memory::InMemoryBroker;
use mig_coordinator_core::infrastructure::broker::Broker;
use mig_coordinator_core::infrastructure::db::Database;
use mig_coordinator_core::infrastructure::keyring::Ed25519SecretKeyring;
use mig_coordinator_core::infrastructure::spool::Spool;

/// Name under which the scheduler key is registered as an investigator.
pub const SCHEDULER_INVESTIGATOR: &str = "mig-scheduler";

/// The scheduler's own key, loaded from its secret keyring.
pub struct SchedulerIdentity {
    pub keyring: Arc<Ed25519SecretKeyring>,
    pub key_id: String,
    pub public_key: String,
}

impl SchedulerIdentity {
    fn signing_key(&self) -> SchedulerKey {
        SchedulerKey {
            signer: self.keyring.clone(),
            key_id: self.key_id.clone(),
        }
    }

    fn investigator(&self, id: u64) -> Investigator {
        let now = Utc::now();
        Investigator {
            id: InvestigatorId(id),
            name: SCHEDULER_INVESTIGATOR.to_string(),
            fingerprint: self.key_id.clone(),
            public_key: self.public_key.clone(),
            status: InvestigatorStatus::Active,
            created_at: Some(now),
            last_modified: Some(now),
            permissions: Permissions::default(),
        }
    }
}

pub async fn execute(config_path: Option<PathBuf>) -> Result<()> {
    let manifest = SchedulerConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    manifest.validate().context("Configuration validation failed")?;
    let spec = manifest.spec.clone();

    let acl = match &spec.signing.acl {
        Some(path) => Acl::from_file(path).with_context(|| format!("Failed to load ACL {:?}", path))?,
        None => Acl::default(),
    };
    let whitelist = spec.agent.whitelist.as_deref().map(load_whitelist).transpose()?;
    let identity = load_identity(&spec.signing)?;

    let database = Database::from_config(&spec.database).await?;
    if database.is_none() {
        warn!("No database configured, actions and agents are kept in memory only");
    }
    let repos = Repositories::create(database.as_ref());

    let ids: Arc<dyn IdGenerator> = Arc::new(EpochIdGenerator::new());
    let spool = Spool::open(spec.directories.spool.clone(), spec.directories.tmp_dir(), ids.clone())
        .await
        .with_context(|| format!("Failed to open spool {:?}", spec.directories.spool))?;

    let broker = connect_broker(&spec.broker).await?;

    let (channels, receivers) = Channels::new();
    let scheduler_investigator = identity.as_ref().map(|i| i.investigator(ids.next_id()));
    let ctx = Arc::new(CoordinatorContext {
        name: manifest.metadata.name.clone(),
        config: spec,
        repos,
        spool: Arc::new(spool),
        broker,
        ids,
        key: identity.as_ref().map(SchedulerIdentity::signing_key),
        acl,
        whitelist,
        channels,
    });

    let mut runtime = CoordinatorRuntime::start(ctx.clone(), receivers, scheduler_investigator)
        .await
        .context("Failed to start coordinator")?;
    info!(
        name = %ctx.name,
        spool = %ctx.spool.root().display(),
        "MIG scheduler started"
    );

    let fatal = tokio::select! {
        _ = shutdown_signal() => None,
        reason = runtime.wait_for_termination() => Some(reason),
    };

    runtime.shutdown().await;
    if let Some(database) = database {
        database.close().await;
    }

    match fatal {
        Some(reason) => {
            error!(reason = %reason, "MIG scheduler stopped on a fatal error");
            anyhow::bail!("coordinator terminated: {}", reason)
        }
        None => {
            info!("MIG scheduler stopped");
            Ok(())
        }
    }
}

/// Reads an agent whitelist file. An invalid `re:` pattern is an error.
pub fn load_whitelist(path: &Path) -> Result<Whitelist> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read whitelist {:?}", path))?;
    Whitelist::parse(&content).with_context(|| format!("Invalid regex in whitelist {:?}", path))
}

fn load_identity(signing: &SigningConfig) -> Result<Option<SchedulerIdentity>> {
    match &signing.secret_keyring {
        Some(path) => load_scheduler_key(path, &signing.key_id).map(Some),
        None => {
            warn!("No scheduler keyring configured, duplicate agents cannot be killed");
            Ok(None)
        }
    }
}

/// Loads the scheduler key from `path`. An empty `key_id` selects the only
/// key of a single-key keyring.
pub fn load_scheduler_key(path: &Path, key_id: &str) -> Result<SchedulerIdentity> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open secret keyring {:?}", path))?;
    let keyring = Ed25519SecretKeyring::from_reader(file).with_context(|| format!("Invalid secret keyring {:?}", path))?;

    let key_id = if key_id.is_empty() {
        match keyring.fingerprints().as_slice() {
            [only] => only.clone(),
            [] => anyhow::bail!("secret keyring {:?} holds no key", path),
            _ => anyhow::bail!("secret keyring {:?} holds several keys, set signing.key_id", path),
        }
    } else {
        key_id.to_uppercase()
    };
    let public_key = keyring
        .public_key(&key_id)
        .with_context(|| format!("key {} not found in {:?}", key_id, path))?;

    Ok(SchedulerIdentity {
        keyring: Arc::new(keyring),
        key_id,
        public_key: STANDARD.encode(public_key.as_bytes()),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// AMQP when `broker.url` is set, otherwise the in-process broker.
async fn connect_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match &config.url {
        Some(url) => {
            let broker = AmqpBroker::connect(url, config.timeout)
                .await
                .context("Failed to connect to the AMQP broker")?;
            Ok(Arc::new(broker))
        }
        None => {
            warn!("No broker configured, agents can only reach this process through the in-process broker");
            Ok(Arc::new(InMemoryBroker::new()))
        }
    }
}
