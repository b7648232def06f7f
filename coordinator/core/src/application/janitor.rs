// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fleet Janitor - Application Layer
//!
//! Background upkeep of the spool and the agent fleet. Three loops share
//! this service:
//!
//! - the **periodic** pass: spool cleanup, idle/offline demotion, fleet
//!   statistics and multi-agent detection;
//! - the **duplicate killer**, fed by multi-agent detection and by heartbeats
//!   of destroyed agents, which signs `agentdestroy` actions;
//! - the **queue cleanup**, deleting the broker queues of endpoints that
//!   disappeared.
//!
//! Every pass runs to completion; cancellation is only observed between
//! passes.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Fleet reconciliation and spool retention

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::context::CoordinatorContext;
use crate::application::error::CoordinatorError;
use crate::domain::action::{Action, ActionId, Operation};
use crate::domain::agent::{Agent, AgentStatus, AgentsStats};
use crate::domain::signature::sign_action;
use crate::infrastructure::broker::{agent_queue, BrokerError};
use crate::infrastructure::spool::SpoolDir;

/// Pause after each kill order so a flapping fleet is not wiped at once.
const KILL_THROTTLE: Duration = Duration::from_secs(5);
const DAY: Duration = Duration::from_secs(24 * 3600);
const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);
const QUEUE_DELETE_PAUSE: Duration = Duration::from_millis(100);
/// Extra margin added to the queue cleanup cutoff.
const QUEUE_CLEANUP_MARGIN: Duration = Duration::from_secs(2 * 3600);
/// Kill actions become valid slightly in the past to absorb clock skew.
const KILL_ACTION_BACKDATE: Duration = Duration::from_secs(60);
const KILL_ACTION_VALIDITY: Duration = Duration::from_secs(30 * 60);

/// Outcome of one duplicate-agent evaluation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DupReport {
    pub agents: usize,
    /// Kill actions issued, re-issued ones included.
    pub kill_actions: Vec<ActionId>,
    /// Agents left running because killing is disabled.
    pub left_running: usize,
}

pub struct Janitor {
    ctx: Arc<CoordinatorContext>,
    kill_throttle: Duration,
}

impl Janitor {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self {
            ctx,
            kill_throttle: KILL_THROTTLE,
        }
    }

    pub fn with_kill_throttle(mut self, throttle: Duration) -> Self {
        self.kill_throttle = throttle;
        self
    }

    pub fn start_periodic(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let freq = self.ctx.config.periodic.freq;
            info!(freq = ?freq, "starting periodic janitor");
            let mut tick = tokio::time::interval(freq);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let started = std::time::Instant::now();
                        self.periodic().await;
                        debug!(elapsed = ?started.elapsed(), "periodic run done");
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            info!("periodic janitor stopped");
        })
    }

    pub fn start_queue_cleanup(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let freq = self.ctx.config.periodic.queues_cleanup_freq;
            info!(freq = ?freq, "starting queue cleanup");
            let mut tick = tokio::time::interval(freq);
            // first cleanup runs one period after startup
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match self.cleanup_queues().await {
                            Ok(deleted) => info!(deleted, "queue cleanup completed"),
                            Err(e) => warn!(error = %e, "queue cleanup failed"),
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            info!("queue cleanup stopped");
        })
    }

    pub fn start_dup_killer(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    queue = rx.recv() => match queue {
                        Some(queue_loc) => {
                            if let Err(e) = self.kill_dup_agents(&queue_loc).await {
                                warn!(queueloc = %queue_loc, error = %e, "duplicate agent handling failed");
                            }
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("duplicate agent killer stopped");
        })
    }

    /// One periodic pass. Each step is independent.
    pub async fn periodic(&self) {
        let delete_after = self.ctx.config.periodic.delete_after;
        for dir in [SpoolDir::ActionDone, SpoolDir::ActionInvalid] {
            match self.ctx.spool.clean_dir(dir, delete_after).await {
                Ok(0) => {}
                Ok(n) => info!(?dir, deleted = n, "cleaned spool directory"),
                Err(e) => warn!(?dir, error = %e, "spool cleanup failed"),
            }
        }
        if let Err(e) = self.demote_agents(Utc::now()).await {
            warn!(error = %e, "agent demotion failed");
        }
        if let Err(e) = self.compute_agents_stats(Utc::now()).await {
            warn!(error = %e, "agent statistics failed");
        }
        if let Err(e) = self.detect_multi_agents(Utc::now()).await {
            warn!(error = %e, "multi-agent detection failed");
        }
    }

    /// Online agents silent past five heartbeats become idle; idle agents
    /// silent past the agent timeout become offline.
    pub async fn demote_agents(&self, now: DateTime<Utc>) -> Result<(u64, u64), CoordinatorError> {
        let agent = &self.ctx.config.agent;
        let offline = self
            .ctx
            .repos
            .agents
            .mark_offline_agents(ago(now, agent.timeout))
            .await?;
        let idle = self
            .ctx
            .repos
            .agents
            .mark_idle_agents(ago(now, agent.idle_after()))
            .await?;
        if idle > 0 || offline > 0 {
            info!(idle, offline, "demoted silent agents");
        }
        Ok((idle, offline))
    }

    /// Runs the statistics queries concurrently and stores one snapshot.
    pub async fn compute_agents_stats(&self, now: DateTime<Utc>) -> Result<AgentsStats, CoordinatorError> {
        let agents = &self.ctx.repos.agents;
        let hb = self.ctx.config.agent.heartbeat_freq;

        let (
            online_by_version,
            idle_by_version,
            online_endpoints,
            idle_endpoints,
            new_endpoints,
            multi_agents,
            disappeared,
            flapping,
        ) = futures::try_join!(
            agents.sum_agents_by_version(AgentStatus::Online),
            agents.sum_agents_by_version(AgentStatus::Idle),
            agents.count_endpoints(AgentStatus::Online),
            agents.count_endpoints(AgentStatus::Idle),
            agents.count_new_endpoints(ago(now, DAY), ago(now, WEEK)),
            agents.count_double_agents(ago(now, hb)),
            agents.count_disappeared_endpoints(ago(now, WEEK)),
            agents.count_flapping_endpoints(ago(now, DAY)),
        )?;

        let stats = AgentsStats {
            timestamp: now,
            online_agents: online_by_version.iter().map(|v| v.count).sum(),
            online_agents_by_version: online_by_version,
            online_endpoints,
            idle_agents: idle_by_version.iter().map(|v| v.count).sum(),
            idle_agents_by_version: idle_by_version,
            idle_endpoints,
            new_endpoints,
            multi_agents_endpoints: multi_agents,
            disappeared_endpoints: disappeared,
            flapping_endpoints: flapping,
        };
        self.ctx.repos.stats.store_agents_stats(&stats).await?;
        metrics::gauge!("mig_agents_online").set(stats.online_agents as f64);
        debug!(
            online = stats.online_agents,
            idle = stats.idle_agents,
            endpoints = stats.online_endpoints,
            "agent statistics stored"
        );
        Ok(stats)
    }

    /// Queues the locations running more than one agent for the duplicate
    /// killer.
    pub async fn detect_multi_agents(&self, now: DateTime<Utc>) -> Result<usize, CoordinatorError> {
        if !self.ctx.config.agent.detect_multi_agents {
            return Ok(0);
        }
        let since = ago(now, self.ctx.config.agent.heartbeat_freq);
        let queues = self.ctx.repos.agents.list_multi_agents_queues(since).await?;
        for queue in &queues {
            if self.ctx.channels.detect_dup.send(queue.clone()).await.is_err() {
                return Err(CoordinatorError::Fatal("duplicate detection channel closed".to_string()));
            }
        }
        Ok(queues.len())
    }

    /// Issues kill actions for the duplicate agents of one queue location.
    ///
    /// Agents already marked destroyed more than three heartbeats ago get a
    /// fresh kill order, since the first one evidently did not land. If more
    /// than one agent is still running, the oldest online one is killed, or
    /// a warning is logged when killing is disabled.
    pub async fn kill_dup_agents(&self, queue_loc: &str) -> Result<DupReport, CoordinatorError> {
        let now = Utc::now();
        let hb = self.ctx.config.agent.heartbeat_freq;
        let agents = self
            .ctx
            .repos
            .agents
            .active_agents_by_queue(queue_loc, ago(now, hb))
            .await?;
        let mut report = DupReport {
            agents: agents.len(),
            ..DupReport::default()
        };
        if agents.len() < 2 {
            return Ok(report);
        }

        let stale_destruction = ago(now, hb * 3);
        let mut handled = 0;
        for agent in agents.iter().filter(|a| a.is_destroyed()) {
            handled += 1;
            if agent.destruction_time.is_some_and(|t| t < stale_destruction) {
                info!(agent = %agent.name, pid = agent.pid, "re-issuing destruction action");
                report.kill_actions.push(self.issue_kill_action(agent).await?);
            }
        }

        let remaining = agents.len() - handled;
        if remaining < 2 {
            return Ok(report);
        }
        if !self.ctx.config.agent.kill_dup_agents {
            let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
            warn!(
                queueloc = queue_loc,
                count = remaining,
                agents = %names.join(", "),
                "multiple agents running on one endpoint, manual inspection required"
            );
            report.left_running = remaining;
            return Ok(report);
        }

        let Some(oldest) = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Online)
            .min_by_key(|a| a.start_time)
        else {
            return Ok(report);
        };
        info!(agent = %oldest.name, pid = oldest.pid, queueloc = queue_loc, "issuing destruction action");
        report.kill_actions.push(self.issue_kill_action(oldest).await?);
        tokio::time::sleep(self.kill_throttle).await;
        Ok(report)
    }

    /// Signs an `agentdestroy` action for `agent`, spools it for dispatch
    /// and marks the agent destroyed.
    pub async fn issue_kill_action(&self, agent: &Agent) -> Result<ActionId, CoordinatorError> {
        let key = self.ctx.key.as_ref().ok_or_else(|| {
            CoordinatorError::Fatal("no scheduler signing key configured, cannot issue kill actions".to_string())
        })?;
        let now = Utc::now();
        let mut action = Action::new(
            ActionId(self.ctx.ids.next_id()),
            format!("Kill agent {}", agent.name),
            format!("queueloc='{}'", agent.queue_loc.replace('\'', "''")),
            ago(now, KILL_ACTION_BACKDATE),
            now + chrono::Duration::from_std(KILL_ACTION_VALIDITY).unwrap_or_default(),
            vec![Operation::new(
                "agentdestroy",
                serde_json::json!({ "pid": agent.pid, "version": agent.version }),
            )],
        );
        let signature = sign_action(&action, &key.key_id, key.signer.as_ref())?;
        action.signatures.push(signature);

        self.ctx.spool.write_action(SpoolDir::ActionNew, &action).await?;
        self.ctx.repos.agents.mark_agent_destroyed(agent.id, now).await?;

        metrics::counter!("mig_kill_actions_issued_total").increment(1);
        warn!(
            action_id = %action.id,
            agent = %agent.name,
            pid = agent.pid,
            "issued kill action"
        );
        Ok(action.id)
    }

    /// Deletes the queues of endpoints that have been offline for longer
    /// than the agent timeout plus one cleanup period. Broker errors on one
    /// queue reopen the channel and move on to the next.
    pub async fn cleanup_queues(&self) -> Result<usize, CoordinatorError> {
        let margin = self.ctx.config.agent.timeout + self.ctx.config.periodic.queues_cleanup_freq + QUEUE_CLEANUP_MARGIN;
        let oldest = ago(Utc::now(), margin);
        let queues = self.ctx.repos.agents.disappeared_endpoints(oldest).await?;
        info!(count = queues.len(), since = %oldest, "found offline endpoints");

        let broker = &self.ctx.broker;
        let mut deleted = 0;
        for queue_loc in queues {
            let queue = agent_queue(&queue_loc);
            let info = match broker.inspect_queue(&queue).await {
                Ok(info) => info,
                Err(e) => {
                    if matches!(e, BrokerError::QueueNotFound(_) | BrokerError::ChannelClosed) {
                        debug!(queue = %queue, error = %e, "queue inspection failed, reopening channel");
                    } else {
                        warn!(queue = %queue, error = %e, "queue inspection failed");
                    }
                    if let Err(e) = broker.reopen_channel().await {
                        warn!(error = %e, "cannot reopen broker channel");
                    }
                    continue;
                }
            };
            if info.consumers > 0 || info.messages > 0 {
                debug!(queue = %queue, consumers = info.consumers, messages = info.messages, "queue still in use");
                continue;
            }
            match broker.delete_queue(&queue).await {
                Ok(purged) => {
                    deleted += 1;
                    info!(queue = %queue, purged, "deleted queue of disappeared endpoint");
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "queue deletion failed");
                    if let Err(e) = broker.reopen_channel().await {
                        warn!(error = %e, "cannot reopen broker channel");
                    }
                }
            }
            tokio::time::sleep(QUEUE_DELETE_PAUSE).await;
        }
        Ok(deleted)
    }
}

/// `now - d`, clamped to the earliest representable time.
fn ago(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
