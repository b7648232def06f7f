// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-memory store implementing every repository trait.
//!
//! Used by single-node development setups and the integration tests. The
//! conditional updates mirror the PostgreSQL `WHERE` clauses so both
//! stores make the same decisions under concurrent coordinators.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::target::TargetFilter;
use crate::domain::action::{Action, ActionCounters, ActionId, ActionStatus};
use crate::domain::agent::{Agent, AgentId, AgentStatus, AgentsStats, AgentsVersionsSum};
use crate::domain::command::{Command, CommandId, CommandStatus};
use crate::domain::investigator::{Investigator, InvestigatorId};
use crate::domain::repository::{
    ActionRepository, ActionUpsert, AgentRepository, AgentStatsRepository, CommandRepository,
    InvestigatorRepository, RepositoryError,
};

#[derive(Default)]
struct StoreState {
    actions: HashMap<ActionId, Action>,
    signatures: Vec<(ActionId, InvestigatorId, String)>,
    commands: HashMap<CommandId, Command>,
    agents: HashMap<AgentId, Agent>,
    investigators: HashMap<InvestigatorId, Investigator>,
    stats: Vec<AgentsStats>,
}

impl StoreState {
    fn queues_with_status(&self, statuses: &[AgentStatus]) -> HashSet<&str> {
        self.agents
            .values()
            .filter(|a| statuses.contains(&a.status))
            .map(|a| a.queue_loc.as_str())
            .collect()
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<_> = self.state.read().agents.values().cloned().collect();
        agents.sort_by_key(|a| a.id);
        agents
    }

    pub fn commands_for_action(&self, action_id: ActionId) -> Vec<Command> {
        let mut commands: Vec<_> = self
            .state
            .read()
            .commands
            .values()
            .filter(|c| c.action.id == action_id)
            .cloned()
            .collect();
        commands.sort_by_key(|c| c.id);
        commands
    }

    pub fn signatures_for_action(&self, action_id: ActionId) -> Vec<(InvestigatorId, String)> {
        self.state
            .read()
            .signatures
            .iter()
            .filter(|(aid, _, _)| *aid == action_id)
            .map(|(_, iid, sig)| (*iid, sig.clone()))
            .collect()
    }
}

#[async_trait]
impl ActionRepository for InMemoryStore {
    async fn schedule_ready_actions(&self, now: DateTime<Utc>) -> Result<Vec<Action>, RepositoryError> {
        let mut state = self.state.write();
        let mut ready = Vec::new();
        for action in state.actions.values_mut() {
            if action.status == ActionStatus::Pending && action.valid_from < now && action.expire_after > now {
                action.status = ActionStatus::Scheduled;
                ready.push(action.clone());
            }
        }
        ready.sort_by_key(|a| a.id);
        Ok(ready)
    }

    async fn insert_or_update_action(&self, action: &Action) -> Result<ActionUpsert, RepositoryError> {
        let mut state = self.state.write();
        let outcome = match state.actions.get(&action.id) {
            None => ActionUpsert::Inserted,
            Some(stored) if stored.status.is_dispatched() => return Ok(ActionUpsert::Unchanged),
            Some(_) => ActionUpsert::Updated,
        };
        state.actions.insert(action.id, action.clone());
        Ok(outcome)
    }

    async fn update_action(&self, action: &Action) -> Result<bool, RepositoryError> {
        let mut state = self.state.write();
        match state.actions.get_mut(&action.id) {
            Some(stored) if !stored.status.is_terminal() => {
                stored.status = action.status;
                stored.start_time = action.start_time;
                stored.expire_after = action.expire_after;
                stored.finish_time = action.finish_time;
                stored.last_update_time = action.last_update_time;
                stored.counters = action.counters;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_running_action(&self, action: &Action) -> Result<bool, RepositoryError> {
        let mut state = self.state.write();
        match state.actions.get_mut(&action.id) {
            Some(stored) if stored.status == ActionStatus::Inflight => {
                stored.last_update_time = action.last_update_time;
                stored.counters = action.counters;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_action(&self, action: &Action) -> Result<bool, RepositoryError> {
        let mut state = self.state.write();
        match state.actions.get_mut(&action.id) {
            Some(stored) if stored.status == ActionStatus::Inflight => {
                stored.status = ActionStatus::Done;
                stored.finish_time = action.finish_time;
                stored.last_update_time = action.last_update_time;
                stored.counters = action.counters;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn action_by_id(&self, id: ActionId) -> Result<Option<Action>, RepositoryError> {
        Ok(self.state.read().actions.get(&id).cloned())
    }

    async fn insert_signature(
        &self,
        action_id: ActionId,
        investigator_id: InvestigatorId,
        signature: &str,
    ) -> Result<(), RepositoryError> {
        self.state
            .write()
            .signatures
            .push((action_id, investigator_id, signature.to_string()));
        Ok(())
    }
}

#[async_trait]
impl CommandRepository for InMemoryStore {
    async fn insert_commands(&self, commands: &[Command]) -> Result<u64, RepositoryError> {
        let mut state = self.state.write();
        let mut inserted = 0;
        for cmd in commands {
            if !state.commands.contains_key(&cmd.id) {
                state.commands.insert(cmd.id, cmd.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn finish_command(&self, command: &Command) -> Result<bool, RepositoryError> {
        if !command.status.is_terminal() {
            return Ok(false);
        }
        let mut state = self.state.write();
        let sender_ids: HashSet<AgentId> = state
            .agents
            .values()
            .filter(|a| {
                a.queue_loc == command.agent.queue_loc
                    && a.pid == command.agent.pid
                    && matches!(a.status, AgentStatus::Online | AgentStatus::Idle)
            })
            .map(|a| a.id)
            .collect();

        match state.commands.get_mut(&command.id) {
            Some(stored) if stored.status != CommandStatus::Success && sender_ids.contains(&stored.agent.id) => {
                stored.status = command.status;
                stored.results = command.results.clone();
                stored.finish_time = command.finish_time;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn action_counters(&self, action_id: ActionId) -> Result<ActionCounters, RepositoryError> {
        let state = self.state.read();
        let mut counters = ActionCounters::default();
        for cmd in state.commands.values().filter(|c| c.action.id == action_id) {
            counters.sent += 1;
            match cmd.status {
                CommandStatus::Sent => counters.inflight += 1,
                CommandStatus::Success => counters.success += 1,
                CommandStatus::Cancelled => counters.cancelled += 1,
                CommandStatus::Expired => counters.expired += 1,
                CommandStatus::Failed => counters.failed += 1,
                CommandStatus::Timeout => counters.timeout += 1,
            }
            if cmd.status.is_terminal() {
                counters.done += 1;
            }
        }
        Ok(counters)
    }

    async fn command_by_id(&self, id: CommandId) -> Result<Option<Command>, RepositoryError> {
        Ok(self.state.read().commands.get(&id).cloned())
    }
}

#[async_trait]
impl AgentRepository for InMemoryStore {
    async fn active_agents_by_target(&self, target: &str) -> Result<Vec<Agent>, RepositoryError> {
        let filter = TargetFilter::parse(target).map_err(|e| RepositoryError::Database(e.to_string()))?;
        let state = self.state.read();
        let mut by_queue: BTreeMap<&str, &Agent> = BTreeMap::new();
        for agent in state
            .agents
            .values()
            .filter(|a| matches!(a.status, AgentStatus::Online | AgentStatus::Idle))
        {
            let doc = serde_json::to_value(agent)?;
            if !filter.matches(&doc) {
                continue;
            }
            by_queue
                .entry(agent.queue_loc.as_str())
                .and_modify(|cur| {
                    if agent.heartbeat_ts > cur.heartbeat_ts {
                        *cur = agent;
                    }
                })
                .or_insert(agent);
        }
        Ok(by_queue.into_values().cloned().collect())
    }

    async fn agent_by_queue_and_pid(&self, queue_loc: &str, pid: i64) -> Result<Option<Agent>, RepositoryError> {
        Ok(self
            .state
            .read()
            .agents
            .values()
            .filter(|a| a.queue_loc == queue_loc && a.pid == pid)
            .max_by_key(|a| a.heartbeat_ts)
            .cloned())
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if state.agents.contains_key(&agent.id) {
            return Err(RepositoryError::Database(format!("duplicate agent id {}", agent.id)));
        }
        state.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn update_agent_heartbeat(&self, agent: &Agent) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if let Some(stored) = state.agents.get_mut(&agent.id) {
            if stored.status != AgentStatus::Destroyed {
                stored.status = AgentStatus::Online;
                stored.heartbeat_ts = agent.heartbeat_ts;
            }
        }
        Ok(())
    }

    async fn replace_refreshed_agent(&self, previous: AgentId, agent: &Agent) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if state.agents.contains_key(&agent.id) {
            return Err(RepositoryError::Database(format!("duplicate agent id {}", agent.id)));
        }
        if let Some(old) = state.agents.get_mut(&previous) {
            old.status = AgentStatus::Offline;
        }
        state.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn mark_offline_agents(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state.write();
        let mut n = 0;
        for agent in state
            .agents
            .values_mut()
            .filter(|a| a.status == AgentStatus::Idle && a.heartbeat_ts < cutoff)
        {
            agent.status = AgentStatus::Offline;
            n += 1;
        }
        Ok(n)
    }

    async fn mark_idle_agents(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state.write();
        let mut n = 0;
        for agent in state
            .agents
            .values_mut()
            .filter(|a| a.status == AgentStatus::Online && a.heartbeat_ts < cutoff)
        {
            agent.status = AgentStatus::Idle;
            n += 1;
        }
        Ok(n)
    }

    async fn mark_agent_destroyed(&self, id: AgentId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        let agent = state
            .agents
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("agent {}", id)))?;
        agent.status = AgentStatus::Destroyed;
        agent.destruction_time = Some(at);
        Ok(())
    }

    async fn list_multi_agents_queues(&self, since: DateTime<Utc>) -> Result<Vec<String>, RepositoryError> {
        let state = self.state.read();
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for agent in state
            .agents
            .values()
            .filter(|a| a.heartbeat_ts > since && a.mode != "checkin")
        {
            *counts.entry(agent.queue_loc.as_str()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(q, _)| q.to_string())
            .collect())
    }

    async fn active_agents_by_queue(
        &self,
        queue_loc: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Agent>, RepositoryError> {
        let mut agents: Vec<_> = self
            .state
            .read()
            .agents
            .values()
            .filter(|a| a.queue_loc == queue_loc && a.heartbeat_ts > since && a.status != AgentStatus::Offline)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.start_time);
        Ok(agents)
    }

    async fn disappeared_endpoints(&self, oldest: DateTime<Utc>) -> Result<Vec<String>, RepositoryError> {
        let state = self.state.read();
        let alive = state.queues_with_status(&[AgentStatus::Online, AgentStatus::Idle]);
        let gone: HashSet<&str> = state
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Offline && a.heartbeat_ts > oldest)
            .map(|a| a.queue_loc.as_str())
            .filter(|q| !alive.contains(q))
            .collect();
        let mut queues: Vec<String> = gone.into_iter().map(str::to_string).collect();
        queues.sort();
        Ok(queues)
    }

    async fn sum_agents_by_version(&self, status: AgentStatus) -> Result<Vec<AgentsVersionsSum>, RepositoryError> {
        let state = self.state.read();
        let online = state.queues_with_status(&[AgentStatus::Online]);
        let mut sums: BTreeMap<&str, i64> = BTreeMap::new();
        for agent in state.agents.values().filter(|a| a.status == status) {
            // idle agents only count when their endpoint has no online agent
            if status == AgentStatus::Idle && online.contains(agent.queue_loc.as_str()) {
                continue;
            }
            *sums.entry(agent.version.as_str()).or_default() += 1;
        }
        Ok(sums
            .into_iter()
            .map(|(version, count)| AgentsVersionsSum { version: version.to_string(), count })
            .collect())
    }

    async fn count_endpoints(&self, status: AgentStatus) -> Result<i64, RepositoryError> {
        let state = self.state.read();
        let mut queues = state.queues_with_status(&[status]);
        if status == AgentStatus::Idle {
            let online = state.queues_with_status(&[AgentStatus::Online]);
            queues.retain(|q| !online.contains(q));
        }
        Ok(queues.len() as i64)
    }

    async fn count_new_endpoints(&self, recent: DateTime<Utc>, old: DateTime<Utc>) -> Result<i64, RepositoryError> {
        let state = self.state.read();
        let seen_before: HashSet<&str> = state
            .agents
            .values()
            .filter(|a| a.heartbeat_ts > old && a.heartbeat_ts < recent)
            .map(|a| a.queue_loc.as_str())
            .collect();
        let new: HashSet<&str> = state
            .agents
            .values()
            .filter(|a| a.start_time > recent && !seen_before.contains(a.queue_loc.as_str()))
            .map(|a| a.queue_loc.as_str())
            .collect();
        Ok(new.len() as i64)
    }

    async fn count_double_agents(&self, since: DateTime<Utc>) -> Result<i64, RepositoryError> {
        let state = self.state.read();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for agent in state
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Online && a.heartbeat_ts > since)
        {
            *counts.entry(agent.queue_loc.as_str()).or_default() += 1;
        }
        Ok(counts.values().filter(|n| **n > 1).count() as i64)
    }

    async fn count_disappeared_endpoints(&self, since: DateTime<Utc>) -> Result<i64, RepositoryError> {
        Ok(self.disappeared_endpoints(since).await?.len() as i64)
    }

    async fn count_flapping_endpoints(&self, since: DateTime<Utc>) -> Result<i64, RepositoryError> {
        let state = self.state.read();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for agent in state.agents.values().filter(|a| {
            matches!(a.status, AgentStatus::Online | AgentStatus::Idle) && a.heartbeat_ts > since
        }) {
            *counts.entry(agent.queue_loc.as_str()).or_default() += 1;
        }
        Ok(counts.values().filter(|n| **n > 1).count() as i64)
    }
}

#[async_trait]
impl InvestigatorRepository for InMemoryStore {
    async fn investigator_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Investigator>, RepositoryError> {
        Ok(self
            .state
            .read()
            .investigators
            .values()
            .find(|i| i.fingerprint.eq_ignore_ascii_case(fingerprint))
            .cloned())
    }

    async fn active_investigators(&self) -> Result<Vec<Investigator>, RepositoryError> {
        let mut active: Vec<_> = self
            .state
            .read()
            .investigators
            .values()
            .filter(|i| i.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|i| i.id);
        Ok(active)
    }

    async fn insert_investigator(&self, investigator: &Investigator) -> Result<(), RepositoryError> {
        let mut state = self.state.write();
        if state
            .investigators
            .values()
            .any(|i| i.fingerprint.eq_ignore_ascii_case(&investigator.fingerprint))
        {
            return Err(RepositoryError::Database(format!(
                "investigator with fingerprint {} already exists",
                investigator.fingerprint
            )));
        }
        state.investigators.insert(investigator.id, investigator.clone());
        Ok(())
    }
}

#[async_trait]
impl AgentStatsRepository for InMemoryStore {
    async fn store_agents_stats(&self, stats: &AgentsStats) -> Result<(), RepositoryError> {
        self.state.write().stats.push(stats.clone());
        Ok(())
    }

    async fn latest_agents_stats(&self) -> Result<Option<AgentsStats>, RepositoryError> {
        Ok(self
            .state
            .read()
            .stats
            .iter()
            .max_by_key(|s| s.timestamp)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::action::Operation;
    use crate::domain::command::ModuleResult;
    use chrono::Duration;
    use serde_json::json;

    fn agent(id: u64, queue: &str, pid: i64, now: DateTime<Utc>) -> Agent {
        let mut a = Agent::new(format!("host{}", id), queue, pid, now);
        a.id = AgentId(id);
        a.env.os = "linux".to_string();
        a
    }

    fn action(id: u64, now: DateTime<Utc>) -> Action {
        Action::new(
            ActionId(id),
            "test",
            "status='online'",
            now - Duration::minutes(1),
            now + Duration::hours(1),
            vec![Operation::new("file", json!({}))],
        )
    }

    #[tokio::test]
    async fn test_schedule_returns_each_action_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert_or_update_action(&action(1, now)).await.unwrap();
        let mut future = action(2, now);
        future.valid_from = now + Duration::minutes(10);
        store.insert_or_update_action(&future).await.unwrap();

        let ready = store.schedule_ready_actions(now).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].status, ActionStatus::Scheduled);
        assert!(store.schedule_ready_actions(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_actions_are_not_updated() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut a = action(1, now);
        a.status = ActionStatus::Invalid;
        assert_eq!(store.insert_or_update_action(&a).await.unwrap(), ActionUpsert::Inserted);
        a.status = ActionStatus::Inflight;
        assert!(!store.update_action(&a).await.unwrap());
        assert!(!store.finish_action(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_never_rewinds_a_dispatched_action() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut a = action(1, now);
        a.status = ActionStatus::Scheduled;
        assert_eq!(store.insert_or_update_action(&a).await.unwrap(), ActionUpsert::Inserted);
        a.status = ActionStatus::Preparing;
        assert_eq!(store.insert_or_update_action(&a).await.unwrap(), ActionUpsert::Updated);

        for landed in [ActionStatus::Inflight, ActionStatus::Done] {
            a.status = landed;
            a.counters.done = 3;
            store.update_action(&a).await.unwrap();
            let mut replay = action(1, now);
            replay.status = ActionStatus::Preparing;
            assert_eq!(store.insert_or_update_action(&replay).await.unwrap(), ActionUpsert::Unchanged);
            let stored = store.action_by_id(ActionId(1)).await.unwrap().unwrap();
            assert_eq!(stored.status, landed);
            assert_eq!(stored.counters.done, 3);
        }
    }

    #[tokio::test]
    async fn test_success_is_sticky() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let agt = agent(7, "linux.a", 100, now);
        store.insert_agent(&agt).await.unwrap();
        let mut cmd = Command::new(CommandId(1), action(1, now), agt.clone(), now);
        store.insert_commands(std::slice::from_ref(&cmd)).await.unwrap();

        cmd.status = CommandStatus::Success;
        cmd.results = vec![ModuleResult { success: true, ..Default::default() }];
        assert!(store.finish_command(&cmd).await.unwrap());

        cmd.status = CommandStatus::Expired;
        assert!(!store.finish_command(&cmd).await.unwrap());
        let stored = store.command_by_id(CommandId(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Success);
    }

    #[tokio::test]
    async fn test_finished_command_cannot_return_to_sent() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let agt = agent(7, "linux.a", 100, now);
        store.insert_agent(&agt).await.unwrap();
        let mut cmd = Command::new(CommandId(1), action(1, now), agt, now);
        store.insert_commands(std::slice::from_ref(&cmd)).await.unwrap();

        cmd.status = CommandStatus::Failed;
        assert!(store.finish_command(&cmd).await.unwrap());

        cmd.status = CommandStatus::Sent;
        assert!(!store.finish_command(&cmd).await.unwrap());
        let counters = store.action_counters(ActionId(1)).await.unwrap();
        assert_eq!(counters.done, 1);
        assert_eq!(counters.failed, 1);
    }

    #[tokio::test]
    async fn test_finish_requires_sending_agent_instance() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let agt = agent(7, "linux.a", 100, now);
        store.insert_agent(&agt).await.unwrap();
        let mut cmd = Command::new(CommandId(1), action(1, now), agt, now);
        store.insert_commands(std::slice::from_ref(&cmd)).await.unwrap();

        cmd.agent.pid = 999;
        cmd.status = CommandStatus::Success;
        assert!(!store.finish_command(&cmd).await.unwrap());
    }

    #[tokio::test]
    async fn test_counters_group_statuses() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let agt = agent(7, "linux.a", 100, now);
        let a = action(1, now);
        let mut cmds: Vec<_> = (1..=3)
            .map(|i| Command::new(CommandId(i), a.clone(), agt.clone(), now))
            .collect();
        cmds[0].status = CommandStatus::Success;
        cmds[1].status = CommandStatus::Failed;
        assert_eq!(store.insert_commands(&cmds).await.unwrap(), 3);
        assert_eq!(store.insert_commands(&cmds).await.unwrap(), 0);

        let c = store.action_counters(ActionId(1)).await.unwrap();
        assert_eq!((c.sent, c.done, c.inflight, c.success, c.failed), (3, 2, 1, 1, 1));
    }

    #[tokio::test]
    async fn test_target_resolution_one_agent_per_queue() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert_agent(&agent(1, "linux.a", 1, now - Duration::minutes(2))).await.unwrap();
        store.insert_agent(&agent(2, "linux.a", 2, now)).await.unwrap();
        store.insert_agent(&agent(3, "linux.b", 3, now)).await.unwrap();
        let mut off = agent(4, "linux.c", 4, now);
        off.status = AgentStatus::Offline;
        store.insert_agent(&off).await.unwrap();

        let agents = store
            .active_agents_by_target("environment->>'os'='linux'")
            .await
            .unwrap();
        let ids: Vec<_> = agents.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![AgentId(2), AgentId(3)]);
        assert!(store.active_agents_by_target("os = ").await.is_err());
    }

    #[tokio::test]
    async fn test_demotion_and_destroyed_heartbeats() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert_agent(&agent(1, "linux.a", 1, now - Duration::hours(2))).await.unwrap();
        assert_eq!(store.mark_idle_agents(now - Duration::minutes(25)).await.unwrap(), 1);
        assert_eq!(store.mark_offline_agents(now - Duration::hours(1)).await.unwrap(), 1);

        store.mark_agent_destroyed(AgentId(1), now).await.unwrap();
        let mut hb = agent(1, "linux.a", 1, now);
        hb.heartbeat_ts = now;
        store.update_agent_heartbeat(&hb).await.unwrap();
        assert!(store.agents()[0].is_destroyed());
    }

    #[tokio::test]
    async fn test_endpoint_statistics() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let since = now - Duration::minutes(5);
        store.insert_agent(&agent(1, "linux.a", 1, now)).await.unwrap();
        store.insert_agent(&agent(2, "linux.a", 2, now)).await.unwrap();
        let mut idle = agent(3, "linux.b", 3, now);
        idle.status = AgentStatus::Idle;
        store.insert_agent(&idle).await.unwrap();
        let mut gone = agent(4, "linux.c", 4, now);
        gone.status = AgentStatus::Offline;
        store.insert_agent(&gone).await.unwrap();

        assert_eq!(store.count_endpoints(AgentStatus::Online).await.unwrap(), 1);
        assert_eq!(store.count_endpoints(AgentStatus::Idle).await.unwrap(), 1);
        assert_eq!(store.count_double_agents(since).await.unwrap(), 1);
        assert_eq!(store.list_multi_agents_queues(since).await.unwrap(), vec!["linux.a".to_string()]);
        assert_eq!(store.disappeared_endpoints(since).await.unwrap(), vec!["linux.c".to_string()]);
        assert_eq!(store.count_new_endpoints(since, now - Duration::days(7)).await.unwrap(), 3);
    }
}
