// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::action::{ActionCounters, ActionId};
use crate::domain::agent::Agent;
use crate::domain::command::CommandId;

/// Events published on the topic exchange for downstream workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    AgentNew {
        agent: Box<Agent>,
    },
    AgentAuthFailed {
        queue_loc: String,
        pid: i64,
        at: DateTime<Utc>,
    },
    CommandReturned {
        action_id: ActionId,
        command_id: CommandId,
        at: DateTime<Utc>,
    },
    ActionInvalid {
        action_id: ActionId,
        reason: String,
        at: DateTime<Utc>,
    },
    ActionLanded {
        action_id: ActionId,
        counters: ActionCounters,
        at: DateTime<Utc>,
    },
    SchedulerHeartbeat {
        host: String,
        pid: u32,
        at: DateTime<Utc>,
    },
}

impl CoordinatorEvent {
    pub fn routing_key(&self) -> &'static str {
        match self {
            CoordinatorEvent::AgentNew { .. } => "agent.new",
            CoordinatorEvent::AgentAuthFailed { .. } => "agent.auth_failed",
            CoordinatorEvent::CommandReturned { .. } => "command.returned",
            CoordinatorEvent::ActionInvalid { .. } => "action.invalid",
            CoordinatorEvent::ActionLanded { .. } => "action.landed",
            CoordinatorEvent::SchedulerHeartbeat { .. } => "scheduler.heartbeat",
        }
    }
}
