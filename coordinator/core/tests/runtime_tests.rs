// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end test of the coordinator runtime
//!
//! Every task runs against the in-memory broker and store: an agent
//! registers through its heartbeat, an action dropped in the spool is
//! dispatched, the agent answers on the results queue and the action lands.

mod common;

use std::time::Duration;

use chrono::Utc;
use ed25519_dalek::SigningKey;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use common::Harness;
use mig_coordinator_core::application::runtime::CoordinatorRuntime;
use mig_coordinator_core::domain::action::{ActionId, ActionStatus};
use mig_coordinator_core::domain::agent::Agent;
use mig_coordinator_core::domain::command::{Command, CommandStatus};
use mig_coordinator_core::domain::investigator::{Investigator, InvestigatorId, InvestigatorStatus, Permissions};
use mig_coordinator_core::domain::repository::{ActionRepository, InvestigatorRepository};
use mig_coordinator_core::infrastructure::broker::{
    agent_queue, Broker, Exchange, Message, HEARTBEAT_QUEUE, RESULTS_QUEUE,
};
use mig_coordinator_core::infrastructure::keyring::fingerprint;

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_action_round_trip_through_running_coordinator() {
    let mut harness = Harness::with_standard_acl().await;
    let receivers = harness.take_receivers();

    let new_key = SigningKey::from_bytes(&[7u8; 32]);
    let operator = Investigator {
        id: InvestigatorId(9),
        name: "operator".to_string(),
        fingerprint: fingerprint(&new_key.verifying_key()),
        public_key: STANDARD.encode(new_key.verifying_key().as_bytes()),
        status: InvestigatorStatus::Active,
        created_at: Some(Utc::now()),
        last_modified: Some(Utc::now()),
        permissions: Permissions::all(),
    };
    let mut runtime = CoordinatorRuntime::start(harness.ctx.clone(), receivers, Some(operator.clone()))
        .await
        .unwrap();
    assert!(harness
        .store
        .investigator_by_fingerprint(&operator.fingerprint)
        .await
        .unwrap()
        .is_some());

    let queues = harness.broker.queue_names();
    assert!(queues.contains(&HEARTBEAT_QUEUE.to_string()));
    assert!(queues.contains(&RESULTS_QUEUE.to_string()));

    // the agent announces itself and listens on its own queue
    let agent = Agent::new("host1.example.net", "linux.host1", 4242, Utc::now());
    let agent_q = agent_queue(&agent.queue_loc);
    harness
        .broker
        .declare_queue(&agent_q, Exchange::ToAgents, &agent_q)
        .await
        .unwrap();
    let mut inbox = harness.broker.consume(&agent_q).await.unwrap();
    harness
        .broker
        .publish(
            Exchange::ToSchedulers,
            HEARTBEAT_QUEUE,
            Message::json(serde_json::to_vec(&agent).unwrap()),
        )
        .await
        .unwrap();
    let store = harness.store.clone();
    eventually("agent registration", || {
        let store = store.clone();
        async move { store.agents().len() == 1 }
    })
    .await;

    let mut action = harness.action(500, "pkg", "status='online'");
    harness.alice.sign(&mut action);
    harness.submit(&action).await;

    let delivery = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
        .await
        .expect("no command delivered")
        .unwrap();
    let mut command = Command::from_json(&delivery.body).unwrap();
    assert_eq!(command.action.id, ActionId(500));
    assert_eq!(command.status, CommandStatus::Sent);

    command.status = CommandStatus::Success;
    command.results[0].success = true;
    harness
        .broker
        .publish(
            Exchange::ToSchedulers,
            RESULTS_QUEUE,
            Message::json(command.to_json().unwrap()),
        )
        .await
        .unwrap();

    eventually("action landing", || {
        let store = store.clone();
        async move {
            store
                .action_by_id(ActionId(500))
                .await
                .unwrap()
                .is_some_and(|a| a.status == ActionStatus::Done)
        }
    })
    .await;

    let stored = harness.store.action_by_id(ActionId(500)).await.unwrap().unwrap();
    assert_eq!(stored.counters.success, 1);
    assert!(harness
        .broker
        .published_to(Exchange::ToWorkers)
        .iter()
        .any(|m| m.routing_key == "scheduler.heartbeat"));

    runtime.context().request_termination("test finished");
    assert_eq!(runtime.wait_for_termination().await, "test finished");
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_every_task() {
    let mut harness = Harness::new().await;
    let receivers = harness.take_receivers();
    let runtime = CoordinatorRuntime::start(harness.ctx.clone(), receivers, None)
        .await
        .unwrap();
    let token = runtime.cancellation_token();

    tokio::time::timeout(Duration::from_secs(10), runtime.shutdown())
        .await
        .expect("shutdown did not complete");
    assert!(token.is_cancelled());
    assert!(harness
        .broker
        .publish(Exchange::ToWorkers, "scheduler.heartbeat", Message::json("{}"))
        .await
        .is_err());
}
