// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for action intake and command delivery
//!
//! These tests drive the dispatcher against a temporary spool, the
//! in-memory store and the in-memory broker:
//! 1. Authorization and target resolution
//! 2. Invalidation paths and their spool/store side effects
//! 3. Command publication with a time to live

mod common;

use std::time::Duration;

use chrono::Utc;

use common::Harness;
use mig_coordinator_core::application::dispatcher::{DispatchOutcome, Dispatcher};
use mig_coordinator_core::application::error::ErrorKind;
use mig_coordinator_core::domain::action::{ActionId, ActionStatus};
use mig_coordinator_core::domain::command::CommandStatus;
use mig_coordinator_core::domain::repository::ActionRepository;
use mig_coordinator_core::infrastructure::broker::{agent_queue, Exchange};
use mig_coordinator_core::infrastructure::spool::SpoolDir;

async fn spool_len(harness: &Harness, dir: SpoolDir) -> usize {
    harness.ctx.spool.list(dir).await.unwrap().len()
}

#[tokio::test]
async fn test_action_without_matching_agents_is_invalid() {
    let harness = Harness::with_standard_acl().await;
    harness.add_agent(1, "linux.host1", 100, Utc::now()).await;

    let mut action = harness.action(10, "pkg", "name='nobody'");
    harness.alice.sign(&mut action);
    let path = harness.submit(&action).await;

    let dispatcher = Dispatcher::new(harness.ctx.clone());
    let outcome = dispatcher.process_new_action(&path).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Invalid { .. }));

    let stored = harness.store.action_by_id(ActionId(10)).await.unwrap().unwrap();
    assert_eq!(stored.status, ActionStatus::Invalid);
    assert_eq!(stored.counters.sent, 0);
    assert!(stored.finish_time.is_some());

    assert!(!path.exists());
    assert_eq!(spool_len(&harness, SpoolDir::ActionInvalid).await, 1);
    assert!(harness.store.commands_for_action(ActionId(10)).is_empty());
}

#[tokio::test]
async fn test_three_agents_receive_one_command_each() {
    let harness = Harness::with_standard_acl().await;
    for (id, queue) in [(1, "linux.host1"), (2, "linux.host2"), (3, "linux.host3")] {
        harness.add_agent(id, queue, 100 + id as i64, Utc::now()).await;
    }

    let mut action = harness.action(20, "pkg", "status='online'");
    harness.alice.sign(&mut action);
    let path = harness.submit(&action).await;

    let dispatcher = Dispatcher::new(harness.ctx.clone());
    let DispatchOutcome::Dispatched { action, commands } = dispatcher.process_new_action(&path).await.unwrap() else {
        panic!("action was not dispatched");
    };
    assert_eq!(commands.len(), 3);
    assert_eq!(action.status, ActionStatus::Inflight);
    assert_eq!(action.counters.sent, 3);
    assert_eq!(action.counters.inflight, 3);

    let stored = harness.store.action_by_id(ActionId(20)).await.unwrap().unwrap();
    assert_eq!(stored.status, ActionStatus::Inflight);

    let stored_commands = harness.store.commands_for_action(ActionId(20));
    assert_eq!(stored_commands.len(), 3);
    assert!(stored_commands.iter().all(|c| c.status == CommandStatus::Sent));

    let signatures = harness.store.signatures_for_action(ActionId(20));
    assert_eq!(signatures.len(), 1);
    assert_eq!(signatures[0].0 .0, 1);

    assert!(!path.exists());
    assert_eq!(spool_len(&harness, SpoolDir::ActionInflight).await, 1);
}

#[tokio::test]
async fn test_expired_action_is_never_dispatched() {
    let harness = Harness::with_standard_acl().await;
    harness.add_agent(1, "linux.host1", 100, Utc::now()).await;

    let now = Utc::now();
    let mut action = harness.action(30, "pkg", "status='online'");
    action.valid_from = now - chrono::Duration::hours(2);
    action.expire_after = now - chrono::Duration::hours(1);
    harness.alice.sign(&mut action);
    let path = harness.submit(&action).await;

    let outcome = Dispatcher::new(harness.ctx.clone())
        .process_new_action(&path)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Invalid { .. }));

    let stored = harness.store.action_by_id(ActionId(30)).await.unwrap().unwrap();
    assert_eq!(stored.status, ActionStatus::Invalid);
    assert!(harness.store.commands_for_action(ActionId(30)).is_empty());
}

#[tokio::test]
async fn test_future_action_stays_in_new() {
    let harness = Harness::with_standard_acl().await;
    let now = Utc::now();
    let mut action = harness.action(40, "pkg", "status='online'");
    action.valid_from = now + chrono::Duration::minutes(10);
    action.expire_after = now + chrono::Duration::hours(1);
    harness.alice.sign(&mut action);
    let path = harness.submit(&action).await;

    let outcome = Dispatcher::new(harness.ctx.clone())
        .process_new_action(&path)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Deferred));
    assert!(path.exists());
    assert!(harness.store.action_by_id(ActionId(40)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_copy_of_inflight_action_is_discarded() {
    let harness = Harness::with_standard_acl().await;
    harness.add_agent(1, "linux.host1", 100, Utc::now()).await;

    let mut action = harness.action(45, "pkg", "status='online'");
    harness.alice.sign(&mut action);
    let path = harness.submit(&action).await;
    let dispatcher = Dispatcher::new(harness.ctx.clone());
    assert!(matches!(
        dispatcher.process_new_action(&path).await.unwrap(),
        DispatchOutcome::Dispatched { .. }
    ));

    let now = Utc::now();
    let mut copy = harness.action(45, "pkg", "status='online'");
    copy.valid_from = now - chrono::Duration::hours(2);
    copy.expire_after = now - chrono::Duration::hours(1);
    harness.alice.sign(&mut copy);
    let path = harness.submit(&copy).await;
    assert!(matches!(
        dispatcher.process_new_action(&path).await.unwrap(),
        DispatchOutcome::Gone
    ));
    assert!(!path.exists());

    let stored = harness.store.action_by_id(ActionId(45)).await.unwrap().unwrap();
    assert_eq!(stored.status, ActionStatus::Inflight);
    assert_eq!(harness.store.commands_for_action(ActionId(45)).len(), 1);
    assert_eq!(spool_len(&harness, SpoolDir::ActionInvalid).await, 0);
}

#[tokio::test]
async fn test_insufficient_weight_invalidates() {
    let harness = Harness::with_standard_acl().await;
    harness.add_agent(1, "linux.host1", 100, Utc::now()).await;

    // `file` needs a weight of 2
    let mut action = harness.action(50, "file", "status='online'");
    harness.alice.sign(&mut action);
    let path = harness.submit(&action).await;

    let outcome = Dispatcher::new(harness.ctx.clone())
        .process_new_action(&path)
        .await
        .unwrap();
    let DispatchOutcome::Invalid { reason } = outcome else {
        panic!("action should have been rejected");
    };
    assert!(reason.contains("file"), "unexpected reason: {}", reason);

    let mut action = harness.action(51, "file", "status='online'");
    harness.alice.sign(&mut action);
    harness.bob.sign(&mut action);
    let path = harness.submit(&action).await;
    let outcome = Dispatcher::new(harness.ctx.clone())
        .process_new_action(&path)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
    assert_eq!(harness.store.signatures_for_action(ActionId(51)).len(), 2);
}

#[tokio::test]
async fn test_tampered_action_is_invalid() {
    let harness = Harness::with_standard_acl().await;
    harness.add_agent(1, "linux.host1", 100, Utc::now()).await;

    let mut action = harness.action(60, "pkg", "status='online'");
    harness.alice.sign(&mut action);
    action.target = "status='online' OR status='offline'".to_string();
    let path = harness.submit(&action).await;

    let outcome = Dispatcher::new(harness.ctx.clone())
        .process_new_action(&path)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Invalid { .. }));
    assert!(harness.store.commands_for_action(ActionId(60)).is_empty());
}

#[tokio::test]
async fn test_unparseable_action_moves_to_invalid() {
    let harness = Harness::with_standard_acl().await;
    let path = harness.ctx.spool.dir(SpoolDir::ActionNew).join("garbage.json");
    harness.ctx.spool.safe_write(&path, b"{not json").await.unwrap();

    let outcome = Dispatcher::new(harness.ctx.clone())
        .process_new_action(&path)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Invalid { .. }));
    assert!(!path.exists());
    assert_eq!(spool_len(&harness, SpoolDir::ActionInvalid).await, 1);
}

#[tokio::test]
async fn test_missing_file_is_gone() {
    let harness = Harness::new().await;
    let path = harness.ctx.spool.dir(SpoolDir::ActionNew).join("1.json");
    let outcome = Dispatcher::new(harness.ctx.clone())
        .process_new_action(&path)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Gone));
}

#[tokio::test]
async fn test_commands_are_published_with_remaining_validity() {
    let harness = Harness::with_standard_acl().await;
    harness.add_agent(1, "linux.host1", 100, Utc::now()).await;
    harness.add_agent(2, "linux.host2", 200, Utc::now()).await;

    let mut action = harness.action(70, "pkg", "status='online'");
    harness.alice.sign(&mut action);
    let path = harness.submit(&action).await;

    let dispatcher = Dispatcher::new(harness.ctx.clone());
    let DispatchOutcome::Dispatched { commands, .. } = dispatcher.process_new_action(&path).await.unwrap() else {
        panic!("action was not dispatched");
    };
    let sent = dispatcher.send_commands(commands).await.unwrap();
    assert_eq!(sent, 2);

    let published = harness.broker.published_to(Exchange::ToAgents);
    assert_eq!(published.len(), 2);
    let mut keys: Vec<_> = published.iter().map(|m| m.routing_key.clone()).collect();
    keys.sort();
    assert_eq!(keys, vec![agent_queue("linux.host1"), agent_queue("linux.host2")]);
    for message in &published {
        let ttl = message.message.expiration.unwrap();
        assert!(ttl <= Duration::from_secs(3600));
        assert!(ttl > Duration::from_secs(3500));
        assert!(message.message.persistent);
    }
    assert_eq!(spool_len(&harness, SpoolDir::CommandInflight).await, 2);
}

#[tokio::test]
async fn test_publish_failure_is_fatal() {
    let harness = Harness::with_standard_acl().await;
    harness.add_agent(1, "linux.host1", 100, Utc::now()).await;

    let mut action = harness.action(80, "pkg", "status='online'");
    harness.alice.sign(&mut action);
    let path = harness.submit(&action).await;

    let dispatcher = Dispatcher::new(harness.ctx.clone());
    let DispatchOutcome::Dispatched { commands, .. } = dispatcher.process_new_action(&path).await.unwrap() else {
        panic!("action was not dispatched");
    };
    harness.broker.fail_next_publishes(1);
    let err = dispatcher.send_commands(commands).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[tokio::test]
async fn test_action_without_id_gets_one() {
    let harness = Harness::with_standard_acl().await;
    harness.add_agent(1, "linux.host1", 100, Utc::now()).await;

    let mut action = harness.action(0, "pkg", "status='online'");
    harness.alice.sign(&mut action);
    let path = harness.ctx.spool.dir(SpoolDir::ActionNew).join("submitted.json");
    harness
        .ctx
        .spool
        .safe_write(&path, &action.to_json().unwrap())
        .await
        .unwrap();

    let DispatchOutcome::Dispatched { action, .. } = Dispatcher::new(harness.ctx.clone())
        .process_new_action(&path)
        .await
        .unwrap()
    else {
        panic!("action was not dispatched");
    };
    assert_ne!(action.id, ActionId(0));
    assert!(harness.store.action_by_id(action.id).await.unwrap().is_some());
}
