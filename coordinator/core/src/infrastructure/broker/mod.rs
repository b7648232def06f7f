// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Broker Boundary
//!
//! The coordinator talks to agents and downstream workers through three
//! exchanges:
//!
//! | Exchange | Kind | Traffic |
//! |----------|------|---------|
//! | `toagents` | direct | commands, routing key `mig.agt.<queueloc>` |
//! | `toschedulers` | direct | heartbeats and results from agents |
//! | `toworkers` | topic | coordinator events |
//!
//! [`Broker`] abstracts the client. [`amqp::AmqpBroker`] talks to RabbitMQ;
//! [`memory::InMemoryBroker`] implements the same routing in-process.

pub mod amqp;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

/// Queue the agents publish heartbeats to.
pub const HEARTBEAT_QUEUE: &str = "mig.agt.heartbeats";
/// Queue the agents publish returned commands to.
pub const RESULTS_QUEUE: &str = "mig.agt.results";

const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    ToAgents,
    ToSchedulers,
    ToWorkers,
}

impl Exchange {
    pub fn name(&self) -> &'static str {
        match self {
            Exchange::ToAgents => "toagents",
            Exchange::ToSchedulers => "toschedulers",
            Exchange::ToWorkers => "toworkers",
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Exchange::ToWorkers)
    }
}

/// Name of the queue an agent listens on.
pub fn agent_queue(queue_loc: &str) -> String {
    format!("mig.agt.{}", queue_loc)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub body: Bytes,
    pub content_type: &'static str,
    pub persistent: bool,
    /// Broker-side time to live; undelivered messages are dropped after it.
    pub expiration: Option<Duration>,
}

impl Message {
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: "application/json",
            persistent: true,
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub messages: u64,
    pub consumers: u32,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a durable queue and binds it to `exchange` under `routing_key`.
    async fn declare_queue(&self, queue: &str, exchange: Exchange, routing_key: &str) -> Result<(), BrokerError>;

    async fn publish(&self, exchange: Exchange, routing_key: &str, message: Message) -> Result<(), BrokerError>;

    /// Starts consuming `queue` with automatic acknowledgement.
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError>;

    /// Passive declaration. A missing queue closes the channel, as on AMQP.
    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError>;

    /// Deletes a queue and returns the number of messages it held.
    async fn delete_queue(&self, queue: &str) -> Result<u64, BrokerError>;

    /// Opens a fresh channel after the previous one was closed by an error.
    async fn reopen_channel(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Publishes with a bounded number of attempts. The last error is returned
/// once `attempts` is exhausted.
pub async fn publish_with_retry(
    broker: &dyn Broker,
    exchange: Exchange,
    routing_key: &str,
    message: Message,
    attempts: u32,
) -> Result<(), BrokerError> {
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match broker.publish(exchange, routing_key, message.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(exchange = exchange.name(), routing_key, attempt, error = %e, "publish failed");
                if matches!(e, BrokerError::ChannelClosed) {
                    let _ = broker.reopen_channel().await;
                }
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| BrokerError::Publish("no publish attempt made".to_string())))
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("queue {0} not found")]
    QueueNotFound(String),

    #[error("broker channel is closed")]
    ChannelClosed,

    #[error("broker connection is closed")]
    ConnectionClosed,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("cannot connect to broker: {0}")]
    Connect(String),

    #[error("broker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("AMQP error: {0}")]
    Amqp(String),
}
