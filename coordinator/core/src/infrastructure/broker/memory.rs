// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// In-Memory Broker - Direct and Topic Exchanges on tokio Channels
//
// Direct exchanges route to the queues bound under the exact routing key.
// The topic exchange fans every message out to broadcast subscribers.
//
// Used for single-process deployments and the end-to-end test suites.
// Messages are lost on restart.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{Broker, BrokerError, Delivery, Exchange, Message, QueueInfo};

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: Exchange,
    pub routing_key: String,
    pub message: Message,
}

#[derive(Default)]
struct MemQueue {
    pending: VecDeque<Delivery>,
    consumer: Option<mpsc::UnboundedSender<Delivery>>,
}

impl MemQueue {
    fn push(&mut self, delivery: Delivery) {
        if let Some(consumer) = &self.consumer {
            match consumer.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(delivery)) => {
                    self.consumer = None;
                    self.pending.push_back(delivery);
                }
            }
        } else {
            self.pending.push_back(delivery);
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, MemQueue>,
    bindings: HashMap<(Exchange, String), Vec<String>>,
    channel_closed: bool,
    connection_closed: bool,
}

impl State {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.connection_closed {
            return Err(BrokerError::ConnectionClosed);
        }
        if self.channel_closed {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }
}

pub struct InMemoryBroker {
    state: Mutex<State>,
    events: broadcast::Sender<Delivery>,
    published: Mutex<Vec<PublishedMessage>>,
    failing_publishes: AtomicU32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1000);
        Self {
            state: Mutex::new(State::default()),
            events,
            published: Mutex::new(Vec::new()),
            failing_publishes: AtomicU32::new(0),
        }
    }

    /// Subscribe to everything published on the topic exchange.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Delivery> {
        self.events.subscribe()
    }

    /// Every successful publish, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, exchange: Exchange) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str, exchange: Exchange, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.queues.entry(queue.to_string()).or_default();
        let bound = state
            .bindings
            .entry((exchange, routing_key.to_string()))
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, exchange: Exchange, routing_key: &str, message: Message) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock();
            state.check_open()?;
            let failing = self.failing_publishes.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_publishes.store(failing - 1, Ordering::SeqCst);
                return Err(BrokerError::Publish("injected failure".to_string()));
            }

            let delivery = Delivery {
                routing_key: routing_key.to_string(),
                body: message.body.clone(),
            };
            if exchange.is_topic() {
                let _ = self.events.send(delivery);
            } else {
                let targets = state
                    .bindings
                    .get(&(exchange, routing_key.to_string()))
                    .cloned()
                    .unwrap_or_default();
                if targets.is_empty() {
                    debug!(exchange = exchange.name(), routing_key, "message unroutable, dropped");
                }
                for queue in targets {
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.push(delivery.clone());
                    }
                }
            }
        }
        self.published.lock().push(PublishedMessage {
            exchange,
            routing_key: routing_key.to_string(),
            message,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let mut state = self.state.lock();
        state.check_open()?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(delivery) = q.pending.pop_front() {
            let _ = tx.send(delivery);
        }
        q.consumer = Some(tx);
        Ok(rx)
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        let mut state = self.state.lock();
        state.check_open()?;
        match state.queues.get(queue) {
            Some(q) => Ok(QueueInfo {
                name: queue.to_string(),
                messages: q.pending.len() as u64,
                consumers: u32::from(q.consumer.as_ref().is_some_and(|c| !c.is_closed())),
            }),
            None => {
                state.channel_closed = true;
                Err(BrokerError::QueueNotFound(queue.to_string()))
            }
        }
    }

    async fn delete_queue(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut state = self.state.lock();
        state.check_open()?;
        let removed = state
            .queues
            .remove(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        for bound in state.bindings.values_mut() {
            bound.retain(|q| q != queue);
        }
        Ok(removed.pending.len() as u64)
    }

    async fn reopen_channel(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.connection_closed {
            return Err(BrokerError::ConnectionClosed);
        }
        state.channel_closed = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.connection_closed = true;
        for q in state.queues.values_mut() {
            q.consumer = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::broker::{agent_queue, publish_with_retry};

    #[tokio::test]
    async fn test_direct_exchange_routes_to_bound_queue() {
        let broker = InMemoryBroker::new();
        let q = agent_queue("linux.host1");
        broker.declare_queue(&q, Exchange::ToAgents, &q).await.unwrap();
        broker
            .publish(Exchange::ToAgents, &q, Message::json("{}"))
            .await
            .unwrap();
        assert_eq!(broker.inspect_queue(&q).await.unwrap().messages, 1);

        let mut rx = broker.consume(&q).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body, "{}");
    }

    #[tokio::test]
    async fn test_topic_exchange_fans_out() {
        let broker = InMemoryBroker::new();
        let mut events = broker.subscribe_events();
        broker
            .publish(Exchange::ToWorkers, "agent.new", Message::json("x"))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap().routing_key, "agent.new");
    }

    #[tokio::test]
    async fn test_missing_queue_closes_channel_until_reopened() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.inspect_queue("mig.agt.gone").await,
            Err(BrokerError::QueueNotFound(_))
        ));
        assert!(matches!(
            broker.inspect_queue("mig.agt.gone").await,
            Err(BrokerError::ChannelClosed)
        ));
        broker.reopen_channel().await.unwrap();
        assert!(matches!(
            broker.inspect_queue("mig.agt.gone").await,
            Err(BrokerError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_retry_is_bounded() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(2);
        publish_with_retry(&broker, Exchange::ToWorkers, "k", Message::json("a"), 3)
            .await
            .unwrap();

        broker.fail_next_publishes(5);
        assert!(publish_with_retry(&broker, Exchange::ToWorkers, "k", Message::json("b"), 3)
            .await
            .is_err());
        assert_eq!(broker.published().len(), 1);
    }
}
