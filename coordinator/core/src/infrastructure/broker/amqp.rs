// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// AMQP Broker - RabbitMQ Client Behind the Broker Trait
//
// One connection, one publishing channel. The three exchanges are declared
// durable on connect. Each consumer gets its own channel so a failed passive
// declaration on the shared channel does not stop the listeners.
//
// Every broker round trip is bounded by the configured timeout.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, Delivery, Exchange, Message, QueueInfo};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    connection: Connection,
    channel: RwLock<Channel>,
    timeout: Duration,
}

impl AmqpBroker {
    /// Connects to `url`, opens the publishing channel and declares the
    /// exchanges.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, BrokerError> {
        let connection = bounded(timeout, Connection::connect(url, ConnectionProperties::default()))
            .await?
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let channel = bounded(timeout, connection.create_channel()).await?.map_err(map_lapin)?;

        for exchange in [Exchange::ToAgents, Exchange::ToSchedulers, Exchange::ToWorkers] {
            bounded(
                timeout,
                channel.exchange_declare(
                    exchange.name(),
                    exchange_kind(exchange),
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                ),
            )
            .await?
            .map_err(map_lapin)?;
        }
        info!(timeout = ?timeout, "connected to AMQP broker");

        Ok(Self {
            connection,
            channel: RwLock::new(channel),
            timeout,
        })
    }

    fn channel(&self) -> Channel {
        self.channel.read().clone()
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, lapin::Error>>,
    {
        bounded(self.timeout, fut).await?.map_err(map_lapin)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str, exchange: Exchange, routing_key: &str) -> Result<(), BrokerError> {
        let channel = self.channel();
        self.call(channel.queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        ))
        .await?;
        self.call(channel.queue_bind(
            queue,
            exchange.name(),
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        ))
        .await?;
        debug!(queue, exchange = exchange.name(), routing_key, "queue declared");
        Ok(())
    }

    async fn publish(&self, exchange: Exchange, routing_key: &str, message: Message) -> Result<(), BrokerError> {
        let channel = self.channel();
        let confirm = self
            .call(channel.basic_publish(
                exchange.name(),
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties(&message),
            ))
            .await
            .map_err(publish_error)?;
        self.call(confirm).await.map_err(publish_error)?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let channel = self.call(self.connection.create_channel()).await?;
        let mut consumer = self
            .call(channel.basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            ))
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            routing_key: delivery.routing_key.as_str().to_string(),
                            body: Bytes::from(delivery.data),
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "AMQP consumer failed");
                        break;
                    }
                }
            }
            debug!(queue = %queue, "AMQP consumer stopped");
        });
        Ok(rx)
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        let channel = self.channel();
        let declared = self
            .call(channel.queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            ))
            .await;
        match declared {
            Ok(declared) => Ok(QueueInfo {
                name: queue.to_string(),
                messages: u64::from(declared.message_count()),
                consumers: declared.consumer_count(),
            }),
            // the server answers a passive declaration of a missing queue by
            // closing the channel
            Err(BrokerError::Amqp(_) | BrokerError::ChannelClosed) => {
                Err(BrokerError::QueueNotFound(queue.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_queue(&self, queue: &str) -> Result<u64, BrokerError> {
        let channel = self.channel();
        let purged = self
            .call(channel.queue_delete(queue, QueueDeleteOptions::default()))
            .await?;
        Ok(u64::from(purged))
    }

    async fn reopen_channel(&self) -> Result<(), BrokerError> {
        let channel = self.call(self.connection.create_channel()).await?;
        *self.channel.write() = channel;
        debug!("AMQP channel reopened");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let channel = self.channel();
        if let Err(e) = self.call(channel.close(200, "coordinator shutting down")).await {
            debug!(error = %e, "AMQP channel already closed");
        }
        self.call(self.connection.close(200, "coordinator shutting down")).await
    }
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| BrokerError::Timeout(timeout))
}

fn exchange_kind(exchange: Exchange) -> ExchangeKind {
    if exchange.is_topic() {
        ExchangeKind::Topic
    } else {
        ExchangeKind::Direct
    }
}

fn properties(message: &Message) -> BasicProperties {
    let mut props = BasicProperties::default().with_content_type(message.content_type.into());
    if message.persistent {
        props = props.with_delivery_mode(PERSISTENT);
    }
    if let Some(ttl) = message.expiration {
        props = props.with_expiration(expiration_ms(ttl).into());
    }
    props
}

/// AMQP expirations are decimal milliseconds. A zero TTL would make the
/// broker drop the message on arrival, so the floor is one millisecond.
fn expiration_ms(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

fn map_lapin(e: lapin::Error) -> BrokerError {
    match e {
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed,
        other => BrokerError::Amqp(other.to_string()),
    }
}

fn publish_error(e: BrokerError) -> BrokerError {
    match e {
        BrokerError::Amqp(msg) => BrokerError::Publish(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_is_whole_milliseconds() {
        assert_eq!(expiration_ms(Duration::from_secs(90)), "90000");
        assert_eq!(expiration_ms(Duration::from_micros(1500)), "1");
        assert_eq!(expiration_ms(Duration::ZERO), "1");
    }

    #[test]
    fn test_exchange_kinds() {
        assert!(matches!(exchange_kind(Exchange::ToAgents), ExchangeKind::Direct));
        assert!(matches!(exchange_kind(Exchange::ToSchedulers), ExchangeKind::Direct));
        assert!(matches!(exchange_kind(Exchange::ToWorkers), ExchangeKind::Topic));
    }

    #[test]
    fn test_command_properties() {
        let message = Message::json(&b"{}"[..]).with_expiration(Duration::from_secs(5));
        let props = properties(&message);
        assert_eq!(props.delivery_mode(), &Some(PERSISTENT));
        assert_eq!(props.expiration().as_ref().map(|e| e.as_str()), Some("5000"));
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some("application/json")
        );
    }

    #[test]
    fn test_channel_errors_map_to_reopenable_states() {
        let err = map_lapin(lapin::Error::InvalidChannelState(lapin::ChannelState::Closed));
        assert!(matches!(err, BrokerError::ChannelClosed));
        assert!(matches!(
            publish_error(BrokerError::Amqp("nack".into())),
            BrokerError::Publish(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_timeout() {
        let never = std::future::pending::<()>();
        let err = bounded(Duration::from_millis(10), never).await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
    }
}
