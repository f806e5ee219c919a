use super::{
    Channel, Connection, Connector, ConsumeOptions, Deliveries, Delivery, Properties, QueueOptions,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connects to an AMQP 0-9-1 broker such as RabbitMQ.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

fn protocol(err: lapin::Error) -> BrokerError {
    BrokerError::Protocol(err.to_string())
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        let connection = lapin::Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionRefused(format!("{url}: {e}")))?;
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel = self.inner.create_channel().await.map_err(protocol)?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = Properties {
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|queue| queue.as_str().to_string()),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        body: delivery.data,
        properties,
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(protocol)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Deliveries, BrokerError> {
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        if tx.send(into_delivery(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Consumer failed");
                        break;
                    }
                }
            }
            debug!(queue = %queue, "Consumer stream ended");
        });

        Ok(rx)
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: Properties,
    ) -> Result<(), BrokerError> {
        let mut basic = BasicProperties::default();
        if let Some(correlation_id) = properties.correlation_id {
            basic = basic.with_correlation_id(ShortString::from(correlation_id));
        }
        if let Some(reply_to) = properties.reply_to {
            basic = basic.with_reply_to(ShortString::from(reply_to));
        }

        self.inner
            .basic_publish("", queue, BasicPublishOptions::default(), &body, basic)
            .await
            .map_err(protocol)?
            .await
            .map_err(protocol)?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(protocol)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(protocol)
    }
}
