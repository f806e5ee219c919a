//! Broker seam.
//!
//! The transport only needs a handful of AMQP 0-9-1 primitives: open a
//! connection, open a channel on it, declare and consume queues, publish to a
//! queue through the default exchange, and acknowledge deliveries. These are
//! modelled as object-safe traits so the sessions can hold `Arc<dyn Channel>`
//! regardless of the backend.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryBroker`], an in-process broker with real prefetch accounting.
//! - `AmqpConnector` (feature `amqp`), backed by `lapin`.

use crate::error::BrokerError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, PublishedMessage};

/// Stream of deliveries for one consumer. The sender side closes when the
/// broker cancels the consumer.
pub type Deliveries = mpsc::UnboundedReceiver<Delivery>;

/// Transport headers carried next to the message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub properties: Properties,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Non-durable, shared queue.
    pub fn transient() -> Self {
        Self::default()
    }

    /// Private queue owned by the declaring connection.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Limits unacknowledged deliveries per consumer. Zero means unlimited.
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Declares `name`, or a broker-named queue when `name` is empty, and
    /// returns the queue's actual name.
    async fn declare_queue(&self, name: &str, options: QueueOptions)
        -> Result<String, BrokerError>;

    async fn consume(&self, queue: &str, options: ConsumeOptions)
        -> Result<Deliveries, BrokerError>;

    /// Publishes through the default exchange, routed by queue name.
    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: Properties,
    ) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}
