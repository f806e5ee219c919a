use super::{
    Channel, Connection, Connector, ConsumeOptions, Deliveries, Delivery, Properties, QueueOptions,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A message as observed on the way into the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: Properties,
}

/// In-process broker.
///
/// Queues live in memory and every connection shares them. Deliveries honour
/// the channel prefetch: a consumer never holds more unacknowledged messages
/// than its limit, and the next message is pushed only after an ack or reject.
/// Publishing to an undeclared queue drops the message, like the AMQP default
/// exchange does for unroutable messages.
///
/// Cloning is cheap and every clone refers to the same broker.
///
/// # Examples
///
/// ```
/// use amqp_rpc_transport::broker::{Connector, MemoryBroker};
///
/// # async fn example() {
/// let broker = MemoryBroker::new();
/// broker.refuse_connections(2);
///
/// assert!(broker.connect("amqp://memory").await.is_err());
/// assert!(broker.connect("amqp://memory").await.is_err());
/// assert!(broker.connect("amqp://memory").await.is_ok());
/// assert_eq!(broker.connect_attempts(), 3);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    connect_attempts: AtomicU32,
    refusals: AtomicU32,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    published: Vec<PublishedMessage>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

#[derive(Clone)]
struct Message {
    body: Vec<u8>,
    properties: Properties,
}

struct ConsumerSlot {
    tx: mpsc::UnboundedSender<Delivery>,
    prefetch: u16,
    no_ack: bool,
    unacked: HashMap<u64, Message>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

impl QueueState {
    /// Hands ready messages to consumers with spare capacity, round-robin.
    fn pump(&mut self, next_tag: &mut u64) {
        self.prune();

        while !self.ready.is_empty() {
            let count = self.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (self.cursor + offset) % count)
                .find(|&i| self.consumers[i].has_capacity())
            else {
                break;
            };
            let Some(message) = self.ready.pop_front() else {
                break;
            };

            *next_tag += 1;
            let tag = *next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            let consumer = &mut self.consumers[index];
            if consumer.tx.send(delivery).is_err() {
                self.ready.push_front(message);
                self.prune();
                continue;
            }
            if !consumer.no_ack {
                consumer.unacked.insert(tag, message);
            }
            self.cursor = (index + 1) % count;
        }
    }

    /// Drops consumers whose receiver is gone and requeues what they held.
    fn prune(&mut self) {
        let mut orphaned = Vec::new();
        self.consumers.retain_mut(|consumer| {
            if consumer.tx.is_closed() {
                orphaned.extend(consumer.unacked.drain());
                false
            } else {
                true
            }
        });
        self.requeue(orphaned);
    }

    fn requeue(&mut self, mut messages: Vec<(u64, Message)>) {
        messages.sort_by_key(|(tag, _)| *tag);
        for (_, message) in messages.into_iter().rev() {
            self.ready.push_front(message);
        }
    }
}

impl State {
    fn pump(&mut self, queue: &str) {
        let State {
            queues, next_tag, ..
        } = self;
        if let Some(queue) = queues.get_mut(queue) {
            queue.pump(next_tag);
        }
    }

    /// Removes an outstanding delivery, returning its queue and message.
    fn settle(&mut self, tag: u64) -> Result<(String, Message), BrokerError> {
        for (name, queue) in self.queues.iter_mut() {
            for consumer in queue.consumers.iter_mut() {
                if let Some(message) = consumer.unacked.remove(&tag) {
                    return Ok((name.clone(), message));
                }
            }
        }
        Err(BrokerError::UnknownDeliveryTag(tag))
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: u32) {
        self.inner.refusals.store(count, Ordering::SeqCst);
    }

    /// Total connection attempts, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every message published so far, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state().published.clone()
    }

    pub fn published_to(&self, queue: &str) -> Vec<PublishedMessage> {
        self.inner
            .state()
            .published
            .iter()
            .filter(|message| message.queue == queue)
            .cloned()
            .collect()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state().queues.contains_key(queue)
    }

    /// Messages waiting in `queue` that no consumer holds yet.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Deliveries from `queue` that are still waiting for an ack.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner.state().queues.get(queue).map_or(0, |queue| {
            queue
                .consumers
                .iter()
                .map(|consumer| consumer.unacked.len())
                .sum()
        })
    }

    /// Cancels every consumer of `queue`. Their delivery streams end and
    /// unacknowledged messages go back to the head of the queue.
    pub fn cancel_consumers(&self, queue: &str) {
        let mut state = self.inner.state();
        if let Some(queue_state) = state.queues.get_mut(queue) {
            let orphaned: Vec<(u64, Message)> = queue_state
                .consumers
                .drain(..)
                .flat_map(|consumer| consumer.unacked.into_iter())
                .collect();
            queue_state.requeue(orphaned);
            debug!(queue = %queue, "Cancelled consumers");
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .inner
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            debug!(url = %url, "Refusing connection");
            return Err(BrokerError::ConnectionRefused(url.to_string()));
        }

        Ok(Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        Ok(Arc::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            prefetch: AtomicU16::new(0),
        }))
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    prefetch: AtomicU16,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        _options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::now_v7().simple())
        } else {
            name.to_string()
        };

        self.inner.state().queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Deliveries, BrokerError> {
        let mut state = self.inner.state();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        queue_state.consumers.push(ConsumerSlot {
            tx,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            no_ack: options.no_ack,
            unacked: HashMap::new(),
        });
        state.pump(queue);

        Ok(rx)
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: Properties,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state();
        state.published.push(PublishedMessage {
            queue: queue.to_string(),
            body: body.clone(),
            properties: properties.clone(),
        });

        match state.queues.get_mut(queue) {
            Some(queue_state) => {
                queue_state.ready.push_back(Message { body, properties });
                state.pump(queue);
            }
            None => debug!(queue = %queue, "Dropping unroutable message"),
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.inner.state();
        let (queue, _) = state.settle(delivery_tag)?;
        state.pump(&queue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.inner.state();
        let (queue, message) = state.settle(delivery_tag)?;
        if requeue {
            if let Some(queue_state) = state.queues.get_mut(&queue) {
                queue_state.ready.push_front(message);
            }
        }
        state.pump(&queue);
        Ok(())
    }
}
