use crate::broker::{
    Channel, Connection, ConsumeOptions, Deliveries, Delivery, Properties, QueueOptions,
};
use crate::error::{Result, TransportError};
use crate::link::BrokerLink;
use crate::message::{Reply, Request};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Maximum length of an AMQP queue name.
const MAX_QUEUE_NAME: usize = 255;

const QUEUE_SUFFIX: &str = "_queue";

/// One delivery at a time per listener.
const LISTEN_PREFETCH: u16 = 1;

/// Where a listening service can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub address: String,
    pub queue_name: String,
}

/// A service that answers requests arriving on its queue.
///
/// `on_message` is called once per delivery, one delivery at a time. The
/// delivery is acknowledged as soon as `on_message` returns, whether or not
/// the service has replied yet, so `responder` may be moved into a task and
/// answered later.
pub trait Service: Send + Sync + 'static {
    fn service_name(&self) -> &str;

    fn on_message(&self, message: Request, responder: Responder);
}

/// [`Service`] built from a name and a closure.
///
/// # Examples
///
/// ```
/// use amqp_rpc_transport::{Request, Responder, ServiceFn};
/// use serde_json::json;
///
/// let echo = ServiceFn::new("echo", |message: Request, responder: Responder| {
///     let a = message.get("a").and_then(|a| a.as_i64()).unwrap_or_default();
///     responder.ok(json!({ "result": a * 2 }));
/// });
/// ```
pub struct ServiceFn<F> {
    name: String,
    handler: F,
}

impl<F> ServiceFn<F>
where
    F: Fn(Request, Responder) + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl<F> Service for ServiceFn<F>
where
    F: Fn(Request, Responder) + Send + Sync + 'static,
{
    fn service_name(&self) -> &str {
        &self.name
    }

    fn on_message(&self, message: Request, responder: Responder) {
        (self.handler)(message, responder)
    }
}

/// Queue a service listens on: `"<service_name>_queue"`.
pub fn queue_name(service_name: &str) -> Result<String> {
    if service_name.is_empty() {
        return Err(TransportError::InvalidArgument(
            "service name must not be empty".to_string(),
        ));
    }

    let queue_name = format!("{service_name}{QUEUE_SUFFIX}");
    if queue_name.len() > MAX_QUEUE_NAME {
        return Err(TransportError::InvalidArgument(format!(
            "queue name for service '{service_name}' exceeds {MAX_QUEUE_NAME} bytes"
        )));
    }

    Ok(queue_name)
}

struct OutboundReply {
    reply_to: String,
    body: Vec<u8>,
    properties: Properties,
}

/// Sends the reply for one request back to its caller.
///
/// Consuming `self` keeps a request from being answered twice. Dropping a
/// responder without replying publishes nothing and the caller keeps waiting.
pub struct Responder {
    id: String,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    outbound: mpsc::UnboundedSender<OutboundReply>,
    replied: bool,
}

impl Responder {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reply(mut self, outcome: std::result::Result<Value, String>) {
        self.replied = true;

        let Some(reply_to) = self.reply_to.take() else {
            warn!(id = %self.id, "Request has no reply-to queue, dropping reply");
            return;
        };

        let reply = Reply::new(self.id.clone(), outcome);
        let body = match serde_json::to_vec(&reply) {
            Ok(body) => body,
            Err(e) => {
                error!(id = %self.id, error = %e, "Failed to encode reply");
                return;
            }
        };

        let properties = Properties {
            correlation_id: self.correlation_id.take(),
            reply_to: None,
        };
        if self
            .outbound
            .send(OutboundReply {
                reply_to,
                body,
                properties,
            })
            .is_err()
        {
            warn!(id = %self.id, "Listener stopped, dropping reply");
        }
    }

    pub fn ok(self, result: Value) {
        self.reply(Ok(result))
    }

    pub fn err(self, error: impl Display) {
        self.reply(Err(error.to_string()))
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.replied {
            warn!(id = %self.id, "Responder dropped without a reply");
        }
    }
}

/// Consumes one service queue and dispatches each delivery to the service.
pub(crate) struct ListenSession<S> {
    channel: Arc<dyn Channel>,
    service: Arc<S>,
    queue_name: String,
    outbound: mpsc::UnboundedSender<OutboundReply>,
}

impl<S: Service> ListenSession<S> {
    /// Connects, subscribes to the service queue and spawns the consumer.
    /// Returns once the subscription is active.
    pub(crate) async fn start(
        link: &BrokerLink,
        url: &str,
        service: Arc<S>,
        queue_name: String,
    ) -> Result<()> {
        let (connection, channel) = link.open(url).await?;

        channel.prefetch(LISTEN_PREFETCH).await?;
        channel
            .declare_queue(&queue_name, QueueOptions::transient())
            .await?;
        let deliveries = channel
            .consume(&queue_name, ConsumeOptions::default())
            .await?;

        let (outbound, replies) = mpsc::unbounded_channel();
        tokio::spawn(publish_replies(Arc::clone(&channel), replies));

        let session = ListenSession {
            channel,
            service,
            queue_name,
            outbound,
        };
        info!(queue = %session.queue_name, "Listening for requests");
        tokio::spawn(session.run(connection, deliveries));

        Ok(())
    }

    async fn run(self, _connection: Arc<dyn Connection>, mut deliveries: Deliveries) {
        while let Some(delivery) = deliveries.recv().await {
            self.dispatch(delivery).await;
        }
        info!(queue = %self.queue_name, "Consumer cancelled, listener stopped");
    }

    async fn dispatch(&self, delivery: Delivery) {
        let tag = delivery.delivery_tag;

        let request: Request = match serde_json::from_slice(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                error!(queue = %self.queue_name, error = %e, "Rejecting undecodable request");
                if let Err(e) = self.channel.reject(tag, false).await {
                    warn!(queue = %self.queue_name, error = %e, "Failed to reject delivery");
                }
                return;
            }
        };

        debug!(queue = %self.queue_name, id = %request.id, "Dispatching request");
        let responder = Responder {
            id: request.id.clone(),
            reply_to: delivery.properties.reply_to,
            correlation_id: delivery.properties.correlation_id,
            outbound: self.outbound.clone(),
            replied: false,
        };

        let id = request.id.clone();
        let service = &self.service;
        if panic::catch_unwind(AssertUnwindSafe(|| service.on_message(request, responder))).is_err()
        {
            error!(queue = %self.queue_name, id = %id, "Service panicked while handling request");
        }

        if let Err(e) = self.channel.ack(tag).await {
            warn!(queue = %self.queue_name, error = %e, "Failed to acknowledge delivery");
        }
    }
}

async fn publish_replies(
    channel: Arc<dyn Channel>,
    mut replies: mpsc::UnboundedReceiver<OutboundReply>,
) {
    while let Some(reply) = replies.recv().await {
        debug!(reply_to = %reply.reply_to, "Publishing reply");
        if let Err(e) = channel
            .publish(&reply.reply_to, reply.body, reply.properties)
            .await
        {
            warn!(reply_to = %reply.reply_to, error = %e, "Failed to publish reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Connector, MemoryBroker};
    use crate::retry::RetryStrategy;
    use serde_json::json;
    use std::time::Duration;

    fn link(broker: &MemoryBroker) -> BrokerLink {
        BrokerLink::new(
            Arc::new(broker.clone()),
            RetryStrategy::new(1, Duration::ZERO),
        )
    }

    async fn client_channel(broker: &MemoryBroker) -> (Arc<dyn Channel>, String, Deliveries) {
        let connection = broker.connect("amqp://memory").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let reply_queue = channel
            .declare_queue("", QueueOptions::exclusive())
            .await
            .unwrap();
        let replies = channel
            .consume(&reply_queue, ConsumeOptions { no_ack: true })
            .await
            .unwrap();
        (channel, reply_queue, replies)
    }

    fn request_properties(reply_queue: &str, correlation_id: &str) -> Properties {
        Properties {
            correlation_id: Some(correlation_id.to_string()),
            reply_to: Some(reply_queue.to_string()),
        }
    }

    #[test]
    fn test_queue_name_from_service_name() {
        assert_eq!(queue_name("echo").unwrap(), "echo_queue");
    }

    #[test]
    fn test_queue_name_rejects_empty() {
        match queue_name("") {
            Err(TransportError::InvalidArgument(msg)) => {
                assert_eq!(msg, "service name must not be empty");
            }
            other => panic!("Expected invalid argument, got {:?}", other),
        }
    }

    #[test]
    fn test_queue_name_length_limit() {
        let longest = "s".repeat(MAX_QUEUE_NAME - QUEUE_SUFFIX.len());
        assert_eq!(queue_name(&longest).unwrap().len(), MAX_QUEUE_NAME);

        let too_long = "s".repeat(MAX_QUEUE_NAME - QUEUE_SUFFIX.len() + 1);
        assert!(matches!(
            queue_name(&too_long),
            Err(TransportError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_connection_config_wire_names() {
        let config = ConnectionConfig {
            address: "amqp://127.0.0.1:5672".to_string(),
            queue_name: "echo_queue".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({ "address": "amqp://127.0.0.1:5672", "queueName": "echo_queue" })
        );
    }

    #[tokio::test]
    async fn test_reply_carries_envelope_id_and_correlation_id() {
        let broker = MemoryBroker::new();
        let service = Arc::new(ServiceFn::new("echo", |message: Request, responder: Responder| {
            let a = message.get("a").and_then(Value::as_i64).unwrap_or_default();
            responder.ok(json!({ "result": a * 2 }));
        }));
        ListenSession::start(&link(&broker), "amqp://memory", service, "echo_queue".to_string())
            .await
            .unwrap();

        let (channel, reply_queue, mut replies) = client_channel(&broker).await;
        let body = serde_json::to_vec(&json!({ "id": "call-1", "a": 21 })).unwrap();
        channel
            .publish("echo_queue", body, request_properties(&reply_queue, "corr-1"))
            .await
            .unwrap();

        let delivery = replies.recv().await.unwrap();
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(delivery.properties.reply_to, None);

        let reply: Reply = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(reply.id, "call-1");
        assert_eq!(reply.result, json!({ "result": 42 }));
    }

    #[tokio::test]
    async fn test_undecodable_request_is_rejected_and_listener_continues() {
        let broker = MemoryBroker::new();
        let service = Arc::new(ServiceFn::new("sturdy", |_message: Request, responder: Responder| {
            responder.ok(json!("fine"));
        }));
        ListenSession::start(&link(&broker), "amqp://memory", service, "sturdy_queue".to_string())
            .await
            .unwrap();

        let (channel, reply_queue, mut replies) = client_channel(&broker).await;
        channel
            .publish(
                "sturdy_queue",
                b"not json".to_vec(),
                request_properties(&reply_queue, "bad"),
            )
            .await
            .unwrap();
        let body = serde_json::to_vec(&json!({ "id": "good" })).unwrap();
        channel
            .publish("sturdy_queue", body, request_properties(&reply_queue, "good"))
            .await
            .unwrap();

        let delivery = replies.recv().await.unwrap();
        let reply: Reply = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(reply.id, "good");
        assert_eq!(broker.ready_count("sturdy_queue"), 0);
        assert_eq!(broker.unacked_count("sturdy_queue"), 0);
    }

    #[tokio::test]
    async fn test_panicking_service_is_contained() {
        let broker = MemoryBroker::new();
        let service = Arc::new(ServiceFn::new("fragile", |message: Request, responder: Responder| {
            if message.get("explode").is_some() {
                panic!("handler blew up");
            }
            responder.ok(json!("survived"));
        }));
        ListenSession::start(&link(&broker), "amqp://memory", service, "fragile_queue".to_string())
            .await
            .unwrap();

        let (channel, reply_queue, mut replies) = client_channel(&broker).await;
        for (id, payload) in [
            ("boom", json!({ "id": "boom", "explode": true })),
            ("calm", json!({ "id": "calm" })),
        ] {
            channel
                .publish(
                    "fragile_queue",
                    serde_json::to_vec(&payload).unwrap(),
                    request_properties(&reply_queue, id),
                )
                .await
                .unwrap();
        }

        let delivery = replies.recv().await.unwrap();
        let reply: Reply = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(reply.id, "calm");
        assert_eq!(reply.result, json!("survived"));
        assert_eq!(broker.unacked_count("fragile_queue"), 0);
    }

    #[tokio::test]
    async fn test_delivery_is_acked_even_without_reply() {
        let broker = MemoryBroker::new();
        let service = Arc::new(ServiceFn::new(
            "silent",
            |_message: Request, _responder: Responder| {},
        ));
        ListenSession::start(&link(&broker), "amqp://memory", service, "silent_queue".to_string())
            .await
            .unwrap();

        let (channel, reply_queue, mut replies) = client_channel(&broker).await;
        let body = serde_json::to_vec(&json!({ "id": "ignored" })).unwrap();
        channel
            .publish("silent_queue", body, request_properties(&reply_queue, "c"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.ready_count("silent_queue"), 0);
        assert_eq!(broker.unacked_count("silent_queue"), 0);
        assert!(replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deferred_reply_from_spawned_task() {
        let broker = MemoryBroker::new();
        let service = Arc::new(ServiceFn::new("later", |message: Request, responder: Responder| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                responder.ok(json!({ "echo": message.payload }));
            });
        }));
        ListenSession::start(&link(&broker), "amqp://memory", service, "later_queue".to_string())
            .await
            .unwrap();

        let (channel, reply_queue, mut replies) = client_channel(&broker).await;
        let body = serde_json::to_vec(&json!({ "id": "slow", "x": 1 })).unwrap();
        channel
            .publish("later_queue", body, request_properties(&reply_queue, "c"))
            .await
            .unwrap();

        let delivery = replies.recv().await.unwrap();
        let reply: Reply = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(reply.id, "slow");
        assert_eq!(reply.result, json!({ "echo": { "x": 1 } }));
    }

    #[tokio::test]
    async fn test_cancelled_consumer_stops_listener() {
        let broker = MemoryBroker::new();
        let service = Arc::new(ServiceFn::new("gone", |_message: Request, responder: Responder| {
            responder.ok(Value::Null);
        }));
        ListenSession::start(&link(&broker), "amqp://memory", service, "gone_queue".to_string())
            .await
            .unwrap();

        broker.cancel_consumers("gone_queue");

        let (channel, reply_queue, mut replies) = client_channel(&broker).await;
        let body = serde_json::to_vec(&json!({ "id": "orphan" })).unwrap();
        channel
            .publish("gone_queue", body, request_properties(&reply_queue, "c"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.ready_count("gone_queue"), 1);
        assert!(replies.try_recv().is_err());
    }
}
