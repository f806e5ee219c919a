use crate::{
    broker::Connector,
    config::{Config, ConfigBuilder},
    error::Result,
    link::BrokerLink,
    listen::{self, ConnectionConfig, ListenSession, Service},
    retry::{RetryStrategy, Sleeper},
    send::{ConnectionState, SendSession},
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::info;

/// Request/reply transport over a message broker.
///
/// A transport plays both roles. [`listen`](Self::listen) serves a
/// [`Service`] from its own queue, and [`send`](Self::send) calls a service
/// that some transport is listening for. All sends on one transport share a
/// single lazily opened connection and a private reply queue.
///
/// # Examples
///
/// ```no_run
/// use amqp_rpc_transport::broker::MemoryBroker;
/// use amqp_rpc_transport::{Request, Responder, RpcTransport, ServiceFn};
/// use serde_json::{json, Value};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), amqp_rpc_transport::TransportError> {
///     let broker = MemoryBroker::new();
///
///     let server = RpcTransport::new(broker.clone());
///     let echo = ServiceFn::new("echo", |message: Request, responder: Responder| {
///         let a = message.get("a").and_then(Value::as_i64).unwrap_or_default();
///         responder.ok(json!({ "result": a * 2 }));
///     });
///     let target = server.listen(Arc::new(echo)).await?;
///
///     let client = RpcTransport::new(broker);
///     let reply: Value = client.send(&target, &json!({ "a": 21 })).await?;
///     assert_eq!(reply, json!({ "result": 42 }));
///     Ok(())
/// }
/// ```
pub struct RpcTransport {
    config: Config,
    link: BrokerLink,
    sender: Arc<SendSession>,
}

impl RpcTransport {
    /// Creates a transport with the default [`Config`].
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self::with_config(Config::default(), connector)
    }

    pub fn with_config(config: Config, connector: impl Connector + 'static) -> Self {
        let retry = RetryStrategy::new(config.max_connect_attempts, config.retry_delay);
        Self::assemble(config, Arc::new(connector), retry)
    }

    /// Connects to a real AMQP broker at `config.url`.
    #[cfg(feature = "amqp")]
    pub fn amqp(config: Config) -> Self {
        Self::with_config(config, crate::broker::AmqpConnector)
    }

    /// Replaces the sleeper used between connection attempts.
    ///
    /// Intended for tests that check retry timing without waiting.
    pub fn with_sleeper(self, sleeper: Arc<dyn Sleeper>) -> Self {
        let retry = RetryStrategy::new(self.config.max_connect_attempts, self.config.retry_delay)
            .with_sleeper(sleeper);
        let connector = self.link.connector();
        Self::assemble(self.config, connector, retry)
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    fn assemble(config: Config, connector: Arc<dyn Connector>, retry: RetryStrategy) -> Self {
        let link = BrokerLink::new(connector, retry);
        let sender = Arc::new(SendSession::new(link.clone(), config.request_timeout));
        Self {
            config,
            link,
            sender,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serves `service` from `"<service_name>_queue"` on the configured broker.
    ///
    /// Resolves once the queue subscription is active. The returned
    /// [`ConnectionConfig`] is what clients pass to [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// * [`TransportError::InvalidArgument`](crate::TransportError::InvalidArgument)
    ///   if the service name cannot form a queue name, before any I/O
    /// * [`TransportError::Connection`](crate::TransportError::Connection) once
    ///   every connection attempt has failed
    /// * [`TransportError::Broker`](crate::TransportError::Broker) if the channel
    ///   or subscription cannot be set up
    pub async fn listen<S: Service>(&self, service: Arc<S>) -> Result<ConnectionConfig> {
        let queue_name = listen::queue_name(service.service_name())?;

        ListenSession::start(&self.link, &self.config.url, service, queue_name.clone()).await?;

        info!(address = %self.config.url, queue = %queue_name, "Service ready");
        Ok(ConnectionConfig {
            address: self.config.url.clone(),
            queue_name,
        })
    }

    /// Sends `payload` to the service at `target` and waits for its reply.
    ///
    /// `payload` must serialize to a JSON object. The first call connects to
    /// `target.address`; calls made meanwhile are queued and go out in order
    /// once the connection is ready.
    ///
    /// # Errors
    ///
    /// * [`TransportError::InvalidArgument`](crate::TransportError::InvalidArgument)
    ///   if `payload` is not a JSON object
    /// * [`TransportError::Connection`](crate::TransportError::Connection) if the
    ///   sender could not connect
    /// * [`TransportError::Remote`](crate::TransportError::Remote) if the service
    ///   replied with an error
    /// * [`TransportError::Timeout`](crate::TransportError::Timeout) if
    ///   `request_timeout` is set and elapses first
    pub async fn send<T, R>(&self, target: &ConnectionConfig, payload: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let result = self.sender.send(target, payload).await?;
        serde_json::from_value(result).map_err(Into::into)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.sender.state().await
    }

    /// Number of sends still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.sender.pending_calls()
    }
}
