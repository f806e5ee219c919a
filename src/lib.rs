//! # AMQP RPC Transport
//!
//! Request/reply messaging over a broker-backed queue.
//!
//! A *listener* consumes `"<service>_queue"`, hands each request to a
//! [`Service`] and publishes the service's reply to the queue named in the
//! request's `reply_to` header. A *sender* opens one connection and one
//! private reply queue per transport, multiplexes concurrent calls over them,
//! and matches each reply to its call by the envelope `id`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use amqp_rpc_transport::broker::MemoryBroker;
//! use amqp_rpc_transport::{Request, Responder, RpcTransport, ServiceFn};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!
//!     // Serve "echo" from echo_queue
//!     let server = RpcTransport::new(broker.clone());
//!     let service = ServiceFn::new("echo", |message: Request, responder: Responder| {
//!         let a = message.get("a").and_then(Value::as_i64).unwrap_or_default();
//!         responder.ok(json!({ "result": a * 2 }));
//!     });
//!     let target = server.listen(Arc::new(service)).await?;
//!
//!     // Call it
//!     let client = RpcTransport::new(broker);
//!     let reply: Value = client.send(&target, &json!({ "a": 21 })).await?;
//!     println!("{}", reply["result"]);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Connection retry** - Up to 15 attempts with a linearly growing delay
//! - **Single-flight connect** - Concurrent first calls share one connection
//! - **Ordered drain** - Calls queued while connecting go out in submission order
//! - **Backpressure** - Listeners hold one unacknowledged delivery at a time
//! - **Pluggable brokers** - [`broker::MemoryBroker`] in-process, `lapin` behind the `amqp` feature
//!
//! ## Configuration
//!
//! ```no_run
//! use amqp_rpc_transport::broker::MemoryBroker;
//! use amqp_rpc_transport::RpcTransport;
//! use std::time::Duration;
//!
//! let transport = RpcTransport::with_config(
//!     RpcTransport::builder()
//!         .url("amqp://rabbitmq-server:5672")
//!         .max_connect_attempts(5)
//!         .retry_delay(Duration::from_millis(200))
//!         .request_timeout(Duration::from_secs(10))
//!         .build(),
//!     MemoryBroker::new(),
//! );
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod listen;
pub mod message;
pub mod retry;
pub mod transport;

mod link;
mod pending;
mod send;

pub use config::{Config, ConfigBuilder};
pub use error::{BrokerError, Result, TransportError};
pub use listen::{queue_name, ConnectionConfig, Responder, Service, ServiceFn};
pub use message::{Reply, Request};
pub use retry::{RetryStrategy, Sleeper, TokioSleeper};
pub use send::ConnectionState;
pub use transport::RpcTransport;
