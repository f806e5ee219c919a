use std::sync::Arc;
use thiserror::Error;

/// Failures reported by a broker backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection error after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Timeout error after {0}ms")]
    Timeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Connection closed before a reply arrived")]
    ConnectionClosed,
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(Arc::new(err))
    }
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Broker(_)
                | TransportError::Timeout(_)
                | TransportError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
