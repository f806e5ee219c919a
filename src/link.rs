use crate::broker::{Channel, Connection, Connector};
use crate::error::Result;
use crate::retry::RetryStrategy;
use std::sync::Arc;
use tracing::{debug, info};

/// Opens a broker connection, retrying per [`RetryStrategy`], and a channel
/// on it. Listeners and senders each hold their own link.
#[derive(Clone)]
pub(crate) struct BrokerLink {
    connector: Arc<dyn Connector>,
    retry: RetryStrategy,
}

impl BrokerLink {
    pub(crate) fn new(connector: Arc<dyn Connector>, retry: RetryStrategy) -> Self {
        Self { connector, retry }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub(crate) async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        debug!(url = %url, "Connecting to broker");
        let connection = self.retry.execute(|| self.connector.connect(url)).await?;
        info!(url = %url, "Connected to broker");
        Ok(connection)
    }

    pub(crate) async fn open(&self, url: &str) -> Result<(Arc<dyn Connection>, Arc<dyn Channel>)> {
        let connection = self.connect(url).await?;
        let channel = connection.create_channel().await?;
        Ok((connection, channel))
    }
}
