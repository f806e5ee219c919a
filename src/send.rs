use crate::broker::{Channel, Connection, ConsumeOptions, Deliveries, Properties, QueueOptions};
use crate::error::{Result, TransportError};
use crate::link::BrokerLink;
use crate::listen::ConnectionConfig;
use crate::message::{Reply, Request};
use crate::pending::PendingCalls;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Observable phase of the sender's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    /// The private reply consumer ended. Sends fail with
    /// [`TransportError::ConnectionClosed`] from here on.
    Closed,
}

/// A request waiting to be published, with the queue it is addressed to.
struct Outbound {
    queue_name: String,
    request: Request,
}

/// Channel plus private reply queue, shared by every send once connected.
#[derive(Clone)]
struct ReplyLink {
    _connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    reply_queue: String,
}

impl ReplyLink {
    async fn publish(&self, outbound: &Outbound) -> Result<()> {
        let body = serde_json::to_vec(&outbound.request)?;
        let properties = Properties {
            correlation_id: Some(Uuid::now_v7().to_string()),
            reply_to: Some(self.reply_queue.clone()),
        };

        debug!(
            queue = %outbound.queue_name,
            id = %outbound.request.id,
            "Publishing request"
        );
        self.channel
            .publish(&outbound.queue_name, body, properties)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
enum SessionState {
    #[default]
    Unconnected,
    Connecting(VecDeque<Outbound>),
    Connected(ReplyLink),
    Closed,
}

/// Client half of the transport.
///
/// The first `send` starts the only connect sequence this session will run.
/// Sends arriving while it is in flight are queued and published in
/// submission order once the reply consumer is active. After that every send
/// goes straight out on the same channel and reply queue. If the reply
/// consumer ends, the session is closed for good and is never reopened.
pub(crate) struct SendSession {
    link: BrokerLink,
    pending: Arc<PendingCalls>,
    state: Mutex<SessionState>,
    request_timeout: Option<Duration>,
}

impl SendSession {
    pub(crate) fn new(link: BrokerLink, request_timeout: Option<Duration>) -> Self {
        Self {
            link,
            pending: Arc::new(PendingCalls::new()),
            state: Mutex::new(SessionState::Unconnected),
            request_timeout,
        }
    }

    pub(crate) async fn state(&self) -> ConnectionState {
        match &*self.state.lock().await {
            SessionState::Unconnected => ConnectionState::Unconnected,
            SessionState::Connecting(_) => ConnectionState::Connecting,
            SessionState::Connected(_) => ConnectionState::Connected,
            SessionState::Closed => ConnectionState::Closed,
        }
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub(crate) async fn send(
        self: &Arc<Self>,
        target: &ConnectionConfig,
        payload: Value,
    ) -> Result<Value> {
        let (request, reply) = self.pending.create_message(payload)?;
        let outbound = Outbound {
            queue_name: target.queue_name.clone(),
            request,
        };

        let ready = {
            let mut state = self.state.lock().await;
            match std::mem::take(&mut *state) {
                SessionState::Connected(link) => {
                    *state = SessionState::Connected(link.clone());
                    Some((link, outbound))
                }
                SessionState::Connecting(mut queued) => {
                    debug!(
                        id = %outbound.request.id,
                        "Connection in progress, queueing request"
                    );
                    queued.push_back(outbound);
                    *state = SessionState::Connecting(queued);
                    None
                }
                SessionState::Unconnected => {
                    *state = SessionState::Connecting(VecDeque::from([outbound]));
                    tokio::spawn(Arc::clone(self).establish(target.address.clone()));
                    None
                }
                SessionState::Closed => {
                    *state = SessionState::Closed;
                    return Err(TransportError::ConnectionClosed);
                }
            }
        };

        if let Some((link, outbound)) = ready {
            link.publish(&outbound).await?;
        }

        reply.wait(self.request_timeout).await
    }

    /// Runs the connect sequence, then drains the queue in FIFO order. The
    /// state lock is held while draining so later sends publish after it.
    /// Requests whose caller stopped waiting are dropped, not published.
    async fn establish(self: Arc<Self>, address: String) {
        match self.open_reply_link(&address).await {
            Ok(link) => {
                let mut state = self.state.lock().await;
                let queued = match std::mem::take(&mut *state) {
                    SessionState::Connecting(queued) => queued,
                    SessionState::Closed => {
                        // The reply consumer ended before the drain began.
                        *state = SessionState::Closed;
                        warn!(address = %address, "Reply consumer closed while connecting");
                        return;
                    }
                    _ => VecDeque::new(),
                };
                *state = SessionState::Connected(link.clone());

                info!(
                    address = %address,
                    reply_queue = %link.reply_queue,
                    queued = queued.len(),
                    "Sender connected"
                );
                for outbound in queued {
                    if !self.pending.contains(&outbound.request.id) {
                        debug!(
                            id = %outbound.request.id,
                            "Caller gave up, skipping queued request"
                        );
                        continue;
                    }
                    if let Err(e) = link.publish(&outbound).await {
                        warn!(
                            id = %outbound.request.id,
                            error = %e,
                            "Failed to publish queued request"
                        );
                        self.pending.fail(&outbound.request.id, e);
                    }
                }
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                let queued = match std::mem::take(&mut *state) {
                    SessionState::Connecting(queued) => queued,
                    _ => VecDeque::new(),
                };

                warn!(
                    address = %address,
                    error = %e,
                    queued = queued.len(),
                    "Sender failed to connect, failing queued requests"
                );
                for outbound in queued {
                    self.pending.fail(&outbound.request.id, e.clone());
                }
            }
        }
    }

    async fn open_reply_link(self: &Arc<Self>, address: &str) -> Result<ReplyLink> {
        let (connection, channel) = self.link.open(address).await?;
        let reply_queue = channel
            .declare_queue("", QueueOptions::exclusive())
            .await?;
        let deliveries = channel
            .consume(&reply_queue, ConsumeOptions { no_ack: true })
            .await?;

        tokio::spawn(route_replies(
            Arc::downgrade(self),
            Arc::clone(&self.pending),
            deliveries,
        ));

        Ok(ReplyLink {
            _connection: connection,
            channel,
            reply_queue,
        })
    }
}

/// Resolves pending calls from the private reply queue, keyed by envelope id.
///
/// When the stream ends the session is marked closed before outstanding calls
/// are failed. Every send that saw `Connected` registered its call first, so
/// none is left waiting on the dead queue.
async fn route_replies(
    session: Weak<SendSession>,
    pending: Arc<PendingCalls>,
    mut deliveries: Deliveries,
) {
    while let Some(delivery) = deliveries.recv().await {
        let reply: Reply = match serde_json::from_slice(&delivery.body) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Discarding undecodable reply");
                continue;
            }
        };

        let id = reply.id.clone();
        if !pending.resolve(&id, reply.into_result()) {
            debug!(id = %id, "Reply for unknown or abandoned call");
        }
    }

    if let Some(session) = session.upgrade() {
        *session.state.lock().await = SessionState::Closed;
    }
    let failed = pending.fail_all(TransportError::ConnectionClosed);
    warn!(failed, "Reply consumer closed");
}
