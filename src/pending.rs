use crate::error::{Result, TransportError};
use crate::message::Request;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

type Completion = oneshot::Sender<Result<Value>>;

/// Outstanding calls keyed by envelope id.
///
/// Each entry is completed at most once: by a matching reply, by an explicit
/// failure, or by its [`PendingReply`] being dropped.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, Completion>>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<String, Completion>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assigns a fresh id to `payload` and registers a completion for it.
    pub(crate) fn create_message(
        self: &Arc<Self>,
        payload: Value,
    ) -> Result<(Request, PendingReply)> {
        let id = Uuid::now_v7().to_string();
        let request = Request::new(id.clone(), payload)?;

        let (tx, rx) = oneshot::channel();
        self.calls().insert(id.clone(), tx);

        Ok((
            request,
            PendingReply {
                id,
                rx,
                table: Arc::clone(self),
            },
        ))
    }

    /// Completes the call registered under `id`. Returns `false` when no such
    /// call is outstanding.
    pub(crate) fn resolve(&self, id: &str, outcome: Result<Value>) -> bool {
        match self.calls().remove(id) {
            // The caller may have stopped waiting; that is not an error here.
            Some(completion) => {
                let _ = completion.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail(&self, id: &str, error: TransportError) -> bool {
        self.resolve(id, Err(error))
    }

    pub(crate) fn fail_all(&self, error: TransportError) -> usize {
        let drained: Vec<Completion> = self.calls().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for completion in drained {
            let _ = completion.send(Err(error.clone()));
        }
        count
    }

    /// Whether a caller is still waiting on `id`.
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.calls().contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.calls().len()
    }

    fn forget(&self, id: &str) {
        self.calls().remove(id);
    }
}

/// Caller-side half of a pending call.
pub(crate) struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Result<Value>>,
    table: Arc<PendingCalls>,
}

impl PendingReply {
    pub(crate) async fn wait(mut self, limit: Option<Duration>) -> Result<Value> {
        let outcome = match limit {
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(TransportError::Timeout(limit.as_millis() as u64)),
            },
            None => (&mut self.rx).await,
        };

        outcome.map_err(|_| TransportError::ConnectionClosed)?
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.forget(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_completes_matching_call() {
        let table = Arc::new(PendingCalls::new());
        let (request, reply) = table.create_message(json!({ "a": 1 })).unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.resolve(&request.id, Ok(json!({ "result": "ok" }))));
        assert_eq!(table.len(), 0);

        let value = reply.wait(None).await.unwrap();
        assert_eq!(value, json!({ "result": "ok" }));
    }

    #[tokio::test]
    async fn test_resolve_is_exactly_once() {
        let table = Arc::new(PendingCalls::new());
        let (request, _reply) = table.create_message(json!({})).unwrap();

        assert!(table.resolve(&request.id, Ok(json!(1))));
        assert!(!table.resolve(&request.id, Ok(json!(2))));
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let table = Arc::new(PendingCalls::new());
        assert!(!table.resolve("nope", Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let table = Arc::new(PendingCalls::new());
        let (first, _a) = table.create_message(json!({})).unwrap();
        let (second, _b) = table.create_message(json!({})).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_all_reaches_every_caller() {
        let table = Arc::new(PendingCalls::new());
        let replies: Vec<PendingReply> = (0..3)
            .map(|_| table.create_message(json!({})).unwrap().1)
            .collect();

        let error = TransportError::Connection {
            attempts: 15,
            source: BrokerError::ConnectionRefused("down".to_string()),
        };
        assert_eq!(table.fail_all(error), 3);
        assert_eq!(table.len(), 0);

        for reply in replies {
            assert!(matches!(
                reply.wait(None).await,
                Err(TransportError::Connection { attempts: 15, .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let table = Arc::new(PendingCalls::new());
        let (_request, reply) = table.create_message(json!({})).unwrap();

        let result = reply.wait(Some(Duration::from_millis(10))).await;

        assert!(matches!(result, Err(TransportError::Timeout(10))));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_dropping_reply_removes_entry() {
        let table = Arc::new(PendingCalls::new());
        let (request, reply) = table.create_message(json!({})).unwrap();

        assert!(table.contains(&request.id));
        drop(reply);

        assert!(!table.contains(&request.id));
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(&request.id, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_invalid_payload_registers_nothing() {
        let table = Arc::new(PendingCalls::new());

        let result = table.create_message(json!("not an object"));

        assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
        assert_eq!(table.len(), 0);
    }
}
