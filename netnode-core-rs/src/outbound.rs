//! Correlation of requests this node sends
//!
//! Every outgoing CALL opens an exchange keyed by a fresh message id. The
//! matching response resolves it, fixing the runtime and waking whoever
//! waits for the answer.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::exchange::Exchange;
use crate::path::NetworkPath;
use crate::types::{ConnectionHandle, Direction, MessageKind, NodeId, Payload, Response};

struct Pending<K, P> {
    exchange: Exchange<K, P>,
    tx: oneshot::Sender<Response<P>>,
}

type PendingMap<K, P> = Arc<Mutex<HashMap<String, Pending<K, P>>>>;

/// Outstanding outbound requests
pub struct OutboundTracker<K, P> {
    node_id: NodeId,
    pending: PendingMap<K, P>,
}

/// Waiter for the response to one outbound request
pub struct PendingResponse<K, P> {
    message_id: String,
    rx: oneshot::Receiver<Response<P>>,
    pending: PendingMap<K, P>,
}

impl<K: MessageKind, P: Payload> OutboundTracker<K, P> {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open an exchange for a request about to be sent
    pub fn begin(
        &self,
        kind: K,
        direction: Direction,
        connection: ConnectionHandle,
        path: NetworkPath,
        request: P,
    ) -> (String, PendingResponse<K, P>) {
        let message_id = Uuid::new_v4().to_string();
        let exchange = Exchange::begin(
            message_id.clone(),
            kind,
            direction,
            Utc::now(),
            self.node_id.clone(),
            connection,
            path,
            request,
        );
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(message_id.clone(), Pending { exchange, tx });

        let waiter = PendingResponse {
            message_id: message_id.clone(),
            rx,
            pending: self.pending.clone(),
        };
        (message_id, waiter)
    }

    /// Match a response to its request.
    ///
    /// Returns the completed exchange, or `None` for an id nobody waits for
    /// (late answer after a timeout, or a confused peer).
    pub fn resolve(&self, message_id: &str, response: Response<P>) -> Option<Exchange<K, P>> {
        let entry = self.pending.lock().remove(message_id);
        let Pending { mut exchange, tx } = match entry {
            Some(p) => p,
            None => {
                warn!(message_id, "Response for unknown or expired request, ignoring");
                return None;
            }
        };

        match exchange.complete(response.clone()) {
            Ok(runtime) => debug!(
                message_id,
                kind = %exchange.kind,
                runtime_ms = runtime.as_millis() as u64,
                "Outbound request answered"
            ),
            Err(e) => warn!(message_id, error = %e, "Outbound exchange completed twice"),
        }

        // The waiter may have given up already
        let _ = tx.send(response);
        Some(exchange)
    }

    /// Forget a request that never made it onto the wire
    pub fn abandon(&self, message_id: &str) -> bool {
        self.pending.lock().remove(message_id).is_some()
    }

    /// Drop every outstanding request; waiters see `ConnectionClosed`
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), "Failing outstanding outbound requests");
        }
        drained.len()
    }

    /// Drop the requests sent over one connection after it closed
    pub fn fail_connection(&self, connection: ConnectionHandle) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.exchange.connection != connection);
        let failed = before - pending.len();
        if failed > 0 {
            warn!(%connection, count = failed, "Connection closed with outbound requests in flight");
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl<K, P> PendingResponse<K, P> {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Wait for the response, giving up after `timeout` or on cancellation.
    ///
    /// The request is forgotten however the wait ends, including when this
    /// future is dropped before it completes.
    pub async fn wait(mut self, timeout: Duration, cancel: CancellationToken) -> Result<Response<P>, RelayError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            r = tokio::time::timeout(timeout, &mut self.rx) => match r {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(RelayError::ConnectionClosed),
                Err(_) => Err(RelayError::Timeout(timeout)),
            },
        }
    }
}

impl<K, P> Drop for PendingResponse<K, P> {
    fn drop(&mut self) {
        if self.pending.lock().remove(&self.message_id).is_some() {
            debug!(message_id = %self.message_id, "Outbound request abandoned by its waiter");
        }
    }
}
