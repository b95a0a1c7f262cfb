//! Per-message-kind event bus
//!
//! Subscribers register for a `(kind, phase)` pair. `publish` invokes every
//! subscriber of the pair concurrently and waits for all of them. A failing,
//! panicking or stuck subscriber is reported to the error sink and never
//! affects its siblings or the caller. Each call is bounded by the bus's
//! subscriber timeout.

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{panic_message, ErrorKind};
use crate::exchange::Exchange;
use crate::path::NetworkPath;
use crate::sink::{ErrorReport, ErrorSink};
use crate::types::{BoxError, ConnectionHandle, Direction, MessageKind, NodeId, Payload, Response};

/// Point in an exchange's life an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventPhase {
    RequestObserved,
    ResponseObserved,
}

/// Notification handed to subscribers
#[derive(Debug, Clone)]
pub struct ExchangeEvent<K, P> {
    pub phase: EventPhase,
    pub kind: K,
    pub direction: Direction,
    pub correlation_id: String,
    pub observed_at: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionHandle,
    pub network_path: NetworkPath,
    pub request: P,
    pub response: Option<Response<P>>,
    pub runtime: Option<Duration>,
}

impl<K: MessageKind, P: Payload> ExchangeEvent<K, P> {
    pub fn request_observed(exchange: &Exchange<K, P>) -> Self {
        Self::from_exchange(EventPhase::RequestObserved, exchange)
    }

    pub fn response_observed(exchange: &Exchange<K, P>) -> Self {
        Self::from_exchange(EventPhase::ResponseObserved, exchange)
    }

    fn from_exchange(phase: EventPhase, exchange: &Exchange<K, P>) -> Self {
        let (response, runtime) = match phase {
            EventPhase::RequestObserved => (None, None),
            EventPhase::ResponseObserved => (exchange.response().cloned(), exchange.runtime()),
        };

        Self {
            phase,
            kind: exchange.kind.clone(),
            direction: exchange.direction,
            correlation_id: exchange.correlation_id.clone(),
            observed_at: Utc::now(),
            sender: exchange.sender.clone(),
            connection: exchange.connection,
            network_path: exchange.network_path.clone(),
            request: exchange.request.clone(),
            response,
            runtime,
        }
    }
}

/// Subscriber callback
pub type Subscriber<K, P> =
    Arc<dyn Fn(Arc<ExchangeEvent<K, P>>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Result of one `publish`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub invoked: usize,
    pub failed: usize,
}

type SubscriberTable<K, P> = HashMap<(K, EventPhase), Arc<[Subscriber<K, P>]>>;

/// Multicast of exchange events to independently failing subscribers
pub struct EventBus<K, P> {
    subscribers: RwLock<SubscriberTable<K, P>>,
    sink: Arc<dyn ErrorSink>,
    subscriber_timeout: Duration,
}

/// Default bound on a single subscriber call
pub const DEFAULT_SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(5);

impl<K: MessageKind, P: Payload> EventBus<K, P> {
    pub fn new(sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            sink,
            subscriber_timeout: DEFAULT_SUBSCRIBER_TIMEOUT,
        }
    }

    pub fn with_subscriber_timeout(mut self, timeout: Duration) -> Self {
        self.subscriber_timeout = timeout;
        self
    }

    pub fn subscriber_timeout(&self) -> Duration {
        self.subscriber_timeout
    }

    /// Register a subscriber for `(kind, phase)`; registration order is kept
    pub fn subscribe<F, Fut>(&self, kind: K, phase: EventPhase, subscriber: F)
    where
        F: Fn(Arc<ExchangeEvent<K, P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let subscriber: Subscriber<K, P> = Arc::new(move |event| subscriber(event).boxed());

        let mut table = self.subscribers.write();
        let key = (kind, phase);
        let mut set: Vec<Subscriber<K, P>> = table
            .get(&key)
            .map(|existing| existing.to_vec())
            .unwrap_or_default();
        set.push(subscriber);

        debug!(kind = %key.0, phase = ?key.1, count = set.len(), "Subscriber registered");
        table.insert(key, set.into());
    }

    pub fn subscriber_count(&self, kind: &K, phase: EventPhase) -> usize {
        self.subscribers
            .read()
            .get(&(kind.clone(), phase))
            .map_or(0, |set| set.len())
    }

    /// Invoke every subscriber of the event's `(kind, phase)` and wait for all
    pub async fn publish(&self, event: ExchangeEvent<K, P>) -> PublishOutcome {
        self.publish_until(event, &CancellationToken::new()).await
    }

    /// Like `publish`, but subscribers still running when `cancel` fires are
    /// abandoned and reported as failed.
    pub async fn publish_until(
        &self,
        event: ExchangeEvent<K, P>,
        cancel: &CancellationToken,
    ) -> PublishOutcome {
        // Snapshot so registrations during publish never affect this call
        let snapshot = self
            .subscribers
            .read()
            .get(&(event.kind.clone(), event.phase))
            .cloned();

        let subscribers = match snapshot {
            Some(set) if !set.is_empty() => set,
            _ => return PublishOutcome::default(),
        };

        let event = Arc::new(event);
        let limit = self.subscriber_timeout;
        let calls = subscribers.iter().map(|subscriber| {
            let event = event.clone();
            let subscriber = subscriber.clone();
            async move {
                // The callback itself may panic before yielding a future
                let fut = std::panic::catch_unwind(AssertUnwindSafe(|| subscriber(event)))
                    .map_err(|p| panic_message(p.as_ref()))?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err("abandoned: exchange cancelled".to_string()),
                    r = tokio::time::timeout(limit, AssertUnwindSafe(fut).catch_unwind()) => match r {
                        Ok(Ok(Ok(()))) => Ok(()),
                        Ok(Ok(Err(e))) => Err(e.to_string()),
                        Ok(Err(p)) => Err(format!("panicked: {}", panic_message(p.as_ref()))),
                        Err(_) => Err(format!("timed out after {:?}", limit)),
                    },
                }
            }
        });

        let results: Vec<Result<(), String>> = join_all(calls).await;

        let mut outcome = PublishOutcome {
            invoked: results.len(),
            failed: 0,
        };
        for (index, result) in results.into_iter().enumerate() {
            if let Err(detail) = result {
                outcome.failed += 1;
                self.sink.report(
                    ErrorReport::new(
                        ErrorKind::SubscriberFailure,
                        event.kind.to_string(),
                        format!("subscriber #{} failed: {}", index, detail),
                    )
                    .with_phase(event.phase)
                    .with_correlation_id(event.correlation_id.clone()),
                );
            }
        }

        outcome
    }
}
