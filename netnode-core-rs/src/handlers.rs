//! Handler registry
//!
//! Maps `(Direction, kind)` to at most one business-logic handler. A second
//! registration for the same key replaces the first, which keeps test
//! doubles easy to swap in. The table is copy-on-write: readers take a
//! snapshot and never observe a half-updated map.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{panic_message, DispatchError, HandlerError};
use crate::exchange::Exchange;
use crate::path::NetworkPath;
use crate::types::{ConnectionHandle, Direction, MessageKind, NodeId, Payload, Response};

/// Everything a handler or decision function gets to see about a request
#[derive(Debug, Clone)]
pub struct RequestContext<K, P> {
    pub correlation_id: String,
    pub kind: K,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionHandle,
    pub network_path: NetworkPath,
    pub request: P,
    /// Cancelled when the originating connection goes away
    pub cancel: CancellationToken,
}

impl<K: MessageKind, P: Payload> RequestContext<K, P> {
    pub fn from_exchange(exchange: &Exchange<K, P>, cancel: CancellationToken) -> Self {
        Self {
            correlation_id: exchange.correlation_id.clone(),
            kind: exchange.kind.clone(),
            direction: exchange.direction,
            timestamp: exchange.timestamp,
            sender: exchange.sender.clone(),
            connection: exchange.connection,
            network_path: exchange.network_path.clone(),
            request: exchange.request.clone(),
            cancel,
        }
    }
}

/// Business-logic handler turning a request into a response
pub type Handler<K, P> = Arc<
    dyn Fn(RequestContext<K, P>) -> BoxFuture<'static, Result<Response<P>, HandlerError>>
        + Send
        + Sync,
>;

type HandlerTable<K, P> = HashMap<(Direction, K), Handler<K, P>>;

/// Wrap an async closure as a `Handler`
pub fn handler_fn<K, P, F, Fut>(f: F) -> Handler<K, P>
where
    K: MessageKind,
    P: Payload,
    F: Fn(RequestContext<K, P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<P>, HandlerError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// At most one handler per `(Direction, kind)`
pub struct HandlerRegistry<K, P> {
    table: RwLock<Arc<HandlerTable<K, P>>>,
}

impl<K: MessageKind, P: Payload> Default for HandlerRegistry<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: MessageKind, P: Payload> HandlerRegistry<K, P> {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Register an async closure; returns true when it replaced a handler
    pub fn register<F, Fut>(&self, direction: Direction, kind: K, f: F) -> bool
    where
        F: Fn(RequestContext<K, P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<P>, HandlerError>> + Send + 'static,
    {
        self.register_handler(direction, kind, handler_fn(f)).is_some()
    }

    /// Register a prepared handler, returning the one it replaced
    pub fn register_handler(
        &self,
        direction: Direction,
        kind: K,
        handler: Handler<K, P>,
    ) -> Option<Handler<K, P>> {
        let mut guard = self.table.write();
        let mut table = (**guard).clone();
        let previous = table.insert((direction, kind.clone()), handler);
        *guard = Arc::new(table);

        if previous.is_some() {
            debug!(kind = %kind, %direction, "Replaced existing handler");
        } else {
            debug!(kind = %kind, %direction, "Registered handler");
        }
        previous
    }

    pub fn unregister(&self, direction: Direction, kind: &K) -> Option<Handler<K, P>> {
        let mut guard = self.table.write();
        if !guard.contains_key(&(direction, kind.clone())) {
            return None;
        }
        let mut table = (**guard).clone();
        let removed = table.remove(&(direction, kind.clone()));
        *guard = Arc::new(table);
        removed
    }

    pub fn contains(&self, direction: Direction, kind: &K) -> bool {
        self.snapshot().contains_key(&(direction, kind.clone()))
    }

    /// Kinds with a handler in one direction's table
    pub fn kinds(&self, direction: Direction) -> Vec<K> {
        self.snapshot()
            .keys()
            .filter(|(d, _)| *d == direction)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn lookup(&self, direction: Direction, kind: &K) -> Option<Handler<K, P>> {
        self.snapshot().get(&(direction, kind.clone())).cloned()
    }

    /// Run the handler registered for the context's direction and kind.
    ///
    /// Panics inside the handler are caught and reported as handler failures.
    pub async fn invoke(&self, ctx: RequestContext<K, P>) -> Result<Response<P>, DispatchError> {
        let handler = self.lookup(ctx.direction, &ctx.kind).ok_or_else(|| {
            DispatchError::UnhandledMessageKind {
                kind: ctx.kind.to_string(),
                direction: ctx.direction,
            }
        })?;

        let fut = std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))).map_err(|p| {
            DispatchError::HandlerFailure(format!("handler panicked: {}", panic_message(p.as_ref())))
        })?;

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result.map_err(DispatchError::from),
            Err(p) => Err(DispatchError::HandlerFailure(format!(
                "handler panicked: {}",
                panic_message(p.as_ref())
            ))),
        }
    }

    fn snapshot(&self) -> Arc<HandlerTable<K, P>> {
        self.table.read().clone()
    }
}
