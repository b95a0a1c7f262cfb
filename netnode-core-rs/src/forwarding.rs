//! Forwarding decision engine
//!
//! When this node relays between a station and the CSMS, each inbound
//! request is first shown to the decision function registered for its
//! `(Direction, kind)`. The function either lets the request pass, rejects
//! it with a synthetic response, or replaces the response. Kinds without a
//! decision function always pass.

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{panic_message, DispatchError, ErrorKind};
use crate::handlers::RequestContext;
use crate::sink::{ErrorReport, ErrorSink};
use crate::types::{Direction, Fault, FaultCode, MessageKind, Payload, Response};

/// Outcome of forwarding policy evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardingDecision<P> {
    /// Pass the request on unchanged
    Forward,
    /// Do not forward; answer with `response`
    Reject { response: Response<P>, reason: String },
    /// Answer with `response` instead of whatever downstream would produce.
    /// `encoded` is an optional pre-encoded wire form sent verbatim.
    Replace {
        response: Response<P>,
        encoded: Option<Vec<u8>>,
        reason: String,
    },
}

impl<P> ForwardingDecision<P> {
    pub fn reject(response: impl Into<Response<P>>, reason: impl Into<String>) -> Self {
        ForwardingDecision::Reject {
            response: response.into(),
            reason: reason.into(),
        }
    }

    pub fn replace(
        response: impl Into<Response<P>>,
        encoded: Option<Vec<u8>>,
        reason: impl Into<String>,
    ) -> Self {
        ForwardingDecision::Replace {
            response: response.into(),
            encoded,
            reason: reason.into(),
        }
    }

    pub fn is_forward(&self) -> bool {
        matches!(self, ForwardingDecision::Forward)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ForwardingDecision::Forward => None,
            ForwardingDecision::Reject { reason, .. } | ForwardingDecision::Replace { reason, .. } => {
                Some(reason)
            }
        }
    }
}

/// Policy function inspecting a request
pub type DecisionFn<K, P> =
    Arc<dyn Fn(RequestContext<K, P>) -> BoxFuture<'static, ForwardingDecision<P>> + Send + Sync>;

/// Wrap an async closure as a `DecisionFn`
pub fn decision_fn<K, P, F, Fut>(f: F) -> DecisionFn<K, P>
where
    K: MessageKind,
    P: Payload,
    F: Fn(RequestContext<K, P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ForwardingDecision<P>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Evaluate `first`; only when it forwards, evaluate `second`.
///
/// Used to put a security policy in front of business policy.
pub fn compose<K: MessageKind, P: Payload>(
    first: DecisionFn<K, P>,
    second: DecisionFn<K, P>,
) -> DecisionFn<K, P> {
    Arc::new(move |ctx: RequestContext<K, P>| {
        let first = first.clone();
        let second = second.clone();
        async move {
            match first(ctx.clone()).await {
                ForwardingDecision::Forward => second(ctx).await,
                decided => decided,
            }
        }
        .boxed()
    })
}

type DecisionTable<K, P> = HashMap<(Direction, K), DecisionFn<K, P>>;

/// At most one decision function per `(Direction, kind)`
pub struct ForwardingEngine<K, P> {
    table: RwLock<Arc<DecisionTable<K, P>>>,
    timeout: Duration,
    sink: Arc<dyn ErrorSink>,
}

impl<K: MessageKind, P: Payload> ForwardingEngine<K, P> {
    pub fn new(timeout: Duration, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            table: RwLock::new(Arc::new(HashMap::new())),
            timeout,
            sink,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register an async closure; returns true when it replaced a function
    pub fn register<F, Fut>(&self, direction: Direction, kind: K, f: F) -> bool
    where
        F: Fn(RequestContext<K, P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ForwardingDecision<P>> + Send + 'static,
    {
        self.register_decision(direction, kind, decision_fn(f)).is_some()
    }

    pub fn register_decision(
        &self,
        direction: Direction,
        kind: K,
        decision: DecisionFn<K, P>,
    ) -> Option<DecisionFn<K, P>> {
        let mut guard = self.table.write();
        let mut table = (**guard).clone();
        let previous = table.insert((direction, kind.clone()), decision);
        *guard = Arc::new(table);
        debug!(kind = %kind, %direction, replaced = previous.is_some(), "Registered forwarding decision");
        previous
    }

    pub fn unregister(&self, direction: Direction, kind: &K) -> Option<DecisionFn<K, P>> {
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
        self.table.read().contains_key(&(direction, kind.clone()))
    }

    /// Evaluate the policy for a request.
    ///
    /// No registered function means `Forward`. A function that does not
    /// answer within the timeout degrades to a `Reject` with a
    /// "Forwarding timeout" fault; a panicking one to an internal error.
    pub async fn decide(&self, ctx: RequestContext<K, P>) -> ForwardingDecision<P> {
        let decision = self.table.read().get(&(ctx.direction, ctx.kind.clone())).cloned();
        let decision = match decision {
            Some(d) => d,
            None => return ForwardingDecision::Forward,
        };

        let kind = ctx.kind.to_string();
        let correlation_id = ctx.correlation_id.clone();

        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| decision(ctx))) {
            Ok(fut) => fut,
            Err(p) => return self.panicked(&kind, &correlation_id, panic_message(p.as_ref())),
        };

        match tokio::time::timeout(self.timeout, AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(decided)) => {
                if let Some(reason) = decided.reason() {
                    info!(kind = %kind, correlation_id = %correlation_id, reason, "Forwarding policy intercepted request");
                }
                decided
            }
            Ok(Err(p)) => self.panicked(&kind, &correlation_id, panic_message(p.as_ref())),
            Err(_) => {
                let err = DispatchError::ForwardingTimeout(self.timeout);
                self.sink.report(
                    ErrorReport::new(ErrorKind::ForwardingTimeout, kind, err.to_string())
                        .with_correlation_id(correlation_id),
                );
                ForwardingDecision::reject(err.to_fault(), "forwarding timeout")
            }
        }
    }

    fn panicked(&self, kind: &str, correlation_id: &str, detail: String) -> ForwardingDecision<P> {
        self.sink.report(
            ErrorReport::new(
                ErrorKind::HandlerFailure,
                kind,
                format!("forwarding decision panicked: {}", detail),
            )
            .with_correlation_id(correlation_id),
        );
        ForwardingDecision::reject(
            Fault::new(FaultCode::InternalError, "Forwarding decision failed"),
            "forwarding decision failed",
        )
    }
}
