//! Dispatch orchestrator
//!
//! Drives one exchange end to end: open the exchange, publish
//! RequestObserved, consult the forwarding engine when this node is an
//! intermediary for the request's direction, invoke the local handler when
//! the decision is `Forward`, complete the exchange and publish
//! ResponseObserved. Every failure between those steps becomes a synthetic
//! `Fault` response and an error report; nothing escapes to the transport.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::{DecodeError, DispatchError, ErrorKind, ExchangeError};
use crate::events::{EventBus, ExchangeEvent};
use crate::exchange::Exchange;
use crate::forwarding::{ForwardingDecision, ForwardingEngine};
use crate::handlers::{HandlerRegistry, RequestContext};
use crate::path::NetworkPath;
use crate::sink::{ErrorReport, ErrorSink};
use crate::stats::{DispatchStats, StatsSnapshot};
use crate::types::{ConnectionHandle, Direction, Fault, MessageKind, NodeId, Payload, Response};

/// A decoded request as delivered by the transport
#[derive(Debug, Clone)]
pub struct InboundRequest<K, P> {
    pub correlation_id: String,
    pub kind: K,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionHandle,
    pub network_path: NetworkPath,
    pub request: P,
}

impl<K, P> InboundRequest<K, P> {
    /// Request received now
    pub fn new(
        correlation_id: impl Into<String>,
        kind: K,
        direction: Direction,
        sender: impl Into<NodeId>,
        connection: ConnectionHandle,
        network_path: NetworkPath,
        request: P,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind,
            direction,
            timestamp: Utc::now(),
            sender: sender.into(),
            connection,
            network_path,
            request,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// How the response of an exchange came about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The local handler answered
    Handled,
    /// A forwarding decision rejected the request
    Rejected,
    /// A forwarding decision replaced the response
    Replaced,
    /// Handling failed; the response is a synthetic fault
    Failed(ErrorKind),
}

/// Result of one `dispatch`
#[derive(Debug)]
pub struct Dispatched<K, P> {
    pub response: Response<P>,
    /// Pre-encoded wire form to send instead of encoding `response`
    pub encoded_override: Option<Vec<u8>>,
    pub outcome: Outcome,
    /// The completed exchange
    pub exchange: Exchange<K, P>,
}

struct Resolution<P> {
    response: Response<P>,
    encoded: Option<Vec<u8>>,
    outcome: Outcome,
}

/// Per-node dispatch pipeline
///
/// Cheap to clone; clones share registries, sink and counters. Separate
/// `Dispatcher::new` calls share nothing, so several nodes can live in one
/// process.
pub struct Dispatcher<K, P> {
    config: Arc<DispatchConfig>,
    handlers: Arc<HandlerRegistry<K, P>>,
    forwarding: Arc<ForwardingEngine<K, P>>,
    events: Arc<EventBus<K, P>>,
    sink: Arc<dyn ErrorSink>,
    stats: Arc<DispatchStats>,
}

impl<K, P> Clone for Dispatcher<K, P> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            forwarding: self.forwarding.clone(),
            events: self.events.clone(),
            sink: self.sink.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<K: MessageKind, P: Payload> Dispatcher<K, P> {
    pub fn new(config: DispatchConfig, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            handlers: Arc::new(HandlerRegistry::new()),
            forwarding: Arc::new(ForwardingEngine::new(config.decide_timeout, sink.clone())),
            events: Arc::new(
                EventBus::new(sink.clone()).with_subscriber_timeout(config.subscriber_timeout),
            ),
            config: Arc::new(config),
            sink,
            stats: Arc::new(DispatchStats::new()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry<K, P> {
        &self.handlers
    }

    pub fn forwarding(&self) -> &ForwardingEngine<K, P> {
        &self.forwarding
    }

    pub fn events(&self) -> &EventBus<K, P> {
        &self.events
    }

    pub fn sink(&self) -> Arc<dyn ErrorSink> {
        self.sink.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Drive one inbound request to its response
    pub async fn dispatch(
        &self,
        inbound: InboundRequest<K, P>,
        cancel: CancellationToken,
    ) -> Dispatched<K, P> {
        let mut exchange = Exchange::begin(
            inbound.correlation_id,
            inbound.kind,
            inbound.direction,
            inbound.timestamp,
            inbound.sender,
            inbound.connection,
            inbound.network_path,
            inbound.request,
        );

        debug!(
            kind = %exchange.kind,
            direction = %exchange.direction,
            correlation_id = %exchange.correlation_id,
            sender = %exchange.sender,
            path = %exchange.network_path,
            "Dispatching request"
        );

        let observed = ExchangeEvent::request_observed(&exchange);
        let ctx = RequestContext::from_exchange(&exchange, cancel.clone());

        // RequestObserved runs alongside decision/handling; join! finishes
        // both before the exchange completes. Subscribers still running on
        // cancellation are abandoned.
        let (published, resolution) = tokio::join!(
            self.events.publish_until(observed, &cancel),
            self.resolve(ctx, &cancel)
        );
        self.stats.record_subscriber_failures(published.failed);

        match resolution.outcome {
            Outcome::Handled => self.stats.record_handled(),
            Outcome::Rejected => self.stats.record_rejected(),
            Outcome::Replaced => self.stats.record_replaced(),
            Outcome::Failed(_) => self.stats.record_failed(),
        }

        // A freshly opened exchange cannot already be complete; the error
        // path is reported inside `complete`.
        let _ = self.complete(&mut exchange, resolution.response.clone()).await;

        info!(
            kind = %exchange.kind,
            correlation_id = %exchange.correlation_id,
            outcome = ?resolution.outcome,
            runtime_ms = exchange.runtime().map(|d| d.as_millis() as u64).unwrap_or(0),
            "Exchange complete"
        );

        Dispatched {
            response: resolution.response,
            encoded_override: resolution.encoded,
            outcome: resolution.outcome,
            exchange,
        }
    }

    /// Complete an exchange and publish ResponseObserved.
    ///
    /// A second completion is a defect: it is reported, nothing is
    /// published, and with `strict_defects` the call panics.
    pub async fn complete(
        &self,
        exchange: &mut Exchange<K, P>,
        response: Response<P>,
    ) -> Result<Duration, ExchangeError> {
        match exchange.complete(response) {
            Ok(runtime) => {
                let published = self
                    .events
                    .publish(ExchangeEvent::response_observed(exchange))
                    .await;
                self.stats.record_subscriber_failures(published.failed);
                Ok(runtime)
            }
            Err(err) => {
                self.sink.report(
                    ErrorReport::new(ErrorKind::AlreadyCompleted, exchange.kind.to_string(), err.to_string())
                        .with_correlation_id(exchange.correlation_id.clone()),
                );
                if self.config.strict_defects {
                    panic!("exchange defect: {}", err);
                }
                Err(err)
            }
        }
    }

    /// Report a frame that could not be decoded and build the fault sent back
    pub fn decode_failure(
        &self,
        kind: &str,
        correlation_id: Option<&str>,
        sender: &str,
        err: DecodeError,
    ) -> Fault {
        self.stats.record_decode_failure();
        let mut report = ErrorReport::new(ErrorKind::Decode, kind, format!("from {}: {}", sender, err));
        if let Some(id) = correlation_id {
            report = report.with_correlation_id(id);
        }
        self.sink.report(report);
        DispatchError::Decode(err).to_fault()
    }

    async fn resolve(&self, ctx: RequestContext<K, P>, cancel: &CancellationToken) -> Resolution<P> {
        let kind = ctx.kind.to_string();
        let correlation_id = ctx.correlation_id.clone();

        if self.config.intermediary.applies_to(ctx.direction) {
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.failed(DispatchError::Cancelled, &kind, &correlation_id);
                }
                decided = self.forwarding.decide(ctx.clone()) => decided,
            };

            match decision {
                ForwardingDecision::Forward => {}
                ForwardingDecision::Reject { response, reason } => {
                    info!(kind = %kind, correlation_id = %correlation_id, %reason, "Request rejected");
                    return Resolution {
                        response,
                        encoded: None,
                        outcome: Outcome::Rejected,
                    };
                }
                ForwardingDecision::Replace { response, encoded, reason } => {
                    info!(kind = %kind, correlation_id = %correlation_id, %reason, "Response replaced");
                    return Resolution {
                        response,
                        encoded,
                        outcome: Outcome::Replaced,
                    };
                }
            }
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            r = bounded(self.config.handler_timeout, self.handlers.invoke(ctx)) => r,
        };

        match result {
            Ok(response) => Resolution {
                response,
                encoded: None,
                outcome: Outcome::Handled,
            },
            Err(err) => self.failed(err, &kind, &correlation_id),
        }
    }

    fn failed(&self, err: DispatchError, kind: &str, correlation_id: &str) -> Resolution<P> {
        if err.kind() == ErrorKind::Decode {
            self.stats.record_decode_failure();
        }
        warn!(kind, correlation_id, error = %err, "Request failed, answering with synthetic fault");
        self.sink.report(
            ErrorReport::new(err.kind(), kind, err.to_string()).with_correlation_id(correlation_id),
        );
        Resolution {
            response: Response::Error(err.to_fault()),
            encoded: None,
            outcome: Outcome::Failed(err.kind()),
        }
    }
}

async fn bounded<P, F>(timeout: Option<Duration>, fut: F) -> Result<Response<P>, DispatchError>
where
    F: Future<Output = Result<Response<P>, DispatchError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(DispatchError::HandlerTimeout(limit))),
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::events::EventPhase;
    use crate::sink::MemoryErrorSink;
    use crate::types::FaultCode;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestDispatcher = Dispatcher<&'static str, String>;

    fn setup() -> (TestDispatcher, Arc<MemoryErrorSink>) {
        let sink = Arc::new(MemoryErrorSink::new());
        let config = DispatchConfig::new("nn-1")
            .with_decide_timeout(Duration::from_millis(100))
            .with_handler_timeout(Some(Duration::from_millis(100)))
            .with_strict_defects(false);
        (Dispatcher::new(config, sink.clone()), sink)
    }

    fn inbound(kind: &'static str, request: &str) -> InboundRequest<&'static str, String> {
        InboundRequest::new(
            "msg-1",
            kind,
            Direction::SystemToDevice,
            "CSMS",
            ConnectionHandle::new(7),
            NetworkPath::from_source("CSMS"),
            request.to_string(),
        )
    }

    fn spy(dispatcher: &TestDispatcher, kind: &'static str) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher.handlers().register(Direction::SystemToDevice, kind, move |ctx: RequestContext<_, String>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, HandlerError>(Response::Result(format!("handled {}", ctx.request))) }
        });
        calls
    }

    #[tokio::test]
    async fn test_dispatch_returns_handler_response() {
        let (dispatcher, sink) = setup();
        let calls = spy(&dispatcher, "Reset");

        let before = Utc::now();
        let done = dispatcher.dispatch(inbound("Reset", "now"), CancellationToken::new()).await;

        assert_eq!(done.response, Response::Result("handled now".to_string()));
        assert_eq!(done.outcome, Outcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(done.exchange.is_completed());
        let elapsed = (Utc::now() - before).to_std().unwrap();
        assert!(done.exchange.runtime().unwrap() <= elapsed + Duration::from_millis(5));
        assert!(sink.is_empty());
        assert_eq!(dispatcher.stats().handled, 1);
    }

    #[tokio::test]
    async fn test_unhandled_kind_yields_not_implemented() {
        let (dispatcher, sink) = setup();

        let done = dispatcher.dispatch(inbound("GetBaseReport", "{}"), CancellationToken::new()).await;

        let fault = done.response.fault().unwrap();
        assert_eq!(fault.code, FaultCode::NotImplemented);
        assert_eq!(done.outcome, Outcome::Failed(ErrorKind::UnhandledMessageKind));
        assert_eq!(sink.count(ErrorKind::UnhandledMessageKind), 1);
        assert_eq!(sink.reports()[0].correlation_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn test_reject_and_replace_skip_handler() {
        let (dispatcher, _sink) = setup();
        let reset_calls = spy(&dispatcher, "Reset");
        let transfer_calls = spy(&dispatcher, "DataTransfer");

        dispatcher.forwarding().register(Direction::SystemToDevice, "Reset", |_ctx| async {
            ForwardingDecision::reject(Response::Result("Rejected".to_string()), "maintenance window")
        });
        dispatcher.forwarding().register(Direction::SystemToDevice, "DataTransfer", |_ctx| async {
            ForwardingDecision::replace(
                Response::Result("canned".to_string()),
                Some(b"[3,\"msg-1\",{}]".to_vec()),
                "canned answer",
            )
        });

        let rejected = dispatcher.dispatch(inbound("Reset", "{}"), CancellationToken::new()).await;
        assert_eq!(rejected.outcome, Outcome::Rejected);
        assert_eq!(rejected.response, Response::Result("Rejected".to_string()));

        let replaced = dispatcher.dispatch(inbound("DataTransfer", "{}"), CancellationToken::new()).await;
        assert_eq!(replaced.outcome, Outcome::Replaced);
        assert_eq!(replaced.encoded_override.as_deref(), Some(&b"[3,\"msg-1\",{}]"[..]));

        assert_eq!(reset_calls.load(Ordering::SeqCst), 0);
        assert_eq!(transfer_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_decisions_ignored_when_not_intermediary() {
        let sink = Arc::new(MemoryErrorSink::new());
        let config = DispatchConfig::new("csms-edge")
            .with_intermediary(crate::config::IntermediaryRoles::only(Direction::DeviceToSystem));
        let dispatcher: TestDispatcher = Dispatcher::new(config, sink);
        let calls = spy(&dispatcher, "Reset");
        dispatcher.forwarding().register(Direction::SystemToDevice, "Reset", |_ctx| async {
            ForwardingDecision::reject(Response::Result("Rejected".to_string()), "never consulted")
        });

        let done = dispatcher.dispatch(inbound("Reset", "{}"), CancellationToken::new()).await;
        assert_eq!(done.outcome, Outcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_yields_generic_error() {
        let (dispatcher, sink) = setup();
        dispatcher.handlers().register(Direction::SystemToDevice, "Reset", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, HandlerError>(Response::Result(String::new()))
        });

        let done = dispatcher.dispatch(inbound("Reset", "{}"), CancellationToken::new()).await;
        let fault = done.response.fault().unwrap();
        assert_eq!(fault.code, FaultCode::GenericError);
        assert_eq!(fault.description, "Handler timeout");
        assert_eq!(sink.count(ErrorKind::HandlerTimeout), 1);
    }

    #[tokio::test]
    async fn test_cancellation_yields_synthetic_fault() {
        let sink = Arc::new(MemoryErrorSink::new());
        let config = DispatchConfig::new("nn-1").with_handler_timeout(None);
        let dispatcher: TestDispatcher = Dispatcher::new(config, sink.clone());
        dispatcher.handlers().register(Direction::SystemToDevice, "Reset", |ctx: RequestContext<_, String>| async move {
            ctx.cancel.cancelled().await;
            Ok::<_, HandlerError>(Response::Result("late".to_string()))
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let done = dispatcher.dispatch(inbound("Reset", "{}"), cancel).await;
        assert_eq!(done.outcome, Outcome::Failed(ErrorKind::Cancelled));
        assert_eq!(done.response.fault().unwrap().description, "Request cancelled");
        assert_eq!(sink.count(ErrorKind::Cancelled), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_subscribers_do_not_hold_the_response() {
        let sink = Arc::new(MemoryErrorSink::new());
        let config = DispatchConfig::new("nn-1")
            .with_subscriber_timeout(Duration::from_millis(200))
            .with_strict_defects(false);
        let dispatcher: TestDispatcher = Dispatcher::new(config, sink.clone());
        let calls = spy(&dispatcher, "Reset");
        for phase in [EventPhase::RequestObserved, EventPhase::ResponseObserved] {
            dispatcher.events().subscribe("Reset", phase, |_| {
                futures_util::future::pending::<Result<(), crate::types::BoxError>>()
            });
        }

        let done = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.dispatch(inbound("Reset", "now"), CancellationToken::new()),
        )
        .await
        .expect("dispatch finishes despite stuck subscribers");

        assert_eq!(done.response, Response::Result("handled now".to_string()));
        assert_eq!(done.outcome, Outcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(ErrorKind::SubscriberFailure), 2);
        assert_eq!(dispatcher.stats().subscriber_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_request_observed_subscribers() {
        let sink = Arc::new(MemoryErrorSink::new());
        let config = DispatchConfig::new("nn-1").with_handler_timeout(None);
        let dispatcher: TestDispatcher = Dispatcher::new(config, sink.clone());
        dispatcher.handlers().register(Direction::SystemToDevice, "Reset", |ctx: RequestContext<_, String>| async move {
            ctx.cancel.cancelled().await;
            Ok::<_, HandlerError>(Response::Result("late".to_string()))
        });
        dispatcher.events().subscribe("Reset", EventPhase::RequestObserved, |_| {
            futures_util::future::pending::<Result<(), crate::types::BoxError>>()
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let done = dispatcher.dispatch(inbound("Reset", "{}"), cancel).await;

        assert!(started.elapsed() < dispatcher.config().subscriber_timeout);
        assert_eq!(done.outcome, Outcome::Failed(ErrorKind::Cancelled));
        assert_eq!(sink.count(ErrorKind::SubscriberFailure), 1);
        assert_eq!(sink.count(ErrorKind::Cancelled), 1);
    }

    #[tokio::test]
    async fn test_request_observed_precedes_response_observed() {
        let (dispatcher, _sink) = setup();
        spy(&dispatcher, "Heartbeat");

        let seen: Arc<Mutex<Vec<(EventPhase, DateTime<Utc>)>>> = Arc::new(Mutex::new(Vec::new()));
        for phase in [EventPhase::RequestObserved, EventPhase::ResponseObserved] {
            let seen = seen.clone();
            dispatcher.events().subscribe("Heartbeat", phase, move |event| {
                seen.lock().push((event.phase, event.observed_at));
                async { Ok(()) }
            });
        }

        dispatcher.dispatch(inbound("Heartbeat", "{}"), CancellationToken::new()).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, EventPhase::RequestObserved);
        assert_eq!(seen[1].0, EventPhase::ResponseObserved);
        assert!(seen[0].1 <= seen[1].1);
    }

    #[tokio::test]
    async fn test_second_completion_is_not_published() {
        let (dispatcher, sink) = setup();
        spy(&dispatcher, "Reset");
        let published = Arc::new(AtomicUsize::new(0));
        let counter = published.clone();
        dispatcher.events().subscribe("Reset", EventPhase::ResponseObserved, move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let mut done = dispatcher.dispatch(inbound("Reset", "{}"), CancellationToken::new()).await;
        let runtime = done.exchange.runtime();

        let again = dispatcher
            .complete(&mut done.exchange, Response::Result("again".to_string()))
            .await;

        assert!(again.is_err());
        assert_eq!(done.exchange.runtime(), runtime);
        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(ErrorKind::AlreadyCompleted), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "exchange defect")]
    async fn test_second_completion_panics_when_strict() {
        let sink = Arc::new(MemoryErrorSink::new());
        let dispatcher: TestDispatcher =
            Dispatcher::new(DispatchConfig::new("nn-1").with_strict_defects(true), sink);
        spy(&dispatcher, "Reset");

        let mut done = dispatcher.dispatch(inbound("Reset", "{}"), CancellationToken::new()).await;
        let _ = dispatcher.complete(&mut done.exchange, Response::Result(String::new())).await;
    }

    #[tokio::test]
    async fn test_decode_failure_reports_and_faults() {
        let (dispatcher, sink) = setup();

        let fault = dispatcher.decode_failure("Reset", Some("msg-9"), "CS001", DecodeError::new("expected array"));

        assert_eq!(fault.code, FaultCode::FormatViolation);
        assert_eq!(sink.count(ErrorKind::Decode), 1);
        assert_eq!(dispatcher.stats().decode_failures, 1);
    }
}
