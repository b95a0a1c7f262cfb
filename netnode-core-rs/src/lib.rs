//! Networking node dispatch core
//!
//! Protocol-agnostic machinery for a relay sitting between charging stations
//! and a CSMS: correlated exchanges with runtime measurement, a per-kind
//! event bus with isolated subscribers, a handler registry, a forwarding
//! decision engine and the dispatcher that drives one exchange end to end.
//! Everything is generic over the message kind `K` and payload `P`.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod exchange;
pub mod forwarding;
pub mod handlers;
pub mod outbound;
pub mod path;
pub mod relay;
pub mod sink;
pub mod stats;
pub mod types;

pub use config::{DispatchConfig, IntermediaryRoles};
pub use dispatch::{Dispatched, Dispatcher, InboundRequest, Outcome};
pub use error::{
    DecodeError, DispatchError, ErrorKind, ExchangeError, HandlerError, RelayError,
};
pub use events::{EventBus, EventPhase, ExchangeEvent, PublishOutcome, Subscriber};
pub use exchange::Exchange;
pub use forwarding::{compose, decision_fn, DecisionFn, ForwardingDecision, ForwardingEngine};
pub use handlers::{handler_fn, Handler, HandlerRegistry, RequestContext};
pub use outbound::{OutboundTracker, PendingResponse};
pub use path::{NetworkPath, PathError};
pub use relay::{NextHop, RelayHandler, RouteMode};
pub use sink::{ErrorReport, ErrorSink, FanoutErrorSink, MemoryErrorSink, TracingErrorSink};
pub use stats::{DispatchStats, StatsSnapshot};
pub use types::*;
