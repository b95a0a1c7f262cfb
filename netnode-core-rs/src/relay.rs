//! Relaying requests to the next hop
//!
//! The transport implements `NextHop`; `RelayHandler` turns it into a
//! regular handler so a forwarded request flows through the same registry
//! as locally handled ones.

use futures_util::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{HandlerError, RelayError};
use crate::handlers::{Handler, RequestContext};
use crate::path::{NetworkPath, PathError};
use crate::types::{MessageKind, NodeId, Payload, Response};

/// Sends a request to a directly connected node and awaits its response
pub trait NextHop<K, P>: Send + Sync {
    fn relay(
        &self,
        target: &str,
        kind: K,
        path: NetworkPath,
        request: P,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Response<P>, RelayError>>;
}

/// How the next hop and the outgoing path are chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMode {
    /// Record this node on the path and send to a fixed target (upward)
    Append { target: NodeId },
    /// Consume this node's hop and send to the next planned hop (downward)
    SourceRouted,
}

/// Handler forwarding requests through a `NextHop`
///
/// In `SourceRouted` mode a path that ends at this node is delivered to the
/// local handler, if one was given.
pub struct RelayHandler<K, P> {
    node_id: NodeId,
    mode: RouteMode,
    next_hop: Arc<dyn NextHop<K, P>>,
    local: Option<Handler<K, P>>,
}

impl<K: MessageKind, P: Payload> RelayHandler<K, P> {
    pub fn new(node_id: impl Into<NodeId>, mode: RouteMode, next_hop: Arc<dyn NextHop<K, P>>) -> Self {
        Self {
            node_id: node_id.into(),
            mode,
            next_hop,
            local: None,
        }
    }

    /// Handle requests addressed to this node locally
    pub fn with_local(mut self, handler: Handler<K, P>) -> Self {
        self.local = Some(handler);
        self
    }

    /// Next hop and the path it receives; `None` when the path ends here
    pub fn route(&self, path: &NetworkPath) -> Result<Option<(NodeId, NetworkPath)>, RelayError> {
        match &self.mode {
            RouteMode::Append { target } => {
                Ok(Some((target.clone(), path.try_append(self.node_id.clone())?)))
            }
            RouteMode::SourceRouted => {
                let (first, rest) = path.pop_hop();
                let remaining = if first == self.node_id {
                    match rest {
                        Some(rest) => rest,
                        None => return Ok(None),
                    }
                } else {
                    warn!(node = %self.node_id, %path, "Planned path does not start at this node");
                    path.clone()
                };
                Ok(Some((remaining.source().clone(), remaining)))
            }
        }
    }

    pub async fn relay(&self, ctx: RequestContext<K, P>) -> Result<Response<P>, HandlerError> {
        let (target, path) = match self.route(&ctx.network_path)? {
            Some(next) => next,
            None => match &self.local {
                Some(local) => return local(ctx).await,
                None => return Err(RelayError::Path(PathError::Empty).into()),
            },
        };

        debug!(kind = %ctx.kind, correlation_id = %ctx.correlation_id, %target, %path, "Relaying request");
        let response = self
            .next_hop
            .relay(&target, ctx.kind, path, ctx.request, ctx.cancel)
            .await?;
        Ok(response)
    }

    pub fn into_handler(self) -> Handler<K, P> {
        let relay = Arc::new(self);
        Arc::new(move |ctx| {
            let relay = relay.clone();
            async move { relay.relay(ctx).await }.boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionHandle, Direction};
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, NetworkPath)>>,
    }

    impl NextHop<&'static str, String> for Recorder {
        fn relay(
            &self,
            target: &str,
            _kind: &'static str,
            path: NetworkPath,
            request: String,
            _cancel: CancellationToken,
        ) -> BoxFuture<'static, Result<Response<String>, RelayError>> {
            self.sent.lock().push((target.to_string(), path));
            async move { Ok(Response::Result(format!("relayed {}", request))) }.boxed()
        }
    }

    fn ctx(path: NetworkPath) -> RequestContext<&'static str, String> {
        RequestContext {
            correlation_id: "msg-1".into(),
            kind: "Heartbeat",
            direction: Direction::DeviceToSystem,
            timestamp: Utc::now(),
            sender: "CS001".into(),
            connection: ConnectionHandle::new(3),
            network_path: path,
            request: "{}".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_append_mode_records_hop() {
        let recorder = Arc::new(Recorder::default());
        let relay = RelayHandler::new(
            "nn-1",
            RouteMode::Append { target: "CSMS".into() },
            recorder.clone() as Arc<dyn NextHop<_, _>>,
        );

        let response = relay.relay(ctx(NetworkPath::from_source("CS001"))).await.unwrap();
        assert_eq!(response, Response::Result("relayed {}".to_string()));

        let sent = recorder.sent.lock();
        assert_eq!(sent[0].0, "CSMS");
        assert_eq!(sent[0].1.hops(), ["CS001", "nn-1"]);
    }

    #[tokio::test]
    async fn test_append_mode_refuses_loops() {
        let relay = RelayHandler::new(
            "nn-1",
            RouteMode::Append { target: "CSMS".into() },
            Arc::new(Recorder::default()) as Arc<dyn NextHop<_, _>>,
        );

        let looped = NetworkPath::new(["CS001", "nn-1"]).unwrap();
        let err = relay.relay(ctx(looped)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Relay(RelayError::Path(PathError::Loop(_)))));
    }

    #[test]
    fn test_source_routed_pops_own_hop() {
        let relay: RelayHandler<&'static str, String> = RelayHandler::new(
            "nn-1",
            RouteMode::SourceRouted,
            Arc::new(Recorder::default()),
        );

        let planned = NetworkPath::new(["nn-1", "nn-2", "CS001"]).unwrap();
        let (target, path) = relay.route(&planned).unwrap().unwrap();
        assert_eq!(target, "nn-2");
        assert_eq!(path.hops(), ["nn-2", "CS001"]);

        let done = NetworkPath::from_source("nn-1");
        assert_eq!(relay.route(&done).unwrap(), None);
    }

    #[tokio::test]
    async fn test_path_ending_here_goes_local() {
        let recorder = Arc::new(Recorder::default());
        let local: Handler<&'static str, String> = crate::handlers::handler_fn(|_ctx| async {
            Ok(Response::Result("local".to_string()))
        });
        let relay = RelayHandler::new("nn-1", RouteMode::SourceRouted, recorder.clone() as Arc<dyn NextHop<_, _>>)
            .with_local(local);

        let response = relay.relay(ctx(NetworkPath::from_source("nn-1"))).await.unwrap();
        assert_eq!(response, Response::Result("local".to_string()));
        assert!(recorder.sent.lock().is_empty());

        let without_local: RelayHandler<&'static str, String> =
            RelayHandler::new("nn-1", RouteMode::SourceRouted, recorder);
        let err = without_local.relay(ctx(NetworkPath::from_source("nn-1"))).await.unwrap_err();
        assert!(matches!(err, HandlerError::Relay(RelayError::Path(PathError::Empty))));
    }
}
