//! Typed registration helpers
//!
//! The JSON dispatcher carries `serde_json::Value` payloads. These helpers
//! let handlers and decision functions work with the schema types instead;
//! payloads that do not match the schema become decode errors, never
//! handler failures.

use futures_util::future::FutureExt;
use netnode_core::{
    DecisionFn, DecodeError, Fault, FaultCode, ForwardingDecision, Handler, HandlerError, RequestContext,
    Response,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

use crate::ocpp::Action;

/// Context as seen by JSON handlers
pub type JsonContext = RequestContext<Action, Value>;

/// Serialize a typed response, degrading to an internal error fault
pub fn to_response<T: Serialize>(value: &T) -> Response<Value> {
    match serde_json::to_value(value) {
        Ok(v) => Response::Result(v),
        Err(e) => {
            error!(error = %e, "Failed to serialize response payload");
            Response::Error(Fault::new(FaultCode::InternalError, "Response serialization failed"))
        }
    }
}

/// Handler decoding the request as `Req` and encoding `Res`
pub fn on_request<Req, Res, F, Fut>(f: F) -> Handler<Action, Value>
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Req, JsonContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, HandlerError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx: JsonContext| {
        let f = f.clone();
        async move {
            let req: Req = serde_json::from_value(ctx.request.clone()).map_err(DecodeError::from)?;
            let res = f(req, ctx).await?;
            Ok::<_, HandlerError>(to_response(&res))
        }
        .boxed()
    })
}

/// Decision function seeing the request as `Req`.
///
/// Requests that do not decode are forwarded unchanged; the next hop will
/// answer them.
pub fn decide_on<Req, F, Fut>(f: F) -> DecisionFn<Action, Value>
where
    Req: DeserializeOwned + Send + 'static,
    F: Fn(Req, JsonContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ForwardingDecision<Value>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx: JsonContext| {
        let f = f.clone();
        async move {
            match serde_json::from_value::<Req>(ctx.request.clone()) {
                Ok(req) => f(req, ctx).await,
                Err(e) => {
                    debug!(kind = %ctx.kind, correlation_id = %ctx.correlation_id, error = %e, "Payload does not decode, forwarding");
                    ForwardingDecision::Forward
                }
            }
        }
        .boxed()
    })
}
