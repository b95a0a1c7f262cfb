//! Forwarding policies
//!
//! Ready-made decision functions for the JSON dispatcher. Chain them with
//! `netnode_core::compose` to put an access check in front of a business
//! rule.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::FutureExt;
use netnode_core::{DecisionFn, Fault, FaultCode, ForwardingDecision, NodeId, Response};
use serde_json::Value;
use tracing::debug;

use crate::ocpp::{Action, DataTransferRequest, DataTransferResponse, DataTransferStatus, StatusInfo};
use crate::typed::{decide_on, to_response, JsonContext};

/// Reject DataTransfer requests whose `data` equals `literal`.
///
/// The requester receives a DataTransfer response with status Rejected
/// instead of an error; everything else is forwarded.
pub fn reject_data_transfer(literal: impl Into<Value>) -> DecisionFn<Action, Value> {
    let literal = Arc::new(literal.into());
    decide_on(move |req: DataTransferRequest, ctx: JsonContext| {
        let literal = literal.clone();
        async move {
            if req.data.as_ref() != Some(&*literal) {
                return ForwardingDecision::Forward;
            }
            debug!(correlation_id = %ctx.correlation_id, vendor_id = %req.vendor_id, "DataTransfer matches reject literal");
            let response = DataTransferResponse {
                status: DataTransferStatus::Rejected,
                status_info: Some(StatusInfo::new("Rejected").with_info("Rejected by networking node")),
                data: None,
            };
            ForwardingDecision::reject(to_response(&response), "data matches reject literal")
        }
    })
}

/// Refuse a set of actions with a NotSupported fault
pub fn block_kinds(blocked: impl IntoIterator<Item = Action>) -> DecisionFn<Action, Value> {
    let blocked: Arc<HashSet<Action>> = Arc::new(blocked.into_iter().collect());
    Arc::new(move |ctx: JsonContext| {
        let blocked = blocked.clone();
        async move {
            if !blocked.contains(&ctx.kind) {
                return ForwardingDecision::Forward;
            }
            ForwardingDecision::reject(
                Fault::new(
                    FaultCode::NotSupported,
                    format!("{} is blocked by this networking node", ctx.kind),
                ),
                "action blocked",
            )
        }
        .boxed()
    })
}

/// Answer every request with a fixed response without contacting the next hop
pub fn replace_with(response: Response<Value>, reason: impl Into<String>) -> DecisionFn<Action, Value> {
    let reason = reason.into();
    Arc::new(move |_ctx: JsonContext| {
        let decision = ForwardingDecision::replace(response.clone(), None, reason.clone());
        async move { decision }.boxed()
    })
}

/// Only let requests from the given originators through.
///
/// The originator is the first hop of the network path, so a station
/// behind another networking node is still recognised.
pub fn allow_senders(allowed: impl IntoIterator<Item = impl Into<NodeId>>) -> DecisionFn<Action, Value> {
    let allowed: Arc<HashSet<NodeId>> = Arc::new(allowed.into_iter().map(Into::into).collect());
    Arc::new(move |ctx: JsonContext| {
        let allowed = allowed.clone();
        async move {
            let origin = ctx.network_path.source();
            if allowed.contains(origin) {
                return ForwardingDecision::Forward;
            }
            ForwardingDecision::reject(
                Fault::new(FaultCode::SecurityError, format!("{} is not allowed to send {}", origin, ctx.kind)),
                "sender not allowed",
            )
        }
        .boxed()
    })
}
