//! Correlated request/response exchanges
//!
//! An `Exchange` is opened when a request is received (or about to be sent)
//! and completed exactly once with its response. Completion fixes the
//! runtime; a second completion is a defect and is refused.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

use crate::error::ExchangeError;
use crate::path::NetworkPath;
use crate::types::{ConnectionHandle, Direction, NodeId, Response};

/// One request/response cycle
#[derive(Debug, Clone)]
pub struct Exchange<K, P> {
    pub correlation_id: String,
    pub kind: K,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub connection: ConnectionHandle,
    pub network_path: NetworkPath,
    pub request: P,
    response: Option<Response<P>>,
    response_timestamp: Option<DateTime<Utc>>,
    runtime: Option<Duration>,
    runtime_clamped: bool,
}

impl<K: std::fmt::Display, P: Clone> Exchange<K, P> {
    /// Open an exchange for a request
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        correlation_id: impl Into<String>,
        kind: K,
        direction: Direction,
        timestamp: DateTime<Utc>,
        sender: impl Into<NodeId>,
        connection: ConnectionHandle,
        network_path: NetworkPath,
        request: P,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind,
            direction,
            timestamp,
            sender: sender.into(),
            connection,
            network_path,
            request,
            response: None,
            response_timestamp: None,
            runtime: None,
            runtime_clamped: false,
        }
    }

    /// Complete with a response observed now
    pub fn complete(&mut self, response: Response<P>) -> Result<Duration, ExchangeError> {
        self.complete_at(response, Utc::now())
    }

    /// Complete with a response observed at `at`.
    ///
    /// A response timestamp earlier than the request timestamp (clock skew)
    /// yields a zero runtime and sets `runtime_clamped`.
    pub fn complete_at(
        &mut self,
        response: Response<P>,
        at: DateTime<Utc>,
    ) -> Result<Duration, ExchangeError> {
        if self.response.is_some() {
            return Err(ExchangeError::AlreadyCompleted {
                correlation_id: self.correlation_id.clone(),
            });
        }

        let runtime = match (at - self.timestamp).to_std() {
            Ok(d) => d,
            Err(_) => {
                warn!(
                    correlation_id = %self.correlation_id,
                    kind = %self.kind,
                    "Response timestamp precedes request timestamp, clamping runtime to zero"
                );
                self.runtime_clamped = true;
                Duration::ZERO
            }
        };

        self.response = Some(response);
        self.response_timestamp = Some(at);
        self.runtime = Some(runtime);
        Ok(runtime)
    }

    pub fn is_completed(&self) -> bool {
        self.response.is_some()
    }

    pub fn response(&self) -> Option<&Response<P>> {
        self.response.as_ref()
    }

    pub fn response_timestamp(&self) -> Option<DateTime<Utc>> {
        self.response_timestamp
    }

    pub fn runtime(&self) -> Option<Duration> {
        self.runtime
    }

    /// True when clock skew forced the runtime to zero
    pub fn runtime_clamped(&self) -> bool {
        self.runtime_clamped
    }
}
