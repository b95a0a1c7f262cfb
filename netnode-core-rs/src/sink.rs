//! Process-wide error sink
//!
//! Every failure the pipeline recovers from (decode errors, handler faults,
//! timeouts, isolated subscriber failures) is reported here with the
//! message kind and correlation id, so operators and tests can see them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::ErrorKind;
use crate::events::EventPhase;

/// A single recovered failure
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message_kind: String,
    pub phase: Option<EventPhase>,
    pub correlation_id: Option<String>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message_kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            message_kind: message_kind.into(),
            phase: None,
            correlation_id: None,
            detail: detail.into(),
            at: Utc::now(),
        }
    }

    pub fn with_phase(mut self, phase: EventPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Append-only destination for error reports; must tolerate concurrent writers
pub trait ErrorSink: Send + Sync {
    fn report(&self, report: ErrorReport);
}

/// Logs every report through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, report: ErrorReport) {
        let correlation_id = report.correlation_id.as_deref().unwrap_or("-");
        match report.kind {
            ErrorKind::SubscriberFailure | ErrorKind::Decode | ErrorKind::Cancelled => {
                warn!(
                    kind = %report.kind,
                    message_kind = %report.message_kind,
                    phase = ?report.phase,
                    correlation_id,
                    "{}",
                    report.detail
                );
            }
            _ => {
                error!(
                    kind = %report.kind,
                    message_kind = %report.message_kind,
                    phase = ?report.phase,
                    correlation_id,
                    "{}",
                    report.detail
                );
            }
        }
    }
}

/// Keeps reports in memory
#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    reports: Mutex<Vec<ErrorReport>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().clone()
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.reports.lock().iter().filter(|r| r.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl ErrorSink for MemoryErrorSink {
    fn report(&self, report: ErrorReport) {
        self.reports.lock().push(report);
    }
}

/// Forwards every report to several sinks
#[derive(Default, Clone)]
pub struct FanoutErrorSink {
    sinks: Vec<Arc<dyn ErrorSink>>,
}

impl FanoutErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ErrorSink for FanoutErrorSink {
    fn report(&self, report: ErrorReport) {
        for sink in &self.sinks {
            sink.report(report.clone());
        }
    }
}
