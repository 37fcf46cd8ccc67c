//! Structured failure report returned when a plan does not complete

use crate::adapter::AdapterErrorKind;
use crate::plan::DataSource;
use crate::telemetry::PlanTelemetry;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionLost,
    InvalidQuery,
    BackendRejected,
    /// An in-memory operation could not be applied
    CombinatorFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionLost => "connection_lost",
            FailureKind::InvalidQuery => "invalid_query",
            FailureKind::BackendRejected => "backend_rejected",
            FailureKind::CombinatorFailed => "combinator_failed",
        }
    }
}

impl From<AdapterErrorKind> for FailureKind {
    fn from(kind: AdapterErrorKind) -> Self {
        match kind {
            AdapterErrorKind::Timeout => FailureKind::Timeout,
            AdapterErrorKind::ConnectionLost => FailureKind::ConnectionLost,
            AdapterErrorKind::InvalidQuery => FailureKind::InvalidQuery,
            AdapterErrorKind::BackendRejected => FailureKind::BackendRejected,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The step whose terminal failure aborted the plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RootCause {
    pub step_id: String,
    pub backend: DataSource,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub plan_id: Uuid,
    /// Unset when the plan ran out of time rather than failing on a step
    pub root_cause: Option<RootCause>,
    pub succeeded: Vec<String>,
    pub skipped: Vec<String>,
    pub cancelled: Vec<String>,
    pub telemetry: PlanTelemetry,
}
