//! Execution telemetry
//!
//! The executor appends one [`TelemetryRecord`] per step and hands the whole
//! [`PlanTelemetry`] to a [`TelemetrySink`] when the plan completes, whether it
//! succeeded or not.

use crate::plan::{DataSource, Step, StepKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A step longer than this can be a bottleneck
const BOTTLENECK_MIN_MS: f64 = 1000.0;
const BOTTLENECK_SHARE: f64 = 0.5;
const BOTTLENECK_HIGH_SHARE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    /// Succeeded after at least one retry
    Retried,
    Failed,
    Skipped,
    Cancelled,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Retried => "retried",
            StepOutcome::Failed => "failed",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded | StepOutcome::Retried)
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub step_id: String,
    pub kind: StepKind,
    pub backend: DataSource,
    /// Unset for steps that never started
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: f64,
    pub row_count: usize,
    pub attempts: u32,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TelemetryRecord {
    pub fn new(step: &Step, outcome: StepOutcome) -> Self {
        Self {
            step_id: step.id.clone(),
            kind: step.kind,
            backend: step.source,
            started_at: None,
            duration_ms: 0.0,
            row_count: 0,
            attempts: 0,
            outcome,
            error: None,
        }
    }

    pub fn started(mut self, at: DateTime<Utc>, duration_ms: f64) -> Self {
        self.started_at = Some(at);
        self.duration_ms = duration_ms;
        self
    }

    pub fn rows(mut self, row_count: usize) -> Self {
        self.row_count = row_count;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Everything recorded for one plan execution
#[derive(Debug, Clone, Serialize)]
pub struct PlanTelemetry {
    pub plan_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub succeeded: bool,
    pub records: Vec<TelemetryRecord>,
}

impl PlanTelemetry {
    pub fn record(&self, step_id: &str) -> Option<&TelemetryRecord> {
        self.records.iter().find(|r| r.step_id == step_id)
    }

    pub fn with_outcome(&self, outcome: StepOutcome) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.outcome == outcome)
            .map(|r| r.step_id.as_str())
            .collect()
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary::from_telemetry(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bottleneck {
    pub step_id: String,
    pub backend: DataSource,
    pub duration_ms: f64,
    /// Fraction of summed step time
    pub share: f64,
    pub severity: Severity,
}

/// Derived view for callers and the optimizer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub total_ms: f64,
    pub step_count: usize,
    pub rows_per_step: BTreeMap<String, usize>,
    pub retries: u32,
    pub bottlenecks: Vec<Bottleneck>,
}

impl ExecutionSummary {
    pub fn from_telemetry(telemetry: &PlanTelemetry) -> Self {
        let summed: f64 = telemetry.records.iter().map(|r| r.duration_ms).sum();
        let bottlenecks = telemetry
            .records
            .iter()
            .filter(|r| r.duration_ms > BOTTLENECK_MIN_MS && summed > 0.0)
            .filter_map(|r| {
                let share = r.duration_ms / summed;
                (share > BOTTLENECK_SHARE).then(|| Bottleneck {
                    step_id: r.step_id.clone(),
                    backend: r.backend,
                    duration_ms: r.duration_ms,
                    share,
                    severity: if share > BOTTLENECK_HIGH_SHARE {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                })
            })
            .collect();

        Self {
            total_ms: telemetry.duration_ms,
            step_count: telemetry.records.len(),
            rows_per_step: telemetry
                .records
                .iter()
                .filter(|r| r.outcome.is_success())
                .map(|r| (r.step_id.clone(), r.row_count))
                .collect(),
            retries: telemetry.records.iter().map(|r| r.attempts.saturating_sub(1)).sum(),
            bottlenecks,
        }
    }
}

/// Receives a plan's telemetry once it completes
pub trait TelemetrySink: Send + Sync {
    fn flush(&self, telemetry: &PlanTelemetry);
}

/// Emits one structured log line per step
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn flush(&self, telemetry: &PlanTelemetry) {
        for record in &telemetry.records {
            tracing::info!(
                plan_id = %telemetry.plan_id,
                step_id = %record.step_id,
                kind = %record.kind,
                backend = %record.backend,
                outcome = %record.outcome,
                attempts = record.attempts,
                rows = record.row_count,
                duration_ms = record.duration_ms,
                error = record.error.as_deref().unwrap_or(""),
                "Step telemetry"
            );
        }
        tracing::info!(
            plan_id = %telemetry.plan_id,
            succeeded = telemetry.succeeded,
            steps = telemetry.records.len(),
            duration_ms = telemetry.duration_ms,
            "Plan telemetry"
        );
    }
}

/// Feeds the Prometheus counters and histograms
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl TelemetrySink for MetricsSink {
    fn flush(&self, telemetry: &PlanTelemetry) {
        for record in &telemetry.records {
            fedq_common::metrics::record_step(
                record.duration_ms / 1000.0,
                record.backend.as_str(),
                record.outcome.as_str(),
                record.attempts,
                record.row_count,
            );
        }
        let outcome = if telemetry.succeeded { "succeeded" } else { "failed" };
        fedq_common::metrics::record_plan(telemetry.duration_ms / 1000.0, outcome);
    }
}

/// Keeps every flushed plan in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    plans: Arc<Mutex<Vec<PlanTelemetry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plans(&self) -> Vec<PlanTelemetry> {
        self.plans.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn last(&self) -> Option<PlanTelemetry> {
        self.plans.lock().ok().and_then(|p| p.last().cloned())
    }
}

impl TelemetrySink for MemorySink {
    fn flush(&self, telemetry: &PlanTelemetry) {
        if let Ok(mut plans) = self.plans.lock() {
            plans.push(telemetry.clone());
        }
    }
}

#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl TelemetrySink for FanoutSink {
    fn flush(&self, telemetry: &PlanTelemetry) {
        for sink in &self.sinks {
            sink.flush(telemetry);
        }
    }
}
