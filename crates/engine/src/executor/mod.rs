//! Federated plan executor
//!
//! Validates a plan, then drives it to completion:
//! - ready steps are dispatched in declaration order as soon as every producer
//!   of their inputs has succeeded
//! - query steps run as spawned tasks, at most `max_concurrent_queries` at once,
//!   with retries for transient adapter failures
//! - memory steps run inline on the scheduling loop; they never wait on I/O
//!
//! The first terminal step failure, or the plan deadline, aborts the run: in-flight
//! tasks are cancelled, unstarted steps are skipped, and the caller gets a
//! [`FailureReport`] instead of a partial result.

mod report;
mod state;

pub use report::{FailureKind, FailureReport, RootCause};

use self::state::{RunState, StepState};
use crate::adapter::{AdapterError, AdapterRegistry, DataSourceAdapter};
use crate::combinator::{Inputs, Operation};
use crate::error::{EngineError, ExecutionError, InternalConsistencyError, PlanValidationError};
use crate::plan::{graph, DependencyGraph, Plan, QueryGuard, QueryPayload, StepAction};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::row::RowSet;
use crate::store::ResultStore;
use crate::telemetry::{
    ExecutionSummary, PlanTelemetry, StepOutcome, TelemetryRecord, TelemetrySink, TracingSink,
};
use chrono::{DateTime, Utc};
use fedq_common::config::{ExecutorConfig, GuardConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id as TaskId, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Overall plan deadline; the executor default applies when unset
    pub deadline: Option<Duration>,
}

/// Final step rows plus what it took to produce them
#[derive(Debug, Clone, Serialize)]
pub struct PlanOutput {
    pub plan_id: Uuid,
    pub rows: RowSet,
    pub telemetry: PlanTelemetry,
    pub summary: ExecutionSummary,
}

pub struct Executor {
    registry: AdapterRegistry,
    guard: QueryGuard,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn TelemetrySink>,
    max_concurrent_queries: usize,
    attempt_timeout: Duration,
    default_deadline: Duration,
}

impl Executor {
    pub fn new(registry: AdapterRegistry) -> Self {
        Self::from_config(&ExecutorConfig::default(), &GuardConfig::default(), registry)
    }

    pub fn from_config(config: &ExecutorConfig, guard: &GuardConfig, registry: AdapterRegistry) -> Self {
        Self {
            registry,
            guard: QueryGuard::from_config(guard),
            retry: RetryPolicy::from_config(config),
            sleeper: Arc::new(TokioSleeper),
            sink: Arc::new(TracingSink),
            max_concurrent_queries: config.max_concurrent_queries.max(1),
            attempt_timeout: config.attempt_timeout(),
            default_deadline: config.default_deadline(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_guard(mut self, guard: QueryGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_max_concurrent_queries(mut self, limit: usize) -> Self {
        self.max_concurrent_queries = limit.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Structural, safety and routing checks; nothing is executed
    pub fn validate(&self, plan: &Plan) -> Result<DependencyGraph, PlanValidationError> {
        let graph = graph::validate(plan)?;
        for step in &plan.steps {
            let StepAction::Query(payload) = &step.action else {
                continue;
            };
            self.guard
                .check(payload)
                .map_err(|reason| PlanValidationError::UnsafeQuery {
                    step_id: step.id.clone(),
                    reason,
                })?;
            if !self.registry.contains(step.source) {
                return Err(PlanValidationError::NoAdapter {
                    step_id: step.id.clone(),
                    backend: step.source,
                });
            }
        }
        Ok(graph)
    }

    pub async fn execute(&self, plan: Plan) -> Result<PlanOutput, EngineError> {
        self.execute_with(plan, ExecuteOptions::default()).await
    }

    pub async fn execute_with(&self, plan: Plan, options: ExecuteOptions) -> Result<PlanOutput, EngineError> {
        let graph = self.validate(&plan).inspect_err(|e| {
            tracing::warn!(plan_id = %plan.id, error = %e, "Plan rejected");
        })?;
        let budget = options.deadline.unwrap_or(self.default_deadline);
        let span = tracing::info_span!("execute_plan", plan_id = %plan.id, steps = plan.len());
        self.run(&plan, &graph, budget).instrument(span).await
    }

    async fn run(&self, plan: &Plan, graph: &DependencyGraph, budget: Duration) -> Result<PlanOutput, EngineError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let deadline = started + budget;
        tracing::info!(deadline_ms = budget.as_millis() as u64, "Executing plan");

        let mut run = Run::new(plan, graph);
        let outcome = self.drive(&mut run, deadline).await;

        let running = run.step_ids(run.state.in_state(StepState::Running));
        let pending = run.step_ids(run.state.not_started());
        if outcome.is_err() {
            run.abort().await;
        }

        let telemetry = run.telemetry(started_at, started.elapsed(), outcome.is_ok());
        self.sink.flush(&telemetry);

        match outcome {
            Ok(()) => {
                let rows = run.store.take(&plan.steps[graph.final_step].output_var)?;
                let summary = telemetry.summary();
                tracing::info!(
                    rows = rows.len(),
                    retries = summary.retries,
                    duration_ms = telemetry.duration_ms,
                    "Plan completed"
                );
                Ok(PlanOutput {
                    plan_id: plan.id,
                    rows,
                    telemetry,
                    summary,
                })
            }
            Err(Abort::Failed(cause)) => {
                tracing::error!(
                    step_id = %cause.step_id,
                    backend = %cause.backend,
                    kind = %cause.kind,
                    attempts = cause.attempts,
                    "Plan failed"
                );
                let report = run.report(Some(cause), telemetry);
                Err(ExecutionError::StepFailed(Box::new(report)).into())
            }
            Err(Abort::Deadline) => {
                tracing::error!(?pending, ?running, "Plan deadline exceeded");
                let report = run.report(None, telemetry);
                Err(ExecutionError::DeadlineExceeded {
                    deadline_ms: budget.as_millis() as u64,
                    pending,
                    running,
                    report: Box::new(report),
                }
                .into())
            }
            Err(Abort::Internal(e)) => {
                tracing::error!(error = %e, "Plan aborted on internal inconsistency");
                Err(e.into())
            }
        }
    }

    async fn drive(&self, run: &mut Run<'_>, deadline: Instant) -> Result<(), Abort> {
        loop {
            if Instant::now() >= deadline {
                return Err(Abort::Deadline);
            }
            self.dispatch(run, deadline)?;

            if run.state.state(run.final_step) == StepState::Succeeded {
                return Ok(());
            }
            if run.tasks.is_empty() {
                return Err(Abort::Internal(InternalConsistencyError::Stalled {
                    steps: run.step_ids(run.state.not_started()),
                }));
            }

            let joined = tokio::select! {
                joined = run.tasks.join_next_with_id() => joined,
                _ = tokio::time::sleep_until(deadline) => return Err(Abort::Deadline),
            };
            match joined {
                Some(Ok((id, (step, result)))) => run.complete_query(id, step, result)?,
                Some(Err(err)) => return Err(run.lose_task(err.id(), err.to_string())),
                None => continue,
            }
        }
    }

    /// Start every ready step the concurrency limit allows
    fn dispatch(&self, run: &mut Run<'_>, deadline: Instant) -> Result<(), Abort> {
        let plan = run.plan;
        loop {
            let mut progressed = false;
            for index in run.state.ready() {
                match &plan.steps[index].action {
                    StepAction::Memory(operation) => {
                        run.run_memory(index, operation)?;
                        progressed = true;
                    }
                    StepAction::Query(payload) => {
                        if run.tasks.len() >= self.max_concurrent_queries {
                            continue;
                        }
                        self.spawn_query(run, index, payload, deadline)?;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn spawn_query(
        &self,
        run: &mut Run<'_>,
        index: usize,
        payload: &QueryPayload,
        deadline: Instant,
    ) -> Result<(), Abort> {
        let plan = run.plan;
        let step = &plan.steps[index];
        let adapter = self.registry.get(step.source).ok_or_else(|| {
            Abort::Internal(InternalConsistencyError::TaskLost {
                step_id: step.id.clone(),
                reason: format!("no adapter for {}", step.source),
            })
        })?;

        let attempts = Arc::new(AtomicU32::new(0));
        let query = QueryTask {
            adapter,
            payload: payload.clone(),
            retry: self.retry.clone(),
            sleeper: Arc::clone(&self.sleeper),
            attempt_timeout: self.attempt_timeout,
            deadline,
            attempts: Arc::clone(&attempts),
        };
        let span = tracing::info_span!("query_step", step_id = %step.id, backend = %step.source);
        let handle = run
            .tasks
            .spawn(async move { (index, query.run().await) }.instrument(span));

        tracing::debug!(step_id = %step.id, backend = %step.source, "Dispatched query step");
        run.state.start(index);
        run.in_flight.insert(
            handle.id(),
            InFlight {
                step: index,
                started: Instant::now(),
                started_at: Utc::now(),
                attempts,
            },
        );
        Ok(())
    }
}

/// One query step's attempts, owned by its spawned task
struct QueryTask {
    adapter: Arc<dyn DataSourceAdapter>,
    payload: QueryPayload,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    attempt_timeout: Duration,
    deadline: Instant,
    attempts: Arc<AtomicU32>,
}

impl QueryTask {
    async fn run(self) -> Result<RowSet, AdapterError> {
        let mut delays = self.retry.schedule();
        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let attempt_deadline = (Instant::now() + self.attempt_timeout).min(self.deadline);

            let result = tokio::time::timeout_at(attempt_deadline, self.adapter.execute(&self.payload, attempt_deadline))
                .await
                .unwrap_or_else(|_| {
                    Err(AdapterError::timeout(format!(
                        "attempt {} did not finish within {}ms",
                        attempt,
                        self.attempt_timeout.as_millis()
                    )))
                });

            match result {
                Ok(rows) => return Ok(rows),
                Err(e) if self.retry.should_retry(&e, attempt) => {
                    let delay = delays.next_delay();
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Query attempt failed, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct InFlight {
    step: usize,
    started: Instant,
    started_at: DateTime<Utc>,
    attempts: Arc<AtomicU32>,
}

enum Abort {
    Failed(RootCause),
    Deadline,
    Internal(InternalConsistencyError),
}

/// Mutable state of one plan execution, owned by the scheduling loop
struct Run<'a> {
    plan: &'a Plan,
    final_step: usize,
    state: RunState,
    store: ResultStore,
    records: Vec<Option<TelemetryRecord>>,
    tasks: JoinSet<(usize, Result<RowSet, AdapterError>)>,
    in_flight: HashMap<TaskId, InFlight>,
}

impl<'a> Run<'a> {
    fn new(plan: &'a Plan, graph: &DependencyGraph) -> Self {
        Self {
            plan,
            final_step: graph.final_step,
            state: RunState::new(graph),
            store: ResultStore::new(),
            records: vec![None; plan.len()],
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
        }
    }

    fn step_ids(&self, indices: Vec<usize>) -> Vec<String> {
        indices.into_iter().map(|i| self.plan.steps[i].id.clone()).collect()
    }

    fn publish(&mut self, index: usize, rows: RowSet) -> Result<(), Abort> {
        let plan = self.plan;
        let step = &plan.steps[index];
        if let Err(e) = self.store.publish(&step.output_var, rows) {
            self.state.fail(index);
            self.records[index] = Some(TelemetryRecord::new(step, StepOutcome::Failed).error(e.to_string()));
            return Err(Abort::Internal(e));
        }
        self.state.succeed(index);
        Ok(())
    }

    fn run_memory(&mut self, index: usize, operation: &Operation) -> Result<(), Abort> {
        let plan = self.plan;
        let step = &plan.steps[index];
        self.state.start(index);
        let started = Instant::now();
        let started_at = Utc::now();

        let mut inputs = Inputs::new();
        for name in &step.inputs {
            let rows = self.store.get(name).map_err(|e| {
                self.state.fail(index);
                Abort::Internal(e)
            })?;
            inputs.push(name.clone(), rows);
        }

        match operation.apply(&inputs) {
            Ok(rows) => {
                let row_count = rows.len();
                self.publish(index, rows)?;
                self.records[index] = Some(
                    TelemetryRecord::new(step, StepOutcome::Succeeded)
                        .started(started_at, millis(started.elapsed()))
                        .rows(row_count)
                        .attempts(1),
                );
                tracing::debug!(step_id = %step.id, operation = operation.name(), rows = row_count, "Memory step finished");
                Ok(())
            }
            Err(e) => {
                self.state.fail(index);
                self.records[index] = Some(
                    TelemetryRecord::new(step, StepOutcome::Failed)
                        .started(started_at, millis(started.elapsed()))
                        .attempts(1)
                        .error(e.to_string()),
                );
                Err(Abort::Failed(RootCause {
                    step_id: step.id.clone(),
                    backend: step.source,
                    kind: FailureKind::CombinatorFailed,
                    message: e.to_string(),
                    attempts: 1,
                }))
            }
        }
    }

    fn complete_query(
        &mut self,
        id: TaskId,
        index: usize,
        result: Result<RowSet, AdapterError>,
    ) -> Result<(), Abort> {
        let plan = self.plan;
        let step = &plan.steps[index];
        let Some(flight) = self.in_flight.remove(&id) else {
            return Err(self.lose_task(id, "completed task was not tracked".to_string()));
        };
        let attempts = flight.attempts.load(Ordering::SeqCst);
        let elapsed = millis(flight.started.elapsed());

        match result {
            Ok(rows) => {
                let row_count = rows.len();
                let outcome = if attempts > 1 {
                    StepOutcome::Retried
                } else {
                    StepOutcome::Succeeded
                };
                self.publish(index, rows)?;
                self.records[index] = Some(
                    TelemetryRecord::new(step, outcome)
                        .started(flight.started_at, elapsed)
                        .rows(row_count)
                        .attempts(attempts),
                );
                tracing::debug!(step_id = %step.id, rows = row_count, attempts, "Query step finished");
                Ok(())
            }
            Err(e) => {
                self.state.fail(index);
                self.records[index] = Some(
                    TelemetryRecord::new(step, StepOutcome::Failed)
                        .started(flight.started_at, elapsed)
                        .attempts(attempts)
                        .error(e.to_string()),
                );
                Err(Abort::Failed(RootCause {
                    step_id: step.id.clone(),
                    backend: step.source,
                    kind: e.kind.into(),
                    message: e.message,
                    attempts,
                }))
            }
        }
    }

    /// A task ended without reporting back (panic or unknown handle)
    fn lose_task(&mut self, id: TaskId, reason: String) -> Abort {
        let Some(flight) = self.in_flight.remove(&id) else {
            return Abort::Internal(InternalConsistencyError::TaskLost {
                step_id: format!("task {}", id),
                reason,
            });
        };
        let plan = self.plan;
        let step = &plan.steps[flight.step];
        self.state.fail(flight.step);
        self.records[flight.step] = Some(
            TelemetryRecord::new(step, StepOutcome::Failed)
                .started(flight.started_at, millis(flight.started.elapsed()))
                .attempts(flight.attempts.load(Ordering::SeqCst))
                .error(reason.clone()),
        );
        Abort::Internal(InternalConsistencyError::TaskLost {
            step_id: step.id.clone(),
            reason,
        })
    }

    /// Cancel in-flight queries and mark everything unfinished
    async fn abort(&mut self) {
        self.tasks.shutdown().await;
        let plan = self.plan;
        for (_, flight) in self.in_flight.drain() {
            let step = &plan.steps[flight.step];
            self.records[flight.step] = Some(
                TelemetryRecord::new(step, StepOutcome::Cancelled)
                    .started(flight.started_at, millis(flight.started.elapsed()))
                    .attempts(flight.attempts.load(Ordering::SeqCst)),
            );
        }
        self.state.abort();
    }

    /// Records in declaration order; steps that never ran are reported skipped
    fn telemetry(&self, started_at: DateTime<Utc>, elapsed: Duration, succeeded: bool) -> PlanTelemetry {
        let records = self
            .records
            .iter()
            .zip(&self.plan.steps)
            .map(|(record, step)| {
                record
                    .clone()
                    .unwrap_or_else(|| TelemetryRecord::new(step, StepOutcome::Skipped))
            })
            .collect();
        PlanTelemetry {
            plan_id: self.plan.id,
            started_at,
            duration_ms: millis(elapsed),
            succeeded,
            records,
        }
    }

    fn report(&self, root_cause: Option<RootCause>, telemetry: PlanTelemetry) -> FailureReport {
        FailureReport {
            plan_id: self.plan.id,
            root_cause,
            succeeded: self.step_ids(self.state.in_state(StepState::Succeeded)),
            skipped: self.step_ids(self.state.in_state(StepState::Skipped)),
            cancelled: self.step_ids(self.state.in_state(StepState::Cancelled)),
            telemetry,
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ScriptedAdapter;
    use crate::combinator::{FilterSpec, JoinSpec, Predicate, TransformSpec, Transformation};
    use crate::plan::{AnalyticalQuery, DataSource, DocumentQuery, Step, StepKind};
    use crate::retry::RecordingSleeper;
    use crate::row;
    use crate::telemetry::MemorySink;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn find(id: &str, collection: &str, output_var: &str) -> Step {
        Step::query(id, QueryPayload::Document(DocumentQuery::find(collection, json!({}))), output_var)
    }

    fn sql(id: &str, query: &str, output_var: &str) -> Step {
        Step::query(id, QueryPayload::Analytical(AnalyticalQuery::sql(query)), output_var)
    }

    fn not_in(field: &str, input: &str) -> Operation {
        Operation::Filter(FilterSpec {
            condition: Predicate::NotIn {
                field: field.to_string(),
                input: input.to_string(),
                input_field: None,
            },
        })
    }

    fn registry(document: &Arc<ScriptedAdapter>, analytical: &Arc<ScriptedAdapter>) -> AdapterRegistry {
        AdapterRegistry::new()
            .with(Arc::clone(document) as Arc<dyn DataSourceAdapter>)
            .with(Arc::clone(analytical) as Arc<dyn DataSourceAdapter>)
    }

    fn executor(registry: AdapterRegistry) -> Executor {
        Executor::new(registry).with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    /// Users who viewed but never purchased
    fn viewed_not_purchased() -> Plan {
        Plan::new(vec![
            find("viewed", "events", "viewed"),
            sql("purchased", "SELECT user_id FROM purchases", "purchased"),
            Step::memory("filter", StepKind::Filter, not_in("user_id", "purchased"), &["viewed", "purchased"], "result"),
            Step::final_step("final", "result"),
        ])
    }

    #[tokio::test]
    async fn test_viewed_but_not_purchased() {
        let document = Arc::new(
            ScriptedAdapter::new(DataSource::Document)
                .respond("events", vec![row! { "user_id" => 1 }, row! { "user_id" => 2 }]),
        );
        let analytical = Arc::new(
            ScriptedAdapter::new(DataSource::Analytical)
                .respond("SELECT user_id FROM purchases", vec![row! { "user_id" => 2 }]),
        );
        let sink = Arc::new(MemorySink::new());
        let executor = executor(registry(&document, &analytical)).with_sink(sink.clone());

        let output = assert_ok!(executor.execute(viewed_not_purchased()).await);

        assert_eq!(output.rows.rows(), &[row! { "user_id" => 1 }]);
        assert_eq!(document.total_calls(), 1);
        assert_eq!(analytical.total_calls(), 1);
        assert_eq!(output.telemetry.records.len(), 4);
        assert!(output.telemetry.records.iter().all(|r| r.outcome == StepOutcome::Succeeded));
        assert_eq!(output.summary.rows_per_step["filter"], 1);

        let flushed = sink.last().unwrap();
        assert!(flushed.succeeded);
        assert_eq!(flushed.plan_id, output.plan_id);
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_any_call() {
        let document = Arc::new(ScriptedAdapter::new(DataSource::Document).respond("events", vec![]));
        let analytical = Arc::new(ScriptedAdapter::new(DataSource::Analytical));
        let plan = Plan::new(vec![
            find("a", "events", "a_out"),
            Step::memory("b", StepKind::Transform, Operation::Union, &["a_out", "c_out"], "b_out"),
            Step::memory("c", StepKind::Transform, Operation::Identity, &["b_out"], "c_out"),
            Step::final_step("d", "c_out"),
        ]);

        let err = assert_err!(executor(registry(&document, &analytical)).execute(plan).await);
        assert!(matches!(err, EngineError::Validation(PlanValidationError::Cycle { .. })));
        assert_eq!(document.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_query_fails_fast_and_skips_dependents() {
        let document = Arc::new(ScriptedAdapter::new(DataSource::Document).respond("users", vec![row! { "user_id" => 1 }]));
        let analytical = Arc::new(
            ScriptedAdapter::new(DataSource::Analytical)
                .fail("SELECT broken", AdapterError::invalid_query("Code: 62. Syntax error")),
        );
        let plan = Plan::new(vec![
            sql("a", "SELECT broken", "a_out"),
            find("b", "users", "b_out"),
            Step::memory("c", StepKind::Join, Operation::Join(JoinSpec::on("user_id")), &["a_out", "b_out"], "c_out"),
            Step::final_step("d", "c_out"),
        ]);

        let err = assert_err!(executor(registry(&document, &analytical)).execute(plan).await);
        let EngineError::Execution(ExecutionError::StepFailed(report)) = err else {
            panic!("expected a step failure, got {:?}", err);
        };
        let cause = report.root_cause.as_ref().unwrap();
        assert_eq!(cause.step_id, "a");
        assert_eq!(cause.kind, FailureKind::InvalidQuery);
        assert_eq!(cause.backend, DataSource::Analytical);
        assert_eq!(cause.attempts, 1);
        assert_eq!(analytical.call_count("SELECT broken"), 1);
        assert!(report.skipped.contains(&"c".to_string()));
        assert!(report.skipped.contains(&"d".to_string()));
        assert_eq!(report.telemetry.record("a").unwrap().outcome, StepOutcome::Failed);
        assert!(!report.telemetry.succeeded);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retry_budget() {
        let document = Arc::new(ScriptedAdapter::new(DataSource::Document));
        let analytical = Arc::new(
            ScriptedAdapter::new(DataSource::Analytical).fail("SELECT slow", AdapterError::timeout("timed out")),
        );
        let sleeper = Arc::new(RecordingSleeper::new());
        let executor = Executor::new(registry(&document, &analytical)).with_sleeper(sleeper.clone());
        let plan = Plan::new(vec![sql("a", "SELECT slow", "a_out"), Step::final_step("f", "a_out")]);

        let err = assert_err!(executor.execute(plan).await);
        let report = err_report(&err);
        assert_eq!(analytical.call_count("SELECT slow"), 3);
        assert_eq!(sleeper.delays().len(), 2);
        assert_eq!(report.root_cause.as_ref().unwrap().attempts, 3);
        assert_eq!(report.root_cause.as_ref().unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_is_retried() {
        let document = Arc::new(
            ScriptedAdapter::new(DataSource::Document)
                .respond("events", vec![row! { "user_id" => 1 }])
                .fail_times("events", 2, AdapterError::connection_lost("reset by peer")),
        );
        let analytical = Arc::new(ScriptedAdapter::new(DataSource::Analytical));
        let plan = Plan::new(vec![find("a", "events", "a_out"), Step::final_step("f", "a_out")]);

        let output = assert_ok!(executor(registry(&document, &analytical)).execute(plan).await);
        let record = output.telemetry.record("a").unwrap();
        assert_eq!(record.outcome, StepOutcome::Retried);
        assert_eq!(record.attempts, 3);
        assert_eq!(output.summary.retries, 2);
        assert_eq!(output.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_independent_queries_overlap() {
        let document = Arc::new(
            ScriptedAdapter::new(DataSource::Document)
                .respond("events", vec![row! { "user_id" => 1 }])
                .delay("events", Duration::from_millis(50)),
        );
        let analytical = Arc::new(
            ScriptedAdapter::new(DataSource::Analytical)
                .respond("SELECT user_id FROM purchases", vec![])
                .delay("SELECT user_id FROM purchases", Duration::from_millis(50)),
        );

        assert_ok!(executor(registry(&document, &analytical)).execute(viewed_not_purchased()).await);
        assert!(document.calls()[0].overlaps(&analytical.calls()[0]));
    }

    #[tokio::test]
    async fn test_concurrency_limit_of_one_serializes_queries() {
        let document = Arc::new(
            ScriptedAdapter::new(DataSource::Document)
                .respond("events", vec![])
                .delay("events", Duration::from_millis(20)),
        );
        let analytical = Arc::new(
            ScriptedAdapter::new(DataSource::Analytical)
                .respond("SELECT user_id FROM purchases", vec![])
                .delay("SELECT user_id FROM purchases", Duration::from_millis(20)),
        );
        let executor = executor(registry(&document, &analytical)).with_max_concurrent_queries(1);

        assert_ok!(executor.execute(viewed_not_purchased()).await);
        assert!(!document.calls()[0].overlaps(&analytical.calls()[0]));
    }

    #[tokio::test]
    async fn test_deadline_reports_pending_and_running() {
        let document = Arc::new(
            ScriptedAdapter::new(DataSource::Document)
                .respond("events", vec![])
                .delay("events", Duration::from_secs(5)),
        );
        let analytical = Arc::new(ScriptedAdapter::new(DataSource::Analytical));
        let plan = Plan::new(vec![find("slow", "events", "slow_out"), Step::final_step("f", "slow_out")]);

        let err = assert_err!(
            executor(registry(&document, &analytical))
                .execute_with(plan, ExecuteOptions { deadline: Some(Duration::from_millis(50)) })
                .await
        );
        let EngineError::Execution(ExecutionError::DeadlineExceeded { pending, running, report, deadline_ms }) = err
        else {
            panic!("expected deadline exceeded, got {:?}", err);
        };
        assert_eq!(deadline_ms, 50);
        assert_eq!(running, vec!["slow".to_string()]);
        assert_eq!(pending, vec!["f".to_string()]);
        assert_eq!(report.cancelled, vec!["slow".to_string()]);
        assert_eq!(report.skipped, vec!["f".to_string()]);
        assert!(report.root_cause.is_none());
    }

    #[tokio::test]
    async fn test_unsafe_query_and_missing_adapter_are_rejected() {
        let document = Arc::new(ScriptedAdapter::new(DataSource::Document));
        let analytical = Arc::new(ScriptedAdapter::new(DataSource::Analytical));
        let unsafe_plan = Plan::new(vec![sql("a", "DROP TABLE purchases", "a_out"), Step::final_step("f", "a_out")]);
        let err = assert_err!(executor(registry(&document, &analytical)).execute(unsafe_plan).await);
        assert!(matches!(err, EngineError::Validation(PlanValidationError::UnsafeQuery { .. })));
        assert_eq!(analytical.total_calls(), 0);

        let only_documents = AdapterRegistry::new().with(Arc::clone(&document) as Arc<dyn DataSourceAdapter>);
        let plan = Plan::new(vec![sql("a", "SELECT 1", "a_out"), Step::final_step("f", "a_out")]);
        let err = assert_err!(executor(only_documents).validate(&plan));
        assert_eq!(
            err,
            PlanValidationError::NoAdapter {
                step_id: "a".into(),
                backend: DataSource::Analytical
            }
        );
    }

    #[tokio::test]
    async fn test_every_step_runs_exactly_once() {
        let document = Arc::new(
            ScriptedAdapter::new(DataSource::Document)
                .respond("a", vec![row! { "k" => 1, "x" => "a" }])
                .respond("b", vec![row! { "k" => 1, "x" => "b" }]),
        );
        let analytical = Arc::new(ScriptedAdapter::new(DataSource::Analytical).respond("SELECT k", vec![row! { "k" => 1 }]));
        let plan = Plan::new(vec![
            find("a", "a", "a_out"),
            find("b", "b", "b_out"),
            sql("c", "SELECT k", "c_out"),
            Step::memory("ab", StepKind::Join, Operation::Join(JoinSpec::on("k")), &["a_out", "b_out"], "ab_out"),
            Step::memory("abc", StepKind::Join, Operation::Join(JoinSpec::on("k")), &["ab_out", "c_out"], "abc_out"),
            Step::final_step("f", "abc_out"),
        ]);

        let output = assert_ok!(executor(registry(&document, &analytical)).execute(plan).await);
        assert_eq!(document.call_count("a"), 1);
        assert_eq!(document.call_count("b"), 1);
        assert_eq!(analytical.call_count("SELECT k"), 1);
        assert_eq!(output.rows.rows(), &[row! { "k" => 1, "x_x" => "a", "x_y" => "b" }]);
        assert_eq!(output.telemetry.records.len(), 6);
    }

    #[tokio::test]
    async fn test_malformed_memory_steps_are_rejected_before_any_call() {
        let document = Arc::new(ScriptedAdapter::new(DataSource::Document).respond("events", vec![]));
        let analytical = Arc::new(ScriptedAdapter::new(DataSource::Analytical));
        let executor = executor(registry(&document, &analytical));

        let one_sided_join = Plan::new(vec![
            find("a", "events", "a_out"),
            Step::memory("j", StepKind::Join, Operation::Join(JoinSpec::on("user_id")), &["a_out"], "j_out"),
            Step::final_step("f", "j_out"),
        ]);
        let err = assert_err!(executor.execute(one_sided_join).await);
        assert!(matches!(err, EngineError::Validation(PlanValidationError::InvalidStep { .. })));

        let undeclared_input = Plan::new(vec![
            find("a", "events", "a_out"),
            Step::memory("g", StepKind::Filter, not_in("user_id", "ghost"), &["a_out"], "g_out"),
            Step::final_step("f", "g_out"),
        ]);
        let err = assert_err!(executor.execute(undeclared_input).await);
        assert!(matches!(err, EngineError::Validation(PlanValidationError::InvalidStep { .. })));
        assert_eq!(document.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_memory_step_failure_cancels_in_flight_queries() {
        let document = Arc::new(ScriptedAdapter::new(DataSource::Document).respond("events", vec![row! { "user_id" => 1 }]));
        let analytical = Arc::new(
            ScriptedAdapter::new(DataSource::Analytical)
                .respond("SELECT user_id FROM purchases", vec![])
                .delay("SELECT user_id FROM purchases", Duration::from_secs(5)),
        );
        let select_country = Operation::Transform(TransformSpec {
            transformations: vec![Transformation::SelectColumns { columns: vec!["country".to_string()] }],
        });
        let plan = Plan::new(vec![
            find("viewed", "events", "viewed"),
            sql("purchased", "SELECT user_id FROM purchases", "purchased"),
            Step::memory("shape", StepKind::Transform, select_country, &["viewed"], "shaped"),
            Step::memory("joined", StepKind::Join, Operation::Join(JoinSpec::on("user_id")), &["shaped", "purchased"], "joined"),
            Step::final_step("final", "joined"),
        ]);

        let err = assert_err!(executor(registry(&document, &analytical)).execute(plan).await);
        let EngineError::Execution(ExecutionError::StepFailed(report)) = err else {
            panic!("expected a step failure, got {:?}", err);
        };
        let cause = report.root_cause.as_ref().unwrap();
        assert_eq!(cause.step_id, "shape");
        assert_eq!(cause.kind, FailureKind::CombinatorFailed);
        assert_eq!(cause.backend, DataSource::Memory);
        assert!(cause.message.contains("country"));

        assert_eq!(report.succeeded, vec!["viewed".to_string()]);
        assert_eq!(report.cancelled, vec!["purchased".to_string()]);
        assert_eq!(report.skipped, vec!["joined".to_string(), "final".to_string()]);
        assert_eq!(report.telemetry.record("shape").unwrap().outcome, StepOutcome::Failed);
        assert_eq!(report.telemetry.record("purchased").unwrap().outcome, StepOutcome::Cancelled);
        assert_eq!(report.telemetry.record("final").unwrap().outcome, StepOutcome::Skipped);
    }

    fn err_report(err: &EngineError) -> &FailureReport {
        match err {
            EngineError::Execution(e) => e.report(),
            other => panic!("expected an execution error, got {:?}", other),
        }
    }
}
