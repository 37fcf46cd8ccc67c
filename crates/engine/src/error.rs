//! Engine error taxonomy and its mapping onto service errors

use crate::executor::FailureReport;
use crate::plan::DataSource;
use fedq_common::errors::AppError;
use thiserror::Error;

/// Plan rejected before any step executes
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanValidationError {
    #[error("plan has no steps")]
    Empty,

    #[error("duplicate step id '{step_id}'")]
    DuplicateStepId { step_id: String },

    #[error("output variable '{output_var}' is produced by both '{first}' and '{second}'")]
    DuplicateOutputVar {
        output_var: String,
        first: String,
        second: String,
    },

    #[error("step '{step_id}' depends on '{input}', which no step produces")]
    DanglingInput { step_id: String, input: String },

    #[error("dependency cycle through steps {steps:?}")]
    Cycle { steps: Vec<String> },

    #[error("plan has no final step")]
    MissingFinal,

    #[error("plan has more than one final step: {steps:?}")]
    MultipleFinal { steps: Vec<String> },

    #[error("final step '{step_id}' is consumed by '{consumer}'")]
    FinalNotTerminal { step_id: String, consumer: String },

    #[error("steps {steps:?} do not contribute to the final step")]
    OrphanStep { steps: Vec<String> },

    #[error("step '{step_id}' is invalid: {reason}")]
    InvalidStep { step_id: String, reason: String },

    #[error("step '{step_id}' carries an unsafe query: {reason}")]
    UnsafeQuery { step_id: String, reason: String },

    #[error("no adapter registered for {backend} (step '{step_id}')")]
    NoAdapter { step_id: String, backend: DataSource },
}

/// Plan failed while running
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("{}", describe_failure(.0))]
    StepFailed(Box<FailureReport>),

    #[error("plan deadline of {deadline_ms}ms exceeded; pending {pending:?}, running {running:?}")]
    DeadlineExceeded {
        deadline_ms: u64,
        pending: Vec<String>,
        running: Vec<String>,
        report: Box<FailureReport>,
    },
}

fn describe_failure(report: &FailureReport) -> String {
    match &report.root_cause {
        Some(cause) => format!(
            "step '{}' failed on {} after {} attempt(s): {} ({})",
            cause.step_id, cause.backend, cause.attempts, cause.kind, cause.message
        ),
        None => "plan failed".to_string(),
    }
}

impl ExecutionError {
    pub fn report(&self) -> &FailureReport {
        match self {
            ExecutionError::StepFailed(report) => report,
            ExecutionError::DeadlineExceeded { report, .. } => report,
        }
    }
}

/// Broken engine invariants; never caused by the plan itself
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InternalConsistencyError {
    #[error("output '{output_var}' read before it was published")]
    NotYetAvailable { output_var: String },

    #[error("output '{output_var}' published twice")]
    DuplicateOutput { output_var: String },

    #[error("scheduler stalled with unfinished steps {steps:?}")]
    Stalled { steps: Vec<String> },

    #[error("task for step '{step_id}' was lost: {reason}")]
    TaskLost { step_id: String, reason: String },
}

/// Top-level engine error
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] PlanValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Internal(#[from] InternalConsistencyError),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(PlanValidationError::UnsafeQuery { step_id, reason }) => {
                AppError::UnsafeQuery {
                    message: format!("step '{}': {}", step_id, reason),
                }
            }
            EngineError::Validation(e) => AppError::InvalidPlan {
                message: e.to_string(),
                details: None,
            },
            EngineError::Execution(e) => {
                let message = e.to_string();
                let details = serde_json::to_value(e.report()).ok();
                match e {
                    ExecutionError::StepFailed(_) => AppError::StepFailed { message, details },
                    ExecutionError::DeadlineExceeded { deadline_ms, .. } => {
                        AppError::DeadlineExceeded { deadline_ms, details }
                    }
                }
            }
            EngineError::Internal(e) => AppError::Internal {
                message: e.to_string(),
            },
        }
    }
}
