//! fedq Engine
//!
//! Federated query execution over a document store and an analytical store:
//! - Plan model, structural validation and the query guard
//! - Data source adapters behind one async contract
//! - In-memory combinators (filter, join, reshaping)
//! - Dependency-driven executor with bounded concurrency, retries and deadlines
//! - Per-step execution telemetry

pub mod adapter;
pub mod combinator;
pub mod error;
pub mod executor;
pub mod plan;
pub mod retry;
pub mod row;
pub mod store;
pub mod telemetry;

pub use adapter::{AdapterError, AdapterErrorKind, AdapterRegistry, DataSourceAdapter};
pub use error::{EngineError, ExecutionError, InternalConsistencyError, PlanValidationError};
pub use executor::{ExecuteOptions, Executor, FailureReport, PlanOutput};
pub use plan::{DataSource, Plan, PlanSpec, Step, StepKind};
pub use row::{Row, RowSet};
pub use telemetry::{ExecutionSummary, PlanTelemetry, TelemetryRecord, TelemetrySink};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
