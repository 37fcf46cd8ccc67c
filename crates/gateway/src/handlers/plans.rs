//! Plan handlers

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use fedq_common::{
    errors::{AppError, Result},
    metrics::RequestMetrics,
};
use fedq_engine::{EngineError, ExecuteOptions, ExecutionSummary, PlanSpec, PlanTelemetry, Row};

/// Plan execution request
#[derive(Debug, Deserialize, Validate)]
pub struct ExecuteRequest {
    pub plan: PlanSpec,

    /// Overall plan deadline, capped by the server request timeout
    #[serde(default)]
    #[validate(range(min = 1, max = 3_600_000))]
    pub deadline_ms: Option<u64>,

    /// Truncate the returned rows
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_rows: Option<usize>,
}

#[derive(Serialize)]
pub struct ExecuteResponse {
    pub plan_id: Uuid,
    pub rows: Vec<Row>,
    /// Rows produced before truncation
    pub row_count: usize,
    pub truncated: bool,
    pub telemetry: PlanTelemetry,
    pub summary: ExecutionSummary,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub plan: PlanSpec,
}

#[derive(Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub plan_id: Uuid,
    /// Step ids in dispatch order
    pub order: Vec<String>,
}

/// Execute a plan and return the final step's rows
pub async fn execute_plan(
    State(state): State<AppState>,
    request: std::result::Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>> {
    let metrics = RequestMetrics::start("POST", "/v1/plans/execute");
    let result = match request {
        Ok(Json(request)) => execute(&state, request).await,
        Err(rejection) => Err(rejection.into()),
    };
    metrics.finish(match &result {
        Ok(_) => 200,
        Err(e) => e.status_code().as_u16(),
    });
    result.map(Json)
}

async fn execute(state: &AppState, request: ExecuteRequest) -> Result<ExecuteResponse> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let plan = request.plan.into_plan().map_err(EngineError::from)?;
    let deadline = request
        .deadline_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.executor.default_deadline())
        .min(state.config.request_timeout());

    let output = state
        .executor
        .execute_with(plan, ExecuteOptions { deadline: Some(deadline) })
        .await?;

    let row_count = output.rows.len();
    let mut rows = output.rows.into_rows();
    let truncated = request.max_rows.is_some_and(|max| row_count > max);
    if let Some(max) = request.max_rows {
        rows.truncate(max);
    }

    tracing::info!(
        plan_id = %output.plan_id,
        rows = row_count,
        truncated,
        duration_ms = output.telemetry.duration_ms,
        "Plan request completed"
    );

    Ok(ExecuteResponse {
        plan_id: output.plan_id,
        rows,
        row_count,
        truncated,
        telemetry: output.telemetry,
        summary: output.summary,
    })
}

/// Validate a plan without executing it
pub async fn validate_plan(
    State(state): State<AppState>,
    request: std::result::Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<Json<ValidateResponse>> {
    let metrics = RequestMetrics::start("POST", "/v1/plans/validate");
    let result = request
        .map_err(AppError::from)
        .and_then(|Json(request)| validate(&state, request));
    metrics.finish(match &result {
        Ok(_) => 200,
        Err(e) => e.status_code().as_u16(),
    });
    result.map(Json)
}

fn validate(state: &AppState, request: ValidateRequest) -> Result<ValidateResponse> {
    let plan = request.plan.into_plan().map_err(EngineError::from)?;
    let graph = state.executor.validate(&plan).map_err(EngineError::from)?;

    Ok(ValidateResponse {
        valid: true,
        plan_id: plan.id,
        order: graph.order.iter().map(|&i| plan.steps[i].id.clone()).collect(),
    })
}
