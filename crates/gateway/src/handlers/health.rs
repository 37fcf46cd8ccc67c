//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::BTreeMap;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    /// Keyed by backend name
    pub checks: BTreeMap<String, CheckResult>,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: fedq_common::VERSION,
    })
}

/// Readiness probe - pings every registered adapter
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let checks: BTreeMap<String, CheckResult> = state
        .executor
        .registry()
        .ping_all()
        .await
        .into_iter()
        .map(|(source, result)| {
            let check = match result {
                Ok(latency) => CheckResult {
                    status: "up".to_string(),
                    latency_ms: Some(latency.as_millis() as u64),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(backend = %source, error = %e, "Readiness check failed");
                    CheckResult {
                        status: "down".to_string(),
                        latency_ms: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            (source.to_string(), check)
        })
        .collect();

    let all_healthy = checks.values().all(|c| c.status == "up");
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
            checks,
        }),
    )
}
