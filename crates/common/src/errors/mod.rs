//! Error types for fedq services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - HTTP status code mapping
//! - Structured error responses carrying failure reports
//! - Error codes for client handling

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    InvalidFormat,
    PayloadTooLarge,

    // Plan errors (2xxx)
    InvalidPlan,
    UnsafeQuery,

    // Rate limiting (6xxx)
    RateLimited,

    // Execution errors (8xxx)
    StepFailed,
    DeadlineExceeded,

    // Internal errors (9xxx)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidFormat => 1002,
            ErrorCode::PayloadTooLarge => 1003,

            // Plans (2xxx)
            ErrorCode::InvalidPlan => 2001,
            ErrorCode::UnsafeQuery => 2002,

            // Rate limits (6xxx)
            ErrorCode::RateLimited => 6001,

            // Execution (8xxx)
            ErrorCode::StepFailed => 8001,
            ErrorCode::DeadlineExceeded => 8002,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>
    },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    #[error("Payload too large: {message}")]
    PayloadTooLarge { message: String },

    // Plan errors
    #[error("Invalid plan: {message}")]
    InvalidPlan {
        message: String,
        details: Option<serde_json::Value>
    },

    #[error("Unsafe query rejected: {message}")]
    UnsafeQuery { message: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // Execution errors
    #[error("Plan execution failed: {message}")]
    StepFailed {
        message: String,
        details: Option<serde_json::Value>
    },

    #[error("Plan deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded {
        deadline_ms: u64,
        details: Option<serde_json::Value>
    },

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            AppError::InvalidPlan { .. } => ErrorCode::InvalidPlan,
            AppError::UnsafeQuery { .. } => ErrorCode::UnsafeQuery,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::StepFailed { .. } => ErrorCode::StepFailed,
            AppError::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            AppError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } |
            AppError::InvalidFormat { .. } => StatusCode::BAD_REQUEST,

            // 413 Payload Too Large
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 422 Unprocessable Entity
            AppError::InvalidPlan { .. } |
            AppError::UnsafeQuery { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::StepFailed { .. } => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            AppError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Structured details attached to the error, if any
    pub fn details(&self) -> Option<&serde_json::Value> {
        match self {
            AppError::InvalidPlan { details, .. } |
            AppError::StepFailed { details, .. } |
            AppError::DeadlineExceeded { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let details = match self {
            AppError::InvalidPlan { details, .. } |
            AppError::StepFailed { details, .. } |
            AppError::DeadlineExceeded { details, .. } => details,
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details,
                request_id: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Request bodies that fail to parse get the standard error envelope
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        let message = rejection.body_text();
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge { message }
        } else {
            AppError::InvalidFormat { message }
        }
    }
}
