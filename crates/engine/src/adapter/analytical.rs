//! Analytical store adapter over the ClickHouse HTTP interface

use super::{remaining, AdapterError, AdapterErrorKind, DataSourceAdapter};
use crate::plan::{AnalyticalQuery, DataSource, QueryPayload};
use crate::row::{Row, RowSet};
use async_trait::async_trait;
use fedq_common::config::ClickHouseConfig;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

pub struct AnalyticalStoreAdapter {
    client: Client,
    url: String,
    database: String,
    user: String,
    password: String,
}

impl AnalyticalStoreAdapter {
    pub fn connect(config: &ClickHouseConfig) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| AdapterError::connection_lost(format!("failed to build HTTP client: {}", e)))?;

        tracing::info!(url = %config.url, database = %config.database, "Analytical store client ready");

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn query_params(&self, query: &AnalyticalQuery, time_left: Duration) -> Vec<(String, String)> {
        let mut params = vec![
            ("database".to_string(), self.database.clone()),
            ("default_format".to_string(), "JSONEachRow".to_string()),
            ("output_format_json_quote_64bit_integers".to_string(), "0".to_string()),
            // Server-side limit is whole seconds; never send 0, which disables it
            ("max_execution_time".to_string(), time_left.as_secs().max(1).to_string()),
        ];
        for (name, value) in &query.params {
            params.push((format!("param_{}", name), format_param(value)));
        }
        for (name, value) in &query.settings {
            params.push((name.clone(), format_setting(value)));
        }
        params
    }

    async fn run(&self, query: &AnalyticalQuery, time_left: Duration) -> Result<RowSet, AdapterError> {
        let response = self
            .client
            .post(&self.url)
            .query(&self.query_params(query, time_left))
            .basic_auth(&self.user, Some(&self.password))
            .timeout(time_left)
            .body(query.query.clone())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let header_code = response
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i32>().ok());
        let body = response.text().await.map_err(classify_transport)?;

        if !status.is_success() || header_code.is_some() {
            return Err(classify_response(status, header_code, &body));
        }
        parse_rows(&body)
    }
}

#[async_trait]
impl DataSourceAdapter for AnalyticalStoreAdapter {
    fn source(&self) -> DataSource {
        DataSource::Analytical
    }

    async fn execute(&self, query: &QueryPayload, deadline: Instant) -> Result<RowSet, AdapterError> {
        let QueryPayload::Analytical(query) = query else {
            return Err(AdapterError::invalid_query("analytical adapter received a non-SQL payload"));
        };
        let time_left = remaining(deadline)?;
        tracing::debug!(params = query.params.len(), "Running analytical query");
        self.run(query, time_left).await
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        let response = self
            .client
            .get(format!("{}/ping", self.url))
            .send()
            .await
            .map_err(classify_transport)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdapterError::backend_rejected(format!("ping returned {}", response.status())))
        }
    }
}

/// Failure class of a server exception code
pub(crate) fn classify_exception(code: i32) -> AdapterErrorKind {
    match code {
        // SYNTAX_ERROR, UNKNOWN_IDENTIFIER, UNKNOWN_FUNCTION, UNKNOWN_TABLE,
        // UNKNOWN_DATABASE, ILLEGAL_TYPE_OF_ARGUMENT-adjacent parse failures
        62 | 46 | 47 | 60 | 81 | 386 => AdapterErrorKind::InvalidQuery,
        // TIMEOUT_EXCEEDED, TOO_SLOW
        159 | 160 => AdapterErrorKind::Timeout,
        _ => AdapterErrorKind::BackendRejected,
    }
}

fn classify_response(status: StatusCode, header_code: Option<i32>, body: &str) -> AdapterError {
    let code = header_code.or_else(|| body_code(body));
    let message = body.lines().next().unwrap_or_default().trim().to_string();
    match code {
        Some(code) => AdapterError::new(classify_exception(code), message),
        None if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::BAD_GATEWAY => {
            AdapterError::connection_lost(format!("{}: {}", status, message))
        }
        None => AdapterError::backend_rejected(format!("{}: {}", status, message)),
    }
}

/// Extract `N` from a `Code: N. DB::Exception: ...` body
fn body_code(body: &str) -> Option<i32> {
    let rest = &body[body.find("Code:")? + "Code:".len()..];
    let digits: String = rest.trim_start().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn classify_transport(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        AdapterError::connection_lost(err.to_string())
    } else {
        AdapterError::backend_rejected(err.to_string())
    }
}

/// Parse a `JSONEachRow` body, one object per line
fn parse_rows(body: &str) -> Result<RowSet, AdapterError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(row)) => Ok(row),
            Ok(other) => Err(AdapterError::backend_rejected(format!("expected a row object, got {}", other))),
            Err(e) => Err(AdapterError::connection_lost(format!("truncated response: {}", e))),
        })
        .collect::<Result<Vec<Row>, _>>()
        .map(RowSet::new)
}

/// Render a parameter in the server's text literal syntax
fn format_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "\\N".to_string(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(format_literal).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

fn format_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Null => "NULL".to_string(),
        Value::Array(_) => format_param(value),
        other => other.to_string(),
    }
}

fn format_setting(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => u8::from(*b).to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exception_codes() {
        assert_eq!(classify_exception(62), AdapterErrorKind::InvalidQuery);
        assert_eq!(classify_exception(60), AdapterErrorKind::InvalidQuery);
        assert_eq!(classify_exception(159), AdapterErrorKind::Timeout);
        assert_eq!(classify_exception(241), AdapterErrorKind::BackendRejected);
    }

    #[test]
    fn test_code_from_body() {
        let body = "Code: 62. DB::Exception: Syntax error: failed at position 8";
        assert_eq!(body_code(body), Some(62));
        assert_eq!(body_code("plain failure"), None);

        let err = classify_response(StatusCode::BAD_REQUEST, None, body);
        assert_eq!(err.kind, AdapterErrorKind::InvalidQuery);
        assert!(err.message.starts_with("Code: 62"));
    }

    #[test]
    fn test_header_code_wins() {
        let err = classify_response(StatusCode::INTERNAL_SERVER_ERROR, Some(159), "Code: 62.");
        assert_eq!(err.kind, AdapterErrorKind::Timeout);
        let err = classify_response(StatusCode::SERVICE_UNAVAILABLE, None, "overloaded");
        assert_eq!(err.kind, AdapterErrorKind::ConnectionLost);
    }

    #[test]
    fn test_parse_json_each_row() {
        let rows = parse_rows("{\"user_id\":1}\n{\"user_id\":2}\n\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.rows()[1]["user_id"], json!(2));

        assert!(parse_rows("[1,2]").is_err());
        assert_eq!(parse_rows("{\"a\":").unwrap_err().kind, AdapterErrorKind::ConnectionLost);
        assert!(parse_rows("").unwrap().is_empty());
    }

    #[test]
    fn test_param_formatting() {
        assert_eq!(format_param(&json!("2024-01-01")), "2024-01-01");
        assert_eq!(format_param(&json!(42)), "42");
        assert_eq!(format_param(&json!(["a", 1, "it's"])), "['a',1,'it\\'s']");
        assert_eq!(format_param(&Value::Null), "\\N");
        assert_eq!(format_setting(&json!(true)), "1");
    }
}
