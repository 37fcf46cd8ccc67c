//! Data source adapters
//!
//! Every backend sits behind [`DataSourceAdapter`]: one shared instance per
//! backend family, callable concurrently, with no retries of its own. Adapters
//! normalize native results into [`RowSet`]s and classify failures into
//! [`AdapterErrorKind`]s the executor can act on.

mod analytical;
mod document;
mod mock;

pub use analytical::AnalyticalStoreAdapter;
pub use document::DocumentStoreAdapter;
pub use mock::{CallRecord, ScriptedAdapter};

use crate::plan::{DataSource, QueryPayload};
use crate::row::RowSet;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Failure class of an adapter call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    Timeout,
    ConnectionLost,
    InvalidQuery,
    BackendRejected,
}

impl AdapterErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterErrorKind::Timeout => "timeout",
            AdapterErrorKind::ConnectionLost => "connection_lost",
            AdapterErrorKind::InvalidQuery => "invalid_query",
            AdapterErrorKind::BackendRejected => "backend_rejected",
        }
    }

    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterErrorKind::Timeout | AdapterErrorKind::ConnectionLost)
    }
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::ConnectionLost, message)
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::InvalidQuery, message)
    }

    pub fn backend_rejected(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::BackendRejected, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Uniform contract over a concrete backend
#[async_trait]
pub trait DataSourceAdapter: Send + Sync {
    /// Backend family this adapter serves
    fn source(&self) -> DataSource;

    /// Run one query. Implementations should give up by `deadline`.
    async fn execute(&self, query: &QueryPayload, deadline: Instant) -> Result<RowSet, AdapterError>;

    /// Cheap liveness round-trip used by readiness probes
    async fn ping(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Drain pooled connections
    async fn shutdown(&self) {}
}

/// Process-wide adapters, one per backend family
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<DataSource, Arc<dyn DataSourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under the source it reports, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn DataSourceAdapter>) -> &mut Self {
        self.adapters.insert(adapter.source(), adapter);
        self
    }

    pub fn with(mut self, adapter: Arc<dyn DataSourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, source: DataSource) -> Option<Arc<dyn DataSourceAdapter>> {
        self.adapters.get(&source).cloned()
    }

    pub fn contains(&self, source: DataSource) -> bool {
        self.adapters.contains_key(&source)
    }

    pub fn sources(&self) -> Vec<DataSource> {
        self.adapters.keys().copied().collect()
    }

    /// Ping every adapter, reporting round-trip latency per backend
    pub async fn ping_all(&self) -> Vec<(DataSource, Result<Duration, AdapterError>)> {
        let checks = self.adapters.iter().map(|(source, adapter)| async move {
            let start = Instant::now();
            let result = adapter.ping().await.map(|_| start.elapsed());
            (*source, result)
        });
        futures::future::join_all(checks).await
    }

    pub async fn shutdown_all(&self) {
        for (source, adapter) in &self.adapters {
            tracing::info!(backend = %source, "Draining adapter");
            adapter.shutdown().await;
        }
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.sources())
            .finish()
    }
}

/// Time left until `deadline`, or an immediate timeout
pub(crate) fn remaining(deadline: Instant) -> Result<Duration, AdapterError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(AdapterError::timeout("deadline already passed"))
    } else {
        Ok(left)
    }
}
