//! Scripted adapter for tests and local runs

use super::{AdapterError, DataSourceAdapter};
use crate::plan::{DataSource, QueryPayload};
use crate::row::{Row, RowSet};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// One observed `execute` call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub key: String,
    pub started: Instant,
    /// Unset while the call is in flight or if it was cancelled
    pub finished: Option<Instant>,
}

impl CallRecord {
    /// Whether two calls were executing at the same time
    pub fn overlaps(&self, other: &CallRecord) -> bool {
        let self_end = self.finished.unwrap_or_else(Instant::now);
        let other_end = other.finished.unwrap_or_else(Instant::now);
        self.started < other_end && other.started < self_end
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Rows(RowSet),
    Fail(AdapterError),
}

#[derive(Debug, Default)]
struct Script {
    queued: VecDeque<Reply>,
    fallback: Option<Reply>,
    delay: Duration,
}

/// Adapter answering from canned replies keyed by [`QueryPayload::key`]
/// (collection name or SQL text)
#[derive(Debug)]
pub struct ScriptedAdapter {
    source: DataSource,
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<CallRecord>>,
}

impl ScriptedAdapter {
    pub fn new(source: DataSource) -> Self {
        Self {
            source,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn script(self, key: &str, edit: impl FnOnce(&mut Script)) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            edit(scripts.entry(key.to_string()).or_default());
        }
        self
    }

    /// Answer every call for `key` with these rows
    pub fn respond(self, key: &str, rows: Vec<Row>) -> Self {
        self.script(key, |s| s.fallback = Some(Reply::Rows(RowSet::new(rows))))
    }

    /// Fail every call for `key`
    pub fn fail(self, key: &str, error: AdapterError) -> Self {
        self.script(key, |s| s.fallback = Some(Reply::Fail(error)))
    }

    /// Fail the next `times` calls for `key`, then fall back to its response
    pub fn fail_times(self, key: &str, times: usize, error: AdapterError) -> Self {
        self.script(key, |s| {
            for _ in 0..times {
                s.queued.push_back(Reply::Fail(error.clone()));
            }
        })
    }

    /// Hold each call for `key` before replying
    pub fn delay(self, key: &str, delay: Duration) -> Self {
        self.script(key, |s| s.delay = delay)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, key: &str) -> usize {
        self.calls().iter().filter(|c| c.key == key).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls().len()
    }

    fn next_reply(&self, key: &str) -> (Duration, Option<Reply>) {
        match self.scripts.lock() {
            Ok(mut scripts) => match scripts.get_mut(key) {
                Some(script) => {
                    let reply = script.queued.pop_front().or_else(|| script.fallback.clone());
                    (script.delay, reply)
                }
                None => (Duration::ZERO, None),
            },
            Err(_) => (Duration::ZERO, None),
        }
    }
}

#[async_trait]
impl DataSourceAdapter for ScriptedAdapter {
    fn source(&self) -> DataSource {
        self.source
    }

    async fn execute(&self, query: &QueryPayload, _deadline: Instant) -> Result<RowSet, AdapterError> {
        let key = query.key().to_string();
        let position = match self.calls.lock() {
            Ok(mut calls) => {
                calls.push(CallRecord {
                    key: key.clone(),
                    started: Instant::now(),
                    finished: None,
                });
                Some(calls.len() - 1)
            }
            Err(_) => None,
        };

        let (delay, reply) = self.next_reply(&key);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let (Some(position), Ok(mut calls)) = (position, self.calls.lock()) {
            calls[position].finished = Some(Instant::now());
        }

        match reply {
            Some(Reply::Rows(rows)) => Ok(rows),
            Some(Reply::Fail(error)) => Err(error),
            None => Err(AdapterError::backend_rejected(format!("no scripted reply for '{}'", key))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{AnalyticalQuery, DocumentQuery};
    use crate::row;
    use serde_json::json;

    fn collection(name: &str) -> QueryPayload {
        QueryPayload::Document(DocumentQuery::find(name, json!({})))
    }

    #[tokio::test]
    async fn test_fail_times_then_respond() {
        let adapter = ScriptedAdapter::new(DataSource::Document)
            .respond("users", vec![row! { "id" => 1 }])
            .fail_times("users", 2, AdapterError::timeout("slow"));
        let deadline = Instant::now() + Duration::from_secs(1);

        assert!(adapter.execute(&collection("users"), deadline).await.is_err());
        assert!(adapter.execute(&collection("users"), deadline).await.is_err());
        let rows = adapter.execute(&collection("users"), deadline).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(adapter.call_count("users"), 3);
    }

    #[tokio::test]
    async fn test_unscripted_key_is_rejected() {
        let adapter = ScriptedAdapter::new(DataSource::Analytical);
        let query = QueryPayload::Analytical(AnalyticalQuery::sql("SELECT 2"));
        let err = adapter
            .execute(&query, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::adapter::AdapterErrorKind::BackendRejected);
    }

    #[tokio::test]
    async fn test_delay_records_window() {
        let adapter = ScriptedAdapter::new(DataSource::Document)
            .respond("slow", vec![])
            .delay("slow", Duration::from_millis(20));
        adapter
            .execute(&collection("slow"), Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        let calls = adapter.calls();
        let call = &calls[0];
        let finished = call.finished.unwrap();
        assert!(finished - call.started >= Duration::from_millis(20));
    }
}
