//! Query plan model
//!
//! A [`Plan`] is an ordered list of immutable [`Step`]s whose `inputs` name the
//! output variables of other steps. Plans arrive as JSON ([`PlanSpec`]), are
//! converted into typed steps, then checked by [`graph::validate`] before any
//! step runs.

pub mod graph;
pub mod guard;
mod spec;

pub use graph::DependencyGraph;
pub use guard::QueryGuard;
pub use spec::{PlanSpec, StepSpec};

use crate::combinator::Operation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Role a step plays in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Query,
    Filter,
    Join,
    Transform,
    Final,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Query => "query",
            StepKind::Filter => "filter",
            StepKind::Join => "join",
            StepKind::Transform => "transform",
            StepKind::Final => "final",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a step's work happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataSource {
    /// Document store
    #[serde(rename = "mongodb")]
    Document,
    /// Columnar analytical store
    #[serde(rename = "clickhouse")]
    Analytical,
    /// In-process combinator
    #[serde(rename = "memory")]
    Memory,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Document => "mongodb",
            DataSource::Analytical => "clickhouse",
            DataSource::Memory => "memory",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentOperation {
    #[default]
    Find,
    Aggregate,
    Count,
}

/// Cursor options of a document `find`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
}

/// Query against the document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    pub collection: String,
    #[serde(default)]
    pub operation: DocumentOperation,
    #[serde(default)]
    pub filter: Map<String, Value>,
    #[serde(default)]
    pub pipeline: Vec<Value>,
    #[serde(default)]
    pub options: FindOptions,
}

impl DocumentQuery {
    pub fn find(collection: &str, filter: Value) -> Self {
        Self {
            collection: collection.to_string(),
            operation: DocumentOperation::Find,
            filter: match filter {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            pipeline: Vec::new(),
            options: FindOptions::default(),
        }
    }
}

/// Query against the analytical store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticalQuery {
    pub query: String,
    /// Bound as `{name:Type}` server-side parameters
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

impl AnalyticalQuery {
    pub fn sql(query: &str) -> Self {
        Self {
            query: query.to_string(),
            params: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }
}

/// Backend-specific payload; only the matching adapter interprets it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryPayload {
    Document(DocumentQuery),
    Analytical(AnalyticalQuery),
}

impl QueryPayload {
    pub fn source(&self) -> DataSource {
        match self {
            QueryPayload::Document(_) => DataSource::Document,
            QueryPayload::Analytical(_) => DataSource::Analytical,
        }
    }

    /// Short identity used in logs and by the scripted adapter
    pub fn key(&self) -> &str {
        match self {
            QueryPayload::Document(q) => &q.collection,
            QueryPayload::Analytical(q) => &q.query,
        }
    }
}

/// What a step does once its inputs are available
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Query(QueryPayload),
    Memory(Operation),
}

/// One immutable unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    pub source: DataSource,
    pub action: StepAction,
    pub inputs: Vec<String>,
    pub output_var: String,
}

impl Step {
    pub fn query(id: &str, payload: QueryPayload, output_var: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: StepKind::Query,
            source: payload.source(),
            action: StepAction::Query(payload),
            inputs: Vec::new(),
            output_var: output_var.to_string(),
        }
    }

    pub fn memory(id: &str, kind: StepKind, operation: Operation, inputs: &[&str], output_var: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            source: DataSource::Memory,
            action: StepAction::Memory(operation),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output_var: output_var.to_string(),
        }
    }

    pub fn final_step(id: &str, input: &str) -> Self {
        Self::memory(id, StepKind::Final, Operation::Identity, &[input], &format!("{}_output", id))
    }
}

/// Steps in declaration order, consumed once by the executor
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: Uuid,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { id: Uuid::now_v7(), steps }
    }

    pub fn with_id(id: Uuid, steps: Vec<Step>) -> Self {
        Self { id, steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_source_wire_names() {
        assert_eq!(serde_json::to_value(DataSource::Document).unwrap(), json!("mongodb"));
        let parsed: DataSource = serde_json::from_value(json!("clickhouse")).unwrap();
        assert_eq!(parsed, DataSource::Analytical);
        assert_eq!(DataSource::Memory.to_string(), "memory");
    }

    #[test]
    fn test_payload_source_and_key() {
        let doc = QueryPayload::Document(DocumentQuery::find("events", json!({"type": "view"})));
        assert_eq!(doc.source(), DataSource::Document);
        assert_eq!(doc.key(), "events");

        let sql = QueryPayload::Analytical(AnalyticalQuery::sql("SELECT 1"));
        assert_eq!(sql.source(), DataSource::Analytical);
        assert_eq!(sql.key(), "SELECT 1");
    }

    #[test]
    fn test_document_query_defaults() {
        let q: DocumentQuery = serde_json::from_value(json!({
            "collection": "users",
            "options": {"limit": 5}
        }))
        .unwrap();
        assert_eq!(q.operation, DocumentOperation::Find);
        assert!(q.filter.is_empty());
        assert_eq!(q.options.limit, Some(5));
    }
}
