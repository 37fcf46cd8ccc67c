//! Document store adapter backed by the MongoDB driver

use super::{remaining, AdapterError, AdapterErrorKind, DataSourceAdapter};
use crate::plan::{DataSource, DocumentOperation, DocumentQuery, QueryPayload};
use crate::row::{Row, RowSet};
use async_trait::async_trait;
use fedq_common::config::MongoConfig;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{AggregateOptions, ClientOptions, CountOptions, FindOptions};
use mongodb::{Client, Database};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;

/// Server error codes treated as malformed queries
const INVALID_QUERY_CODES: &[i32] = &[2, 9, 14, 15, 17, 168, 40324, 31249];
/// MaxTimeMSExpired
const TIME_LIMIT_CODE: i32 = 50;

pub struct DocumentStoreAdapter {
    client: Client,
    database: Database,
}

impl DocumentStoreAdapter {
    /// Build the shared client; connections are established lazily by the pool
    pub async fn connect(config: &MongoConfig) -> Result<Self, AdapterError> {
        let mut options = ClientOptions::parse(&config.uri).await.map_err(classify)?;
        options.app_name = Some(config.app_name.clone());
        options.max_pool_size = Some(config.max_pool_size);
        options.connect_timeout = Some(Duration::from_millis(config.connect_timeout_ms));
        options.server_selection_timeout = Some(Duration::from_millis(config.connect_timeout_ms));

        let client = Client::with_options(options).map_err(classify)?;
        let database = client.database(&config.database);

        tracing::info!(database = %config.database, "Document store client ready");
        Ok(Self { client, database })
    }

    async fn run(&self, query: &DocumentQuery, time_left: Duration) -> Result<RowSet, AdapterError> {
        let collection = self.database.collection::<Document>(&query.collection);
        let filter = to_document(&Value::Object(query.filter.clone()))?;

        match query.operation {
            DocumentOperation::Find => {
                let mut options = FindOptions::default();
                options.projection = query.options.projection.as_ref().map(to_map_document).transpose()?;
                options.sort = query.options.sort.as_ref().map(to_map_document).transpose()?;
                options.limit = query.options.limit;
                options.skip = query.options.skip;
                options.max_time = Some(time_left);

                let cursor = collection.find(filter).with_options(options).await.map_err(classify)?;
                let docs: Vec<Document> = cursor.try_collect().await.map_err(classify)?;
                Ok(docs.into_iter().map(document_to_row).collect())
            }
            DocumentOperation::Aggregate => {
                let pipeline = query
                    .pipeline
                    .iter()
                    .map(to_document)
                    .collect::<Result<Vec<_>, _>>()?;
                let mut options = AggregateOptions::default();
                options.max_time = Some(time_left);

                let cursor = collection.aggregate(pipeline).with_options(options).await.map_err(classify)?;
                let docs: Vec<Document> = cursor.try_collect().await.map_err(classify)?;
                Ok(docs.into_iter().map(document_to_row).collect())
            }
            DocumentOperation::Count => {
                let mut options = CountOptions::default();
                options.max_time = Some(time_left);

                let count = collection
                    .count_documents(filter)
                    .with_options(options)
                    .await
                    .map_err(classify)?;
                let mut row = Row::new();
                row.insert("count".to_string(), Value::from(count));
                Ok(RowSet::new(vec![row]))
            }
        }
    }
}

#[async_trait]
impl DataSourceAdapter for DocumentStoreAdapter {
    fn source(&self) -> DataSource {
        DataSource::Document
    }

    async fn execute(&self, query: &QueryPayload, deadline: Instant) -> Result<RowSet, AdapterError> {
        let QueryPayload::Document(query) = query else {
            return Err(AdapterError::invalid_query("document adapter received a non-document payload"));
        };
        let time_left = remaining(deadline)?;
        tracing::debug!(collection = %query.collection, operation = ?query.operation, "Running document query");
        self.run(query, time_left).await
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn shutdown(&self) {
        self.client.clone().shutdown().await;
    }
}

/// Map driver errors onto the adapter taxonomy
fn classify(err: MongoError) -> AdapterError {
    let kind = match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => {
            AdapterErrorKind::ConnectionLost
        }
        ErrorKind::Command(command) if command.code == TIME_LIMIT_CODE => AdapterErrorKind::Timeout,
        ErrorKind::Command(command) if INVALID_QUERY_CODES.contains(&command.code) => {
            AdapterErrorKind::InvalidQuery
        }
        ErrorKind::InvalidArgument { .. }
        | ErrorKind::BsonDeserialization(_)
        | ErrorKind::BsonSerialization(_) => AdapterErrorKind::InvalidQuery,
        _ => AdapterErrorKind::BackendRejected,
    };
    AdapterError::new(kind, err.to_string())
}

/// Convert extended JSON (`{"$oid": ..}`, `{"$date": ..}`) into a BSON document
fn to_document(value: &Value) -> Result<Document, AdapterError> {
    match Bson::try_from(value.clone()) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(AdapterError::invalid_query(format!(
            "expected a document, got {:?}",
            other.element_type()
        ))),
        Err(e) => Err(AdapterError::invalid_query(e.to_string())),
    }
}

fn to_map_document(map: &Map<String, Value>) -> Result<Document, AdapterError> {
    to_document(&Value::Object(map.clone()))
}

fn document_to_row(document: Document) -> Row {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_json(value)))
        .collect()
}

/// Relaxed extended JSON, with object ids and dates flattened to strings
fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or_else(|_| Bson::DateTime(dt).into_relaxed_extjson()),
        Bson::Document(document) => Value::Object(document_to_row(document)),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        other => other.into_relaxed_extjson(),
    }
}
