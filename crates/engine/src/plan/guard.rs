//! Static safety checks on query payloads
//!
//! Runs during plan validation, so an unsafe query rejects the whole plan
//! before any adapter is called.

use super::{DocumentQuery, QueryPayload};
use fedq_common::config::GuardConfig;
use regex_lite::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const DANGEROUS_DOCUMENT_KEYS: &[&str] = &["$where", "$function", "$accumulator", "$eval", "mapReduce"];
const WRITE_STAGES: &[&str] = &["$out", "$merge"];
const RESERVED_NAMESPACES: &[&str] = &["system.", "admin.", "config.", "local."];

#[derive(Debug, Clone)]
pub struct QueryGuard {
    max_query_size: usize,
    allow_writes: bool,
}

impl Default for QueryGuard {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}

impl QueryGuard {
    pub fn new(max_query_size: usize, allow_writes: bool) -> Self {
        Self { max_query_size, allow_writes }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new(config.max_query_size, config.enable_write_operations)
    }

    /// Returns the reason a payload is rejected
    pub fn check(&self, payload: &QueryPayload) -> Result<(), String> {
        match payload {
            QueryPayload::Document(query) => self.check_document(query),
            QueryPayload::Analytical(query) => self.check_sql(&query.query),
        }
    }

    fn check_document(&self, query: &DocumentQuery) -> Result<(), String> {
        let text = serde_json::to_string(query).map_err(|e| e.to_string())?;
        if text.len() > self.max_query_size {
            return Err(format!("query exceeds maximum size of {} characters", self.max_query_size));
        }

        let collection = query.collection.to_ascii_lowercase();
        if RESERVED_NAMESPACES.iter().any(|ns| collection.starts_with(ns)) {
            return Err(format!("collection '{}' is reserved", query.collection));
        }

        let body = [Value::Object(query.filter.clone()), Value::Array(query.pipeline.clone())];
        for key in DANGEROUS_DOCUMENT_KEYS {
            if body.iter().any(|v| contains_key(v, key)) {
                return Err(format!("query contains dangerous operation {}", key));
            }
        }
        if !self.allow_writes {
            for stage in WRITE_STAGES {
                if query.pipeline.iter().any(|v| contains_key(v, stage)) {
                    return Err(format!("write stage {} is disabled", stage));
                }
            }
        }

        let patterns = patterns()?;
        let pipeline_text = serde_json::to_string(&body).map_err(|e| e.to_string())?;
        if patterns.namespace.is_match(&pipeline_text) {
            return Err("query references a reserved namespace".to_string());
        }
        if patterns.javascript.is_match(&pipeline_text) {
            return Err("query contains JavaScript".to_string());
        }
        Ok(())
    }

    fn check_sql(&self, sql: &str) -> Result<(), String> {
        if sql.trim().is_empty() {
            return Err("query is empty".to_string());
        }
        if sql.len() > self.max_query_size {
            return Err(format!("query exceeds maximum size of {} characters", self.max_query_size));
        }

        let patterns = patterns()?;
        if let Some(found) = patterns.forbidden.find(sql) {
            return Err(format!("forbidden keyword {}", found.as_str().to_ascii_uppercase()));
        }
        if !self.allow_writes {
            if let Some(found) = patterns.write.find(sql) {
                return Err(format!("write statement {} is disabled", found.as_str().to_ascii_uppercase()));
            }
        }

        let statements = sql.split(';').filter(|s| !s.trim().is_empty()).count();
        if statements > 1 {
            return Err("multi-statement queries are not allowed".to_string());
        }
        if sql.contains("--") || sql.contains("/*") {
            return Err("SQL comments are not allowed".to_string());
        }
        Ok(())
    }
}

fn contains_key(value: &Value, key: &str) -> bool {
    match value {
        Value::Object(map) => map.contains_key(key) || map.values().any(|v| contains_key(v, key)),
        Value::Array(items) => items.iter().any(|v| contains_key(v, key)),
        _ => false,
    }
}

struct Patterns {
    forbidden: Regex,
    write: Regex,
    namespace: Regex,
    javascript: Regex,
}

fn patterns() -> Result<&'static Patterns, String> {
    static PATTERNS: OnceLock<Result<Patterns, String>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let compile = |p: &str| Regex::new(p).map_err(|e| e.to_string());
            Ok(Patterns {
                forbidden: compile(r"(?i)\b(DROP|TRUNCATE|ALTER|GRANT|REVOKE|SYSTEM|SHUTDOWN|KILL|OUTFILE)\b")?,
                write: compile(r"(?i)\b(INSERT|UPDATE|DELETE|CREATE|RENAME|OPTIMIZE)\b")?,
                namespace: compile(r#""(system|admin|config|local)\."#)?,
                javascript: compile(r"function\s*\(|=>|\bthis\.|\bprototype\b|\bconstructor\b")?,
            })
        })
        .as_ref()
        .map_err(|e| format!("query guard unavailable: {}", e))
}
