//! In-memory combinators
//!
//! Pure, synchronous operations over already materialized row sets:
//! - `filter`: predicate over the first input, with set membership against others
//! - `join`: key-based equi-join of two inputs
//! - `union`, `sort`, `limit`, `transform`: reshaping of a single input
//! - identity: the pass-through used by terminal steps

mod filter;
mod join;
mod transform;

pub use filter::{FilterSpec, Predicate};
pub use join::{JoinHow, JoinSpec};
pub use transform::{LimitSpec, SortSpec, TransformSpec, Transformation};

use crate::row::RowSet;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while applying a combinator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CombinatorError {
    #[error("input '{name}' was not supplied")]
    MissingInput { name: String },

    #[error("{operation} expects {expected} input(s), got {actual}")]
    InputCount {
        operation: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("{operation} names column '{column}', which no input row carries")]
    UnknownColumn {
        operation: &'static str,
        column: String,
    },
}

/// Declarative in-memory operation of a memory step
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Filter(FilterSpec),
    Join(JoinSpec),
    Union,
    Sort(SortSpec),
    Limit(LimitSpec),
    Transform(TransformSpec),
    Identity,
}

impl Operation {
    /// Parse the wire form: an operation name plus its parameters object
    pub fn parse(name: &str, parameters: Value) -> Result<Self, String> {
        let parameters = match parameters {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let op = match name {
            "filter" => Operation::Filter(decode(name, parameters)?),
            "join" => Operation::Join(decode(name, parameters)?),
            "union" | "concat" => Operation::Union,
            "sort" => Operation::Sort(decode(name, parameters)?),
            "limit" => Operation::Limit(decode(name, parameters)?),
            "transform" => Operation::Transform(decode(name, parameters)?),
            "identity" | "passthrough" => Operation::Identity,
            other => return Err(format!("unsupported memory operation '{}'", other)),
        };
        op.check()?;
        Ok(op)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Filter(_) => "filter",
            Operation::Join(_) => "join",
            Operation::Union => "union",
            Operation::Sort(_) => "sort",
            Operation::Limit(_) => "limit",
            Operation::Transform(_) => "transform",
            Operation::Identity => "identity",
        }
    }

    /// Check parameter consistency that serde alone cannot express
    fn check(&self) -> Result<(), String> {
        match self {
            Operation::Join(spec) => spec.check(),
            Operation::Sort(spec) => spec.check(),
            Operation::Transform(spec) if spec.transformations.is_empty() => {
                Err("transform requires at least one transformation".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Check the number of inputs a step feeds this operation
    pub fn check_arity(&self, inputs: usize) -> Result<(), CombinatorError> {
        let (expected, ok) = match self {
            Operation::Join(_) => ("2", inputs == 2),
            Operation::Filter(_) | Operation::Union => ("at least 1", inputs >= 1),
            Operation::Sort(_)
            | Operation::Limit(_)
            | Operation::Transform(_)
            | Operation::Identity => ("1", inputs == 1),
        };
        if ok {
            Ok(())
        } else {
            Err(CombinatorError::InputCount {
                operation: self.name(),
                expected,
                actual: inputs,
            })
        }
    }

    /// Names of step inputs this operation reads beyond its positional ones
    pub fn referenced_inputs(&self) -> Vec<&str> {
        match self {
            Operation::Filter(spec) => spec.condition.referenced_inputs(),
            _ => Vec::new(),
        }
    }

    /// Apply the operation to the step's inputs, in declared input order
    pub fn apply(&self, inputs: &Inputs) -> Result<RowSet, CombinatorError> {
        self.check_arity(inputs.len())?;
        match self {
            Operation::Filter(spec) => filter::apply(spec, inputs),
            Operation::Join(spec) => Ok(join::apply(spec, inputs.at(0), inputs.at(1))),
            Operation::Union => Ok(transform::union(inputs.iter().map(|(_, rows)| rows.as_ref()))),
            Operation::Sort(spec) => Ok(transform::sort(spec, inputs.at(0))),
            Operation::Limit(spec) => Ok(transform::limit(spec, inputs.at(0))),
            Operation::Transform(spec) => transform::transform(spec, inputs.at(0)),
            Operation::Identity => Ok(inputs.at(0).clone()),
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(name: &str, parameters: Value) -> Result<T, String> {
    serde_json::from_value(parameters).map_err(|e| format!("invalid {} parameters: {}", name, e))
}

/// Named, ordered inputs of a memory step
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    entries: Vec<(String, Arc<RowSet>)>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, rows: Arc<RowSet>) {
        self.entries.push((name.into(), rows));
    }

    pub fn with(mut self, name: impl Into<String>, rows: RowSet) -> Self {
        self.push(name, Arc::new(rows));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn at(&self, position: usize) -> &RowSet {
        &self.entries[position].1
    }

    pub fn get(&self, name: &str) -> Result<&RowSet, CombinatorError> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, rows)| rows.as_ref())
            .ok_or_else(|| CombinatorError::MissingInput { name: name.to_string() })
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Arc<RowSet>)> {
        self.entries.iter()
    }
}

/// A single value or a list, as accepted by `by`, `left_on` and friends
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item.clone()],
            OneOrMany::Many(items) => items.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use serde_json::json;

    #[test]
    fn test_parse_known_operations() {
        let op = Operation::parse("join", json!({"left_on": "user_id"})).unwrap();
        assert_eq!(op.name(), "join");
        assert!(matches!(Operation::parse("union", Value::Null), Ok(Operation::Union)));
        assert!(matches!(
            Operation::parse("limit", json!({"count": 2})),
            Ok(Operation::Limit(LimitSpec { count: 2, offset: 0 }))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_and_bad_parameters() {
        assert!(Operation::parse("pivot", json!({})).unwrap_err().contains("pivot"));
        assert!(Operation::parse("sort", json!({})).is_err());
        assert!(Operation::parse("transform", json!({"transformations": []})).is_err());
    }

    #[test]
    fn test_arity() {
        let join = Operation::parse("join", json!({"left_on": "id"})).unwrap();
        assert!(join.check_arity(2).is_ok());
        assert_eq!(
            join.check_arity(1),
            Err(CombinatorError::InputCount { operation: "join", expected: "2", actual: 1 })
        );
        assert!(Operation::Identity.check_arity(2).is_err());
    }

    #[test]
    fn test_identity_passes_rows_through() {
        let rows = RowSet::new(vec![row! { "a" => 1 }, row! { "a" => 2 }]);
        let inputs = Inputs::new().with("x", rows.clone());
        assert_eq!(Operation::Identity.apply(&inputs).unwrap(), rows);
    }
}
