//! Declarative row filtering

use super::{CombinatorError, Inputs};
use crate::row::{compare_values, field, KeyValue, Row, RowSet};
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Parameters of a filter step
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FilterSpec {
    pub condition: Predicate,
}

/// Predicate over a row.
///
/// Leaf predicates are false when their field is missing or null.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    /// Field value appears in another input
    In {
        field: String,
        input: String,
        #[serde(default)]
        input_field: Option<String>,
    },
    /// Field value is present and does not appear in another input
    NotIn {
        field: String,
        input: String,
        #[serde(default)]
        input_field: Option<String>,
    },
    Exists { field: String },
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn referenced_inputs(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_inputs(&mut names);
        names
    }

    fn collect_inputs<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Predicate::In { input, .. } | Predicate::NotIn { input, .. } => names.push(input),
            Predicate::And { predicates } | Predicate::Or { predicates } => {
                for p in predicates {
                    p.collect_inputs(names);
                }
            }
            Predicate::Not { predicate } => predicate.collect_inputs(names),
            _ => {}
        }
    }
}

/// Predicate with membership sets resolved against the step inputs
enum Compiled<'a> {
    Equals { field: &'a str, key: Option<KeyValue>, negate: bool },
    Compare { field: &'a str, value: &'a Value, accept: fn(Ordering) -> bool },
    Member { field: &'a str, keys: HashSet<KeyValue>, negate: bool },
    Exists { field: &'a str },
    All(Vec<Compiled<'a>>),
    Any(Vec<Compiled<'a>>),
    Not(Box<Compiled<'a>>),
}

fn compile<'a>(predicate: &'a Predicate, inputs: &Inputs) -> Result<Compiled<'a>, CombinatorError> {
    let compiled = match predicate {
        Predicate::Eq { field, value } => Compiled::Equals {
            field,
            key: KeyValue::from_value(value),
            negate: false,
        },
        Predicate::Ne { field, value } => Compiled::Equals {
            field,
            key: KeyValue::from_value(value),
            negate: true,
        },
        Predicate::Gt { field, value } => Compiled::Compare { field, value, accept: Ordering::is_gt },
        Predicate::Gte { field, value } => Compiled::Compare { field, value, accept: Ordering::is_ge },
        Predicate::Lt { field, value } => Compiled::Compare { field, value, accept: Ordering::is_lt },
        Predicate::Lte { field, value } => Compiled::Compare { field, value, accept: Ordering::is_le },
        Predicate::In { field, input, input_field } => Compiled::Member {
            field,
            keys: key_set(inputs.get(input)?, input_field.as_deref().unwrap_or(field)),
            negate: false,
        },
        Predicate::NotIn { field, input, input_field } => Compiled::Member {
            field,
            keys: key_set(inputs.get(input)?, input_field.as_deref().unwrap_or(field)),
            negate: true,
        },
        Predicate::Exists { field } => Compiled::Exists { field },
        Predicate::And { predicates } => Compiled::All(
            predicates.iter().map(|p| compile(p, inputs)).collect::<Result<_, _>>()?,
        ),
        Predicate::Or { predicates } => Compiled::Any(
            predicates.iter().map(|p| compile(p, inputs)).collect::<Result<_, _>>()?,
        ),
        Predicate::Not { predicate } => Compiled::Not(Box::new(compile(predicate, inputs)?)),
    };
    Ok(compiled)
}

/// Rows with a missing or null key contribute nothing
fn key_set(rows: &RowSet, name: &str) -> HashSet<KeyValue> {
    rows.iter().filter_map(|row| KeyValue::of(row, name)).collect()
}

impl Compiled<'_> {
    fn matches(&self, row: &Row) -> bool {
        match self {
            Compiled::Equals { field, key, negate } => match (KeyValue::of(row, field), key) {
                (Some(actual), Some(expected)) => (actual == *expected) != *negate,
                _ => false,
            },
            Compiled::Compare { field: name, value, accept } => field(row, name)
                .and_then(|actual| compare_values(actual, value))
                .map(accept)
                .unwrap_or(false),
            Compiled::Member { field, keys, negate } => match KeyValue::of(row, field) {
                Some(key) => keys.contains(&key) != *negate,
                None => false,
            },
            Compiled::Exists { field: name } => field(row, name).is_some(),
            Compiled::All(parts) => parts.iter().all(|p| p.matches(row)),
            Compiled::Any(parts) => parts.iter().any(|p| p.matches(row)),
            Compiled::Not(inner) => !inner.matches(row),
        }
    }
}

pub(super) fn apply(spec: &FilterSpec, inputs: &Inputs) -> Result<RowSet, CombinatorError> {
    let compiled = compile(&spec.condition, inputs)?;
    let (_, subject) = inputs
        .iter()
        .next()
        .ok_or(CombinatorError::InputCount { operation: "filter", expected: "at least 1", actual: 0 })?;
    Ok(subject.iter().filter(|row| compiled.matches(row)).cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use serde_json::json;

    fn spec(condition: Value) -> FilterSpec {
        serde_json::from_value(json!({ "condition": condition })).unwrap()
    }

    #[test]
    fn test_not_in_viewed_but_not_purchased() {
        let viewed = RowSet::new(vec![row! { "user_id" => 1 }, row! { "user_id" => 2 }]);
        let purchased = RowSet::new(vec![row! { "user_id" => 2.0 }]);
        let inputs = Inputs::new().with("viewed", viewed).with("purchased", purchased);

        let out = apply(
            &spec(json!({"op": "not_in", "field": "user_id", "input": "purchased"})),
            &inputs,
        )
        .unwrap();

        assert_eq!(out.rows(), &[row! { "user_id" => 1 }]);
    }

    #[test]
    fn test_missing_keys_never_match() {
        let subject = RowSet::new(vec![
            row! { "user_id" => 1 },
            row! { "other" => 5 },
            row! { "user_id" => null },
        ]);
        let other = RowSet::new(vec![row! { "name" => "no key" }, row! { "user_id" => 9 }]);
        let inputs = Inputs::new().with("a", subject).with("b", other);

        let not_in = apply(&spec(json!({"op": "not_in", "field": "user_id", "input": "b"})), &inputs).unwrap();
        assert_eq!(not_in.len(), 1);

        let is_in = apply(&spec(json!({"op": "in", "field": "user_id", "input": "b"})), &inputs).unwrap();
        assert!(is_in.is_empty());

        let ne = apply(&spec(json!({"op": "ne", "field": "user_id", "value": 3})), &inputs).unwrap();
        assert_eq!(ne.len(), 1);
    }

    #[test]
    fn test_membership_against_named_input_field() {
        let orders = RowSet::new(vec![row! { "customer" => "a" }, row! { "customer" => "b" }]);
        let vip = RowSet::new(vec![row! { "name" => "b" }]);
        let inputs = Inputs::new().with("orders", orders).with("vip", vip);

        let out = apply(
            &spec(json!({"op": "in", "field": "customer", "input": "vip", "input_field": "name"})),
            &inputs,
        )
        .unwrap();
        assert_eq!(out.rows(), &[row! { "customer" => "b" }]);
    }

    #[test]
    fn test_comparisons_and_composition() {
        let rows = RowSet::new(vec![
            row! { "amount" => 5, "region" => "eu" },
            row! { "amount" => 50, "region" => "eu" },
            row! { "amount" => 500, "region" => "us" },
            row! { "amount" => "n/a", "region" => "eu" },
        ]);
        let inputs = Inputs::new().with("sales", rows);

        let out = apply(
            &spec(json!({"op": "and", "predicates": [
                {"op": "gte", "field": "amount", "value": 10},
                {"op": "not", "predicate": {"op": "eq", "field": "region", "value": "us"}}
            ]})),
            &inputs,
        )
        .unwrap();
        assert_eq!(out.rows(), &[row! { "amount" => 50, "region" => "eu" }]);

        let either = apply(
            &spec(json!({"op": "or", "predicates": [
                {"op": "lt", "field": "amount", "value": 10},
                {"op": "eq", "field": "region", "value": "us"}
            ]})),
            &inputs,
        )
        .unwrap();
        assert_eq!(either.len(), 2);
    }

    #[test]
    fn test_unknown_input_is_reported() {
        let inputs = Inputs::new().with("a", RowSet::empty());
        let err = apply(&spec(json!({"op": "in", "field": "x", "input": "ghost"})), &inputs).unwrap_err();
        assert_eq!(err, CombinatorError::MissingInput { name: "ghost".into() });
    }

    #[test]
    fn test_referenced_inputs_walks_tree() {
        let s = spec(json!({"op": "or", "predicates": [
            {"op": "in", "field": "x", "input": "b"},
            {"op": "not", "predicate": {"op": "not_in", "field": "x", "input": "c"}}
        ]}));
        assert_eq!(s.condition.referenced_inputs(), vec!["b", "c"]);
    }
}
