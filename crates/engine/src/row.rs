//! Uniform row model shared by adapters, combinators and the result store
//!
//! Rows are JSON objects with insertion-ordered fields. Values compared across
//! backends go through [`KeyValue`], which normalizes numbers so that an integer
//! `1` from one store equals a `1.0` from another.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A single record: field name to JSON value, field order preserved
pub type Row = Map<String, Value>;

/// Ordered sequence of rows produced by one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowSet {
    rows: Vec<Row>,
}

impl RowSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl From<Vec<Row>> for RowSet {
    fn from(rows: Vec<Row>) -> Self {
        Self::new(rows)
    }
}

impl FromIterator<Row> for RowSet {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a RowSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Look up a field, falling back to a dotted path into nested objects.
///
/// Returns `None` for missing fields and for explicit `null`.
pub fn field<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    let found = match row.get(name) {
        Some(value) => Some(value),
        None if name.contains('.') => {
            let mut parts = name.split('.');
            let first = parts.next()?;
            let mut current = row.get(first)?;
            for part in parts {
                current = current.as_object()?.get(part)?;
            }
            Some(current)
        }
        None => None,
    };
    found.filter(|value| !value.is_null())
}

/// Hashable, cross-backend comparable form of a JSON value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    /// Integer above `i64::MAX`
    UInt(u64),
    /// Non-integral number, stored as IEEE-754 bits
    Float(u64),
    Str(String),
    /// Arrays and objects, compared by canonical JSON text
    Composite(String),
}

impl KeyValue {
    /// Returns `None` for `null`, which never participates in matching
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Some(KeyValue::Int(i));
                }
                if let Some(u) = n.as_u64() {
                    return Some(KeyValue::UInt(u));
                }
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    Some(KeyValue::Int(f as i64))
                } else if f.fract() == 0.0 && f >= i64::MAX as f64 && f < u64::MAX as f64 {
                    Some(KeyValue::UInt(f as u64))
                } else {
                    Some(KeyValue::Float(f.to_bits()))
                }
            }
            Value::String(s) => Some(KeyValue::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => Some(KeyValue::Composite(canonical(value))),
        }
    }

    /// Key of `name` in `row`; `None` when missing or null
    pub fn of(row: &Row, name: &str) -> Option<Self> {
        field(row, name).and_then(Self::from_value)
    }

    /// Composite key over several fields; `None` if any part is missing
    pub fn composite(row: &Row, names: &[String]) -> Option<Vec<Self>> {
        names.iter().map(|name| Self::of(row, name)).collect()
    }
}

fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", body.join(","))
        }
        Value::Number(_) => match KeyValue::from_value(value) {
            Some(KeyValue::Int(i)) => i.to_string(),
            Some(KeyValue::UInt(u)) => u.to_string(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// Order two values of the same type; `None` when types are not comparable
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
                return Some(i.cmp(&j));
            }
            if let (Some(i), Some(j)) = (x.as_u64(), y.as_u64()) {
                return Some(i.cmp(&j));
            }
            // Negative integer against one above i64::MAX
            if x.is_i64() && y.is_u64() {
                return Some(Ordering::Less);
            }
            if x.is_u64() && y.is_i64() {
                return Some(Ordering::Greater);
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used for sorting: by type first, then by value
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    compare_values(a, b).unwrap_or_else(|| {
        type_rank(a)
            .cmp(&type_rank(b))
            .then_with(|| canonical(a).cmp(&canonical(b)))
    })
}

/// Build a row from `(field, value)` pairs
#[macro_export]
macro_rules! row {
    ($($key:literal => $value:tt),* $(,)?) => {{
        let mut row = $crate::row::Row::new();
        $( row.insert($key.to_string(), $crate::__private::json!($value)); )*
        row
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_keys_normalize() {
        assert_eq!(KeyValue::from_value(&json!(1)), KeyValue::from_value(&json!(1.0)));
        assert_ne!(KeyValue::from_value(&json!(1)), KeyValue::from_value(&json!(1.5)));
        assert_ne!(KeyValue::from_value(&json!(1)), KeyValue::from_value(&json!("1")));
    }

    #[test]
    fn test_null_and_missing_have_no_key() {
        let r = row! { "a" => null, "b" => 2 };
        assert!(KeyValue::of(&r, "a").is_none());
        assert!(KeyValue::of(&r, "missing").is_none());
        assert_eq!(KeyValue::of(&r, "b"), Some(KeyValue::Int(2)));
    }

    #[test]
    fn test_composite_key_ignores_field_order() {
        let a = KeyValue::from_value(&json!({"x": 1, "y": [1, 2]}));
        let b = KeyValue::from_value(&json!({"y": [1.0, 2], "x": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_dotted_field_lookup() {
        let r = row! { "user" => {"id": 7, "name": "ada"}, "a.b" => 1 };
        assert_eq!(field(&r, "user.id"), Some(&json!(7)));
        assert_eq!(field(&r, "a.b"), Some(&json!(1)));
        assert!(field(&r, "user.email").is_none());
    }

    #[test]
    fn test_total_cmp_orders_mixed_types() {
        assert_eq!(total_cmp(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(total_cmp(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(total_cmp(&json!("b"), &json!(3)), Ordering::Greater);
    }

    #[test]
    fn test_large_unsigned_keys_stay_exact() {
        let max = KeyValue::from_value(&json!(18446744073709551615u64));
        let below = KeyValue::from_value(&json!(18446744073709551614u64));
        assert_eq!(max, Some(KeyValue::UInt(u64::MAX)));
        assert_ne!(max, below);
        assert_eq!(
            total_cmp(&json!(18446744073709551614u64), &json!(18446744073709551615u64)),
            Ordering::Less
        );
        assert_eq!(total_cmp(&json!(-1), &json!(9223372036854775808u64)), Ordering::Less);
    }
}
