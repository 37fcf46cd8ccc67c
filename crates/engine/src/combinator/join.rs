//! Key-based equi-join of two row sets

use super::OneOrMany;
use crate::row::{KeyValue, Row, RowSet};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinHow {
    #[default]
    Inner,
    Left,
}

/// Parameters of a join step
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinSpec {
    pub left_on: OneOrMany<String>,

    /// Defaults to `left_on`
    #[serde(default)]
    pub right_on: Option<OneOrMany<String>>,

    #[serde(default)]
    pub how: JoinHow,

    /// Appended to colliding non-key fields of the left and right rows
    #[serde(default = "default_suffixes")]
    pub suffixes: (String, String),
}

fn default_suffixes() -> (String, String) {
    ("_x".to_string(), "_y".to_string())
}

impl JoinSpec {
    pub fn on(key: &str) -> Self {
        Self {
            left_on: OneOrMany::One(key.to_string()),
            right_on: None,
            how: JoinHow::Inner,
            suffixes: default_suffixes(),
        }
    }

    fn keys(&self) -> (Vec<String>, Vec<String>) {
        let left = self.left_on.to_vec();
        let right = self.right_on.as_ref().map(OneOrMany::to_vec).unwrap_or_else(|| left.clone());
        (left, right)
    }

    pub(super) fn check(&self) -> Result<(), String> {
        let (left, right) = self.keys();
        if left.is_empty() {
            return Err("join requires at least one key".to_string());
        }
        if left.len() != right.len() {
            return Err(format!(
                "join key count mismatch: {} left vs {} right",
                left.len(),
                right.len()
            ));
        }
        if self.suffixes.0 == self.suffixes.1 {
            return Err("join suffixes must differ".to_string());
        }
        Ok(())
    }
}

/// Left rows drive output order; matches follow right input order
pub(super) fn apply(spec: &JoinSpec, left: &RowSet, right: &RowSet) -> RowSet {
    let (left_on, right_on) = spec.keys();

    let mut index: HashMap<Vec<KeyValue>, Vec<&Row>> = HashMap::new();
    for row in right {
        if let Some(key) = KeyValue::composite(row, &right_on) {
            index.entry(key).or_default().push(row);
        }
    }

    // Key columns with the same name on both sides appear once
    let shared: HashSet<&str> = left_on
        .iter()
        .zip(&right_on)
        .filter(|(l, r)| l == r)
        .map(|(l, _)| l.as_str())
        .collect();

    let mut out = Vec::new();
    for row in left {
        let matches = KeyValue::composite(row, &left_on).and_then(|key| index.get(&key));
        match matches {
            Some(rights) => {
                for other in rights {
                    out.push(merge(row, other, &shared, &spec.suffixes));
                }
            }
            None if spec.how == JoinHow::Left => out.push(row.clone()),
            None => {}
        }
    }
    RowSet::new(out)
}

fn merge(left: &Row, right: &Row, shared: &HashSet<&str>, suffixes: &(String, String)) -> Row {
    let collides = |name: &str| !shared.contains(name) && left.contains_key(name) && right.contains_key(name);

    let mut merged = Row::new();
    for (name, value) in left {
        if collides(name) {
            merged.insert(format!("{}{}", name, suffixes.0), value.clone());
        } else {
            merged.insert(name.clone(), value.clone());
        }
    }
    for (name, value) in right {
        if shared.contains(name.as_str()) {
            continue;
        }
        if collides(name) {
            merged.insert(format!("{}{}", name, suffixes.1), value.clone());
        } else {
            merged.insert(name.clone(), value.clone());
        }
    }
    merged
}
