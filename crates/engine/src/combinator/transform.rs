//! Union, sort, limit and column transformations

use super::{CombinatorError, OneOrMany};
use crate::row::{field, total_cmp, Row, RowSet};
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Parameters of a sort step
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SortSpec {
    pub by: OneOrMany<String>,

    /// One flag for all keys, or one per key
    #[serde(default = "default_ascending")]
    pub ascending: OneOrMany<bool>,
}

fn default_ascending() -> OneOrMany<bool> {
    OneOrMany::One(true)
}

impl SortSpec {
    pub(super) fn check(&self) -> Result<(), String> {
        let by = self.by.to_vec();
        if by.is_empty() {
            return Err("sort requires at least one column".to_string());
        }
        if let OneOrMany::Many(flags) = &self.ascending {
            if flags.len() != by.len() {
                return Err(format!(
                    "sort has {} columns but {} ascending flags",
                    by.len(),
                    flags.len()
                ));
            }
        }
        Ok(())
    }

    fn keys(&self) -> Vec<(String, bool)> {
        let by = self.by.to_vec();
        let flags = match &self.ascending {
            OneOrMany::One(flag) => vec![*flag; by.len()],
            OneOrMany::Many(flags) => flags.clone(),
        };
        by.into_iter().zip(flags).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LimitSpec {
    #[serde(alias = "limit", alias = "n")]
    pub count: usize,

    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransformSpec {
    pub transformations: Vec<Transformation>,
}

/// Column-level reshaping, applied in order
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
    SelectColumns { columns: Vec<String> },
    RenameColumns {
        #[serde(alias = "mapping")]
        rename_map: HashMap<String, String>,
    },
    DropColumns { columns: Vec<String> },
    /// Replace missing or null values
    #[serde(alias = "fill_missing")]
    FillNa {
        value: Value,
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
}

pub(super) fn union<'a>(inputs: impl Iterator<Item = &'a RowSet>) -> RowSet {
    inputs.flat_map(|rows| rows.iter().cloned()).collect()
}

/// Stable sort; missing values go last in either direction
pub(super) fn sort(spec: &SortSpec, input: &RowSet) -> RowSet {
    let keys = spec.keys();
    let mut rows = input.rows().to_vec();
    rows.sort_by(|a, b| {
        for (name, ascending) in &keys {
            let ordering = match (field(a, name), field(b, name)) {
                (Some(x), Some(y)) => {
                    let ord = total_cmp(x, y);
                    if *ascending { ord } else { ord.reverse() }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    RowSet::new(rows)
}

pub(super) fn limit(spec: &LimitSpec, input: &RowSet) -> RowSet {
    input.iter().skip(spec.offset).take(spec.count).cloned().collect()
}

/// Selecting or dropping a column that no row carries fails, unless the input is empty
pub(super) fn transform(spec: &TransformSpec, input: &RowSet) -> Result<RowSet, CombinatorError> {
    let mut rows = input.rows().to_vec();
    for step in &spec.transformations {
        rows = match step {
            Transformation::SelectColumns { columns } => {
                require_columns("select_columns", columns, &rows)?;
                rows.into_iter()
                    .map(|row| {
                        columns
                            .iter()
                            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                            .collect()
                    })
                    .collect()
            }
            Transformation::RenameColumns { rename_map } => rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|(k, v)| (rename_map.get(&k).cloned().unwrap_or(k), v))
                        .collect()
                })
                .collect(),
            Transformation::DropColumns { columns } => {
                require_columns("drop_columns", columns, &rows)?;
                rows.into_iter()
                    .map(|mut row| {
                        for c in columns {
                            row.shift_remove(c);
                        }
                        row
                    })
                    .collect()
            }
            Transformation::FillNa { value, columns } => {
                let targets = columns.clone().unwrap_or_else(|| all_columns(&rows));
                rows.into_iter()
                    .map(|mut row| {
                        for c in &targets {
                            let entry = row.entry(c.clone()).or_insert(Value::Null);
                            if entry.is_null() {
                                *entry = value.clone();
                            }
                        }
                        row
                    })
                    .collect()
            }
        };
    }
    Ok(RowSet::new(rows))
}

fn require_columns(operation: &'static str, columns: &[String], rows: &[Row]) -> Result<(), CombinatorError> {
    if rows.is_empty() {
        return Ok(());
    }
    match columns.iter().find(|c| !rows.iter().any(|row| row.contains_key(c.as_str()))) {
        Some(column) => Err(CombinatorError::UnknownColumn {
            operation,
            column: column.clone(),
        }),
        None => Ok(()),
    }
}

/// Union of field names across rows, in first-seen order
fn all_columns(rows: &[Row]) -> Vec<String> {
    let mut seen = Vec::new();
    for row in rows {
        for name in row.keys() {
            if !seen.contains(name) {
                seen.push(name.clone());
            }
        }
    }
    seen
}
