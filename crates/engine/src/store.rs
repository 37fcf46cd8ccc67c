//! Plan-scoped result store
//!
//! Maps output variables to the rows their producing step published. Each
//! variable is written exactly once; readers get shared handles and never
//! observe a mutation.

use crate::error::InternalConsistencyError;
use crate::row::RowSet;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ResultStore {
    entries: HashMap<String, Arc<RowSet>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a step's rows. A second publish for the same variable fails and
    /// leaves the first value in place.
    pub fn publish(&mut self, output_var: &str, rows: RowSet) -> Result<Arc<RowSet>, InternalConsistencyError> {
        if self.entries.contains_key(output_var) {
            return Err(InternalConsistencyError::DuplicateOutput {
                output_var: output_var.to_string(),
            });
        }
        let rows = Arc::new(rows);
        self.entries.insert(output_var.to_string(), Arc::clone(&rows));
        Ok(rows)
    }

    pub fn get(&self, output_var: &str) -> Result<Arc<RowSet>, InternalConsistencyError> {
        self.entries
            .get(output_var)
            .cloned()
            .ok_or_else(|| InternalConsistencyError::NotYetAvailable {
                output_var: output_var.to_string(),
            })
    }

    pub fn contains(&self, output_var: &str) -> bool {
        self.entries.contains_key(output_var)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return a value, cloning only if other handles are still alive
    pub fn take(&mut self, output_var: &str) -> Result<RowSet, InternalConsistencyError> {
        let rows = self
            .entries
            .remove(output_var)
            .ok_or_else(|| InternalConsistencyError::NotYetAvailable {
                output_var: output_var.to_string(),
            })?;
        Ok(Arc::try_unwrap(rows).unwrap_or_else(|shared| (*shared).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    #[test]
    fn test_publish_then_get() {
        let mut store = ResultStore::new();
        store.publish("users", RowSet::new(vec![row! { "id" => 1 }])).unwrap();

        assert!(store.contains("users"));
        assert_eq!(store.get("users").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_publish_keeps_first_value() {
        let mut store = ResultStore::new();
        store.publish("x", RowSet::new(vec![row! { "v" => "first" }])).unwrap();

        let err = store.publish("x", RowSet::new(vec![row! { "v" => "second" }])).unwrap_err();
        assert_eq!(err, InternalConsistencyError::DuplicateOutput { output_var: "x".into() });
        assert_eq!(store.get("x").unwrap().rows()[0]["v"], "first");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_before_publish() {
        let store = ResultStore::new();
        assert_eq!(
            store.get("later").unwrap_err(),
            InternalConsistencyError::NotYetAvailable { output_var: "later".into() }
        );
    }

    #[test]
    fn test_take_with_outstanding_reader() {
        let mut store = ResultStore::new();
        let published = store.publish("x", RowSet::new(vec![row! { "a" => 1 }])).unwrap();
        let taken = store.take("x").unwrap();

        assert_eq!(&taken, published.as_ref());
        assert!(store.is_empty());
    }
}
