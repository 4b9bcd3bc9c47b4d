//! Write mutations and key sets.

use crate::value::{Encode, Value};

/// A primary key: one value per key column.
pub type Key = Vec<Value>;

/// A range of keys.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    /// Start key.
    pub start: Key,
    /// Whether `start` is included.
    pub start_closed: bool,
    /// End key.
    pub end: Key,
    /// Whether `end` is included.
    pub end_closed: bool,
}

impl KeyRange {
    /// A range including both endpoints.
    #[must_use]
    pub fn closed(start: Key, end: Key) -> Self {
        Self {
            start,
            start_closed: true,
            end,
            end_closed: true,
        }
    }
}

/// A set of keys and key ranges.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeySet {
    /// Individual keys.
    pub keys: Vec<Key>,
    /// Key ranges.
    pub ranges: Vec<KeyRange>,
    /// Every row of the table.
    pub all: bool,
}

impl KeySet {
    /// Every row of the table.
    #[must_use]
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// A single key.
    #[must_use]
    pub fn key(key: Key) -> Self {
        Self {
            keys: vec![key],
            ..Self::default()
        }
    }

    /// A single range.
    #[must_use]
    pub fn range(range: KeyRange) -> Self {
        Self {
            ranges: vec![range],
            ..Self::default()
        }
    }
}

/// Kind of write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    /// Insert rows; fails if a row exists.
    Insert,
    /// Update existing rows; fails if a row is missing.
    Update,
    /// Insert rows or update them if they exist.
    InsertOrUpdate,
    /// Insert rows, deleting existing ones first.
    Replace,
    /// Delete rows by key.
    Delete,
}

/// A buffered write.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// The write kind.
    pub op: MutationOp,
    /// Target table.
    pub table: String,
    /// Columns written (empty for deletes).
    pub columns: Vec<String>,
    /// Rows of values, one entry per column (empty for deletes).
    pub values: Vec<Vec<Value>>,
    /// Keys removed by a delete.
    pub key_set: Option<KeySet>,
}

impl Mutation {
    fn write(op: MutationOp, table: &str, columns: &[&str], values: &[&dyn Encode]) -> Self {
        Self {
            op,
            table: table.to_string(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            values: vec![values.iter().map(|v| v.encode()).collect()],
            key_set: None,
        }
    }

    /// Insert one row.
    pub fn insert(table: &str, columns: &[&str], values: &[&dyn Encode]) -> Self {
        Self::write(MutationOp::Insert, table, columns, values)
    }

    /// Update one row.
    pub fn update(table: &str, columns: &[&str], values: &[&dyn Encode]) -> Self {
        Self::write(MutationOp::Update, table, columns, values)
    }

    /// Insert or update one row.
    pub fn insert_or_update(table: &str, columns: &[&str], values: &[&dyn Encode]) -> Self {
        Self::write(MutationOp::InsertOrUpdate, table, columns, values)
    }

    /// Replace one row.
    pub fn replace(table: &str, columns: &[&str], values: &[&dyn Encode]) -> Self {
        Self::write(MutationOp::Replace, table, columns, values)
    }

    /// Delete the rows in `key_set`.
    pub fn delete(table: &str, key_set: KeySet) -> Self {
        Self {
            op: MutationOp::Delete,
            table: table.to_string(),
            columns: Vec::new(),
            values: Vec::new(),
            key_set: Some(key_set),
        }
    }

    /// Approximate encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.table.len()
            + self.columns.iter().map(String::len).sum::<usize>()
            + self
                .values
                .iter()
                .flatten()
                .map(Value::encoded_len)
                .sum::<usize>()
    }
}

/// Mutations applied atomically by a batch write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MutationGroup {
    /// The mutations of the group.
    pub mutations: Vec<Mutation>,
}

impl MutationGroup {
    /// Create a group.
    #[must_use]
    pub fn new(mutations: Vec<Mutation>) -> Self {
        Self { mutations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_mutation() {
        let m = Mutation::insert("Singers", &["SingerId", "Name"], &[&1i64, &"Marc"]);
        assert_eq!(m.op, MutationOp::Insert);
        assert_eq!(m.columns, vec!["SingerId", "Name"]);
        assert_eq!(
            m.values,
            vec![vec![Value::Int64(1), Value::String("Marc".into())]]
        );
        assert!(m.key_set.is_none());
    }

    #[test]
    fn test_delete_mutation() {
        let m = Mutation::delete("Singers", KeySet::key(vec![Value::Int64(7)]));
        assert_eq!(m.op, MutationOp::Delete);
        assert!(m.values.is_empty());
        assert_eq!(m.key_set.map(|k| k.keys.len()), Some(1));
    }
}
