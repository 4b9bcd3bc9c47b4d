//! Test fixture utilities.

use bytes::Bytes;
use spanner_protocol::{Field, PartialResultSet, Type, TypeCode, Value};

use crate::mock_server::MockResults;

/// Database path used by fixtures.
pub const TEST_DATABASE: &str = "projects/test-project/instances/test-instance/databases/test-db";

/// A `Singers` table with `SingerId INT64` and `Name STRING` columns.
pub struct SingersFixture {
    /// Number of rows.
    pub rows: usize,
}

impl SingersFixture {
    /// A fixture with `rows` singers, numbered from 1.
    #[must_use]
    pub fn new(rows: usize) -> Self {
        Self { rows }
    }

    /// Column metadata.
    #[must_use]
    pub fn fields() -> Vec<Field> {
        vec![
            Field::new("SingerId", Type::scalar(TypeCode::Int64)),
            Field::new("Name", Type::scalar(TypeCode::String)),
        ]
    }

    /// Row values.
    #[must_use]
    pub fn values(&self) -> Vec<Vec<Value>> {
        (1..=self.rows)
            .map(|i| vec![Value::Int64(i as i64), Value::String(format!("singer-{i}"))])
            .collect()
    }

    /// One row per message, each with a resume token.
    #[must_use]
    pub fn results(&self) -> MockResults {
        MockResults::rows(Self::fields(), self.values())
    }
}

/// A message carrying `values` and `resume_token` (empty for none).
#[must_use]
pub fn partial(values: Vec<Value>, resume_token: &'static str) -> PartialResultSet {
    PartialResultSet {
        values,
        resume_token: Bytes::from_static(resume_token.as_bytes()),
        ..Default::default()
    }
}

/// A single INT64 column named `n`.
#[must_use]
pub fn int_fields() -> Vec<Field> {
    vec![Field::new("n", Type::scalar(TypeCode::Int64))]
}
