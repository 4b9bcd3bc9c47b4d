//! Rows and row iteration.
//!
//! A [`RowIterator`] turns the partial result sets delivered by a
//! [`ResumableStreamDecoder`] into [`Row`]s. Values of a row may span several
//! partial result sets, and a single value may be split in chunks; both are
//! reassembled here using the column count from the result metadata.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use spanner_protocol::{
    Decode, Field, PartialResultSet, PrecommitToken, ProtocolError, ResultSetStats, Transaction,
    Value,
};
use spanner_transport::Context;

use crate::decoder::{DecoderOptions, ResumableStreamDecoder, StreamSource};
use crate::error::Error;

/// A row of a result set.
#[derive(Clone, PartialEq)]
pub struct Row {
    fields: Arc<[Field]>,
    values: Vec<Value>,
}

impl Row {
    /// Create a row.
    pub fn new(fields: Arc<[Field]>, values: Vec<Value>) -> Self {
        Self { fields, values }
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column descriptions.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Index of the column named `name`.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// The raw value of column `index`.
    #[must_use]
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Whether column `index` is NULL.
    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        self.values.get(index).is_some_and(Value::is_null)
    }

    /// Decode column `index`.
    pub fn get<T: Decode>(&self, index: usize) -> Result<T, Error> {
        let (value, field) = self
            .values
            .get(index)
            .zip(self.fields.get(index))
            .ok_or_else(|| {
                Error::Protocol(ProtocolError::TypeMismatch {
                    expected: "column",
                    actual: format!("index {index} out of range for {} columns", self.len()),
                })
            })?;
        Ok(T::decode(value, &field.ty)?)
    }

    /// Decode the column named `name`.
    pub fn get_by_name<T: Decode>(&self, name: &str) -> Result<T, Error> {
        let index = self.column_index(name).ok_or_else(|| {
            Error::Protocol(ProtocolError::TypeMismatch {
                expected: "column",
                actual: format!("no column named {name:?}"),
            })
        })?;
        self.get(index)
    }

    /// The raw values.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.values).finish()
    }
}

/// Receives transaction state carried in streamed results.
pub(crate) trait ResultObserver: Send + Sync {
    /// The result named the transaction it ran in.
    fn on_transaction(&self, transaction: &Transaction);

    /// The result carried a precommit token.
    fn on_precommit_token(&self, token: &PrecommitToken);

    /// The stream ended, failed or was abandoned.
    fn on_done(&self, error: Option<&Error>);
}

/// Iterates over the rows of a query or read.
///
/// # Example
///
/// ```rust,ignore
/// let mut rows = client.single().query(&ctx, Statement::new("SELECT 1")).await?;
/// while let Some(row) = rows.next().await {
///     let value: i64 = row?.get(0)?;
/// }
/// ```
pub struct RowIterator {
    decoder: ResumableStreamDecoder<Box<dyn StreamSource>>,
    ctx: Context,
    fields: Option<Arc<[Field]>>,
    partial: Vec<Value>,
    chunk: Option<Value>,
    rows: VecDeque<Row>,
    stats: Option<ResultSetStats>,
    observer: Option<Arc<dyn ResultObserver>>,
    finished: bool,
}

impl RowIterator {
    pub(crate) fn new(
        ctx: Context,
        source: Box<dyn StreamSource>,
        options: DecoderOptions,
        observer: Option<Arc<dyn ResultObserver>>,
    ) -> Self {
        Self {
            decoder: ResumableStreamDecoder::new(source, options),
            ctx,
            fields: None,
            partial: Vec::new(),
            chunk: None,
            rows: VecDeque::new(),
            stats: None,
            observer,
            finished: false,
        }
    }

    /// The next row, or `None` when the results are exhausted.
    pub async fn next(&mut self) -> Option<Result<Row, Error>> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                return Some(Ok(row));
            }
            if self.finished {
                return None;
            }
            if !self.decoder.next(&self.ctx).await {
                return self.finish().map(Err);
            }
            if let Some(item) = self.decoder.take() {
                if let Err(e) = self.absorb(item) {
                    self.finished = true;
                    let _ = self.decoder.stop();
                    self.notify_done(Some(&e));
                    return Some(Err(e));
                }
            }
        }
    }

    /// Column descriptions, once the first result has arrived.
    #[must_use]
    pub fn fields(&self) -> Option<&[Field]> {
        self.fields.as_deref()
    }

    /// Result statistics, sent with the last result.
    #[must_use]
    pub fn stats(&self) -> Option<&ResultSetStats> {
        self.stats.as_ref()
    }

    /// Rows modified by a DML statement: exact if known, else the lower
    /// bound reported for partitioned DML.
    #[must_use]
    pub fn row_count(&self) -> Option<i64> {
        self.stats
            .as_ref()
            .and_then(|s| s.row_count_exact.or(s.row_count_lower_bound))
    }

    /// Stop the iteration and release the underlying call.
    ///
    /// Returns [`Error::AlreadyClosed`] if called twice; `next` fails the
    /// same way after a stop.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.decoder.stop()?;
        self.rows.clear();
        self.partial.clear();
        self.chunk = None;
        if !self.finished {
            self.notify_done(None);
        }
        Ok(())
    }

    /// Read every remaining row.
    pub async fn collect_all(mut self) -> Result<Vec<Row>, Error> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Drain the results, keeping only the statistics.
    pub(crate) async fn drain(&mut self) -> Result<(), Error> {
        while let Some(row) = self.next().await {
            row?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Option<Error> {
        self.finished = true;
        let mut error = self.decoder.take_error();
        if error.is_none() && (self.chunk.is_some() || !self.partial.is_empty()) {
            error = Some(Error::Protocol(ProtocolError::IncompleteRow {
                values: self.partial.len() + usize::from(self.chunk.is_some()),
                columns: self.fields.as_ref().map_or(0, |f| f.len()),
            }));
        }
        self.notify_done(error.as_ref());
        error
    }

    fn notify_done(&mut self, error: Option<&Error>) {
        if let Some(observer) = self.observer.take() {
            observer.on_done(error);
        }
    }

    fn absorb(&mut self, item: PartialResultSet) -> Result<(), Error> {
        let PartialResultSet {
            metadata,
            mut values,
            chunked_value,
            stats,
            precommit_token,
            ..
        } = item;

        if let Some(metadata) = metadata {
            if let (Some(tx), Some(observer)) = (&metadata.transaction, &self.observer) {
                observer.on_transaction(tx);
            }
            if self.fields.is_none() {
                self.fields = Some(metadata.fields.into());
            }
        }
        if let (Some(token), Some(observer)) = (&precommit_token, &self.observer) {
            observer.on_precommit_token(token);
        }
        if stats.is_some() {
            self.stats = stats;
        }

        if let Some(head) = self.chunk.take() {
            match values.first_mut() {
                Some(first) => {
                    let tail = std::mem::replace(first, Value::Null);
                    *first = head.merge_chunk(tail)?;
                }
                None => values.push(head),
            }
        }
        if chunked_value {
            self.chunk = values.pop();
        }
        if values.is_empty() {
            return Ok(());
        }

        let fields = match &self.fields {
            Some(fields) if !fields.is_empty() => Arc::clone(fields),
            _ => return Err(ProtocolError::MissingMetadata.into()),
        };
        self.partial.extend(values);
        let columns = fields.len();
        while self.partial.len() >= columns {
            let rest = self.partial.split_off(columns);
            let row = std::mem::replace(&mut self.partial, rest);
            self.rows.push_back(Row::new(Arc::clone(&fields), row));
        }
        Ok(())
    }
}

impl Drop for RowIterator {
    fn drop(&mut self) {
        self.notify_done(None);
    }
}

impl fmt::Debug for RowIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowIterator")
            .field("decoder", &self.decoder)
            .field("buffered_rows", &self.rows.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use spanner_protocol::{RequestId, ResultSetMetadata, Status, Type, TypeCode};
    use spanner_transport::{Backoff, PartialResultStream, VecStream};

    struct Fixed(Option<Vec<PartialResultSet>>);

    #[async_trait]
    impl StreamSource for Fixed {
        async fn open(&mut self, _resume_token: Bytes) -> Result<PartialResultStream, Status> {
            let items = self.0.take().unwrap_or_default();
            Ok(Box::new(VecStream::new(items.into_iter().map(Ok))))
        }

        fn request_id(&self) -> Option<RequestId> {
            None
        }
    }

    #[derive(Default)]
    struct Recorder {
        transactions: Mutex<Vec<Bytes>>,
        tokens: Mutex<Vec<i32>>,
        done: Mutex<Vec<bool>>,
    }

    impl ResultObserver for Recorder {
        fn on_transaction(&self, transaction: &Transaction) {
            self.transactions.lock().push(transaction.id.clone());
        }

        fn on_precommit_token(&self, token: &PrecommitToken) {
            self.tokens.lock().push(token.seq_num);
        }

        fn on_done(&self, error: Option<&Error>) {
            self.done.lock().push(error.is_some());
        }
    }

    fn iterator(items: Vec<PartialResultSet>, observer: Option<Arc<dyn ResultObserver>>) -> RowIterator {
        let options = DecoderOptions {
            backoff: Backoff::new().initial(Duration::from_millis(1)),
            max_bytes_between_resume_tokens: 1 << 20,
        };
        RowIterator::new(Context::background(), Box::new(Fixed(Some(items))), options, observer)
    }

    fn metadata(columns: &[&str]) -> ResultSetMetadata {
        ResultSetMetadata {
            fields: columns
                .iter()
                .map(|c| Field::new(*c, Type::scalar(TypeCode::String)))
                .collect(),
            transaction: None,
        }
    }

    fn strings(values: &[&str]) -> Vec<Value> {
        values.iter().map(|v| Value::String((*v).to_string())).collect()
    }

    #[tokio::test]
    async fn test_rows_span_partial_results() {
        let rows = iterator(
            vec![
                PartialResultSet {
                    metadata: Some(metadata(&["a", "b"])),
                    values: strings(&["1", "2", "3"]),
                    ..PartialResultSet::default()
                },
                PartialResultSet {
                    values: strings(&["4"]),
                    resume_token: Bytes::from_static(b"t"),
                    ..PartialResultSet::default()
                },
            ],
            None,
        )
        .collect_all()
        .await
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get::<String>(1).unwrap(), "2");
        assert_eq!(rows[1].get_by_name::<String>("a").unwrap(), "3");
    }

    #[tokio::test]
    async fn test_chunked_values_merge() {
        let rows = iterator(
            vec![
                PartialResultSet {
                    metadata: Some(metadata(&["s"])),
                    values: strings(&["hel"]),
                    chunked_value: true,
                    ..PartialResultSet::default()
                },
                PartialResultSet {
                    values: strings(&["lo", "next"]),
                    ..PartialResultSet::default()
                },
            ],
            None,
        )
        .collect_all()
        .await
        .unwrap();

        let values: Vec<String> = rows.iter().map(|r| r.get(0).unwrap()).collect();
        assert_eq!(values, ["hello", "next"]);
    }

    #[tokio::test]
    async fn test_incomplete_row_is_an_error() {
        let mut it = iterator(
            vec![PartialResultSet {
                metadata: Some(metadata(&["a", "b"])),
                values: strings(&["1", "2", "3"]),
                ..PartialResultSet::default()
            }],
            None,
        );
        assert!(it.next().await.unwrap().is_ok());
        let err = it.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::IncompleteRow { values: 1, columns: 2 })));
        assert!(it.next().await.is_none());
    }

    #[tokio::test]
    async fn test_values_without_metadata_fail() {
        let mut it = iterator(
            vec![PartialResultSet {
                values: strings(&["1"]),
                ..PartialResultSet::default()
            }],
            None,
        );
        let err = it.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::MissingMetadata)));
    }

    #[tokio::test]
    async fn test_observer_sees_transaction_and_tokens() {
        let recorder = Arc::new(Recorder::default());
        let mut md = metadata(&["a"]);
        md.transaction = Some(Transaction {
            id: Bytes::from_static(b"tx1"),
            ..Transaction::default()
        });
        let mut it = iterator(
            vec![PartialResultSet {
                metadata: Some(md),
                values: strings(&["1"]),
                precommit_token: Some(PrecommitToken {
                    token: Bytes::from_static(b"p"),
                    seq_num: 3,
                }),
                stats: Some(ResultSetStats {
                    row_count_exact: Some(1),
                    row_count_lower_bound: None,
                }),
                ..PartialResultSet::default()
            }],
            Some(Arc::clone(&recorder) as Arc<dyn ResultObserver>),
        );
        it.drain().await.unwrap();

        assert_eq!(*recorder.transactions.lock(), vec![Bytes::from_static(b"tx1")]);
        assert_eq!(*recorder.tokens.lock(), vec![3]);
        assert_eq!(*recorder.done.lock(), vec![false]);
        assert_eq!(it.row_count(), Some(1));
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let mut it = iterator(Vec::new(), None);
        it.stop().unwrap();
        assert!(matches!(it.stop(), Err(Error::AlreadyClosed)));
        assert!(matches!(it.next().await, Some(Err(Error::AlreadyClosed))));
        assert!(it.next().await.is_none());
    }
}
