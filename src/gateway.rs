use crate::error::{Error, Result, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Scalar value bound to a statement parameter or read from a row.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Returns the integer, if this is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the value as a float. Integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Returns the text, if this is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a blob.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One result row, keyed by column name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: BTreeMap<String, Value>,
}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a column value.
    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    /// Returns a column value. Missing columns read as `None`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Returns an integer column.
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    /// Returns a float column.
    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(Value::as_f64)
    }

    /// Returns a text column.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    /// Returns a blob column.
    pub fn get_blob(&self, column: &str) -> Option<&[u8]> {
        self.get(column).and_then(Value::as_blob)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

/// Parameterized SQL statement. Values never appear in `sql` itself.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    /// Creates a statement from SQL text and its positional parameters.
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Outcome of an execute call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Executed {
    /// Number of rows the statement changed.
    pub rows_affected: u64,
    /// Row id generated by an insert, if any.
    pub last_insert_id: Option<i64>,
}

/// Parameterized-statement interface to the backing relational store.
///
/// Implementations run every call inside its own transaction and roll it
/// back when the statement fails.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Runs a statement that returns no rows.
    async fn execute(&self, statement: &Statement) -> std::result::Result<Executed, StoreError>;

    /// Runs a statement and returns its rows.
    async fn query(&self, statement: &Statement) -> std::result::Result<Vec<Row>, StoreError>;
}

/// Logging, retrying wrapper around a [`Connection`].
///
/// Reads are retried up to `read_attempts` times. Writes run exactly once,
/// since a failed insert may or may not have been applied by the transport.
#[derive(Debug)]
pub struct Gateway<C> {
    connection: C,
    read_attempts: u32,
    last_inserted_id: AtomicI64,
}

impl<C> Gateway<C> {
    /// Wraps a connection.
    pub fn new(connection: C, read_attempts: u32) -> Self {
        Self {
            connection,
            read_attempts: read_attempts.max(1),
            last_inserted_id: AtomicI64::new(0),
        }
    }

    /// Returns the wrapped connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Returns the id generated by the most recent successful insert.
    pub fn last_inserted_id(&self) -> Option<i64> {
        match self.last_inserted_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }
}

impl<C: Connection> Gateway<C> {
    /// Runs a write statement once.
    pub async fn execute(&self, statement: &Statement) -> Result<Executed> {
        tracing::debug!(sql = %statement.sql, params = statement.params.len(), "execute");
        let executed = self
            .connection
            .execute(statement)
            .await
            .map_err(Error::from)?;
        if let Some(id) = executed.last_insert_id {
            self.last_inserted_id.store(id, Ordering::Release);
        }
        Ok(executed)
    }

    /// Runs a read statement, retrying failed attempts.
    pub async fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        tracing::debug!(sql = %statement.sql, params = statement.params.len(), "query");
        let mut attempt = 1;
        loop {
            match self.connection.query(statement).await {
                Ok(rows) => return Ok(rows),
                Err(error) if attempt < self.read_attempts => {
                    tracing::warn!(attempt, error = %error, "query failed, retrying");
                    attempt += 1;
                }
                Err(error) => return Err(Error::from(error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::Mutex;

    struct FlakyConnection {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Connection for FlakyConnection {
        async fn execute(
            &self,
            _statement: &Statement,
        ) -> std::result::Result<Executed, StoreError> {
            let mut guard = self.failures_left.lock().expect("poisoned lock");
            if *guard > 0 {
                *guard -= 1;
                return Err("transport reset".into());
            }
            Ok(Executed {
                rows_affected: 1,
                last_insert_id: Some(17),
            })
        }

        async fn query(&self, _statement: &Statement) -> std::result::Result<Vec<Row>, StoreError> {
            let mut guard = self.failures_left.lock().expect("poisoned lock");
            if *guard > 0 {
                *guard -= 1;
                return Err("transport reset".into());
            }
            let mut row = Row::new();
            row.insert("id", Value::Integer(3));
            Ok(vec![row])
        }
    }

    fn flaky(failures: u32) -> FlakyConnection {
        FlakyConnection {
            failures_left: Mutex::new(failures),
        }
    }

    #[test]
    fn query_should_retry_until_attempts_exhausted() {
        let gateway = Gateway::new(flaky(1), 2);
        let rows = block_on(gateway.query(&Statement::default())).unwrap();
        assert_eq!(rows[0].get_i64("id"), Some(3));

        let gateway = Gateway::new(flaky(2), 2);
        let result = block_on(gateway.query(&Statement::default()));
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[test]
    fn execute_should_not_retry() {
        let gateway = Gateway::new(flaky(1), 5);
        let result = block_on(gateway.execute(&Statement::default()));
        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(gateway.last_inserted_id(), None);
    }

    #[test]
    fn execute_should_record_last_inserted_id() {
        let gateway = Gateway::new(flaky(0), 1);
        block_on(gateway.execute(&Statement::default())).unwrap();
        assert_eq!(gateway.last_inserted_id(), Some(17));
    }

    #[test]
    fn row_should_widen_integers_to_floats() {
        let mut row = Row::new();
        row.insert("latitude", Value::Integer(34));
        assert_eq!(row.get_f64("latitude"), Some(34.0));
        assert_eq!(row.get_str("latitude"), None);
    }
}
