//! SQLite backend for the statement gateway.

use crate::error::{Error, Result, StoreError};
use crate::gateway::{Connection, Executed, Row, Statement, Value};
use crate::geo::{GeoPoint, haversine_km};
use crate::types::{RecordId, SecurityId, TEMPLATE_ROW_ID, Table};
use async_trait::async_trait;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{OpenFlags, params_from_iter};
use std::path::Path;
use std::sync::Mutex;

const TEMPLATE_DISCRIMINATOR: &str = "template";

fn table_schema(table: Table) -> String {
    let extra = match table {
        Table::Records => "",
        Table::SecurityNodes => {
            ",\n            delegated_ids TEXT,\n            login_id TEXT UNIQUE"
        }
    };
    let name = table.name();
    format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type_discriminator TEXT NOT NULL,
            read_security_id INTEGER,
            write_security_id INTEGER,
            owner_id INTEGER,
            name TEXT,
            tag0 TEXT, tag1 TEXT, tag2 TEXT, tag3 TEXT, tag4 TEXT,
            tag5 TEXT, tag6 TEXT, tag7 TEXT, tag8 TEXT, tag9 TEXT,
            latitude REAL,
            longitude REAL,
            context TEXT,
            payload BLOB,
            last_modified INTEGER{extra}
        );
        CREATE INDEX IF NOT EXISTS {name}_owner ON {name} (owner_id);
        CREATE INDEX IF NOT EXISTS {name}_type ON {name} (type_discriminator);
        CREATE INDEX IF NOT EXISTS {name}_location ON {name} (latitude, longitude);"
    )
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(value) => ToSqlOutput::Owned(SqlValue::Integer(*value)),
            Value::Real(value) => ToSqlOutput::Owned(SqlValue::Real(*value)),
            Value::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Value::Blob(value) => ToSqlOutput::Borrowed(ValueRef::Blob(value)),
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::Integer(value),
        ValueRef::Real(value) => Value::Real(value),
        ValueRef::Text(value) => Value::Text(String::from_utf8_lossy(value).into_owned()),
        ValueRef::Blob(value) => Value::Blob(value.to_vec()),
    }
}

fn is_insert(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("insert"))
}

/// Single-connection SQLite store.
///
/// Every statement runs in its own transaction, which is rolled back when the
/// statement fails. The `geo_distance_km(lat1, lon1, lat2, lon2)` SQL function
/// is registered on open for phase-one location filtering.
#[derive(Debug)]
pub struct SqliteConnection {
    inner: Mutex<rusqlite::Connection>,
}

impl SqliteConnection {
    /// Opens (or creates) a database file and bootstraps the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let connection = rusqlite::Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(store_error)?;
        Self::initialize(connection)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let connection = rusqlite::Connection::open_in_memory().map_err(store_error)?;
        Self::initialize(connection)
    }

    fn initialize(connection: rusqlite::Connection) -> Result<Self> {
        connection
            .create_scalar_function(
                "geo_distance_km",
                4,
                FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
                |ctx| {
                    let coordinates = (
                        ctx.get::<Option<f64>>(0)?,
                        ctx.get::<Option<f64>>(1)?,
                        ctx.get::<Option<f64>>(2)?,
                        ctx.get::<Option<f64>>(3)?,
                    );
                    let (Some(lat1), Some(lon1), Some(lat2), Some(lon2)) = coordinates else {
                        return Ok(None);
                    };
                    Ok(GeoPoint::new(lat1, lon1)
                        .and_then(|from| Ok((from, GeoPoint::new(lat2, lon2)?)))
                        .ok()
                        .map(|(from, to)| haversine_km(from, to)))
                },
            )
            .map_err(store_error)?;
        // The builtin LOWER folds ASCII only; text matching needs full case folding.
        connection
            .create_scalar_function(
                "lower",
                1,
                FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
                |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|text| text.to_lowercase())),
            )
            .map_err(store_error)?;
        connection
            .execute_batch(&format!(
                "{}\n{}",
                table_schema(Table::Records),
                table_schema(Table::SecurityNodes)
            ))
            .map_err(store_error)?;
        Ok(Self {
            inner: Mutex::new(connection),
        })
    }

    /// Installs the template rows and the superuser login.
    ///
    /// Idempotent. Template rows are readable and writable by the superuser
    /// only; the superuser row follows the security node invariants.
    pub fn install_baseline(&self, god_id: RecordId) -> Result<()> {
        if god_id.get() == TEMPLATE_ROW_ID {
            return Err(Error::InvalidId(format!(
                "superuser id {god_id} is reserved for template rows"
            )));
        }
        let god = Value::Integer(god_id.get());
        for table in [Table::Records, Table::SecurityNodes] {
            self.run_execute(&Statement::new(
                format!(
                    "INSERT OR IGNORE INTO {table} \
                     (id, type_discriminator, read_security_id, write_security_id) \
                     VALUES (?, ?, ?, ?)"
                ),
                vec![
                    Value::Integer(TEMPLATE_ROW_ID),
                    Value::from(TEMPLATE_DISCRIMINATOR),
                    god.clone(),
                    god.clone(),
                ],
            ))
            .map_err(Error::from)?;
        }
        self.run_execute(&Statement::new(
            format!(
                "INSERT OR IGNORE INTO {} \
                 (id, type_discriminator, read_security_id, write_security_id, \
                 name, delegated_ids) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                Table::SecurityNodes
            ),
            vec![
                god.clone(),
                Value::from("login"),
                god,
                Value::Integer(SecurityId::SELF_WRITE.get()),
                Value::from("superuser"),
                Value::from(""),
            ],
        ))
        .map_err(Error::from)?;
        tracing::debug!(god_id = %god_id, "baseline installed");
        Ok(())
    }

    fn run_execute(&self, statement: &Statement) -> std::result::Result<Executed, StoreError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| "sqlite connection mutex poisoned")?;
        let tx = guard.transaction()?;
        let rows_affected = tx.execute(&statement.sql, params_from_iter(statement.params.iter()))?;
        let last_insert_id =
            (is_insert(&statement.sql) && rows_affected > 0).then(|| tx.last_insert_rowid());
        tx.commit()?;
        Ok(Executed {
            rows_affected: rows_affected as u64,
            last_insert_id,
        })
    }

    fn run_query(&self, statement: &Statement) -> std::result::Result<Vec<Row>, StoreError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| "sqlite connection mutex poisoned")?;
        let tx = guard.transaction()?;
        let rows = {
            let mut prepared = tx.prepare(&statement.sql)?;
            let columns: Vec<String> = prepared
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            let mut cursor = prepared.query(params_from_iter(statement.params.iter()))?;
            let mut rows = Vec::new();
            while let Some(raw) = cursor.next()? {
                let mut row = Row::new();
                for (index, column) in columns.iter().enumerate() {
                    row.insert(column.clone(), from_sql(raw.get_ref(index)?));
                }
                rows.push(row);
            }
            rows
        };
        tx.commit()?;
        Ok(rows)
    }
}

fn store_error(error: rusqlite::Error) -> Error {
    Error::Connection(Box::new(error))
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn execute(&self, statement: &Statement) -> std::result::Result<Executed, StoreError> {
        self.run_execute(statement)
    }

    async fn query(&self, statement: &Statement) -> std::result::Result<Vec<Row>, StoreError> {
        self.run_query(statement)
    }
}
