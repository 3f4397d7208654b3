//! Record store contract and SQLite implementation.
//!
//! # Responsibility
//! - Provide schema-driven CRUD over parent and child tables.
//! - Scope a sequence of writes in one transaction with guaranteed rollback.
//!
//! # Invariants
//! - Identifiers are assigned here, on create, as random UUIDs.
//! - Child listings are returned in insertion order (`rowid ASC`).
//! - A transaction scope either commits every write or none of them, also
//!   when the scope unwinds.

use crate::db::DbError;
use crate::model::binding::EmbeddedResource;
use crate::model::record::{id_value, Record, RecordId};
use crate::model::schema::{FieldKind, FieldSpec, SchemaAdapter};
use log::{debug, error};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Row, Transaction, TransactionBehavior};
use serde_json::{Number, Value};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const SAVEPOINT_NAME: &str = "nestwrite_scope";

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence error for record store operations.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    NotFound { table: String, id: RecordId },
    MissingRequiredTable(String),
    MissingRequiredColumn { table: String, column: String },
    /// A value cannot be written to its column.
    UnsupportedValue { table: String, column: String },
    /// Persisted data cannot be converted to a valid record.
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound { table, id } => write!(f, "record not found in `{table}`: {id}"),
            Self::MissingRequiredTable(table) => {
                write!(f, "record store requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "record store requires column `{column}` in table `{table}`"
            ),
            Self::UnsupportedValue { table, column } => write!(
                f,
                "value for `{table}.{column}` is not a storable scalar"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted record: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Storage contract used by the reconciler and the save service.
pub trait RecordStore {
    /// Loads one record by identifier.
    fn fetch(&self, schema: &dyn SchemaAdapter, id: RecordId) -> StoreResult<Option<Record>>;
    /// Loads every record whose `foreign_key` points at `parent_id`.
    fn fetch_children(
        &self,
        schema: &dyn SchemaAdapter,
        foreign_key: &str,
        parent_id: RecordId,
    ) -> StoreResult<Vec<Record>>;
    /// Inserts a record, assigns its identifier and returns the stored row.
    fn create(&self, schema: &dyn SchemaAdapter, values: &Record) -> StoreResult<Record>;
    /// Overwrites the given fields and returns the stored row.
    fn update(
        &self,
        schema: &dyn SchemaAdapter,
        id: RecordId,
        values: &Record,
    ) -> StoreResult<Record>;
    fn delete(&self, schema: &dyn SchemaAdapter, id: RecordId) -> StoreResult<()>;
    /// Runs `scope` in one transaction: committed on `Ok`, rolled back
    /// otherwise.
    fn with_transaction<T, E, F>(&self, scope: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<StoreError>;
}

/// SQLite-backed record store.
pub struct SqliteRecordStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRecordStore<'conn> {
    /// Creates a store without checking the connection schema.
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Creates a store after checking that every table and column used by
    /// `resource` exists.
    pub fn try_new(conn: &'conn Connection, resource: &EmbeddedResource) -> StoreResult<Self> {
        for schema in resource.adapters() {
            ensure_table_ready(conn, schema)?;
        }
        Ok(Self { conn })
    }
}

impl RecordStore for SqliteRecordStore<'_> {
    fn fetch(&self, schema: &dyn SchemaAdapter, id: RecordId) -> StoreResult<Option<Record>> {
        let sql = format!(
            "{} WHERE {} = ?1;",
            select_sql(schema),
            quote(schema.id_field())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_record_row(row, schema)?));
        }
        Ok(None)
    }

    fn fetch_children(
        &self,
        schema: &dyn SchemaAdapter,
        foreign_key: &str,
        parent_id: RecordId,
    ) -> StoreResult<Vec<Record>> {
        let sql = format!(
            "{} WHERE {} = ?1 ORDER BY rowid ASC;",
            select_sql(schema),
            quote(foreign_key)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([parent_id.to_string()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row, schema)?);
        }
        Ok(records)
    }

    fn create(&self, schema: &dyn SchemaAdapter, values: &Record) -> StoreResult<Record> {
        let id = Uuid::new_v4();
        let mut columns = vec![quote(schema.id_field())];
        let mut bind_values = vec![SqlValue::Text(id.to_string())];

        for spec in schema.fields() {
            if let Some(value) = values.get(spec.name()) {
                columns.push(quote(spec.name()));
                bind_values.push(to_sql_value(schema, spec, value)?);
            }
        }

        let placeholders = (1..=bind_values.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({placeholders});",
                quote(schema.table()),
                columns.join(", ")
            ),
            params_from_iter(bind_values),
        )?;
        debug!(
            "event=record_create module=repo status=ok table={} id={id}",
            schema.table()
        );

        load_required_record(self, schema, id)
    }

    fn update(
        &self,
        schema: &dyn SchemaAdapter,
        id: RecordId,
        values: &Record,
    ) -> StoreResult<Record> {
        let mut assignments = Vec::new();
        let mut bind_values = Vec::new();

        for spec in schema.fields() {
            if let Some(value) = values.get(spec.name()) {
                bind_values.push(to_sql_value(schema, spec, value)?);
                assignments.push(format!("{} = ?{}", quote(spec.name()), bind_values.len()));
            }
        }

        if assignments.is_empty() {
            return load_required_record(self, schema, id);
        }

        bind_values.push(SqlValue::Text(id.to_string()));
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET {} WHERE {} = ?{};",
                quote(schema.table()),
                assignments.join(", "),
                quote(schema.id_field()),
                bind_values.len()
            ),
            params_from_iter(bind_values),
        )?;

        if changed == 0 {
            return Err(not_found(schema, id));
        }
        debug!(
            "event=record_update module=repo status=ok table={} id={id}",
            schema.table()
        );

        load_required_record(self, schema, id)
    }

    fn delete(&self, schema: &dyn SchemaAdapter, id: RecordId) -> StoreResult<()> {
        let changed = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1;",
                quote(schema.table()),
                quote(schema.id_field())
            ),
            [id.to_string()],
        )?;

        if changed == 0 {
            return Err(not_found(schema, id));
        }
        debug!(
            "event=record_delete module=repo status=ok table={} id={id}",
            schema.table()
        );
        Ok(())
    }

    fn with_transaction<T, E, F>(&self, scope: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<StoreError>,
    {
        let tx = TransactionScope::begin(self.conn)?;
        match scope(self) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}

/// Open transaction scope; both variants roll back on drop.
enum TransactionScope<'conn> {
    /// Outermost transaction, opened with `BEGIN IMMEDIATE`.
    Top(Transaction<'conn>),
    /// Nested scope inside a caller-owned transaction.
    Savepoint(SavepointGuard<'conn>),
}

impl<'conn> TransactionScope<'conn> {
    fn begin(conn: &'conn Connection) -> StoreResult<Self> {
        if conn.is_autocommit() {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            Ok(Self::Top(tx))
        } else {
            Ok(Self::Savepoint(SavepointGuard::begin(conn)?))
        }
    }

    fn commit(self) -> StoreResult<()> {
        match self {
            Self::Top(tx) => tx.commit()?,
            Self::Savepoint(savepoint) => savepoint.release()?,
        }
        Ok(())
    }

    fn rollback(self) {
        let (scope, result) = match self {
            Self::Top(tx) => ("top", tx.rollback()),
            Self::Savepoint(mut savepoint) => ("savepoint", savepoint.rollback()),
        };
        if let Err(err) = result {
            error!("event=tx_rollback module=repo status=error scope={scope} error={err}");
        }
    }
}

// `Connection::savepoint` needs `&mut Connection`, so nested scopes issue the
// savepoint statements directly.
struct SavepointGuard<'conn> {
    conn: &'conn Connection,
    finished: bool,
}

impl<'conn> SavepointGuard<'conn> {
    fn begin(conn: &'conn Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT_NAME};"))?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    fn release(mut self) -> rusqlite::Result<()> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {SAVEPOINT_NAME};"))?;
        self.finished = true;
        Ok(())
    }

    fn rollback(&mut self) -> rusqlite::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.conn.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {SAVEPOINT_NAME}; RELEASE SAVEPOINT {SAVEPOINT_NAME};"
        ))
    }
}

impl Drop for SavepointGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.rollback() {
            error!("event=tx_rollback module=repo status=error scope=savepoint error={err}");
        }
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn select_sql(schema: &dyn SchemaAdapter) -> String {
    let mut columns = vec![quote(schema.id_field())];
    columns.extend(schema.fields().iter().map(|spec| quote(spec.name())));
    format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        quote(schema.table())
    )
}

fn not_found(schema: &dyn SchemaAdapter, id: RecordId) -> StoreError {
    StoreError::NotFound {
        table: schema.table().to_string(),
        id,
    }
}

fn load_required_record(
    store: &SqliteRecordStore<'_>,
    schema: &dyn SchemaAdapter,
    id: RecordId,
) -> StoreResult<Record> {
    store
        .fetch(schema, id)?
        .ok_or_else(|| not_found(schema, id))
}

fn to_sql_value(
    schema: &dyn SchemaAdapter,
    spec: &FieldSpec,
    value: &Value,
) -> StoreResult<SqlValue> {
    let converted = match value {
        Value::Null => Some(SqlValue::Null),
        Value::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) if spec.kind() == FieldKind::Real => {
            number.as_f64().map(SqlValue::Real)
        }
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real)),
        Value::String(text) => Some(SqlValue::Text(text.clone())),
        Value::Array(_) | Value::Object(_) => None,
    };

    converted.ok_or_else(|| StoreError::UnsupportedValue {
        table: schema.table().to_string(),
        column: spec.name().to_string(),
    })
}

fn parse_record_row(row: &Row<'_>, schema: &dyn SchemaAdapter) -> StoreResult<Record> {
    let mut record = Record::new();

    let id_text: String = row.get(0)?;
    let id = Uuid::parse_str(&id_text).map_err(|_| {
        StoreError::InvalidData(format!(
            "invalid uuid value `{id_text}` in {}.{}",
            schema.table(),
            schema.id_field()
        ))
    })?;
    record.insert(schema.id_field().to_string(), id_value(id));

    for (offset, spec) in schema.fields().iter().enumerate() {
        let raw: SqlValue = row.get(offset + 1)?;
        let value = from_sql_value(spec.kind(), raw).ok_or_else(|| {
            StoreError::InvalidData(format!(
                "unexpected value in {}.{}",
                schema.table(),
                spec.name()
            ))
        })?;
        record.insert(spec.name().to_string(), value);
    }

    Ok(record)
}

fn from_sql_value(kind: FieldKind, raw: SqlValue) -> Option<Value> {
    match (kind, raw) {
        (_, SqlValue::Null) => Some(Value::Null),
        (FieldKind::Text { .. }, SqlValue::Text(text)) => Some(Value::String(text)),
        (FieldKind::Integer { .. }, SqlValue::Integer(number)) => Some(Value::from(number)),
        (FieldKind::Real, SqlValue::Real(number)) => Number::from_f64(number).map(Value::Number),
        (FieldKind::Real, SqlValue::Integer(number)) => {
            Number::from_f64(number as f64).map(Value::Number)
        }
        (FieldKind::Bool, SqlValue::Integer(0)) => Some(Value::Bool(false)),
        (FieldKind::Bool, SqlValue::Integer(1)) => Some(Value::Bool(true)),
        (FieldKind::Reference, SqlValue::Text(text)) => {
            Uuid::parse_str(&text).ok().map(id_value)
        }
        _ => None,
    }
}

fn ensure_table_ready(conn: &Connection, schema: &dyn SchemaAdapter) -> StoreResult<()> {
    let columns = table_columns(conn, schema.table())?;
    if columns.is_empty() {
        return Err(StoreError::MissingRequiredTable(schema.table().to_string()));
    }

    let required = std::iter::once(schema.id_field())
        .chain(schema.fields().iter().map(FieldSpec::name));
    for column in required {
        if !columns.contains(column) {
            return Err(StoreError::MissingRequiredColumn {
                table: schema.table().to_string(),
                column: column.to_string(),
            });
        }
    }

    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> StoreResult<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", quote(table)))?;
    let mut rows = stmt.query([])?;
    let mut columns = HashSet::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        columns.insert(name);
    }
    Ok(columns)
}
