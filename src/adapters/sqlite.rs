//! SQLite Relational Adapter
//!
//! Implements the `SqlExecutor` port with rusqlite. File-backed for
//! single-node deployments, in-memory for tests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};
use tracing::{debug, instrument};

use crate::domain::ports::SqlExecutor;
use crate::error::Result;
use crate::model::FieldMap;
use crate::sql::{check_identifier, ColumnMeta, Dialect, Executed, Statement, TableMeta};

/// SQLite-backed executor.
#[derive(Clone)]
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteExecutor").finish_non_exhaustive()
    }
}

impl SqliteExecutor {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run raw DDL, e.g. to create application tables.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

// =============================================================================
// Value Conversion
// =============================================================================

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

// =============================================================================
// Blocking Helpers
// =============================================================================

fn run_query(conn: &Connection, statement: &Statement) -> Result<Vec<FieldMap>> {
    let mut prepared = conn.prepare(&statement.sql)?;
    let names: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    let params: Vec<SqlValue> = statement.params.iter().map(to_sql).collect();
    let mut rows = prepared.query(params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut fields = FieldMap::new();
        for (i, name) in names.iter().enumerate() {
            fields.insert(name.clone(), from_sql(row.get_ref(i)?));
        }
        out.push(fields);
    }
    Ok(out)
}

fn run_execute(conn: &Connection, statement: &Statement) -> Result<Executed> {
    let params: Vec<SqlValue> = statement.params.iter().map(to_sql).collect();
    let affected = conn.execute(&statement.sql, params_from_iter(params.iter()))?;

    let is_insert = statement
        .sql
        .trim_start()
        .get(..6)
        .is_some_and(|verb| verb.eq_ignore_ascii_case("insert"));

    Ok(Executed {
        affected: affected as u64,
        last_insert_id: (is_insert && affected > 0).then(|| conn.last_insert_rowid()),
    })
}

fn read_table_meta(conn: &Connection, table: &str) -> Result<Option<TableMeta>> {
    let table = check_identifier(table)?;
    let quoted = Dialect::Sqlite.quote(table);

    // (name, declared type, pk position)
    let mut columns: Vec<(String, String, i64)> = Vec::new();
    {
        let mut info = conn.prepare(&format!("PRAGMA table_info({})", quoted))?;
        let mut rows = info.query([])?;
        while let Some(row) = rows.next()? {
            columns.push((row.get(1)?, row.get(2)?, row.get(5)?));
        }
    }
    if columns.is_empty() {
        return Ok(None);
    }

    let mut pk: Vec<(i64, String)> = columns
        .iter()
        .filter(|(_, _, pos)| *pos > 0)
        .map(|(name, _, pos)| (*pos, name.clone()))
        .collect();
    pk.sort();
    let primary_key: Vec<String> = pk.into_iter().map(|(_, name)| name).collect();

    // A lone INTEGER PRIMARY KEY aliases the rowid and is generated.
    let rowid_alias = match primary_key.as_slice() {
        [only] => columns
            .iter()
            .any(|(name, kind, _)| name == only && kind.eq_ignore_ascii_case("INTEGER")),
        _ => false,
    };

    let mut unique_keys = Vec::new();
    {
        let mut list = conn.prepare(&format!("PRAGMA index_list({})", quoted))?;
        let mut indexes: Vec<String> = Vec::new();
        let mut rows = list.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let unique: i64 = row.get(2)?;
            let origin: String = row.get(3)?;
            if unique == 1 && origin != "pk" {
                indexes.push(name);
            }
        }
        indexes.sort();

        for index in indexes {
            let mut info =
                conn.prepare(&format!("PRAGMA index_info({})", Dialect::Sqlite.quote(&index)))?;
            let mut cols: Vec<(i64, String)> = Vec::new();
            let mut rows = info.query([])?;
            while let Some(row) = rows.next()? {
                cols.push((row.get(0)?, row.get(2)?));
            }
            cols.sort();
            unique_keys.push(cols.into_iter().map(|(_, name)| name).collect());
        }
    }

    Ok(Some(TableMeta {
        name: table.to_string(),
        columns: columns
            .into_iter()
            .map(|(name, _, _)| ColumnMeta {
                auto_increment: rowid_alias && primary_key.first() == Some(&name),
                name,
            })
            .collect(),
        primary_key,
        unique_keys,
    }))
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    #[instrument(skip(self, statement), fields(sql = %statement.sql))]
    async fn query(&self, statement: &Statement) -> Result<Vec<FieldMap>> {
        let rows = run_query(&self.conn.lock(), statement)?;
        debug!(rows = rows.len(), "Query complete");
        Ok(rows)
    }

    #[instrument(skip(self, statement), fields(sql = %statement.sql))]
    async fn execute(&self, statement: &Statement) -> Result<Executed> {
        run_execute(&self.conn.lock(), statement)
    }

    async fn table_meta(&self, table: &str) -> Result<Option<TableMeta>> {
        read_table_meta(&self.conn.lock(), table)
    }

    async fn health_check(&self) -> Result<bool> {
        let one: i64 = self.conn.lock().query_row("SELECT 1", [], |row| row.get(0))?;
        Ok(one == 1)
    }
}

// =============================================================================
// Tests
// =============================================================================
