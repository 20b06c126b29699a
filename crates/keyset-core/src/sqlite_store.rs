//! SQLite-backed metadata store and namespace directory.

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row,
    functions::{Context, FunctionFlags},
    params, params_from_iter,
    types::{Type, Value},
};
use time::{Duration, OffsetDateTime};
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::{KeysetError, KeysetResult},
    models::{KeysetId, KeysetMetadata, KeysetPage, KeysetQuery, KeysetSort},
    namespaces::{NamespaceDirectory, validate_namespace},
    store::{KeysetStore, UnitOfWork},
};

const SCHEMA: &str = r#"
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS namespaces (
        name TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS keysets (
        id TEXT PRIMARY KEY,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        algorithm TEXT NOT NULL,
        state TEXT NOT NULL,
        description TEXT,
        tags TEXT NOT NULL,
        rotation_period_nanos INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        last_rotated_at INTEGER,
        destroyed_at INTEGER,
        UNIQUE (namespace, name)
    );
    CREATE INDEX IF NOT EXISTS idx_keysets_namespace_state ON keysets(namespace, state);
"#;

const COLUMNS: &str = "id, namespace, name, algorithm, state, description, tags, \
     rotation_period_nanos, created_at, updated_at, last_rotated_at, destroyed_at";

pub struct SqliteKeysetStore {
    conn: Mutex<Connection>,
}

impl SqliteKeysetStore {
    pub fn new<P: AsRef<Path>>(path: P) -> KeysetResult<Self> {
        let conn = Connection::open(path).map_err(KeysetError::storage)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> KeysetResult<Self> {
        let conn = Connection::open_in_memory().map_err(KeysetError::storage)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> KeysetResult<Self> {
        conn.execute_batch(SCHEMA).map_err(KeysetError::storage)?;
        // SQLite's built-in lower() only folds ASCII.
        conn.create_scalar_function(
            "fold_case",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            fold_case,
        )
        .map_err(KeysetError::storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeysetStore for SqliteKeysetStore {
    fn get(&self, id: &KeysetId) -> KeysetResult<Option<KeysetMetadata>> {
        let conn = self.conn.lock();
        fetch(&conn, id)
    }

    fn find(&self, query: &KeysetQuery) -> KeysetResult<KeysetPage> {
        let conn = self.conn.lock();
        let (clause, mut values) = where_clause(query);

        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM keysets{clause}"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .map_err(KeysetError::storage)?;

        let order = match query.sort {
            KeysetSort::Created => "created_at ASC, id ASC",
            KeysetSort::NameAsc => "name ASC, id ASC",
            KeysetSort::NameDesc => "name DESC, id ASC",
        };
        values.push(Value::Integer(i64::from(query.effective_per_page())));
        values.push(Value::Integer(query.offset() as i64));
        let sql = format!("SELECT {COLUMNS} FROM keysets{clause} ORDER BY {order} LIMIT ? OFFSET ?");
        let mut stmt = conn.prepare(&sql).map_err(KeysetError::storage)?;
        let items = stmt
            .query_map(params_from_iter(values.iter()), map_row)
            .map_err(KeysetError::storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(KeysetError::storage)?;

        Ok(KeysetPage::new(items, total as usize, query))
    }

    fn begin(&self) -> KeysetResult<Box<dyn UnitOfWork + '_>> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(KeysetError::storage)?;
        Ok(Box::new(SqliteUnitOfWork {
            conn,
            finished: false,
        }))
    }
}

impl NamespaceDirectory for SqliteKeysetStore {
    fn exists(&self, namespace: &str) -> KeysetResult<bool> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM namespaces WHERE name = ?1",
            params![namespace],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .map_err(KeysetError::storage)
    }

    fn register(&self, namespace: &str) -> KeysetResult<()> {
        let namespace = validate_namespace(namespace)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?1, ?2)",
            params![namespace, to_nanos(OffsetDateTime::now_utc())?],
        )
        .map_err(KeysetError::storage)?;
        Ok(())
    }

    fn list(&self) -> KeysetResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name FROM namespaces ORDER BY name ASC")
            .map_err(KeysetError::storage)?;
        stmt.query_map([], |row| row.get::<_, String>(0))
            .map_err(KeysetError::storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(KeysetError::storage)
    }
}

struct SqliteUnitOfWork<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl UnitOfWork for SqliteUnitOfWork<'_> {
    fn get_for_update(&mut self, id: &KeysetId) -> KeysetResult<Option<KeysetMetadata>> {
        fetch(&self.conn, id)
    }

    fn name_taken(&mut self, namespace: &str, name: &str) -> KeysetResult<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM keysets WHERE namespace = ?1 AND name = ?2",
                params![namespace, name],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(KeysetError::storage)
    }

    fn insert(&mut self, metadata: &KeysetMetadata) -> KeysetResult<()> {
        let values = row_values(metadata)?;
        let result = self.conn.execute(
            &format!(
                "INSERT INTO keysets ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params_from_iter(values.iter()),
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(KeysetError::AlreadyExists {
                    namespace: metadata.namespace.clone(),
                    name: metadata.name.clone(),
                })
            }
            Err(err) => Err(KeysetError::storage(err)),
        }
    }

    fn update(&mut self, metadata: &KeysetMetadata) -> KeysetResult<()> {
        let values = row_values(metadata)?;
        let rows = self
            .conn
            .execute(
                "UPDATE keysets SET namespace = ?2, name = ?3, algorithm = ?4, state = ?5, \
                 description = ?6, tags = ?7, rotation_period_secs = ?8, created_at = ?9, \
                 updated_at = ?10, last_rotated_at = ?11, destroyed_at = ?12 WHERE id = ?1",
                params_from_iter(values.iter()),
            )
            .map_err(KeysetError::storage)?;
        if rows == 0 {
            return Err(KeysetError::not_found(&metadata.id));
        }
        Ok(())
    }

    fn delete(&mut self, id: &KeysetId) -> KeysetResult<()> {
        let rows = self
            .conn
            .execute("DELETE FROM keysets WHERE id = ?1", params![id.to_string()])
            .map_err(KeysetError::storage)?;
        if rows == 0 {
            return Err(KeysetError::not_found(id));
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> KeysetResult<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(KeysetError::storage)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished
            && let Err(err) = self.conn.execute_batch("ROLLBACK")
        {
            warn!(error = %err, "failed to roll back keyset transaction");
        }
    }
}

fn fetch(conn: &Connection, id: &KeysetId) -> KeysetResult<Option<KeysetMetadata>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM keysets WHERE id = ?1"),
        params![id.to_string()],
        map_row,
    )
    .optional()
    .map_err(KeysetError::storage)
}

/// Build the shared WHERE clause for count and page queries.
fn where_clause(query: &KeysetQuery) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    let criteria = &query.criteria;
    if let Some(namespace) = &criteria.namespace {
        clauses.push("namespace = ?");
        values.push(Value::Text(namespace.clone()));
    }
    if let Some(algorithm) = criteria.algorithm {
        clauses.push("algorithm = ?");
        values.push(Value::Text(algorithm.as_str().to_string()));
    }
    if let Some(state) = criteria.state {
        clauses.push("state = ?");
        values.push(Value::Text(state.as_str().to_string()));
    }
    if let Some(id) = criteria.id {
        clauses.push("id = ?");
        values.push(Value::Text(id.to_string()));
    }
    if let Some(term) = query.normalized_term() {
        clauses.push(
            "(instr(fold_case(name), ?) > 0 OR instr(fold_case(coalesce(description, '')), ?) > 0)",
        );
        values.push(Value::Text(term.clone()));
        values.push(Value::Text(term));
    }
    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

fn row_values(metadata: &KeysetMetadata) -> KeysetResult<Vec<Value>> {
    let tags = serde_json::to_string(&metadata.tags).map_err(KeysetError::storage)?;
    let optional_nanos = |ts: Option<OffsetDateTime>| -> KeysetResult<Value> {
        Ok(match ts {
            Some(ts) => Value::Integer(to_nanos(ts)?),
            None => Value::Null,
        })
    };
    Ok(vec![
        Value::Text(metadata.id.to_string()),
        Value::Text(metadata.namespace.clone()),
        Value::Text(metadata.name.clone()),
        Value::Text(metadata.algorithm.as_str().to_string()),
        Value::Text(metadata.state.as_str().to_string()),
        metadata
            .description
            .clone()
            .map_or(Value::Null, Value::Text),
        Value::Text(tags),
        metadata
            .rotation_period
            .map(|period| {
                i64::try_from(period.whole_nanoseconds())
                    .map(Value::Integer)
                    .map_err(|_| KeysetError::invalid("rotation period out of range"))
            })
            .transpose()?
            .unwrap_or(Value::Null),
        Value::Integer(to_nanos(metadata.created_at)?),
        Value::Integer(to_nanos(metadata.updated_at)?),
        optional_nanos(metadata.last_rotated_at)?,
        optional_nanos(metadata.destroyed_at)?,
    ])
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<KeysetMetadata> {
    let id: String = row.get(0)?;
    let algorithm: String = row.get(3)?;
    let state: String = row.get(4)?;
    let tags: String = row.get(6)?;
    let rotation_period: Option<i64> = row.get(7)?;
    let last_rotated_at: Option<i64> = row.get(10)?;
    let destroyed_at: Option<i64> = row.get(11)?;

    Ok(KeysetMetadata {
        id: Uuid::parse_str(&id).map_err(|err| conversion_error(0, err))?,
        namespace: row.get(1)?,
        name: row.get(2)?,
        algorithm: algorithm.parse().map_err(|err| conversion_error(3, err))?,
        state: state.parse().map_err(|err| conversion_error(4, err))?,
        description: row.get(5)?,
        tags: serde_json::from_str(&tags).map_err(|err| conversion_error(6, err))?,
        rotation_period: rotation_period.map(Duration::nanoseconds),
        created_at: from_nanos(8, row.get(8)?)?,
        updated_at: from_nanos(9, row.get(9)?)?,
        last_rotated_at: last_rotated_at.map(|n| from_nanos(10, n)).transpose()?,
        destroyed_at: destroyed_at.map(|n| from_nanos(11, n)).transpose()?,
    })
}

fn fold_case(ctx: &Context<'_>) -> rusqlite::Result<Option<String>> {
    let text: Option<String> = ctx.get(0)?;
    Ok(text.map(|text| text.to_lowercase()))
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn to_nanos(ts: OffsetDateTime) -> KeysetResult<i64> {
    i64::try_from(ts.unix_timestamp_nanos())
        .map_err(|_| KeysetError::storage(format!("timestamp {ts} out of range")))
}

fn from_nanos(column: usize, nanos: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(column, Type::Integer, Box::new(err))
    })
}
