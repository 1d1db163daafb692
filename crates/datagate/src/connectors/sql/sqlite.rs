//! SQLite over `rusqlite`; blocking calls run on the blocking pool

use super::dialect::{SqlDialect, SqliteDialect};
use super::{QueryResult, SqlConnector, SqlDriver, SqlSession};
use crate::connector::{DataConnector, Operation, QUERY_OPERATIONS};
use crate::error::{ConnectorError, ConnectorResult};
use crate::registry::{parse_section, ConnectorFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use validator::Validate;

/// `databases.sqlite`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct SqliteConfig {
    /// Database file path
    #[serde(rename = "DATABASE", default)]
    pub database: Option<String>,
}

fn sqlite_err(e: rusqlite::Error) -> ConnectorError {
    ConnectorError::query(e)
}

fn join_err(e: tokio::task::JoinError) -> ConnectorError {
    ConnectorError::query(format!("sqlite task failed: {}", e))
}

struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|x| format!("{:02x}", x)).collect()),
    }
}

#[async_trait]
impl SqlSession for SqliteSession {
    async fn query(&mut self, sql: &str) -> ConnectorResult<QueryResult> {
        let conn = self.conn.clone();
        let sql = sql.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let width = columns.len();

            let mut rows = stmt.query([]).map_err(sqlite_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(sqlite_err)? {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(value_ref_to_json(row.get_ref(i).map_err(sqlite_err)?));
                }
                out.push(values);
            }

            Ok(QueryResult { columns, rows: out })
        })
        .await
        .map_err(join_err)?
    }

    async fn execute(&mut self, sql: &str) -> ConnectorResult<u64> {
        let conn = self.conn.clone();
        let sql = sql.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let changed = conn.execute(&sql, []).map_err(sqlite_err)?;
            Ok(changed as u64)
        })
        .await
        .map_err(join_err)?
    }
}

/// Driver for SQLite database files
pub struct SqliteDriver {
    database: Option<String>,
}

impl SqliteDriver {
    pub fn new(config: SqliteConfig) -> Self {
        Self {
            database: config.database,
        }
    }
}

#[async_trait]
impl SqlDriver for SqliteDriver {
    fn dialect(&self) -> &dyn SqlDialect {
        &SqliteDialect
    }

    fn default_database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    async fn open(&self, database: &str) -> ConnectorResult<Box<dyn SqlSession>> {
        let path = database.to_string();
        let conn = tokio::task::spawn_blocking(move || Connection::open(&path))
            .await
            .map_err(join_err)?
            .map_err(|e| ConnectorError::connection(format!("Failed to open SQLite database: {}", e)))?;

        debug!(database, "Opened SQLite database");
        Ok(Box::new(SqliteSession {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

/// Factory for the `sqlite` source
pub struct SqliteFactory;

impl ConnectorFactory for SqliteFactory {
    fn description(&self) -> &'static str {
        "SQLite database file"
    }

    fn operations(&self) -> &'static [Operation] {
        QUERY_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(SqliteConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: SqliteConfig = parse_section(section)?;
        Ok(Box::new(SqlConnector::new(
            "sqlite",
            Box::new(SqliteDriver::new(config)),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::types::ValueRef;
    use serde_json::json;

    #[test]
    fn test_value_conversion() {
        assert_eq!(value_ref_to_json(ValueRef::Null), Value::Null);
        assert_eq!(value_ref_to_json(ValueRef::Integer(7)), json!(7));
        assert_eq!(value_ref_to_json(ValueRef::Real(0.25)), json!(0.25));
        assert_eq!(value_ref_to_json(ValueRef::Text(b"hi")), json!("hi"));
        assert_eq!(value_ref_to_json(ValueRef::Blob(&[1, 255])), json!("01ff"));
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let driver = SqliteDriver::new(SqliteConfig { database: None });

        let mut session = driver.open(path.to_str().unwrap()).await.unwrap();
        session.execute("CREATE TABLE t (a INTEGER, b TEXT)").await.unwrap();
        let n = session
            .execute("INSERT INTO t (a, b) VALUES (1, 'x'), (2, NULL)")
            .await
            .unwrap();
        assert_eq!(n, 2);

        let result = session.query("SELECT a, b FROM t ORDER BY a").await.unwrap();
        assert_eq!(result.columns, vec!["a", "b"]);
        assert_eq!(result.rows, vec![vec![json!(1), json!("x")], vec![json!(2), Value::Null]]);
    }

    #[tokio::test]
    async fn test_empty_result_keeps_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let driver = SqliteDriver::new(SqliteConfig { database: None });
        let mut session = driver.open(path.to_str().unwrap()).await.unwrap();
        session.execute("CREATE TABLE t (a INTEGER)").await.unwrap();

        let result = session.query("SELECT a FROM t").await.unwrap();
        assert_eq!(result.columns, vec!["a"]);
        assert!(result.rows.is_empty());
    }
}
