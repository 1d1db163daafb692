//! MySQL, MariaDB and StarRocks over `mysql_async`
//!
//! StarRocks speaks the MySQL protocol on its frontend query port (9030).

use super::dialect::{MySqlDialect, SqlDialect, StarRocksDialect};
use super::{DatabaseConfig, QueryResult, SqlConnector, SqlDriver, SqlSession};
use crate::connector::{DataConnector, Operation, QUERY_OPERATIONS};
use crate::error::{ConnectorError, ConnectorResult};
use crate::registry::{parse_section, ConnectorFactory};
use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row};
use serde_json::Value;
use tracing::debug;

struct MySqlSession {
    conn: Conn,
}

#[async_trait]
impl SqlSession for MySqlSession {
    async fn query(&mut self, sql: &str) -> ConnectorResult<QueryResult> {
        let mut result = self
            .conn
            .exec_iter(sql, ())
            .await
            .map_err(ConnectorError::query)?;

        let column_meta: Vec<(String, ColumnType)> = result
            .columns_ref()
            .iter()
            .map(|c| (c.name_str().to_string(), c.column_type()))
            .collect();
        let rows: Vec<Row> = result.collect().await.map_err(ConnectorError::query)?;

        let rows = rows
            .into_iter()
            .map(|mut row| {
                column_meta
                    .iter()
                    .enumerate()
                    .map(|(i, (_, ty))| {
                        let value = row.take(i).unwrap_or(mysql_async::Value::NULL);
                        mysql_value_to_json(value, *ty)
                    })
                    .collect()
            })
            .collect();

        Ok(QueryResult {
            columns: column_meta.into_iter().map(|(name, _)| name).collect(),
            rows,
        })
    }

    async fn execute(&mut self, sql: &str) -> ConnectorResult<u64> {
        self.conn
            .query_drop(sql)
            .await
            .map_err(ConnectorError::query)?;
        Ok(self.conn.affected_rows())
    }
}

/// Convert a MySQL value to JSON
fn mysql_value_to_json(value: mysql_async::Value, column_type: ColumnType) -> Value {
    use mysql_async::Value as My;

    match value {
        My::NULL => Value::Null,
        My::Bytes(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            match column_type {
                ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => text
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::String(text)),
                ColumnType::MYSQL_TYPE_JSON => {
                    serde_json::from_str(&text).unwrap_or(Value::String(text))
                }
                _ => Value::String(text),
            }
        }
        My::Int(i) => Value::from(i),
        My::UInt(u) => Value::from(u),
        My::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        My::Double(d) => serde_json::Number::from_f64(d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        My::Date(y, m, d, h, mi, s, us) => {
            let text = if column_type == ColumnType::MYSQL_TYPE_DATE {
                format!("{:04}-{:02}-{:02}", y, m, d)
            } else if us > 0 {
                format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    y, m, d, h, mi, s, us
                )
            } else {
                format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, m, d, h, mi, s)
            };
            Value::String(text)
        }
        My::Time(neg, days, h, m, s, us) => {
            let hours = days * 24 + h as u32;
            let sign = if neg { "-" } else { "" };
            let text = if us > 0 {
                format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, m, s, us)
            } else {
                format!("{}{:02}:{:02}:{:02}", sign, hours, m, s)
            };
            Value::String(text)
        }
    }
}

/// Driver for MySQL-protocol servers
pub struct MySqlDriver {
    config: DatabaseConfig,
    port: u16,
    dialect: &'static dyn SqlDialect,
}

impl MySqlDriver {
    pub fn new(config: DatabaseConfig) -> Self {
        let port = config.port.unwrap_or(3306);
        Self {
            config,
            port,
            dialect: &MySqlDialect,
        }
    }

    /// StarRocks frontend, port 9030 unless configured
    pub fn starrocks(config: DatabaseConfig) -> Self {
        let port = config.port.unwrap_or(9030);
        Self {
            config,
            port,
            dialect: &StarRocksDialect,
        }
    }
}

#[async_trait]
impl SqlDriver for MySqlDriver {
    fn dialect(&self) -> &dyn SqlDialect {
        self.dialect
    }

    fn default_database(&self) -> Option<&str> {
        self.config.database.as_deref()
    }

    async fn open(&self, database: &str) -> ConnectorResult<Box<dyn SqlSession>> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.port)
            .user(Some(self.config.username.clone()))
            .pass(Some(self.config.password.expose_secret().to_string()))
            .db_name(Some(database.to_string()));

        let server = self.dialect.name();
        let conn = Conn::new(opts).await.map_err(|e| {
            ConnectorError::connection(format!("Failed to connect to {}: {}", server, e))
        })?;

        debug!(host = %self.config.host, port = self.port, database, server, "Connected");
        Ok(Box::new(MySqlSession { conn }))
    }
}

/// Factory for the `mysql`, `mariadb` and `starrocks` sources
pub struct MySqlFactory {
    source_id: &'static str,
    description: &'static str,
    driver: fn(DatabaseConfig) -> MySqlDriver,
}

impl MySqlFactory {
    pub fn mysql() -> Self {
        Self {
            source_id: "mysql",
            description: "MySQL database",
            driver: MySqlDriver::new,
        }
    }

    pub fn mariadb() -> Self {
        Self {
            source_id: "mariadb",
            description: "MariaDB database",
            driver: MySqlDriver::new,
        }
    }

    pub fn starrocks() -> Self {
        Self {
            source_id: "starrocks",
            description: "StarRocks analytical database",
            driver: MySqlDriver::starrocks,
        }
    }
}

impl ConnectorFactory for MySqlFactory {
    fn description(&self) -> &'static str {
        self.description
    }

    fn operations(&self) -> &'static [Operation] {
        QUERY_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(DatabaseConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: DatabaseConfig = parse_section(section)?;
        Ok(Box::new(SqlConnector::new(
            self.source_id,
            Box::new((self.driver)(config)),
        )))
    }
}
