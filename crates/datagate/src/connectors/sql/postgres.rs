//! PostgreSQL and Amazon Redshift over `tokio-postgres`

use super::dialect::{PostgresDialect, RedshiftDialect, SqlDialect};
use super::{DatabaseConfig, QueryResult, SqlConnector, SqlDriver, SqlSession};
use crate::connector::{DataConnector, Operation, QUERY_OPERATIONS};
use crate::error::{ConnectorError, ConnectorResult};
use crate::registry::{parse_section, ConnectorFactory};
use crate::types::SensitiveString;
use async_trait::async_trait;
use rustls::ClientConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error};
use validator::Validate;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS mode for the connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    Disable,
    Require,
}

/// `datawarehouses.redshift`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct RedshiftConfig {
    #[serde(rename = "HOST")]
    #[validate(length(min = 1))]
    pub host: String,

    #[serde(rename = "PORT", default)]
    pub port: Option<u16>,

    #[serde(rename = "USERNAME")]
    #[validate(length(min = 1))]
    pub username: String,

    #[serde(rename = "PASSWORD")]
    pub password: SensitiveString,

    #[serde(rename = "DATABASE", default)]
    pub database: Option<String>,

    #[serde(rename = "SSLMODE", default)]
    pub ssl_mode: SslMode,
}

/// Session over a `tokio_postgres::Client`
struct PostgresSession {
    client: Client,
}

#[async_trait]
impl SqlSession for PostgresSession {
    async fn query(&mut self, sql: &str) -> ConnectorResult<QueryResult> {
        let stmt = self.client.prepare(sql).await.map_err(ConnectorError::query)?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let types: Vec<Type> = stmt.columns().iter().map(|c| c.type_().clone()).collect();

        let rows = self
            .client
            .query(&stmt, &[])
            .await
            .map_err(ConnectorError::query)?;

        let rows = rows
            .iter()
            .map(|row| {
                types
                    .iter()
                    .enumerate()
                    .map(|(idx, ty)| pg_value_to_json(row, idx, ty))
                    .collect()
            })
            .collect();

        Ok(QueryResult { columns, rows })
    }

    async fn execute(&mut self, sql: &str) -> ConnectorResult<u64> {
        self.client
            .execute(sql, &[])
            .await
            .map_err(ConnectorError::query)
    }
}

fn get<'a, T>(row: &'a Row, idx: usize) -> Option<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

fn float(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Convert one column of a row to JSON
fn pg_value_to_json(row: &Row, idx: usize, pg_type: &Type) -> Value {
    use rust_decimal::prelude::ToPrimitive;

    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::from),
        Type::INT4 => get::<i32>(row, idx).map(Value::from),
        Type::INT8 => get::<i64>(row, idx).map(Value::from),
        Type::OID => get::<u32>(row, idx).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx).map(|v| float(v as f64)),
        Type::FLOAT8 => get::<f64>(row, idx).map(float),
        Type::NUMERIC => get::<rust_decimal::Decimal>(row, idx)
            .map(|d| d.to_f64().map(float).unwrap_or_else(|| Value::String(d.to_string()))),
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(|b| Value::String(hex(&b))),
        Type::DATE => get::<chrono::NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        Type::TIME => get::<chrono::NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)
            .map(|t| Value::String(t.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|t| Value::String(t.to_rfc3339())),
        Type::UUID => get::<uuid::Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        Type::JSON | Type::JSONB => get::<Value>(row, idx),
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn rustls_config() -> ConnectorResult<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Ok(
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| ConnectorError::config(format!("TLS setup failed: {}", e)))?
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Driver for PostgreSQL-protocol servers
pub struct PostgresDriver {
    label: &'static str,
    host: String,
    port: u16,
    username: String,
    password: SensitiveString,
    database: Option<String>,
    ssl_mode: SslMode,
    dialect: Box<dyn SqlDialect>,
}

impl PostgresDriver {
    pub fn postgres(config: DatabaseConfig) -> Self {
        Self {
            label: "PostgreSQL",
            host: config.host,
            port: config.port.unwrap_or(5432),
            username: config.username,
            password: config.password,
            database: config.database,
            ssl_mode: SslMode::Disable,
            dialect: Box::new(PostgresDialect),
        }
    }

    pub fn redshift(config: RedshiftConfig) -> Self {
        Self {
            label: "Redshift",
            host: config.host,
            port: config.port.unwrap_or(5439),
            username: config.username,
            password: config.password,
            database: config.database,
            ssl_mode: config.ssl_mode,
            dialect: Box::new(RedshiftDialect),
        }
    }

    fn pg_config(&self, database: &str) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.host)
            .port(self.port)
            .user(&self.username)
            .password(self.password.expose_secret())
            .dbname(database)
            .application_name("datagate")
            .connect_timeout(CONNECT_TIMEOUT);
        pg
    }
}

#[async_trait]
impl SqlDriver for PostgresDriver {
    fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    fn default_database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    async fn open(&self, database: &str) -> ConnectorResult<Box<dyn SqlSession>> {
        let pg = self.pg_config(database);
        let label = self.label;

        let client = match self.ssl_mode {
            SslMode::Disable => {
                let (client, connection) = pg.connect(NoTls).await.map_err(|e| {
                    ConnectorError::connection(format!("Failed to connect to {}: {}", label, e))
                })?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("{} connection error: {}", label, e);
                    }
                });
                client
            }
            SslMode::Require => {
                let tls = MakeRustlsConnect::new(rustls_config()?);
                let (client, connection) = pg.connect(tls).await.map_err(|e| {
                    ConnectorError::connection(format!("Failed to connect to {}: {}", label, e))
                })?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("{} connection error: {}", label, e);
                    }
                });
                client
            }
        };

        debug!(host = %self.host, port = self.port, database, "Connected to {}", label);
        Ok(Box::new(PostgresSession { client }))
    }
}

/// Factory for the `postgresql` source
pub struct PostgresFactory;

impl ConnectorFactory for PostgresFactory {
    fn description(&self) -> &'static str {
        "PostgreSQL database"
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
            "postgresql",
            Box::new(PostgresDriver::postgres(config)),
        )))
    }
}

/// Factory for the `redshift` source
pub struct RedshiftFactory;

impl ConnectorFactory for RedshiftFactory {
    fn description(&self) -> &'static str {
        "Amazon Redshift data warehouse"
    }

    fn operations(&self) -> &'static [Operation] {
        QUERY_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(RedshiftConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: RedshiftConfig = parse_section(section)?;
        Ok(Box::new(SqlConnector::new(
            "redshift",
            Box::new(PostgresDriver::redshift(config)),
        )))
    }
}
