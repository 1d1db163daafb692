//! Microsoft SQL Server over `tiberius`

use super::dialect::{SqlDialect, SqlServerDialect};
use super::{QueryResult, SqlConnector, SqlDriver, SqlSession};
use crate::connector::{DataConnector, Operation, QUERY_OPERATIONS};
use crate::error::{ConnectorError, ConnectorResult};
use crate::registry::{parse_section, ConnectorFactory};
use crate::types::SensitiveString;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiberius::{AuthMethod, Client, Config, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;
use validator::Validate;

/// `databases.mssql`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct SqlServerConfig {
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

    /// Accept the server certificate without validation
    #[serde(rename = "TRUST_CERT", default)]
    pub trust_cert: bool,
}

struct SqlServerSession {
    client: Client<Compat<TcpStream>>,
}

#[async_trait]
impl SqlSession for SqlServerSession {
    async fn query(&mut self, sql: &str) -> ConnectorResult<QueryResult> {
        let mut stream = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| ConnectorError::query(format!("Query failed: {}", e)))?;

        let columns: Vec<String> = stream
            .columns()
            .await
            .map_err(ConnectorError::query)?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows = stream
            .into_first_result()
            .await
            .map_err(|e| ConnectorError::query(format!("Failed to fetch rows: {}", e)))?;

        let rows = rows
            .iter()
            .map(|row| (0..columns.len()).map(|i| tiberius_to_json(row, i)).collect())
            .collect();

        Ok(QueryResult { columns, rows })
    }

    async fn execute(&mut self, sql: &str) -> ConnectorResult<u64> {
        let result = self
            .client
            .execute(sql, &[])
            .await
            .map_err(|e| ConnectorError::query(format!("Execute failed: {}", e)))?;
        Ok(result.total())
    }
}

fn float(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Try typed getters in order; a NULL of any type falls through to `Null`
fn tiberius_to_json(row: &Row, idx: usize) -> Value {
    if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return float(v as f64);
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return float(v);
    }
    if let Ok(Some(v)) = row.try_get::<tiberius::numeric::Numeric, _>(idx) {
        let text = v.to_string();
        return text.parse::<f64>().map(float).unwrap_or(Value::String(text));
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<tiberius::Uuid, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDateTime, _>(idx) {
        return Value::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string());
    }
    if let Ok(Some(v)) = row.try_get::<chrono::DateTime<chrono::FixedOffset>, _>(idx) {
        return Value::String(v.to_rfc3339());
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDate, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveTime, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(bytes)) = row.try_get::<&[u8], _>(idx) {
        return Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect());
    }

    Value::Null
}

/// Driver for SQL Server
pub struct SqlServerDriver {
    config: SqlServerConfig,
    port: u16,
}

impl SqlServerDriver {
    pub fn new(config: SqlServerConfig) -> Self {
        let port = config.port.unwrap_or(1433);
        Self { config, port }
    }
}

#[async_trait]
impl SqlDriver for SqlServerDriver {
    fn dialect(&self) -> &dyn SqlDialect {
        &SqlServerDialect
    }

    fn default_database(&self) -> Option<&str> {
        self.config.database.as_deref()
    }

    async fn open(&self, database: &str) -> ConnectorResult<Box<dyn SqlSession>> {
        let mut tib_config = Config::new();
        tib_config.host(&self.config.host);
        tib_config.port(self.port);
        tib_config.database(database);
        tib_config.authentication(AuthMethod::sql_server(
            &self.config.username,
            self.config.password.expose_secret(),
        ));
        if self.config.trust_cert {
            tib_config.trust_cert();
        }

        let tcp = TcpStream::connect(tib_config.get_addr())
            .await
            .map_err(|e| ConnectorError::connection(format!("Failed to connect: {}", e)))?;
        tcp.set_nodelay(true).ok();

        let client = Client::connect(tib_config, tcp.compat_write())
            .await
            .map_err(|e| ConnectorError::auth(format!("Failed to authenticate: {}", e)))?;

        debug!(host = %self.config.host, port = self.port, database, "Connected to SQL Server");
        Ok(Box::new(SqlServerSession { client }))
    }
}

/// Factory for the `mssql` source
pub struct SqlServerFactory;

impl ConnectorFactory for SqlServerFactory {
    fn description(&self) -> &'static str {
        "Microsoft SQL Server database"
    }

    fn operations(&self) -> &'static [Operation] {
        QUERY_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(SqlServerConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: SqlServerConfig = parse_section(section)?;
        Ok(Box::new(SqlConnector::new(
            "mssql",
            Box::new(SqlServerDriver::new(config)),
        )))
    }
}
