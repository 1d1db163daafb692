//! SQL database connectors
//!
//! Every relational backend implements [`SqlDriver`] (open a session against a
//! database) and [`SqlSession`] (run a query, execute a statement). The shared
//! [`SqlConnector`] turns those two primitives into the dataframe contract:
//!
//! ```text
//! read_as_dataframe(Query)  ──▶ open(db) ─▶ [set schema] ─▶ query ─▶ DataFrame
//! write_dataframe(Table)    ──▶ open(db) ─▶ drop/create  ─▶ INSERT chunks
//! download_file(Query)      ──▶ read_as_dataframe ─▶ local file by extension
//! ```
//!
//! The database for a call is taken from the request first, then from the
//! `DATABASE` key of the section; with neither the call fails with
//! `MissingParameter`.

pub mod dialect;

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "sqlserver")]
pub mod sqlserver;

use crate::connector::{
    unexpected_read, unexpected_write, DataConnector, IfExists, Operation, ReadRequest,
    WriteRequest, WriteSummary, QUERY_OPERATIONS,
};
use crate::error::{ConnectorError, ConnectorResult};
use crate::frame::DataFrame;
use crate::types::SensitiveString;
use async_trait::async_trait;
use dialect::SqlDialect;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use validator::Validate;

/// Columns and rows returned by a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn into_frame(self) -> ConnectorResult<DataFrame> {
        DataFrame::from_rows(&self.columns, self.rows)
    }
}

/// An open connection
#[async_trait]
pub trait SqlSession: Send {
    /// Run a statement that returns rows
    async fn query(&mut self, sql: &str) -> ConnectorResult<QueryResult>;

    /// Run a statement, returning the affected row count
    async fn execute(&mut self, sql: &str) -> ConnectorResult<u64>;

    /// Make `schema` the default for later statements
    async fn set_schema(&mut self, dialect: &dyn SqlDialect, schema: &str) -> ConnectorResult<()> {
        if let Some(sql) = dialect.set_schema_sql(schema) {
            self.execute(&sql).await?;
        }
        Ok(())
    }
}

/// Opens sessions against one configured server
#[async_trait]
pub trait SqlDriver: Send + Sync {
    fn dialect(&self) -> &dyn SqlDialect;

    /// `DATABASE` from the configuration section, if set
    fn default_database(&self) -> Option<&str>;

    async fn open(&self, database: &str) -> ConnectorResult<Box<dyn SqlSession>>;
}

/// Section keys shared by the server-based SQL backends
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct DatabaseConfig {
    #[serde(rename = "HOST")]
    #[validate(length(min = 1))]
    pub host: String,

    /// Backend default when omitted
    #[serde(rename = "PORT", default)]
    pub port: Option<u16>,

    #[serde(rename = "USERNAME")]
    #[validate(length(min = 1))]
    pub username: String,

    #[serde(rename = "PASSWORD")]
    pub password: SensitiveString,

    #[serde(rename = "DATABASE", default)]
    pub database: Option<String>,
}

/// Dataframe contract over a [`SqlDriver`]
pub struct SqlConnector {
    name: String,
    driver: Box<dyn SqlDriver>,
}

impl SqlConnector {
    pub fn new(name: impl Into<String>, driver: Box<dyn SqlDriver>) -> Self {
        Self {
            name: name.into(),
            driver,
        }
    }

    fn resolve_database<'a>(&'a self, requested: Option<&'a str>) -> ConnectorResult<&'a str> {
        requested
            .filter(|d| !d.is_empty())
            .or_else(|| self.driver.default_database())
            .ok_or_else(|| {
                ConnectorError::MissingParameter(format!(
                    "database: pass one in the request or set DATABASE in the '{}' section",
                    self.name
                ))
            })
    }

    async fn session(
        &self,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> ConnectorResult<Box<dyn SqlSession>> {
        let database = self.resolve_database(database)?;
        let mut session = self.driver.open(database).await?;
        if let Some(schema) = schema.filter(|s| !s.is_empty()) {
            session.set_schema(self.driver.dialect(), schema).await?;
        }
        Ok(session)
    }
}

#[async_trait]
impl DataConnector for SqlConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations(&self) -> &'static [Operation] {
        QUERY_OPERATIONS
    }

    async fn read_as_dataframe(&self, request: &ReadRequest) -> ConnectorResult<DataFrame> {
        let ReadRequest::Query {
            sql,
            database,
            schema,
        } = request
        else {
            return Err(unexpected_read(&self.name, request));
        };

        let mut session = self.session(database.as_deref(), schema.as_deref()).await?;
        let result = session.query(sql).await?;
        let frame = result.into_frame()?;

        info!(
            connector = %self.name,
            rows = frame.num_rows(),
            columns = frame.num_columns(),
            "Query returned"
        );
        Ok(frame)
    }

    async fn write_dataframe(
        &self,
        frame: &DataFrame,
        request: &WriteRequest,
    ) -> ConnectorResult<WriteSummary> {
        let WriteRequest::Table {
            table,
            database,
            schema,
            if_exists,
        } = request
        else {
            return Err(unexpected_write(&self.name, request));
        };
        if frame.num_columns() == 0 {
            return Err(ConnectorError::invalid_request("frame has no columns"));
        }

        let dialect = self.driver.dialect();
        let target = dialect.qualified_table(schema.as_deref(), table);
        let mut session = self.session(database.as_deref(), None).await?;

        match if_exists {
            IfExists::Replace => {
                session.execute(&dialect.drop_table_sql(&target)).await?;
                session
                    .execute(&dialect.create_table_sql(&target, frame.schema(), false))
                    .await?;
            }
            IfExists::Fail => {
                session
                    .execute(&dialect.create_table_sql(&target, frame.schema(), false))
                    .await?;
            }
            IfExists::Append => {
                session
                    .execute(&dialect.create_table_sql(&target, frame.schema(), true))
                    .await?;
            }
        }

        let columns = frame.column_names();
        let rows: Vec<Vec<Value>> = frame
            .to_json_records()?
            .into_iter()
            .map(|mut record| {
                columns
                    .iter()
                    .map(|c| record.remove(*c).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        let mut written = 0u64;
        for chunk in rows.chunks(dialect.max_rows_per_insert()) {
            let sql = dialect.insert_sql(&target, &columns, chunk);
            session.execute(&sql).await?;
            written += chunk.len() as u64;
            debug!(connector = %self.name, table = %target, written, "Inserted chunk");
        }

        info!(
            connector = %self.name,
            table = %target,
            rows = written,
            mode = ?if_exists,
            "Wrote dataframe"
        );
        Ok(WriteSummary::new(target, written))
    }
}
