//! The connector contract shared by every backend
//!
//! A connector is produced by a [`ConnectorFactory`](crate::ConnectorFactory)
//! and exposes the same dataframe and file operations regardless of whether
//! it talks to an object store, a warehouse, a SQL database or a document
//! store. Operations a backend cannot perform fail with
//! [`ConnectorError::UnsupportedOperation`].

use crate::error::{ConnectorError, ConnectorResult};
use crate::format::{self, FileFormat};
use crate::frame::DataFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Operations a connector may support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ReadDataframe,
    WriteDataframe,
    DownloadFile,
    UploadFile,
    UploadFolder,
    DownloadFolder,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadDataframe => "read_as_dataframe",
            Self::WriteDataframe => "write_dataframe",
            Self::DownloadFile => "download_file",
            Self::UploadFile => "upload_file",
            Self::UploadFolder => "upload_folder",
            Self::DownloadFolder => "download_folder",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every operation, for object stores
pub const ALL_OPERATIONS: &[Operation] = &[
    Operation::ReadDataframe,
    Operation::WriteDataframe,
    Operation::DownloadFile,
    Operation::UploadFile,
    Operation::UploadFolder,
    Operation::DownloadFolder,
];

/// Read, write and query download, for SQL backends
pub const QUERY_OPERATIONS: &[Operation] = &[
    Operation::ReadDataframe,
    Operation::WriteDataframe,
    Operation::DownloadFile,
];

/// Read and write only, for document stores
pub const DATAFRAME_OPERATIONS: &[Operation] =
    &[Operation::ReadDataframe, Operation::WriteDataframe];

/// Bucket and key of an object in an object store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into().trim_start_matches('/').to_string(),
        }
    }

    /// Parse `scheme://bucket/key` (`s3://`, `gs://`, `az://`, ...)
    ///
    /// The key is taken verbatim; object keys are not percent-encoded.
    pub fn parse(uri: &str) -> ConnectorResult<Self> {
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| {
            ConnectorError::invalid_request(format!(
                "invalid path '{}': expected scheme://bucket/key",
                uri
            ))
        })?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConnectorError::invalid_request(format!(
                "invalid scheme in path '{}'",
                uri
            )));
        }
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ConnectorError::invalid_request(format!(
                "path '{}' has no bucket",
                uri
            )));
        }
        Ok(Self::new(bucket, key))
    }

    /// Whether the key selects several objects (`*` or `/` suffix, or empty)
    pub fn is_prefix(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('*') || self.key.ends_with('/')
    }

    /// The key with any trailing `*` removed, used as a string prefix
    pub fn prefix(&self) -> &str {
        self.key.trim_end_matches('*')
    }

    /// Last path segment of the key
    pub fn file_name(&self) -> Option<&str> {
        self.key
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Location with `name` appended as a new path segment
    pub fn join(&self, name: &str) -> Self {
        let base = self.key.trim_end_matches('*').trim_end_matches('/');
        let key = if base.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", base, name.trim_start_matches('/'))
        };
        Self::new(self.bucket.clone(), key)
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// What to read
#[derive(Debug, Clone)]
pub enum ReadRequest {
    /// One object, or every object under a prefix
    Object {
        location: ObjectLocation,
        format: Option<FileFormat>,
    },
    /// A SQL query
    Query {
        sql: String,
        database: Option<String>,
        schema: Option<String>,
    },
    /// Documents from a collection
    Collection {
        database: String,
        collection: String,
        filter: Option<serde_json::Value>,
    },
    /// A search against an index
    Search {
        index: String,
        query: serde_json::Value,
    },
    /// Every item of a key-value table
    Table { table: String },
}

impl ReadRequest {
    pub fn object(location: ObjectLocation) -> Self {
        Self::Object {
            location,
            format: None,
        }
    }

    pub fn query(sql: impl Into<String>) -> Self {
        Self::Query {
            sql: sql.into(),
            database: None,
            schema: None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Object { .. } => "object",
            Self::Query { .. } => "query",
            Self::Collection { .. } => "collection",
            Self::Search { .. } => "search",
            Self::Table { .. } => "table",
        }
    }
}

/// Behaviour when the target table already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    #[default]
    Append,
    Replace,
    Fail,
}

impl std::str::FromStr for IfExists {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "replace" => Ok(Self::Replace),
            "fail" => Ok(Self::Fail),
            other => Err(ConnectorError::invalid_request(format!(
                "if_exists must be append, replace or fail, got '{}'",
                other
            ))),
        }
    }
}

/// Where to write
#[derive(Debug, Clone)]
pub enum WriteRequest {
    Object {
        location: ObjectLocation,
        format: Option<FileFormat>,
    },
    Table {
        table: String,
        database: Option<String>,
        schema: Option<String>,
        if_exists: IfExists,
    },
    Collection {
        database: String,
        collection: String,
    },
    Index {
        index: String,
    },
}

impl WriteRequest {
    pub fn table(table: impl Into<String>) -> Self {
        Self::Table {
            table: table.into(),
            database: None,
            schema: None,
            if_exists: IfExists::default(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Object { .. } => "object",
            Self::Table { .. } => "table",
            Self::Collection { .. } => "collection",
            Self::Index { .. } => "index",
        }
    }
}

/// What to download
#[derive(Debug, Clone)]
pub enum DownloadRequest {
    /// Copy an object into a local directory, keeping its file name
    Object {
        location: ObjectLocation,
        destination_dir: PathBuf,
    },
    /// Run a query and write the result to a local file
    Query {
        sql: String,
        database: Option<String>,
        schema: Option<String>,
        destination: PathBuf,
    },
}

/// Outcome of a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub target: String,
    pub rows_written: u64,
}

impl WriteSummary {
    pub fn new(target: impl Into<String>, rows_written: u64) -> Self {
        Self {
            target: target.into(),
            rows_written,
        }
    }
}

/// Uniform data access over a configured backend
#[async_trait]
pub trait DataConnector: Send + Sync {
    /// Source id this connector was built for
    fn name(&self) -> &str;

    /// Operations this connector implements
    fn operations(&self) -> &'static [Operation];

    fn supports(&self, operation: Operation) -> bool {
        self.operations().contains(&operation)
    }

    async fn read_as_dataframe(&self, request: &ReadRequest) -> ConnectorResult<DataFrame> {
        let _ = request;
        Err(ConnectorError::unsupported(self.name(), Operation::ReadDataframe))
    }

    async fn write_dataframe(
        &self,
        frame: &DataFrame,
        request: &WriteRequest,
    ) -> ConnectorResult<WriteSummary> {
        let _ = (frame, request);
        Err(ConnectorError::unsupported(self.name(), Operation::WriteDataframe))
    }

    /// Download an object, or the result of a query, to the local filesystem.
    ///
    /// The query form runs [`read_as_dataframe`](Self::read_as_dataframe) and
    /// writes the result in the format named by the destination's extension.
    async fn download_file(&self, request: &DownloadRequest) -> ConnectorResult<PathBuf> {
        match request {
            DownloadRequest::Query {
                sql,
                database,
                schema,
                destination,
            } => {
                let format = FileFormat::from_path(destination)?;
                let frame = self
                    .read_as_dataframe(&ReadRequest::Query {
                        sql: sql.clone(),
                        database: database.clone(),
                        schema: schema.clone(),
                    })
                    .await?;
                format::write_local(&frame, destination, format).await?;
                info!(
                    connector = self.name(),
                    rows = frame.num_rows(),
                    path = %destination.display(),
                    "Downloaded query result"
                );
                Ok(destination.clone())
            }
            DownloadRequest::Object { .. } => {
                Err(ConnectorError::unsupported(self.name(), Operation::DownloadFile))
            }
        }
    }

    async fn upload_file(
        &self,
        source: &Path,
        location: &ObjectLocation,
    ) -> ConnectorResult<ObjectLocation> {
        let _ = (source, location);
        Err(ConnectorError::unsupported(self.name(), Operation::UploadFile))
    }

    async fn upload_folder(
        &self,
        source: &Path,
        location: &ObjectLocation,
    ) -> ConnectorResult<Vec<ObjectLocation>> {
        let _ = (source, location);
        Err(ConnectorError::unsupported(self.name(), Operation::UploadFolder))
    }

    async fn download_folder(
        &self,
        location: &ObjectLocation,
        destination: &Path,
    ) -> ConnectorResult<PathBuf> {
        let _ = (location, destination);
        Err(ConnectorError::unsupported(self.name(), Operation::DownloadFolder))
    }
}

/// Error for a request variant the connector does not handle
pub fn unexpected_read(connector: &str, request: &ReadRequest) -> ConnectorError {
    ConnectorError::invalid_request(format!(
        "connector '{}' cannot read a {} request",
        connector,
        request.kind()
    ))
}

/// Error for a write target the connector does not handle
pub fn unexpected_write(connector: &str, request: &WriteRequest) -> ConnectorError {
    ConnectorError::invalid_request(format!(
        "connector '{}' cannot write to a {} target",
        connector,
        request.kind()
    ))
}
