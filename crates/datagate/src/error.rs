//! Error types for datagate
//!
//! Two layers: [`ConnectError`] covers the facade (configuration loading,
//! source lookup, connector construction) and [`ConnectorError`] covers what
//! a connector reports while it is built or while it talks to its backend.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::connector::Operation;

/// Result type alias for facade operations
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Result type alias for connector operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Errors raised by the facade
#[derive(Error, Debug)]
pub enum ConnectError {
    /// `connect` was called before any configuration was loaded
    #[error("configuration not loaded: call set_config with a configuration file first")]
    ConfigNotLoaded,

    /// The configuration path does not exist
    #[error("configuration file not found: {}", path.display())]
    ConfigNotFound { path: PathBuf },

    /// The configuration file exists but could not be read
    #[error("failed to read configuration file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid YAML or has the wrong shape
    #[error("failed to parse configuration {origin}: {message}")]
    ConfigParse { origin: String, message: String },

    /// The requested source is not registered
    #[error(
        "unsupported data source '{source_id}', supported data sources: [{}]",
        supported.join(", ")
    )]
    UnknownSource {
        source_id: String,
        supported: Vec<String>,
    },

    /// The loaded document has no section for the source
    #[error("configuration for data source '{source_id}' not found: expected '{group}.{source_id}'")]
    ConfigSectionMissing { group: String, source_id: String },

    /// The factory rejected its configuration section
    #[error("failed to create connector '{source_id}': {error}")]
    ConnectorConstruction {
        source_id: String,
        #[source]
        error: ConnectorError,
    },

    /// A registered source is not listed in any group
    #[error("inconsistent source registry: {0}")]
    InconsistentRegistry(String),
}

impl ConnectError {
    /// Source id carried by the error, if any
    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::UnknownSource { source_id, .. }
            | Self::ConfigSectionMissing { source_id, .. }
            | Self::ConnectorConstruction { source_id, .. } => Some(source_id),
            _ => None,
        }
    }
}

/// Errors that can occur in connector construction and operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration section rejected
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to external system failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Authentication failed
    #[error("authentication error: {0}")]
    Auth(String),

    /// Object, table or file not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend rejected or failed a query
    #[error("query error: {0}")]
    Query(String),

    /// Data could not be converted
    #[error("serialization error: {0}")]
    Serialization(String),

    /// File extension has no reader/writer
    #[error("extension '{0}' not supported")]
    UnsupportedExtension(String),

    /// The connector does not implement the operation
    #[error("connector '{connector}' does not support {operation}")]
    UnsupportedOperation {
        connector: String,
        operation: Operation,
    },

    /// Request shape does not fit the connector
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A required parameter was given neither in the call nor in config
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Arrow error
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// Parquet error
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl ConnectorError {
    /// Create a config error
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a connection error
    pub fn connection(msg: impl fmt::Display) -> Self {
        Self::Connection(msg.to_string())
    }

    /// Create an auth error
    pub fn auth(msg: impl fmt::Display) -> Self {
        Self::Auth(msg.to_string())
    }

    /// Create a not found error
    pub fn not_found(msg: impl fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create a query error
    pub fn query(msg: impl fmt::Display) -> Self {
        Self::Query(msg.to_string())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl fmt::Display) -> Self {
        Self::InvalidRequest(msg.to_string())
    }

    /// Create an unsupported operation error
    pub fn unsupported(connector: impl Into<String>, operation: Operation) -> Self {
        Self::UnsupportedOperation {
            connector: connector.into(),
            operation,
        }
    }

    /// Check if error is a configuration problem the caller can fix
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::MissingParameter(_) | Self::Yaml(_)
        )
    }
}
