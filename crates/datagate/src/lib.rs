//! datagate - one configuration file, one `connect` call, many data backends
//!
//! A [`DataGate`] owns a registry of source ids (`s3`, `postgresql`,
//! `mongodb`, ...) mapped to connector factories, a table assigning each id
//! to a configuration group, and the currently loaded YAML configuration.
//! `connect(id)` finds the id's group, pulls `<group>.<id>` out of the
//! configuration and hands that section to the factory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ DataGate: set_config / get_supported_data_sources_list /     │
//! │           connect                                            │
//! ├──────────────────────┬───────────────────────────────────────┤
//! │ SourceRegistry       │ ConfigResolver                        │
//! │  id -> factory       │  SourceGroups + loaded ConfigDocument │
//! ├──────────────────────┴───────────────────────────────────────┤
//! │ DataConnector: read_as_dataframe, write_dataframe,           │
//! │   download_file, upload_file, upload_folder, download_folder │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Built-in backends                                            │
//! │  ├── Object storage (s3, gcs, azureblob)                     │
//! │  ├── Warehouses (snowflake, redshift, bigquery, starrocks)   │
//! │  ├── Databases (postgresql, mssql, mysql, mariadb, sqlite)   │
//! │  └── NoSQL (mongodb, elasticsearch, dynamodb)                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! datalakes:
//!   s3:
//!     AWS_ACCESS_KEY_ID: ${AWS_ACCESS_KEY_ID}
//!     AWS_SECRET_ACCESS_KEY: ${AWS_SECRET_ACCESS_KEY}
//! databases:
//!   postgresql:
//!     HOST: localhost
//!     USERNAME: app
//!     PASSWORD: ${PG_PASSWORD:-secret}
//!     DATABASE: analytics
//! ```
//!
//! # Library usage
//!
//! ```rust,ignore
//! use datagate::{DataGate, ReadRequest};
//!
//! let gate = DataGate::builtin();
//! gate.set_config("datagate.yaml")?;
//!
//! let pg = gate.connect("PostgreSQL")?;
//! let frame = pg.read_as_dataframe(&ReadRequest::query("SELECT * FROM orders")).await?;
//! println!("{} rows", frame.num_rows());
//! ```
//!
//! # CLI usage
//!
//! ```bash
//! datagate sources
//! datagate -c datagate.yaml read postgresql --query "SELECT 1" --output out.parquet
//! datagate -c datagate.yaml upload s3 --folder ./exports --path s3://bucket/raw/
//! ```

pub mod config;
pub mod connector;
pub mod connectors;
pub mod error;
pub mod format;
pub mod frame;
pub mod gate;
pub mod registry;
pub mod types;

pub use config::{ConfigDocument, ConfigResolver};
pub use connector::{
    DataConnector, DownloadRequest, IfExists, ObjectLocation, Operation, ReadRequest,
    WriteRequest, WriteSummary,
};
pub use error::{ConnectError, ConnectorError, ConnectorResult, Result};
pub use format::FileFormat;
pub use frame::DataFrame;
pub use gate::DataGate;
pub use registry::{ConnectorFactory, SourceGroups, SourceRegistry};
pub use types::SensitiveString;
