//! Cloud data warehouses
//!
//! | Source id  | Transport                 | Auth                 |
//! |------------|---------------------------|----------------------|
//! | snowflake  | SQL API v2 (`reqwest`)    | key-pair JWT         |
//! | bigquery   | `gcp-bigquery-client`     | service account key  |
//!
//! Redshift speaks the PostgreSQL protocol and lives with the SQL backends.

#[cfg(feature = "bigquery")]
pub mod bigquery;
#[cfg(feature = "snowflake")]
pub mod snowflake;

#[cfg(feature = "bigquery")]
pub use bigquery::{BigQueryConfig, BigQueryConnector, BigQueryFactory};
#[cfg(feature = "snowflake")]
pub use snowflake::{SnowflakeConfig, SnowflakeDriver, SnowflakeFactory};
