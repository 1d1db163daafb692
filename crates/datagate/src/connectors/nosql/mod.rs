//! Document, search and key-value stores
//!
//! These backends read and write dataframes only; file and folder transfers
//! fail with `UnsupportedOperation`.

#[cfg(feature = "dynamodb")]
pub mod dynamodb;
#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;
#[cfg(feature = "mongodb")]
pub mod mongodb;

#[cfg(feature = "dynamodb")]
pub use dynamodb::{DynamoDbConfig, DynamoDbConnector, DynamoDbFactory};
#[cfg(feature = "elasticsearch")]
pub use elasticsearch::{ElasticsearchConfig, ElasticsearchConnector, ElasticsearchFactory};
#[cfg(feature = "mongodb")]
pub use self::mongodb::{MongoConfig, MongoConnector, MongoFactory};
