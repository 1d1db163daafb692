//! Built-in backends
//!
//! Each backend is compiled behind a cargo feature and registered under a
//! fixed source id. The group table maps ids to the top-level section of the
//! configuration file that holds their settings:
//!
//! | Group            | Sources                                        |
//! |------------------|------------------------------------------------|
//! | `datalakes`      | s3, gcs, azureblob                             |
//! | `datawarehouses` | snowflake, redshift, bigquery, starrocks       |
//! | `databases`      | postgresql, mssql, mysql, mariadb, sqlite      |
//! | `nosql`          | mongodb, elasticsearch, dynamodb               |

pub mod nosql;
pub mod sql;
#[cfg(feature = "cloud-storage")]
pub mod storage;
pub mod warehouse;

use crate::registry::{SourceGroups, SourceRegistry};
#[allow(unused_imports)]
use std::sync::Arc;

/// Registry of every backend compiled into this build, in listing order
pub fn builtin_registry() -> SourceRegistry {
    #[allow(unused_mut)]
    let mut registry = SourceRegistry::new();

    #[cfg(feature = "cloud-storage")]
    {
        registry.register("s3", Arc::new(storage::S3Factory));
        registry.register("gcs", Arc::new(storage::GcsFactory));
        registry.register("azureblob", Arc::new(storage::AzureBlobFactory));
    }
    #[cfg(feature = "bigquery")]
    registry.register("bigquery", Arc::new(warehouse::BigQueryFactory));
    #[cfg(feature = "snowflake")]
    registry.register("snowflake", Arc::new(warehouse::SnowflakeFactory));
    #[cfg(feature = "postgres")]
    registry.register("redshift", Arc::new(sql::postgres::RedshiftFactory));
    #[cfg(feature = "mysql")]
    registry.register("starrocks", Arc::new(sql::mysql::MySqlFactory::starrocks()));
    #[cfg(feature = "postgres")]
    registry.register("postgresql", Arc::new(sql::postgres::PostgresFactory));
    #[cfg(feature = "mysql")]
    registry.register("mysql", Arc::new(sql::mysql::MySqlFactory::mysql()));
    #[cfg(feature = "sqlserver")]
    registry.register("mssql", Arc::new(sql::sqlserver::SqlServerFactory));
    #[cfg(feature = "mysql")]
    registry.register("mariadb", Arc::new(sql::mysql::MySqlFactory::mariadb()));
    #[cfg(feature = "sqlite")]
    registry.register("sqlite", Arc::new(sql::sqlite::SqliteFactory));
    #[cfg(feature = "elasticsearch")]
    registry.register("elasticsearch", Arc::new(nosql::ElasticsearchFactory));
    #[cfg(feature = "mongodb")]
    registry.register("mongodb", Arc::new(nosql::MongoFactory));
    #[cfg(feature = "dynamodb")]
    registry.register("dynamodb", Arc::new(nosql::DynamoDbFactory));

    registry
}

/// Group table for the built-in sources
pub fn builtin_groups() -> SourceGroups {
    SourceGroups::new()
        .with_group("datalakes", ["s3", "gcs", "azureblob"])
        .with_group(
            "datawarehouses",
            ["snowflake", "redshift", "bigquery", "starrocks"],
        )
        .with_group(
            "databases",
            ["postgresql", "mssql", "mysql", "mariadb", "sqlite"],
        )
        .with_group("nosql", ["mongodb", "elasticsearch", "dynamodb"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::validate_catalog;

    #[test]
    fn test_builtin_catalog_is_consistent() {
        validate_catalog(&builtin_registry(), &builtin_groups()).unwrap();
    }

    #[cfg(feature = "full")]
    #[test]
    fn test_builtin_listing_order() {
        assert_eq!(
            builtin_registry().list_supported(),
            vec![
                "s3",
                "gcs",
                "azureblob",
                "bigquery",
                "snowflake",
                "redshift",
                "starrocks",
                "postgresql",
                "mysql",
                "mssql",
                "mariadb",
                "sqlite",
                "elasticsearch",
                "mongodb",
                "dynamodb",
            ]
        );
    }

    #[test]
    fn test_builtin_groups() {
        let groups = builtin_groups();
        assert_eq!(groups.group_of("s3"), Some("datalakes"));
        assert_eq!(groups.group_of("redshift"), Some("datawarehouses"));
        assert_eq!(groups.group_of("mariadb"), Some("databases"));
        assert_eq!(groups.group_of("elasticsearch"), Some("nosql"));
        assert_eq!(groups.group_of("starrocks"), Some("datawarehouses"));
        assert_eq!(groups.group_of("dynamodb"), Some("nosql"));
        assert_eq!(groups.group_of("oracle"), None);
    }
}
