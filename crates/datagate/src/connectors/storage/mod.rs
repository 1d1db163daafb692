//! Object storage connectors (S3, GCS, Azure Blob, local filesystem)
//!
//! All providers share one connector built on the `object_store` crate, so
//! prefix reads, folder transfers and format dispatch behave the same on
//! every cloud.
//!
//! | Source      | Section keys                                             |
//! |-------------|----------------------------------------------------------|
//! | `s3`        | `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_REGION`, `AWS_ENDPOINT` |
//! | `gcs`       | `GOOGLE_APPLICATION_CREDENTIALS_PATH`                    |
//! | `azureblob` | `ACCOUNT_NAME`, `ACCOUNT_KEY`                            |
//! | local       | `ROOT` (buckets are sub-directories)                     |

mod config;
mod object;

pub use config::{AzureBlobConfig, GcsConfig, LocalStorageConfig, S3Config, StorageProvider};
pub use object::{
    AzureBlobFactory, GcsFactory, LocalStorageFactory, ObjectStorageConnector, S3Factory,
};
