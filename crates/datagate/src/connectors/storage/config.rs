//! Provider configuration and `ObjectStore` construction

use crate::error::{ConnectorError, ConnectorResult};
use crate::types::SensitiveString;
use object_store::ObjectStore;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use validator::{Validate, ValidationError};

pub(crate) fn non_empty_secret(value: &SensitiveString) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("empty"));
    }
    Ok(())
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// `datalakes.s3`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct S3Config {
    #[serde(rename = "AWS_ACCESS_KEY_ID")]
    #[validate(custom(function = "non_empty_secret"))]
    pub access_key_id: SensitiveString,

    #[serde(rename = "AWS_SECRET_ACCESS_KEY")]
    #[validate(custom(function = "non_empty_secret"))]
    pub secret_access_key: SensitiveString,

    #[serde(rename = "AWS_SESSION_TOKEN", default)]
    pub session_token: Option<SensitiveString>,

    #[serde(rename = "AWS_REGION", default = "default_region")]
    #[validate(length(min = 1))]
    pub region: String,

    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...)
    #[serde(rename = "AWS_ENDPOINT", default)]
    pub endpoint: Option<String>,
}

/// `datalakes.gcs`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct GcsConfig {
    /// Path to a service account JSON key
    #[serde(rename = "GOOGLE_APPLICATION_CREDENTIALS_PATH")]
    #[validate(length(min = 1))]
    pub credentials_path: String,
}

/// `datalakes.azureblob`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct AzureBlobConfig {
    #[serde(rename = "ACCOUNT_NAME")]
    #[validate(length(min = 1))]
    pub account_name: String,

    #[serde(rename = "ACCOUNT_KEY")]
    #[validate(custom(function = "non_empty_secret"))]
    pub account_key: SensitiveString,
}

/// Local directory standing in for a bucket store
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct LocalStorageConfig {
    #[serde(rename = "ROOT")]
    #[validate(length(min = 1))]
    pub root: String,
}

/// A configured storage provider
#[derive(Debug, Clone)]
pub enum StorageProvider {
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureBlobConfig),
    Local(LocalStorageConfig),
}

impl StorageProvider {
    /// URI scheme used when displaying locations
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::S3(_) => "s3",
            Self::Gcs(_) => "gs",
            Self::Azure(_) => "az",
            Self::Local(_) => "file",
        }
    }

    /// Create a store scoped to one bucket (container)
    pub fn store_for(&self, bucket: &str) -> ConnectorResult<Arc<dyn ObjectStore>> {
        if bucket.is_empty() {
            return Err(ConnectorError::invalid_request("bucket name is empty"));
        }
        match self {
            Self::S3(config) => Self::create_s3_store(config, bucket),
            Self::Gcs(config) => Self::create_gcs_store(config, bucket),
            Self::Azure(config) => Self::create_azure_store(config, bucket),
            Self::Local(config) => Self::create_local_store(config, bucket),
        }
    }

    fn create_s3_store(config: &S3Config, bucket: &str) -> ConnectorResult<Arc<dyn ObjectStore>> {
        use object_store::aws::AmazonS3Builder;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&config.region)
            .with_access_key_id(config.access_key_id.expose_secret())
            .with_secret_access_key(config.secret_access_key.expose_secret());

        if let Some(token) = &config.session_token {
            builder = builder.with_token(token.expose_secret());
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .map_err(|e| ConnectorError::config(format!("Failed to create S3 client: {}", e)))?;

        Ok(Arc::new(store))
    }

    fn create_gcs_store(config: &GcsConfig, bucket: &str) -> ConnectorResult<Arc<dyn ObjectStore>> {
        use object_store::gcp::GoogleCloudStorageBuilder;

        let store = GoogleCloudStorageBuilder::new()
            .with_bucket_name(bucket)
            .with_service_account_path(&config.credentials_path)
            .build()
            .map_err(|e| ConnectorError::config(format!("Failed to create GCS client: {}", e)))?;

        Ok(Arc::new(store))
    }

    fn create_azure_store(
        config: &AzureBlobConfig,
        container: &str,
    ) -> ConnectorResult<Arc<dyn ObjectStore>> {
        use object_store::azure::MicrosoftAzureBuilder;

        let store = MicrosoftAzureBuilder::new()
            .with_account(&config.account_name)
            .with_access_key(config.account_key.expose_secret())
            .with_container_name(container)
            .build()
            .map_err(|e| {
                ConnectorError::config(format!("Failed to create Azure Blob client: {}", e))
            })?;

        Ok(Arc::new(store))
    }

    fn create_local_store(
        config: &LocalStorageConfig,
        bucket: &str,
    ) -> ConnectorResult<Arc<dyn ObjectStore>> {
        use object_store::local::LocalFileSystem;

        if bucket.contains('/') || bucket.contains('\\') || bucket == ".." {
            return Err(ConnectorError::invalid_request(format!(
                "invalid bucket name '{}'",
                bucket
            )));
        }

        let root = Path::new(&config.root).join(bucket);
        std::fs::create_dir_all(&root).map_err(|e| {
            ConnectorError::config(format!("Failed to create local storage directory: {}", e))
        })?;

        let store = LocalFileSystem::new_with_prefix(&root).map_err(|e| {
            ConnectorError::config(format!("Failed to create local filesystem store: {}", e))
        })?;

        Ok(Arc::new(store))
    }
}
