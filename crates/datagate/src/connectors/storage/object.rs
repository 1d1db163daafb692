//! Object storage connector and its factories

use super::config::{
    AzureBlobConfig, GcsConfig, LocalStorageConfig, S3Config, StorageProvider,
};
use crate::connector::{
    unexpected_read, unexpected_write, DataConnector, DownloadRequest, ObjectLocation, Operation,
    ReadRequest, WriteRequest, WriteSummary, ALL_OPERATIONS,
};
use crate::error::{ConnectorError, ConnectorResult};
use crate::format::{self, FileFormat};
use crate::frame::DataFrame;
use crate::registry::{parse_section, ConnectorFactory};
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

fn map_store_error(e: object_store::Error) -> ConnectorError {
    match e {
        object_store::Error::NotFound { path, .. } => ConnectorError::not_found(path),
        other => ConnectorError::connection(other),
    }
}

fn object_path(key: &str) -> ObjectPath {
    ObjectPath::from(key.trim_matches('/'))
}

/// Reads and writes objects through an `ObjectStore`
pub struct ObjectStorageConnector {
    name: String,
    provider: StorageProvider,
}

impl ObjectStorageConnector {
    pub fn new(name: impl Into<String>, provider: StorageProvider) -> Self {
        Self {
            name: name.into(),
            provider,
        }
    }

    fn display(&self, location: &ObjectLocation) -> String {
        format!("{}://{}", self.provider.scheme(), location)
    }

    async fn get(&self, store: &Arc<dyn ObjectStore>, key: &str) -> ConnectorResult<bytes::Bytes> {
        let result = store.get(&object_path(key)).await.map_err(map_store_error)?;
        result.bytes().await.map_err(map_store_error)
    }

    async fn put(
        &self,
        store: &Arc<dyn ObjectStore>,
        key: &str,
        data: Vec<u8>,
    ) -> ConnectorResult<()> {
        store
            .put(&object_path(key), PutPayload::from(data))
            .await
            .map_err(map_store_error)?;
        Ok(())
    }

    /// Objects whose key starts with the location's prefix, sorted by key.
    ///
    /// Returns the directory the listing was rooted at alongside the objects.
    async fn list_prefix(
        &self,
        store: &Arc<dyn ObjectStore>,
        location: &ObjectLocation,
    ) -> ConnectorResult<(String, Vec<ObjectMeta>)> {
        let prefix = location.prefix().trim_start_matches('/');
        let dir = match prefix.rfind('/') {
            Some(pos) => &prefix[..pos],
            None => "",
        };
        let root = if dir.is_empty() {
            None
        } else {
            Some(object_path(dir))
        };

        let mut objects: Vec<ObjectMeta> = store
            .list(root.as_ref())
            .try_collect()
            .await
            .map_err(map_store_error)?;
        objects.retain(|meta| meta.location.as_ref().starts_with(prefix));
        objects.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));

        debug!(
            connector = %self.name,
            prefix,
            count = objects.len(),
            "Listed objects"
        );
        Ok((dir.to_string(), objects))
    }

    fn require_single(location: &ObjectLocation) -> ConnectorResult<()> {
        if location.is_prefix() {
            return Err(ConnectorError::invalid_request(format!(
                "'{}' names a prefix, expected a single object",
                location
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DataConnector for ObjectStorageConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations(&self) -> &'static [Operation] {
        ALL_OPERATIONS
    }

    async fn read_as_dataframe(&self, request: &ReadRequest) -> ConnectorResult<DataFrame> {
        let ReadRequest::Object {
            location,
            format: requested,
        } = request
        else {
            return Err(unexpected_read(&self.name, request));
        };
        let store = self.provider.store_for(&location.bucket)?;

        if !location.is_prefix() {
            let fmt = FileFormat::resolve(&location.key, *requested)?;
            let data = self.get(&store, &location.key).await?;
            let frame = format::read_frame(fmt, data)?;
            info!(
                connector = %self.name,
                path = %self.display(location),
                rows = frame.num_rows(),
                "Read object"
            );
            return Ok(frame);
        }

        let (_, objects) = self.list_prefix(&store, location).await?;
        if objects.is_empty() {
            return Err(ConnectorError::not_found(format!(
                "no objects match '{}'",
                self.display(location)
            )));
        }

        let mut frames = Vec::with_capacity(objects.len());
        for meta in &objects {
            let key = meta.location.as_ref();
            let fmt = FileFormat::resolve(key, *requested)?;
            let data = self.get(&store, key).await?;
            frames.push(format::read_frame(fmt, data)?);
        }
        let frame = DataFrame::concat_all(frames)?;

        info!(
            connector = %self.name,
            path = %self.display(location),
            objects = objects.len(),
            rows = frame.num_rows(),
            "Read objects under prefix"
        );
        Ok(frame)
    }

    async fn write_dataframe(
        &self,
        frame: &DataFrame,
        request: &WriteRequest,
    ) -> ConnectorResult<WriteSummary> {
        let WriteRequest::Object {
            location,
            format: requested,
        } = request
        else {
            return Err(unexpected_write(&self.name, request));
        };
        Self::require_single(location)?;

        let fmt = FileFormat::resolve(&location.key, *requested)?;
        let data = format::write_frame(fmt, frame)?;
        let store = self.provider.store_for(&location.bucket)?;
        self.put(&store, &location.key, data).await?;

        info!(
            connector = %self.name,
            path = %self.display(location),
            rows = frame.num_rows(),
            "Wrote dataframe"
        );
        Ok(WriteSummary::new(
            self.display(location),
            frame.num_rows() as u64,
        ))
    }

    async fn download_file(&self, request: &DownloadRequest) -> ConnectorResult<PathBuf> {
        let DownloadRequest::Object {
            location,
            destination_dir,
        } = request
        else {
            return Err(ConnectorError::invalid_request(format!(
                "connector '{}' cannot run queries",
                self.name
            )));
        };
        Self::require_single(location)?;

        let file_name = location.file_name().ok_or_else(|| {
            ConnectorError::invalid_request(format!("'{}' has no file name", location))
        })?;
        let store = self.provider.store_for(&location.bucket)?;
        let data = self.get(&store, &location.key).await?;

        tokio::fs::create_dir_all(destination_dir).await?;
        let target = destination_dir.join(file_name);
        tokio::fs::write(&target, &data).await?;

        info!(
            connector = %self.name,
            path = %self.display(location),
            file = %target.display(),
            "Downloaded object"
        );
        Ok(target)
    }

    async fn upload_file(
        &self,
        source: &Path,
        location: &ObjectLocation,
    ) -> ConnectorResult<ObjectLocation> {
        let target = if location.is_prefix() {
            let file_name = source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    ConnectorError::invalid_request(format!(
                        "'{}' has no file name",
                        source.display()
                    ))
                })?;
            location.join(file_name)
        } else {
            location.clone()
        };

        let data = tokio::fs::read(source).await?;
        let store = self.provider.store_for(&target.bucket)?;
        self.put(&store, &target.key, data).await?;

        info!(
            connector = %self.name,
            file = %source.display(),
            path = %self.display(&target),
            "Uploaded file"
        );
        Ok(target)
    }

    async fn upload_folder(
        &self,
        source: &Path,
        location: &ObjectLocation,
    ) -> ConnectorResult<Vec<ObjectLocation>> {
        if !source.is_dir() {
            return Err(ConnectorError::not_found(format!(
                "'{}' is not a directory",
                source.display()
            )));
        }
        let folder = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let base = if folder.is_empty() {
            location.clone()
        } else {
            location.join(folder)
        };

        let files: Vec<PathBuf> = walkdir::WalkDir::new(source)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        let store = self.provider.store_for(&base.bucket)?;
        let mut uploaded = Vec::with_capacity(files.len());
        for file in files {
            let relative = file
                .strip_prefix(source)
                .map_err(ConnectorError::invalid_request)?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let target = base.join(&relative);
            let data = tokio::fs::read(&file).await?;
            self.put(&store, &target.key, data).await?;
            uploaded.push(target);
        }

        info!(
            connector = %self.name,
            folder = %source.display(),
            path = %self.display(&base),
            files = uploaded.len(),
            "Uploaded folder"
        );
        Ok(uploaded)
    }

    async fn download_folder(
        &self,
        location: &ObjectLocation,
        destination: &Path,
    ) -> ConnectorResult<PathBuf> {
        // a bare key names a folder, not a string prefix
        let location = if location.is_prefix() {
            location.clone()
        } else {
            ObjectLocation::new(location.bucket.clone(), format!("{}/", location.key))
        };
        let store = self.provider.store_for(&location.bucket)?;
        let (dir, objects) = self.list_prefix(&store, &location).await?;
        if objects.is_empty() {
            return Err(ConnectorError::not_found(format!(
                "no objects match '{}'",
                self.display(&location)
            )));
        }

        let folder = dir.rsplit('/').next().filter(|s| !s.is_empty());
        let target_root = destination.join(folder.unwrap_or(location.bucket.as_str()));

        for meta in &objects {
            let key = meta.location.as_ref();
            let relative = if dir.is_empty() {
                key
            } else {
                key.strip_prefix(dir.as_str())
                    .map(|r| r.trim_start_matches('/'))
                    .unwrap_or(key)
            };
            let target = relative
                .split('/')
                .filter(|s| !s.is_empty() && *s != "..")
                .fold(target_root.clone(), |acc, part| acc.join(part));
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let data = self.get(&store, key).await?;
            tokio::fs::write(&target, &data).await?;
        }

        info!(
            connector = %self.name,
            path = %self.display(&location),
            folder = %target_root.display(),
            files = objects.len(),
            "Downloaded folder"
        );
        Ok(target_root)
    }
}

macro_rules! storage_factory {
    ($factory:ident, $config:ty, $variant:ident, $id:literal, $desc:literal) => {
        #[doc = concat!("Factory for the `", $id, "` source")]
        pub struct $factory;

        impl ConnectorFactory for $factory {
            fn description(&self) -> &'static str {
                $desc
            }

            fn operations(&self) -> &'static [Operation] {
                ALL_OPERATIONS
            }

            fn config_schema(&self) -> schemars::schema::RootSchema {
                schemars::schema_for!($config)
            }

            fn create(
                &self,
                section: &serde_yaml::Value,
            ) -> ConnectorResult<Box<dyn DataConnector>> {
                let config: $config = parse_section(section)?;
                Ok(Box::new(ObjectStorageConnector::new(
                    $id,
                    StorageProvider::$variant(config),
                )))
            }
        }
    };
}

storage_factory!(S3Factory, S3Config, S3, "s3", "Amazon S3 and S3-compatible object stores");
storage_factory!(GcsFactory, GcsConfig, Gcs, "gcs", "Google Cloud Storage");
storage_factory!(AzureBlobFactory, AzureBlobConfig, Azure, "azureblob", "Azure Blob Storage");
storage_factory!(LocalStorageFactory, LocalStorageConfig, Local, "local", "Local directory of buckets");
