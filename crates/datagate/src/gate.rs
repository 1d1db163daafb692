//! The data-access facade
//!
//! ```rust,ignore
//! use datagate::{DataGate, ReadRequest, ObjectLocation};
//!
//! let gate = DataGate::builtin();
//! gate.set_config("datagate.yaml")?;
//!
//! let s3 = gate.connect("s3")?;
//! let df = s3
//!     .read_as_dataframe(&ReadRequest::object(ObjectLocation::parse("s3://bucket/data.csv")?))
//!     .await?;
//! ```

use crate::config::ConfigResolver;
use crate::connector::DataConnector;
use crate::connectors;
use crate::error::{ConnectError, Result};
use crate::registry::{self, normalize_id, SourceGroups, SourceRegistry};
use std::path::Path;
use tracing::{debug, info};

/// Entry point: a registry, its group table and the active configuration
#[derive(Debug)]
pub struct DataGate {
    registry: SourceRegistry,
    resolver: ConfigResolver,
}

impl DataGate {
    /// Create a gate over an explicit registry and group table.
    ///
    /// Fails with `InconsistentRegistry` if a registered source is not
    /// listed in any group.
    pub fn new(registry: SourceRegistry, groups: SourceGroups) -> Result<Self> {
        registry::validate_catalog(&registry, &groups)?;
        debug!(
            sources = registry.len(),
            groups = groups.len(),
            "Created data gate"
        );
        Ok(Self {
            registry,
            resolver: ConfigResolver::new(groups),
        })
    }

    /// Gate with every backend compiled into this build
    pub fn builtin() -> Self {
        Self::new(connectors::builtin_registry(), connectors::builtin_groups())
            .expect("built-in source catalog is inconsistent - this is a bug")
    }

    /// Built-in gate with configuration loaded from `path`
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let gate = Self::builtin();
        gate.set_config(path)?;
        Ok(gate)
    }

    /// Load (or reload) the configuration document.
    ///
    /// On failure the previously loaded document stays active.
    pub fn set_config(&self, path: impl AsRef<Path>) -> Result<()> {
        self.resolver.load(path)
    }

    /// Load the configuration document from a YAML string
    pub fn set_config_str(&self, content: &str) -> Result<()> {
        self.resolver.load_str(content)
    }

    /// Supported source ids in registration order
    pub fn get_supported_data_sources_list(&self) -> Vec<String> {
        self.registry.list_supported()
    }

    /// Build a fresh connector for `source_id` from the loaded configuration
    pub fn connect(&self, source_id: &str) -> Result<Box<dyn DataConnector>> {
        let id = normalize_id(source_id);

        let doc = self.resolver.snapshot().ok_or(ConnectError::ConfigNotLoaded)?;
        let factory = self.registry.factory_for(&id)?;
        let (group, section) = self.resolver.section_in(&doc, &id)?;

        let connector = factory
            .create(&section)
            .map_err(|error| ConnectError::ConnectorConstruction {
                source_id: id.clone(),
                error,
            })?;

        info!(source = %id, group, "Connected");
        Ok(connector)
    }

    /// Registered sources and their factories
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Group table and the active configuration document
    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    /// Whether a configuration document has been loaded
    pub fn is_configured(&self) -> bool {
        self.resolver.is_loaded()
    }
}
