//! Source registry and group table
//!
//! The registry maps a logical source id (`s3`, `postgresql`, ...) to the
//! factory that builds its connector. The group table maps a group id
//! (`datalakes`, `databases`, ...) to the source ids whose configuration
//! lives under that group in the configuration document.
//!
//! ```text
//! ┌──────────────┐  group_of   ┌──────────────┐  section  ┌──────────────┐
//! │   SourceId   │────────────▶│   GroupId    │──────────▶│ ConfigMapping│
//! └──────┬───────┘             └──────────────┘           └──────┬───────┘
//!        │ factory_for                                           │
//!        ▼                                                       ▼
//! ┌──────────────┐              create(section)           ┌──────────────┐
//! │   Factory    │───────────────────────────────────────▶│  Connector   │
//! └──────────────┘                                        └──────────────┘
//! ```
//!
//! Both values are built once and then owned, immutable, by a
//! [`DataGate`](crate::DataGate).
//!
//! # Example
//!
//! ```rust,ignore
//! use datagate::{SourceGroups, SourceRegistry};
//! use std::sync::Arc;
//!
//! let mut registry = SourceRegistry::new();
//! registry.register("s3", Arc::new(S3Factory));
//!
//! let groups = SourceGroups::new().with_group("datalakes", ["s3", "gcs"]);
//! ```

use crate::connector::{DataConnector, Operation};
use crate::error::{ConnectError, ConnectorError, ConnectorResult, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use validator::Validate;

/// Factory trait for creating connector instances
///
/// A factory receives exactly one argument, the configuration section
/// resolved for its source id, and returns a fresh connector.
pub trait ConnectorFactory: Send + Sync {
    /// Short human readable description
    fn description(&self) -> &'static str;

    /// Operations the produced connector supports
    fn operations(&self) -> &'static [Operation];

    /// JSON schema of the configuration section
    fn config_schema(&self) -> schemars::schema::RootSchema;

    /// Create a connector from its configuration section
    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>>;
}

/// Deserialize and validate a configuration section into a typed config.
pub fn parse_section<T>(section: &serde_yaml::Value) -> ConnectorResult<T>
where
    T: DeserializeOwned + Validate,
{
    let config: T = serde_yaml::from_value(section.clone())
        .map_err(|e| ConnectorError::config(format!("invalid config: {}", e)))?;
    config
        .validate()
        .map_err(|e| ConnectorError::config(format!("validation failed: {}", e)))?;
    Ok(config)
}

struct RegistryEntry {
    id: String,
    factory: Arc<dyn ConnectorFactory>,
}

/// Registry of available connectors, in registration order
#[derive(Default)]
pub struct SourceRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
}

impl SourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `id` (stored lower case).
    ///
    /// Registering an id twice replaces the factory and keeps the original
    /// position in the listing.
    pub fn register(&mut self, id: &str, factory: Arc<dyn ConnectorFactory>) {
        let id = normalize_id(id);
        match self.index.get(&id) {
            Some(&pos) => self.entries[pos].factory = factory,
            None => {
                self.index.insert(id.clone(), self.entries.len());
                self.entries.push(RegistryEntry { id, factory });
            }
        }
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, id: &str, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.register(id, factory);
        self
    }

    /// All registered source ids in registration order
    pub fn list_supported(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    /// Case-insensitive membership test
    pub fn is_supported(&self, id: &str) -> bool {
        self.index.contains_key(&normalize_id(id))
    }

    /// Look up a factory by id
    pub fn get(&self, id: &str) -> Option<&Arc<dyn ConnectorFactory>> {
        self.index
            .get(&normalize_id(id))
            .map(|&pos| &self.entries[pos].factory)
    }

    /// Look up a factory, failing with the supported list when absent
    pub fn factory_for(&self, id: &str) -> Result<Arc<dyn ConnectorFactory>> {
        self.get(id)
            .cloned()
            .ok_or_else(|| ConnectError::UnknownSource {
                source_id: normalize_id(id),
                supported: self.list_supported(),
            })
    }

    /// Iterate `(id, factory)` pairs in registration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ConnectorFactory>)> {
        self.entries.iter().map(|e| (e.id.as_str(), &e.factory))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.list_supported())
            .finish()
    }
}

/// Ordered group table. Lookups take the first group that lists an id.
#[derive(Debug, Clone, Default)]
pub struct SourceGroups {
    groups: Vec<(String, Vec<String>)>,
}

impl SourceGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add members to a group, creating it at the end of the table if new
    pub fn insert<I, S>(&mut self, group: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let members = members.into_iter().map(|m| normalize_id(m.as_ref()));
        match self.groups.iter_mut().find(|(name, _)| name == group) {
            Some((_, existing)) => {
                for member in members {
                    if !existing.contains(&member) {
                        existing.push(member);
                    }
                }
            }
            None => {
                let mut list: Vec<String> = Vec::new();
                for member in members {
                    if !list.contains(&member) {
                        list.push(member);
                    }
                }
                self.groups.push((group.to_string(), list));
            }
        }
    }

    /// Builder-style [`insert`](Self::insert)
    pub fn with_group<I, S>(mut self, group: &str, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insert(group, members);
        self
    }

    /// First group (in table order) containing the id
    pub fn group_of(&self, source_id: &str) -> Option<&str> {
        let id = normalize_id(source_id);
        self.groups
            .iter()
            .find(|(_, members)| members.contains(&id))
            .map(|(name, _)| name.as_str())
    }

    /// Every group containing the id, in table order
    pub fn groups_containing(&self, source_id: &str) -> Vec<&str> {
        let id = normalize_id(source_id);
        self.groups
            .iter()
            .filter(|(_, members)| members.contains(&id))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Members of a group
    pub fn members(&self, group: &str) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|(name, _)| name == group)
            .map(|(_, members)| members.as_slice())
    }

    /// Every source id listed in any group, first occurrence order
    pub fn all_sources(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for (_, members) in &self.groups {
            for member in members {
                if !out.contains(member) {
                    out.push(member.clone());
                }
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.groups
            .iter()
            .map(|(name, members)| (name.as_str(), members.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Check that every registered source can be located in the group table.
///
/// Ids listed in several groups are accepted (first match wins) but logged.
pub fn validate_catalog(registry: &SourceRegistry, groups: &SourceGroups) -> Result<()> {
    let mut orphans = Vec::new();
    for (id, _) in registry.iter() {
        let containing = groups.groups_containing(id);
        match containing.len() {
            0 => orphans.push(id.to_string()),
            1 => {}
            _ => warn!(
                source = id,
                groups = ?containing,
                "Source listed in several groups, using '{}'",
                containing[0]
            ),
        }
    }

    if orphans.is_empty() {
        Ok(())
    } else {
        Err(ConnectError::InconsistentRegistry(format!(
            "sources without a group: {}",
            orphans.join(", ")
        )))
    }
}

/// Lower-case and trim a source id
pub(crate) fn normalize_id(id: &str) -> String {
    id.trim().to_lowercase()
}
