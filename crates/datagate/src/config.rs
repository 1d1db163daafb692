//! Configuration document loading and section resolution
//!
//! The document is a YAML mapping of groups to sources to backend keys:
//!
//! ```yaml
//! datalakes:
//!   s3:
//!     AWS_ACCESS_KEY_ID: ${AWS_ACCESS_KEY_ID}
//!     AWS_SECRET_ACCESS_KEY: ${AWS_SECRET_ACCESS_KEY}
//! databases:
//!   postgresql:
//!     HOST: localhost
//!     PORT: ${PGPORT:-5432}
//!     USERNAME: postgres
//!     PASSWORD: secret
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are expanded from the environment before
//! parsing. A [`ConfigResolver`] holds at most one loaded document; a new load
//! replaces it only after the new document parsed.

use crate::error::{ConnectError, Result};
use crate::registry::{normalize_id, SourceGroups};
use parking_lot::RwLock;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

/// A parsed configuration document
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    root: Mapping,
    origin: Option<PathBuf>,
}

impl ConfigDocument {
    /// Read, expand and parse a document from disk
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConnectError::ConfigNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConnectError::ConfigRead {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let mut doc = Self::parse(&content, &path.display().to_string())?;
        doc.origin = Some(path.to_path_buf());
        Ok(doc)
    }

    /// Parse a document from an in-memory string
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Self::parse(content, "<inline>")
    }

    fn parse(content: &str, origin: &str) -> Result<Self> {
        let parse_error = |message: String| ConnectError::ConfigParse {
            origin: origin.to_string(),
            message,
        };

        let expanded = expand_env_vars(content);
        let value: Value =
            serde_yaml::from_str(&expanded).map_err(|e| parse_error(e.to_string()))?;

        let root = match value {
            Value::Null => Mapping::new(),
            Value::Mapping(map) => map,
            other => {
                return Err(parse_error(format!(
                    "top level must be a mapping of groups, found {}",
                    kind_of(&other)
                )))
            }
        };

        for (key, group) in &root {
            let name = key
                .as_str()
                .ok_or_else(|| parse_error(format!("group keys must be strings, found {:?}", key)))?;
            if !matches!(group, Value::Mapping(_) | Value::Null) {
                return Err(parse_error(format!(
                    "group '{}' must be a mapping of sources, found {}",
                    name,
                    kind_of(group)
                )));
            }
        }

        Ok(Self { root, origin: None })
    }

    /// Path the document was loaded from, if any
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// Group names in document order
    pub fn group_names(&self) -> Vec<&str> {
        self.root.keys().filter_map(Value::as_str).collect()
    }

    /// The section `document[group][source_id]`, if present
    pub fn section(&self, group: &str, source_id: &str) -> Option<&Value> {
        match self.root.get(group)? {
            Value::Mapping(sources) => sources.get(source_id),
            _ => None,
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Holds the active document and resolves per-source sections from it
#[derive(Debug)]
pub struct ConfigResolver {
    groups: SourceGroups,
    active: RwLock<Option<Arc<ConfigDocument>>>,
}

impl ConfigResolver {
    pub fn new(groups: SourceGroups) -> Self {
        Self {
            groups,
            active: RwLock::new(None),
        }
    }

    /// Load a document from disk, replacing the active one on success
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let doc = ConfigDocument::from_path(path)?;
        info!(path = %path.display(), groups = ?doc.group_names(), "Loaded configuration");
        self.install(doc);
        Ok(())
    }

    /// Load a document from a string, replacing the active one on success
    pub fn load_str(&self, content: &str) -> Result<()> {
        let doc = ConfigDocument::from_yaml_str(content)?;
        debug!(groups = ?doc.group_names(), "Loaded inline configuration");
        self.install(doc);
        Ok(())
    }

    /// Make an already parsed document the active one
    pub fn install(&self, doc: ConfigDocument) {
        *self.active.write() = Some(Arc::new(doc));
    }

    pub fn is_loaded(&self) -> bool {
        self.active.read().is_some()
    }

    /// The active document, if any
    pub fn snapshot(&self) -> Option<Arc<ConfigDocument>> {
        self.active.read().clone()
    }

    /// The group table this resolver reads sections through
    pub fn groups(&self) -> &SourceGroups {
        &self.groups
    }

    /// Group whose configuration block holds the source
    pub fn group_of(&self, source_id: &str) -> Result<&str> {
        self.groups
            .group_of(source_id)
            .ok_or_else(|| ConnectError::UnknownSource {
                source_id: normalize_id(source_id),
                supported: self.groups.all_sources(),
            })
    }

    /// Resolve `document[group_of(id)][id]` from the active document
    pub fn section_for(&self, source_id: &str) -> Result<Value> {
        let doc = self.snapshot().ok_or(ConnectError::ConfigNotLoaded)?;
        self.section_in(&doc, source_id).map(|(_, section)| section)
    }

    /// Resolve a section from a specific document snapshot, together with
    /// the group it was found under
    pub fn section_in(&self, doc: &ConfigDocument, source_id: &str) -> Result<(&str, Value)> {
        let id = normalize_id(source_id);
        let group = self.group_of(&id)?;
        debug!(source = %id, group, "Resolving configuration section");
        match doc.section(group, &id) {
            Some(section) => Ok((group, section.clone())),
            None => Err(ConnectError::ConfigSectionMissing {
                group: group.to_string(),
                source_id: id,
            }),
        }
    }
}
