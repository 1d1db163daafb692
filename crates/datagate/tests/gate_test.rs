//! Tests for the DataGate facade: registry, group resolution and connect

use async_trait::async_trait;
use datagate::connector::ALL_OPERATIONS;
use datagate::registry::parse_section;
use datagate::{
    ConnectError, ConnectorError, ConnectorFactory, ConnectorResult, DataConnector, DataGate,
    Operation, SourceGroups, SourceRegistry,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, JsonSchema)]
struct EchoConfig {
    #[serde(rename = "NAME")]
    #[validate(length(min = 1))]
    name: String,
}

/// Connector whose name is taken from its section
struct EchoConnector {
    name: String,
}

#[async_trait]
impl DataConnector for EchoConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations(&self) -> &'static [Operation] {
        &[]
    }
}

struct EchoFactory;

impl ConnectorFactory for EchoFactory {
    fn description(&self) -> &'static str {
        "echo"
    }

    fn operations(&self) -> &'static [Operation] {
        ALL_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(EchoConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: EchoConfig = parse_section(section)?;
        Ok(Box::new(EchoConnector { name: config.name }))
    }
}

fn gate() -> DataGate {
    let registry = SourceRegistry::new()
        .with("s3", Arc::new(EchoFactory))
        .with("postgresql", Arc::new(EchoFactory));
    let groups = SourceGroups::new()
        .with_group("GroupA", ["s3"])
        .with_group("GroupB", ["postgresql"]);
    DataGate::new(registry, groups).unwrap()
}

fn connect_err(gate: &DataGate, id: &str) -> ConnectError {
    match gate.connect(id) {
        Ok(connector) => panic!("expected an error, got connector '{}'", connector.name()),
        Err(e) => e,
    }
}

const BOTH_SECTIONS: &str = r#"
GroupA:
  s3:
    NAME: bucket-a
GroupB:
  postgresql:
    NAME: pg-a
"#;

// ==================== Catalog Tests ====================

#[test]
fn test_every_registered_id_resolves_to_its_group() {
    let gate = gate();
    for id in gate.get_supported_data_sources_list() {
        let group = gate.resolver().group_of(&id).unwrap();
        assert!(gate
            .resolver()
            .groups()
            .members(group)
            .unwrap()
            .contains(&id));
    }
}

#[test]
fn test_orphan_source_is_rejected() {
    let registry = SourceRegistry::new()
        .with("s3", Arc::new(EchoFactory))
        .with("ftp", Arc::new(EchoFactory));
    let groups = SourceGroups::new().with_group("GroupA", ["s3"]);

    let err = DataGate::new(registry, groups).unwrap_err();
    assert!(matches!(err, ConnectError::InconsistentRegistry(ref msg) if msg.contains("ftp")));
}

#[test]
fn test_first_group_wins() {
    let registry = SourceRegistry::new().with("s3", Arc::new(EchoFactory));
    let groups = SourceGroups::new()
        .with_group("primary", ["s3"])
        .with_group("secondary", ["s3"]);
    let gate = DataGate::new(registry, groups).unwrap();

    gate.set_config_str("primary:\n  s3:\n    NAME: one\nsecondary:\n  s3:\n    NAME: two\n")
        .unwrap();
    assert_eq!(gate.connect("s3").unwrap().name(), "one");
}

#[test]
fn test_supported_list_is_independent_of_config() {
    let gate = gate();
    let before = gate.get_supported_data_sources_list();
    assert_eq!(before, vec!["s3", "postgresql"]);

    gate.set_config_str("GroupA: {}\n").unwrap();
    assert_eq!(gate.get_supported_data_sources_list(), before);
}

#[cfg(feature = "full")]
#[test]
fn test_builtin_supported_list() {
    let list = DataGate::builtin().get_supported_data_sources_list();
    assert_eq!(&list[..4], &["s3", "gcs", "azureblob", "bigquery"]);
    assert_eq!(list.len(), 15);
    assert_eq!(list.last().map(String::as_str), Some("dynamodb"));
    assert!(list.iter().any(|id| id == "starrocks"));
}

// ==================== Connect Tests ====================

#[test]
fn test_connect_before_load() {
    let gate = gate();
    assert!(!gate.is_configured());
    for id in ["s3", "POSTGRESQL", "unknown_source", ""] {
        assert!(matches!(connect_err(&gate, id), ConnectError::ConfigNotLoaded));
    }
}

#[test]
fn test_connect_unknown_source_carries_supported_list() {
    let gate = gate();
    gate.set_config_str(BOTH_SECTIONS).unwrap();

    match connect_err(&gate, "unknown_source") {
        ConnectError::UnknownSource {
            source_id,
            supported,
        } => {
            assert_eq!(source_id, "unknown_source");
            assert_eq!(supported, gate.get_supported_data_sources_list());
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_connect_is_case_insensitive() {
    let gate = gate();
    gate.set_config_str(BOTH_SECTIONS).unwrap();

    let connector = gate.connect("  PostgreSQL ").unwrap();
    assert_eq!(connector.name(), "pg-a");
}

#[test]
fn test_missing_section_names_group_and_source() {
    let gate = gate();
    gate.set_config_str("GroupA:\n  s3:\n    NAME: a\nGroupB: {}\n")
        .unwrap();

    match connect_err(&gate, "postgresql") {
        ConnectError::ConfigSectionMissing { group, source_id } => {
            assert_eq!(group, "GroupB");
            assert_eq!(source_id, "postgresql");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(gate.connect("s3").unwrap().name(), "a");
}

#[test]
fn test_missing_group_is_missing_section() {
    let gate = gate();
    gate.set_config_str("GroupA:\n  s3:\n    NAME: a\n").unwrap();

    let err = connect_err(&gate, "postgresql");
    assert!(err.to_string().contains("'GroupB.postgresql'"));
}

#[test]
fn test_factory_failure_is_wrapped() {
    let gate = gate();
    gate.set_config_str("GroupA:\n  s3:\n    NAME: ''\n").unwrap();

    match connect_err(&gate, "s3") {
        ConnectError::ConnectorConstruction { source_id, error } => {
            assert_eq!(source_id, "s3");
            assert!(matches!(error, ConnectorError::Config(_)));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_each_connect_returns_a_fresh_instance() {
    let gate = gate();
    gate.set_config_str(BOTH_SECTIONS).unwrap();

    let a = gate.connect("s3").unwrap();
    let b = gate.connect("s3").unwrap();
    let a_ptr = a.as_ref() as *const dyn DataConnector as *const u8;
    let b_ptr = b.as_ref() as *const dyn DataConnector as *const u8;
    assert_ne!(a_ptr, b_ptr);
}

// ==================== Loading Tests ====================

#[test]
fn test_reload_replaces_document() {
    let gate = gate();
    gate.set_config_str(BOTH_SECTIONS).unwrap();
    gate.set_config_str("GroupA:\n  s3:\n    NAME: bucket-b\n").unwrap();

    assert_eq!(gate.connect("s3").unwrap().name(), "bucket-b");
    assert!(matches!(
        connect_err(&gate, "postgresql"),
        ConnectError::ConfigSectionMissing { .. }
    ));
}

#[test]
fn test_failed_load_keeps_previous_document() {
    let gate = gate();
    gate.set_config_str(BOTH_SECTIONS).unwrap();

    assert!(matches!(
        gate.set_config_str("GroupA: [unclosed"),
        Err(ConnectError::ConfigParse { .. })
    ));
    assert!(matches!(
        gate.set_config("/nonexistent/datagate.yaml"),
        Err(ConnectError::ConfigNotFound { .. })
    ));

    assert_eq!(gate.connect("s3").unwrap().name(), "bucket-a");
}

#[test]
fn test_load_from_file_with_env_expansion() {
    std::env::set_var("DATAGATE_GATE_TEST_NAME", "from-env");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "GroupA:\n  s3:\n    NAME: ${{DATAGATE_GATE_TEST_NAME}}\nGroupB:\n  postgresql:\n    NAME: ${{DATAGATE_GATE_TEST_UNSET:-fallback}}"
    )
    .unwrap();

    let gate = gate();
    gate.set_config(file.path()).unwrap();
    assert!(gate.is_configured());
    assert_eq!(gate.connect("s3").unwrap().name(), "from-env");
    assert_eq!(gate.connect("postgresql").unwrap().name(), "fallback");
}

#[test]
fn test_gate_is_shareable_across_threads() {
    let gate = Arc::new(gate());
    gate.set_config_str(BOTH_SECTIONS).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let gate = gate.clone();
            std::thread::spawn(move || {
                if i % 2 == 0 {
                    gate.set_config_str(BOTH_SECTIONS).unwrap();
                }
                gate.connect("s3").unwrap().name().to_string()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), "bucket-a");
    }
}
