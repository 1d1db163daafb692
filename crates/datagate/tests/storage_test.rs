//! End-to-end tests for the object storage connector over a local directory

#![cfg(feature = "cloud-storage")]

use datagate::connectors::storage::LocalStorageFactory;
use datagate::{
    ConnectorError, DataConnector, DataFrame, DataGate, DownloadRequest, FileFormat,
    ObjectLocation, ReadRequest, SourceGroups, SourceRegistry, WriteRequest,
};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn connect(root: &Path) -> Box<dyn DataConnector> {
    let registry = SourceRegistry::new().with("local", Arc::new(LocalStorageFactory));
    let groups = SourceGroups::new().with_group("datalakes", ["local"]);
    let gate = DataGate::new(registry, groups).unwrap();
    gate.set_config_str(&format!("datalakes:\n  local:\n    ROOT: '{}'\n", root.display()))
        .unwrap();
    gate.connect("local").unwrap()
}

fn records(values: &[Value]) -> Vec<Map<String, Value>> {
    values
        .iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect()
}

fn sample_frame(offset: i64) -> DataFrame {
    DataFrame::from_json_records(&records(&[
        json!({"id": offset + 1, "city": "Oslo"}),
        json!({"id": offset + 2, "city": "Lima"}),
    ]))
    .unwrap()
}

fn loc(uri: &str) -> ObjectLocation {
    ObjectLocation::parse(uri).unwrap()
}

async fn write(conn: &dyn DataConnector, uri: &str, frame: &DataFrame) {
    conn.write_dataframe(
        frame,
        &WriteRequest::Object {
            location: loc(uri),
            format: None,
        },
    )
    .await
    .unwrap();
}

// ==================== Dataframe Tests ====================

#[tokio::test]
async fn test_write_then_read_each_format() {
    let root = TempDir::new().unwrap();
    let conn = connect(root.path());

    for ext in ["csv", "json", "jsonl", "parquet", "feather", "xlsx"] {
        let uri = format!("file://lake/out/data.{}", ext);
        write(conn.as_ref(), &uri, &sample_frame(0)).await;

        let frame = conn
            .read_as_dataframe(&ReadRequest::object(loc(&uri)))
            .await
            .unwrap();
        assert_eq!(frame.num_rows(), 2, "format {}", ext);
        assert_eq!(frame.column_names(), vec!["id", "city"], "format {}", ext);
    }

    assert!(root.path().join("lake/out/data.parquet").is_file());
}

#[tokio::test]
async fn test_prefix_read_concatenates_in_key_order() {
    let root = TempDir::new().unwrap();
    let conn = connect(root.path());

    write(conn.as_ref(), "file://lake/exports/part-2.csv", &sample_frame(2)).await;
    write(conn.as_ref(), "file://lake/exports/part-1.csv", &sample_frame(0)).await;
    write(conn.as_ref(), "file://lake/exports/other.csv", &sample_frame(10)).await;

    let frame = conn
        .read_as_dataframe(&ReadRequest::object(loc("file://lake/exports/part-*")))
        .await
        .unwrap();
    assert_eq!(frame.num_rows(), 4);

    let ids: Vec<Value> = frame
        .to_json_records()
        .unwrap()
        .into_iter()
        .map(|r| r["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4)]);

    let all = conn
        .read_as_dataframe(&ReadRequest::object(loc("file://lake/exports/")))
        .await
        .unwrap();
    assert_eq!(all.num_rows(), 6);
}

#[tokio::test]
async fn test_requested_format_applies_without_extension() {
    let root = TempDir::new().unwrap();
    let conn = connect(root.path());

    conn.write_dataframe(
        &sample_frame(0),
        &WriteRequest::Object {
            location: loc("file://lake/raw/events"),
            format: Some(FileFormat::Jsonl),
        },
    )
    .await
    .unwrap();

    let frame = conn
        .read_as_dataframe(&ReadRequest::Object {
            location: loc("file://lake/raw/events"),
            format: Some(FileFormat::Jsonl),
        })
        .await
        .unwrap();
    assert_eq!(frame.num_rows(), 2);
}

#[tokio::test]
async fn test_errors() {
    let root = TempDir::new().unwrap();
    let conn = connect(root.path());

    let missing = conn
        .read_as_dataframe(&ReadRequest::object(loc("file://lake/nope.csv")))
        .await;
    assert!(matches!(missing, Err(ConnectorError::NotFound(_))));

    let empty_prefix = conn
        .read_as_dataframe(&ReadRequest::object(loc("file://lake/none/")))
        .await;
    assert!(matches!(empty_prefix, Err(ConnectorError::NotFound(_))));

    let to_prefix = conn
        .write_dataframe(
            &sample_frame(0),
            &WriteRequest::Object {
                location: loc("file://lake/dir/"),
                format: None,
            },
        )
        .await;
    assert!(matches!(to_prefix, Err(ConnectorError::InvalidRequest(_))));

    let query = conn.read_as_dataframe(&ReadRequest::query("SELECT 1")).await;
    assert!(matches!(query, Err(ConnectorError::InvalidRequest(_))));

    let bad_ext = conn
        .write_dataframe(
            &sample_frame(0),
            &WriteRequest::Object {
                location: loc("file://lake/data.avro"),
                format: None,
            },
        )
        .await;
    assert!(matches!(bad_ext, Err(ConnectorError::UnsupportedExtension(ref e)) if e == "avro"));
}

// ==================== File Transfer Tests ====================

#[tokio::test]
async fn test_upload_then_download_file() {
    let root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let conn = connect(root.path());

    let source = work.path().join("report.csv");
    std::fs::write(&source, "a,b\n1,2\n").unwrap();

    let uploaded = conn
        .upload_file(&source, &loc("file://lake/uploads/"))
        .await
        .unwrap();
    assert_eq!(uploaded.key, "uploads/report.csv");

    let renamed = conn
        .upload_file(&source, &loc("file://lake/uploads/renamed.csv"))
        .await
        .unwrap();
    assert_eq!(renamed.key, "uploads/renamed.csv");

    let dest = work.path().join("downloads");
    let path = conn
        .download_file(&DownloadRequest::Object {
            location: uploaded,
            destination_dir: dest.clone(),
        })
        .await
        .unwrap();
    assert_eq!(path, dest.join("report.csv"));
    assert_eq!(std::fs::read_to_string(path).unwrap(), "a,b\n1,2\n");
}

#[tokio::test]
async fn test_upload_then_download_folder() {
    let root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let conn = connect(root.path());

    let folder = work.path().join("batch");
    std::fs::create_dir_all(folder.join("nested")).unwrap();
    std::fs::write(folder.join("a.csv"), "x\n1\n").unwrap();
    std::fs::write(folder.join("nested/b.csv"), "x\n2\n").unwrap();

    let uploaded = conn
        .upload_folder(&folder, &loc("file://lake/raw/"))
        .await
        .unwrap();
    let keys: Vec<&str> = uploaded.iter().map(|l| l.key.as_str()).collect();
    assert_eq!(keys, vec!["raw/batch/a.csv", "raw/batch/nested/b.csv"]);

    let dest = work.path().join("restore");
    let restored = conn
        .download_folder(&loc("file://lake/raw/batch"), &dest)
        .await
        .unwrap();
    assert_eq!(restored, dest.join("batch"));
    assert_eq!(
        std::fs::read_to_string(restored.join("a.csv")).unwrap(),
        "x\n1\n"
    );
    assert_eq!(
        std::fs::read_to_string(restored.join("nested/b.csv")).unwrap(),
        "x\n2\n"
    );

    let frame = conn
        .read_as_dataframe(&ReadRequest::object(loc("file://lake/raw/batch/")))
        .await
        .unwrap();
    assert_eq!(frame.num_rows(), 2);
}

#[tokio::test]
async fn test_query_download_is_rejected() {
    let root = TempDir::new().unwrap();
    let conn = connect(root.path());

    let result = conn
        .download_file(&DownloadRequest::Query {
            sql: "SELECT 1".into(),
            database: None,
            schema: None,
            destination: root.path().join("out.csv"),
        })
        .await;
    assert!(matches!(result, Err(ConnectorError::InvalidRequest(_))));
}
