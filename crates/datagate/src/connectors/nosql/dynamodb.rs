//! Amazon DynamoDB: full-table scans and batched puts
//!
//! Reads take a [`ReadRequest::Table`] and follow `LastEvaluatedKey` until the
//! scan is exhausted. Writes take a [`WriteRequest::Table`] in append mode and
//! send `BatchWriteItem` calls of at most 25 puts, resending unprocessed items
//! with backoff.
//!
//! | DynamoDB   | JSON                                  |
//! |------------|---------------------------------------|
//! | S, N, BOOL | string, number (string if too large), bool |
//! | NULL       | null                                  |
//! | L, M       | array, object                         |
//! | SS, NS     | array of strings, array of numbers    |
//! | B, BS      | base64 string, array of base64 strings |

use crate::connector::{
    unexpected_read, unexpected_write, DataConnector, IfExists, Operation, ReadRequest,
    WriteRequest, WriteSummary, DATAFRAME_OPERATIONS,
};
use crate::error::{ConnectorError, ConnectorResult};
use crate::frame::DataFrame;
use crate::registry::{parse_section, ConnectorFactory};
use crate::types::SensitiveString;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::config::Credentials;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest as ItemWrite};
use aws_sdk_dynamodb::Client;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use validator::{Validate, ValidationError};

/// Most puts in one `BatchWriteItem` call
const BATCH_SIZE: usize = 25;

/// Resends of a batch's unprocessed items before the write fails
const MAX_UNPROCESSED_RETRIES: u32 = 5;

type Item = HashMap<String, AttributeValue>;

fn default_region() -> String {
    "us-east-1".to_string()
}

fn non_empty_secret(value: &SensitiveString) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("empty"));
    }
    Ok(())
}

/// `nosql.dynamodb`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct DynamoDbConfig {
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

    /// DynamoDB Local or another compatible endpoint
    #[serde(rename = "AWS_ENDPOINT", default)]
    pub endpoint: Option<String>,
}

/// A number attribute as JSON; integers stay exact
fn number_to_json(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(text.to_string()))
}

fn attribute_to_json(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => number_to_json(n),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(items) => Value::Array(items.iter().map(attribute_to_json).collect()),
        AttributeValue::M(map) => Value::Object(item_to_record(map)),
        AttributeValue::Ss(items) => Value::from(items.clone()),
        AttributeValue::Ns(items) => Value::Array(items.iter().map(|n| number_to_json(n)).collect()),
        AttributeValue::B(blob) => Value::String(STANDARD.encode(blob.as_ref())),
        AttributeValue::Bs(blobs) => Value::Array(
            blobs
                .iter()
                .map(|b| Value::String(STANDARD.encode(b.as_ref())))
                .collect(),
        ),
        _ => Value::Null,
    }
}

/// Item to a record with its attributes in name order
fn item_to_record(item: &Item) -> Map<String, Value> {
    let mut names: Vec<&String> = item.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| (name.clone(), attribute_to_json(&item[name])))
        .collect()
}

fn json_to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(json_to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_attribute(v)))
                .collect(),
        ),
    }
}

fn record_to_put(record: &Map<String, Value>) -> ConnectorResult<ItemWrite> {
    let item: Item = record
        .iter()
        .map(|(k, v)| (k.clone(), json_to_attribute(v)))
        .collect();
    let put = PutRequest::builder()
        .set_item(Some(item))
        .build()
        .map_err(ConnectorError::serialization)?;
    Ok(ItemWrite::builder().put_request(put).build())
}

fn request_failed(operation: &str, table: &str, err: impl std::error::Error) -> ConnectorError {
    ConnectorError::query(format!(
        "DynamoDB {} on '{}' failed: {}",
        operation,
        table,
        DisplayErrorContext(err)
    ))
}

/// Run a paginated scan to the end.
///
/// `fetch` gets the exclusive start key (none for the first page) and returns
/// the page's items with its `LastEvaluatedKey`.
async fn scan_all<F, Fut>(mut fetch: F) -> ConnectorResult<Vec<Map<String, Value>>>
where
    F: FnMut(Option<Item>) -> Fut,
    Fut: Future<Output = ConnectorResult<(Vec<Item>, Option<Item>)>>,
{
    let mut records = Vec::new();
    let mut start_key = None;
    let mut pages = 0usize;
    loop {
        let (items, last_key) = fetch(start_key).await?;
        pages += 1;
        records.extend(items.iter().map(item_to_record));
        match last_key {
            Some(key) if !key.is_empty() => start_key = Some(key),
            _ => break,
        }
    }
    debug!(pages, items = records.len(), "Scan finished");
    Ok(records)
}

/// Send puts in batches; `send` returns the items DynamoDB left unprocessed
async fn write_batches<F, Fut>(requests: &[ItemWrite], mut send: F) -> ConnectorResult<u64>
where
    F: FnMut(Vec<ItemWrite>) -> Fut,
    Fut: Future<Output = ConnectorResult<Vec<ItemWrite>>>,
{
    let mut written = 0u64;
    for chunk in requests.chunks(BATCH_SIZE) {
        let mut pending = chunk.to_vec();
        let mut retries = 0u32;
        loop {
            let unprocessed = send(pending).await?;
            if unprocessed.is_empty() {
                break;
            }
            retries += 1;
            if retries > MAX_UNPROCESSED_RETRIES {
                return Err(ConnectorError::query(format!(
                    "{} items were still unprocessed after {} retries",
                    unprocessed.len(),
                    MAX_UNPROCESSED_RETRIES
                )));
            }
            warn!(unprocessed = unprocessed.len(), retry = retries, "Resending unprocessed items");
            tokio::time::sleep(Duration::from_millis(25 << retries)).await;
            pending = unprocessed;
        }
        written += chunk.len() as u64;
    }
    Ok(written)
}

/// DynamoDB connector; the client is created on first use
pub struct DynamoDbConnector {
    config: DynamoDbConfig,
    client: OnceCell<Client>,
}

impl DynamoDbConnector {
    pub fn new(config: DynamoDbConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let credentials = Credentials::new(
                    self.config.access_key_id.expose_secret(),
                    self.config.secret_access_key.expose_secret(),
                    self.config
                        .session_token
                        .as_ref()
                        .map(|t| t.expose_secret().to_string()),
                    None,
                    "datagate",
                );
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.config.region.clone()))
                    .credentials_provider(credentials);
                if let Some(endpoint) = &self.config.endpoint {
                    loader = loader.endpoint_url(endpoint);
                }
                debug!(region = %self.config.region, "Creating DynamoDB client");
                Client::new(&loader.load().await)
            })
            .await
    }
}

fn check_table(table: &str) -> ConnectorResult<()> {
    if table.is_empty() {
        return Err(ConnectorError::invalid_request("table name is empty"));
    }
    Ok(())
}

#[async_trait]
impl DataConnector for DynamoDbConnector {
    fn name(&self) -> &str {
        "dynamodb"
    }

    fn operations(&self) -> &'static [Operation] {
        DATAFRAME_OPERATIONS
    }

    async fn read_as_dataframe(&self, request: &ReadRequest) -> ConnectorResult<DataFrame> {
        let ReadRequest::Table { table } = request else {
            return Err(unexpected_read(self.name(), request));
        };
        check_table(table)?;

        let client = self.client().await;
        let records = scan_all(|start_key| async move {
            let output = client
                .scan()
                .table_name(table.as_str())
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| request_failed("Scan", table, e))?;
            Ok((output.items.unwrap_or_default(), output.last_evaluated_key))
        })
        .await?;

        info!(table = %table, items = records.len(), "Scanned table");
        DataFrame::from_json_records(&records)
    }

    async fn write_dataframe(
        &self,
        frame: &DataFrame,
        request: &WriteRequest,
    ) -> ConnectorResult<WriteSummary> {
        let WriteRequest::Table {
            table, if_exists, ..
        } = request
        else {
            return Err(unexpected_write(self.name(), request));
        };
        check_table(table)?;
        if *if_exists != IfExists::Append {
            return Err(ConnectorError::invalid_request(
                "DynamoDB tables only support if_exists = append",
            ));
        }

        let puts = frame
            .to_json_records()?
            .iter()
            .map(record_to_put)
            .collect::<ConnectorResult<Vec<_>>>()?;
        if puts.is_empty() {
            return Ok(WriteSummary::new(table.as_str(), 0));
        }

        let client = self.client().await;
        let written = write_batches(&puts, |batch| async move {
            let output = client
                .batch_write_item()
                .request_items(table.as_str(), batch)
                .send()
                .await
                .map_err(|e| request_failed("BatchWriteItem", table, e))?;
            Ok(output
                .unprocessed_items
                .and_then(|mut tables| tables.remove(table.as_str()))
                .unwrap_or_default())
        })
        .await?;

        info!(table = %table, items = written, "Wrote dataframe");
        Ok(WriteSummary::new(table.as_str(), written))
    }
}

/// Factory for the `dynamodb` source
pub struct DynamoDbFactory;

impl ConnectorFactory for DynamoDbFactory {
    fn description(&self) -> &'static str {
        "Amazon DynamoDB key-value store"
    }

    fn operations(&self) -> &'static [Operation] {
        DATAFRAME_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(DynamoDbConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: DynamoDbConfig = parse_section(section)?;
        Ok(Box::new(DynamoDbConnector::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn item(pairs: &[(&str, AttributeValue)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn puts(n: usize) -> Vec<ItemWrite> {
        (0..n)
            .map(|i| {
                let record = json!({"pk": format!("k{}", i)});
                record_to_put(record.as_object().unwrap()).unwrap()
            })
            .collect()
    }

    // ==================== Config Tests ====================

    #[test]
    fn test_section_parsing() {
        let section = serde_yaml::from_str(
            "AWS_ACCESS_KEY_ID: AKIA123\nAWS_SECRET_ACCESS_KEY: s3cr3t\nAWS_REGION: eu-west-1\n",
        )
        .unwrap();
        let config: DynamoDbConfig = parse_section(&section).unwrap();
        assert_eq!(config.access_key_id.expose_secret(), "AKIA123");
        assert_eq!(config.region, "eu-west-1");
        assert!(config.endpoint.is_none());
        assert!(!format!("{:?}", config).contains("s3cr3t"));

        let section =
            serde_yaml::from_str("AWS_ACCESS_KEY_ID: AKIA123\nAWS_SECRET_ACCESS_KEY: s3cr3t\n")
                .unwrap();
        let config: DynamoDbConfig = parse_section(&section).unwrap();
        assert_eq!(config.region, "us-east-1");
    }

    #[test]
    fn test_missing_secret_is_a_config_error() {
        let missing = serde_yaml::from_str("AWS_ACCESS_KEY_ID: AKIA123\n").unwrap();
        assert!(matches!(DynamoDbFactory.create(&missing), Err(ConnectorError::Config(_))));

        let empty =
            serde_yaml::from_str("AWS_ACCESS_KEY_ID: AKIA123\nAWS_SECRET_ACCESS_KEY: ''\n").unwrap();
        assert!(matches!(DynamoDbFactory.create(&empty), Err(ConnectorError::Config(_))));

        let ok = serde_yaml::from_str(
            "AWS_ACCESS_KEY_ID: AKIA123\nAWS_SECRET_ACCESS_KEY: s3cr3t\nAWS_ENDPOINT: http://localhost:8000\n",
        )
        .unwrap();
        assert!(DynamoDbFactory.create(&ok).is_ok());
    }

    // ==================== Attribute Tests ====================

    #[test]
    fn test_attributes_to_record() {
        let record = item_to_record(&item(&[
            ("pk", AttributeValue::S("user#1".into())),
            ("age", AttributeValue::N("42".into())),
            ("score", AttributeValue::N("9.5".into())),
            ("big", AttributeValue::N("123456789012345678901234567890".into())),
            ("active", AttributeValue::Bool(true)),
            ("gone", AttributeValue::Null(true)),
            ("tags", AttributeValue::Ss(vec!["a".into(), "b".into()])),
            ("nums", AttributeValue::Ns(vec!["1".into(), "2.5".into()])),
            ("raw", AttributeValue::B(Blob::new(vec![1u8, 2, 3]))),
            (
                "meta",
                AttributeValue::M(item(&[(
                    "list",
                    AttributeValue::L(vec![AttributeValue::N("7".into())]),
                )])),
            ),
        ]));

        let names: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec!["active", "age", "big", "gone", "meta", "nums", "pk", "raw", "score", "tags"]
        );
        assert_eq!(record["pk"], json!("user#1"));
        assert_eq!(record["age"], json!(42));
        assert_eq!(record["score"], json!(9.5));
        assert!(record["big"].is_f64());
        assert_eq!(record["active"], json!(true));
        assert_eq!(record["gone"], Value::Null);
        assert_eq!(record["tags"], json!(["a", "b"]));
        assert_eq!(record["nums"], json!([1, 2.5]));
        assert_eq!(record["raw"], json!("AQID"));
        assert_eq!(record["meta"], json!({"list": [7]}));
    }

    #[test]
    fn test_record_to_put() {
        let record = json!({"pk": "a", "n": 3, "nested": {"ok": false}, "none": null});
        let put = record_to_put(record.as_object().unwrap()).unwrap();
        let item = put.put_request().unwrap().item();

        assert_eq!(item["pk"], AttributeValue::S("a".into()));
        assert_eq!(item["n"], AttributeValue::N("3".into()));
        assert_eq!(item["none"], AttributeValue::Null(true));
        assert_eq!(
            item["nested"],
            AttributeValue::M(self::item(&[("ok", AttributeValue::Bool(false))]))
        );
    }

    // ==================== Scan Tests ====================

    #[tokio::test]
    async fn test_scan_follows_last_evaluated_key() {
        let starts: Arc<Mutex<Vec<Option<Item>>>> = Arc::default();
        let seen = starts.clone();
        let cursor = item(&[("pk", AttributeValue::S("k2".into()))]);

        let records = scan_all(|start_key| {
            let seen = seen.clone();
            let cursor = cursor.clone();
            async move {
                let first = start_key.is_none();
                seen.lock().push(start_key);
                if first {
                    let items = vec![
                        item(&[("pk", AttributeValue::S("k1".into()))]),
                        item(&[("pk", AttributeValue::S("k2".into()))]),
                    ];
                    Ok((items, Some(cursor)))
                } else {
                    let items = vec![item(&[("pk", AttributeValue::S("k3".into()))])];
                    Ok((items, None))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[2]["pk"], json!("k3"));
        assert_eq!(*starts.lock(), vec![None, Some(cursor)]);
    }

    #[tokio::test]
    async fn test_scan_stops_on_empty_last_key() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let records = scan_all(|_| {
            let counter = counter.clone();
            async move {
                *counter.lock() += 1;
                Ok((Vec::new(), Some(Item::new())))
            }
        })
        .await
        .unwrap();

        assert!(records.is_empty());
        assert_eq!(*calls.lock(), 1);
    }

    // ==================== Batch Write Tests ====================

    #[tokio::test]
    async fn test_batches_of_25_with_unprocessed_resent() {
        let sizes: Arc<Mutex<Vec<usize>>> = Arc::default();
        let seen = sizes.clone();

        let written = write_batches(&puts(30), |batch| {
            let seen = seen.clone();
            async move {
                let first_call = seen.lock().is_empty();
                seen.lock().push(batch.len());
                // the first call leaves two puts unprocessed
                if first_call {
                    Ok(batch[..2].to_vec())
                } else {
                    Ok(Vec::new())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(written, 30);
        assert_eq!(*sizes.lock(), vec![25, 2, 5]);
    }

    #[tokio::test]
    async fn test_persistent_unprocessed_items_fail() {
        let result = write_batches(&puts(3), |batch| async move { Ok(batch) }).await;
        match result {
            Err(ConnectorError::Query(msg)) => assert!(msg.contains("3 items")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replace_is_rejected() {
        let section = serde_yaml::from_str(
            "AWS_ACCESS_KEY_ID: AKIA123\nAWS_SECRET_ACCESS_KEY: s3cr3t\n",
        )
        .unwrap();
        let conn = DynamoDbFactory.create(&section).unwrap_or_else(|_| panic!("factory failed"));
        let frame = DataFrame::from_json_records(&[json!({"pk": "a"})
            .as_object()
            .unwrap()
            .clone()])
        .unwrap();

        let result = conn
            .write_dataframe(
                &frame,
                &WriteRequest::Table {
                    table: "t".into(),
                    database: None,
                    schema: None,
                    if_exists: IfExists::Replace,
                },
            )
            .await;
        assert!(matches!(result, Err(ConnectorError::InvalidRequest(_))));

        let result = conn.read_as_dataframe(&ReadRequest::query("SELECT 1")).await;
        assert!(matches!(result, Err(ConnectorError::InvalidRequest(_))));
    }
}
