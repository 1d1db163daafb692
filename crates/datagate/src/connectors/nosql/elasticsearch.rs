//! Elasticsearch over its REST API
//!
//! Reads post the given query body to `<index>/_search` and turn each hit's
//! `_source` into a row. Writes send the frame's records to `_bulk` as
//! NDJSON `index` actions and fail if the response reports item errors.

use crate::connector::{
    unexpected_read, unexpected_write, DataConnector, Operation, ReadRequest, WriteRequest,
    WriteSummary, DATAFRAME_OPERATIONS,
};
use crate::error::{ConnectorError, ConnectorResult};
use crate::frame::DataFrame;
use crate::registry::{parse_section, ConnectorFactory};
use crate::types::SensitiveString;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use validator::Validate;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Documents per `_bulk` request
const BULK_BATCH_SIZE: usize = 1000;

/// `nosql.elasticsearch`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ElasticsearchConfig {
    /// Base URL, e.g. `https://localhost:9200`
    #[serde(rename = "HOST")]
    #[validate(length(min = 1))]
    pub host: String,

    #[serde(rename = "USERNAME", default)]
    pub username: Option<String>,

    #[serde(rename = "PASSWORD", default)]
    pub password: Option<SensitiveString>,

    /// Encoded API key, or `id:api_key`
    #[serde(rename = "API_KEY", default)]
    pub api_key: Option<SensitiveString>,
}

#[derive(Debug, Clone)]
enum Credentials {
    None,
    Basic {
        username: String,
        password: SensitiveString,
    },
    ApiKey(SensitiveString),
}

impl Credentials {
    fn from_config(config: &ElasticsearchConfig) -> ConnectorResult<Self> {
        if let Some(key) = config.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(Self::ApiKey(SensitiveString::new(api_key_header(
                key.expose_secret(),
            ))));
        }
        match (&config.username, &config.password) {
            (Some(username), Some(password)) => Ok(Self::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            (Some(_), None) => Err(ConnectorError::config("USERNAME is set without PASSWORD")),
            (None, Some(_)) => Err(ConnectorError::config("PASSWORD is set without USERNAME")),
            (None, None) => Ok(Self::None),
        }
    }
}

/// `ApiKey` header value; an `id:key` pair is base64-encoded first
fn api_key_header(key: &str) -> String {
    if key.contains(':') {
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key)
    } else {
        key.to_string()
    }
}

/// Parse `HOST`, making sure the path ends with `/` so endpoints join under it
fn base_url(host: &str) -> ConnectorResult<Url> {
    let mut url = Url::parse(host)
        .map_err(|e| ConnectorError::config(format!("invalid HOST '{}': {}", host, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConnectorError::config(format!(
            "HOST must be an http(s) URL, got '{}'",
            host
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Request body for a search; `null` matches every document
fn search_body(query: &Value) -> ConnectorResult<Value> {
    match query {
        Value::Null => Ok(json!({"query": {"match_all": {}}})),
        Value::Object(_) => Ok(query.clone()),
        Value::String(text) => serde_json::from_str(text)
            .map_err(|e| ConnectorError::invalid_request(format!("invalid search body: {}", e))),
        other => Err(ConnectorError::invalid_request(format!(
            "search body must be a JSON object, got {}",
            other
        ))),
    }
}

/// `_source` of every hit in a search response
fn hit_sources(response: &Value) -> ConnectorResult<Vec<Map<String, Value>>> {
    let hits = response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| ConnectorError::serialization("search response has no hits.hits"))?;

    Ok(hits
        .iter()
        .filter_map(|hit| hit.get("_source").and_then(Value::as_object).cloned())
        .collect())
}

/// NDJSON body indexing `records` into `index`
fn bulk_body(index: &str, records: &[Map<String, Value>]) -> ConnectorResult<String> {
    let action = serde_json::to_string(&json!({"index": {"_index": index}}))?;
    let mut body = String::new();
    for record in records {
        body.push_str(&action);
        body.push('\n');
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    Ok(body)
}

/// Item errors reported by a `_bulk` response
fn bulk_errors(response: &Value) -> Vec<String> {
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return Vec::new();
    }
    response
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_object()?.values().next()?.get("error"))
                .map(|error| error.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Elasticsearch connector
pub struct ElasticsearchConnector {
    client: reqwest::Client,
    base: Url,
    credentials: Credentials,
}

impl ElasticsearchConnector {
    pub fn new(config: ElasticsearchConfig) -> ConnectorResult<Self> {
        let base = base_url(&config.host)?;
        let credentials = Credentials::from_config(&config)?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ConnectorError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base,
            credentials,
        })
    }

    fn endpoint(&self, index: &str, action: &str) -> ConnectorResult<Url> {
        if index.is_empty() || index.contains('/') {
            return Err(ConnectorError::invalid_request(format!(
                "invalid index name '{}'",
                index
            )));
        }
        self.base
            .join(&format!("{}/{}", index, action))
            .map_err(|e| ConnectorError::invalid_request(e.to_string()))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Credentials::None => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
            Credentials::ApiKey(key) => {
                request.header("Authorization", format!("ApiKey {}", key.expose_secret()))
            }
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ConnectorResult<Value> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| ConnectorError::connection(format!("Elasticsearch request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ConnectorError::auth(format!(
                "Elasticsearch rejected credentials ({})",
                status
            )));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::not_found(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::query(format!(
                "Elasticsearch error ({}): {}",
                status, body
            )));
        }

        response.json().await.map_err(|e| {
            ConnectorError::serialization(format!("Failed to parse Elasticsearch response: {}", e))
        })
    }
}

#[async_trait]
impl DataConnector for ElasticsearchConnector {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    fn operations(&self) -> &'static [Operation] {
        DATAFRAME_OPERATIONS
    }

    async fn read_as_dataframe(&self, request: &ReadRequest) -> ConnectorResult<DataFrame> {
        let ReadRequest::Search { index, query } = request else {
            return Err(unexpected_read(self.name(), request));
        };

        let url = self.endpoint(index, "_search")?;
        let response = self
            .send(self.client.post(url).json(&search_body(query)?))
            .await?;
        let records = hit_sources(&response)?;

        info!(index = %index, hits = records.len(), "Search returned");
        DataFrame::from_json_records(&records)
    }

    async fn write_dataframe(
        &self,
        frame: &DataFrame,
        request: &WriteRequest,
    ) -> ConnectorResult<WriteSummary> {
        let WriteRequest::Index { index } = request else {
            return Err(unexpected_write(self.name(), request));
        };

        let url = self.endpoint(index, "_bulk")?;
        let records = frame.to_json_records()?;

        let mut written = 0u64;
        for chunk in records.chunks(BULK_BATCH_SIZE) {
            let body = bulk_body(index, chunk)?;
            let response = self
                .send(
                    self.client
                        .post(url.clone())
                        .header("Content-Type", "application/x-ndjson")
                        .body(body),
                )
                .await?;

            let errors = bulk_errors(&response);
            if !errors.is_empty() {
                for error in errors.iter().take(5) {
                    warn!(index = %index, error = %error, "Bulk item failed");
                }
                return Err(ConnectorError::query(format!(
                    "{} of {} documents failed to index into '{}' after {} succeeded",
                    errors.len(),
                    chunk.len(),
                    index,
                    written
                )));
            }
            written += chunk.len() as u64;
            debug!(index = %index, written, "Indexed batch");
        }

        info!(index = %index, documents = written, "Wrote dataframe");
        Ok(WriteSummary::new(index.clone(), written))
    }
}

/// Factory for the `elasticsearch` source
pub struct ElasticsearchFactory;

impl ConnectorFactory for ElasticsearchFactory {
    fn description(&self) -> &'static str {
        "Elasticsearch search engine"
    }

    fn operations(&self) -> &'static [Operation] {
        DATAFRAME_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(ElasticsearchConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: ElasticsearchConfig = parse_section(section)?;
        Ok(Box::new(ElasticsearchConnector::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_endpoints_join_under_base_path() {
        let connector = ElasticsearchConnector::new(
            parse_section(&yaml("HOST: http://localhost:9200")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            connector.endpoint("logs", "_search").unwrap().as_str(),
            "http://localhost:9200/logs/_search"
        );

        let connector = ElasticsearchConnector::new(
            parse_section(&yaml("HOST: https://proxy.local/es")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            connector.endpoint("logs", "_bulk").unwrap().as_str(),
            "https://proxy.local/es/logs/_bulk"
        );
        assert!(connector.endpoint("a/b", "_search").is_err());
    }

    #[test]
    fn test_invalid_host_fails_construction() {
        assert!(matches!(
            ElasticsearchFactory.create(&yaml("HOST: not a url")),
            Err(ConnectorError::Config(_))
        ));
        assert!(matches!(
            ElasticsearchFactory.create(&yaml("HOST: ftp://host")),
            Err(ConnectorError::Config(_))
        ));
    }

    #[test]
    fn test_credentials() {
        let config: ElasticsearchConfig =
            parse_section(&yaml("HOST: http://h:9200\nAPI_KEY: id:secret\nUSERNAME: u\n")).unwrap();
        match Credentials::from_config(&config).unwrap() {
            Credentials::ApiKey(key) => assert_eq!(key.expose_secret(), "aWQ6c2VjcmV0"),
            other => panic!("unexpected {:?}", other),
        }

        let config: ElasticsearchConfig =
            parse_section(&yaml("HOST: http://h:9200\nUSERNAME: elastic\n")).unwrap();
        assert!(Credentials::from_config(&config).is_err());
    }

    #[test]
    fn test_search_body() {
        assert_eq!(
            search_body(&Value::Null).unwrap(),
            json!({"query": {"match_all": {}}})
        );
        let q = json!({"query": {"term": {"level": "error"}}, "size": 50});
        assert_eq!(search_body(&q).unwrap(), q);
        assert_eq!(
            search_body(&json!("{\"size\": 1}")).unwrap(),
            json!({"size": 1})
        );
        assert!(search_body(&json!([1])).is_err());
    }

    #[test]
    fn test_hit_sources() {
        let response = json!({
            "hits": {"total": {"value": 2}, "hits": [
                {"_id": "1", "_source": {"msg": "a", "n": 1}},
                {"_id": "2", "_source": {"msg": "b", "n": 2}}
            ]}
        });
        let records = hit_sources(&response).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["msg"], json!("b"));
        assert!(hit_sources(&json!({"error": "x"})).is_err());
    }

    #[test]
    fn test_bulk_body_and_errors() {
        let records: Vec<Map<String, Value>> = vec![
            json!({"a": 1}).as_object().unwrap().clone(),
            json!({"a": 2}).as_object().unwrap().clone(),
        ];
        let body = bulk_body("idx", &records).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], r#"{"index":{"_index":"idx"}}"#);
        assert_eq!(lines[3], r#"{"a":2}"#);
        assert!(body.ends_with('\n'));

        assert!(bulk_errors(&json!({"errors": false, "items": []})).is_empty());
        let failed = json!({"errors": true, "items": [
            {"index": {"status": 201}},
            {"index": {"status": 400, "error": {"type": "mapper_parsing_exception"}}}
        ]});
        let errors = bulk_errors(&failed);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("mapper_parsing_exception"));
    }
}
