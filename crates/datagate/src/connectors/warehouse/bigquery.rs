//! Google BigQuery over `gcp-bigquery-client`
//!
//! Reads run a query job, wait for it to finish and follow page tokens until
//! every row is fetched; cells come back as strings and are typed from the
//! result schema. Writes stream rows into an existing table with `insertAll`.

use crate::connector::{
    unexpected_read, unexpected_write, DataConnector, IfExists, Operation, ReadRequest,
    WriteRequest, WriteSummary, QUERY_OPERATIONS,
};
use crate::error::{ConnectorError, ConnectorResult};
use crate::frame::DataFrame;
use crate::registry::{parse_section, ConnectorFactory};
use crate::types::SensitiveString;
use async_trait::async_trait;
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::table_data_insert_all_request::TableDataInsertAllRequest;
use gcp_bigquery_client::model::table_data_insert_all_request_rows::TableDataInsertAllRequestRows;
use gcp_bigquery_client::yup_oauth2::ServiceAccountKey;
use gcp_bigquery_client::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use validator::Validate;

/// Rows per `insertAll` call
const INSERT_BATCH_SIZE: usize = 500;

/// Server-side wait per `getQueryResults` call while a job runs
const RESULTS_WAIT_MS: i32 = 10_000;

/// Give up on a query job after this long
const QUERY_TIMEOUT: Duration = Duration::from_secs(600);

/// `datawarehouses.bigquery`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct BigQueryConfig {
    /// Service account key file
    #[serde(rename = "GOOGLE_APPLICATION_CREDENTIALS_PATH")]
    #[validate(length(min = 1))]
    pub credentials_path: String,

    #[serde(rename = "PROJECT_ID")]
    #[validate(length(min = 1, max = 255))]
    pub project_id: String,
}

/// BigQuery connector; the API client is created on first use
pub struct BigQueryConnector {
    project_id: String,
    credentials: SensitiveString,
    client: OnceCell<Client>,
}

impl BigQueryConnector {
    pub fn new(config: BigQueryConfig) -> ConnectorResult<Self> {
        let credentials = std::fs::read_to_string(&config.credentials_path).map_err(|e| {
            ConnectorError::config(format!(
                "Failed to read credentials from '{}': {}",
                config.credentials_path, e
            ))
        })?;
        parse_key(&credentials)?;

        Ok(Self {
            project_id: config.project_id,
            credentials: SensitiveString::new(credentials),
            client: OnceCell::new(),
        })
    }

    async fn client(&self) -> ConnectorResult<&Client> {
        self.client
            .get_or_try_init(|| async {
                let sa_key = parse_key(self.credentials.expose_secret())?;
                Client::from_service_account_key(sa_key, false)
                    .await
                    .map_err(|e| {
                        ConnectorError::connection(format!(
                            "Failed to create BigQuery client: {}",
                            e
                        ))
                    })
            })
            .await
    }

    async fn query(&self, sql: &str) -> ConnectorResult<DataFrame> {
        let client = self.client().await?;
        let response = client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await
            .map_err(|e| ConnectorError::query(format!("BigQuery query failed: {}", e)))?;
        let first = QueryPage::from_model(response.query_response())?;

        let job = first.job_reference.clone().unwrap_or_default();
        collect_pages(first, |page_token| {
            let job = job.clone();
            async move {
                let job_id = job.job_id.ok_or_else(|| {
                    ConnectorError::query("BigQuery response has no job id to fetch results for")
                })?;
                let params = GetQueryResultsParameters {
                    location: job.location,
                    page_token,
                    timeout_ms: Some(RESULTS_WAIT_MS),
                    ..Default::default()
                };
                let response = client
                    .job()
                    .get_query_results(&self.project_id, &job_id, params)
                    .await
                    .map_err(|e| {
                        ConnectorError::query(format!("BigQuery result fetch failed: {}", e))
                    })?;
                QueryPage::from_model(&response)
            }
        })
        .await
    }
}

/// The parts of a `jobs.query` / `jobs.getQueryResults` response a read
/// needs, in the REST wire shape
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    job_complete: Option<bool>,
    job_reference: Option<PageJob>,
    page_token: Option<String>,
    rows: Option<Vec<PageRow>>,
    schema: Option<PageSchema>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageJob {
    job_id: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageRow {
    f: Option<Vec<PageCell>>,
}

#[derive(Debug, Deserialize)]
struct PageCell {
    v: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PageSchema {
    fields: Option<Vec<PageField>>,
}

#[derive(Debug, Deserialize)]
struct PageField {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
}

impl QueryPage {
    /// Re-read a client model through its JSON form
    fn from_model<T: Serialize>(model: &T) -> ConnectorResult<Self> {
        serde_json::to_value(model)
            .and_then(serde_json::from_value)
            .map_err(|e| ConnectorError::serialization(format!("Unexpected BigQuery response: {}", e)))
    }

    fn is_complete(&self) -> bool {
        self.job_complete.unwrap_or(true)
    }
}

/// Wait for the job, then follow page tokens until the result is exhausted.
///
/// `fetch(None)` asks for the first page again (used while the job is still
/// running); `fetch(Some(token))` asks for the page after `token`.
async fn collect_pages<F, Fut>(first: QueryPage, mut fetch: F) -> ConnectorResult<DataFrame>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = ConnectorResult<QueryPage>>,
{
    let deadline = Instant::now() + QUERY_TIMEOUT;
    let mut page = first;
    while !page.is_complete() {
        if Instant::now() >= deadline {
            return Err(ConnectorError::query(format!(
                "BigQuery job did not finish within {}s",
                QUERY_TIMEOUT.as_secs()
            )));
        }
        debug!("BigQuery job still running");
        page = fetch(None).await?;
    }

    let fields = page
        .schema
        .take()
        .and_then(|s| s.fields)
        .unwrap_or_default();
    let columns: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();

    let mut rows = Vec::new();
    let mut pages = 0usize;
    loop {
        pages += 1;
        for row in page.rows.take().unwrap_or_default() {
            let cells = row.f.unwrap_or_default();
            let mut values = Vec::with_capacity(fields.len());
            for (idx, field) in fields.iter().enumerate() {
                let raw = cells.get(idx).and_then(|c| c.v.clone());
                values.push(bigquery_value(raw, &field.kind));
            }
            rows.push(values);
        }

        match page.page_token.take().filter(|t| !t.is_empty()) {
            Some(token) => page = fetch(Some(token)).await?,
            None => break,
        }
    }

    debug!(pages, rows = rows.len(), "Fetched BigQuery results");
    DataFrame::from_rows(&columns, rows)
}

fn parse_key(json: &str) -> ConnectorResult<ServiceAccountKey> {
    serde_json::from_str(json)
        .map_err(|e| ConnectorError::config(format!("Invalid service account key: {}", e)))
}

/// Type one cell from its schema type name (`INTEGER`, `FLOAT64`, ...)
fn bigquery_value(raw: Option<Value>, kind: &str) -> Value {
    let text = match raw {
        None | Some(Value::Null) => return Value::Null,
        Some(Value::String(text)) => text,
        Some(other) => return other,
    };

    let typed = match kind {
        "INTEGER" | "INT64" => text.parse::<i64>().ok().map(Value::from),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        "BOOLEAN" | "BOOL" => text.parse::<bool>().ok().map(Value::Bool),
        "TIMESTAMP" => text.parse::<f64>().ok().and_then(|secs| {
            let micros = (secs * 1_000_000.0).round() as i64;
            chrono::DateTime::from_timestamp_micros(micros).map(|t| Value::String(t.to_rfc3339()))
        }),
        "JSON" => serde_json::from_str(&text).ok(),
        _ => None,
    };
    typed.unwrap_or(Value::String(text))
}

/// `dataset.table`, or a bare table with the dataset in `schema`/`database`
fn split_table<'a>(
    table: &'a str,
    schema: Option<&'a str>,
    database: Option<&'a str>,
) -> ConnectorResult<(&'a str, &'a str)> {
    if let Some((dataset, table)) = table.split_once('.') {
        return Ok((dataset, table));
    }
    schema
        .or(database)
        .filter(|d| !d.is_empty())
        .map(|dataset| (dataset, table))
        .ok_or_else(|| {
            ConnectorError::MissingParameter(format!(
                "dataset: write to 'dataset.{}' or pass a schema",
                table
            ))
        })
}

#[async_trait]
impl DataConnector for BigQueryConnector {
    fn name(&self) -> &str {
        "bigquery"
    }

    fn operations(&self) -> &'static [Operation] {
        QUERY_OPERATIONS
    }

    async fn read_as_dataframe(&self, request: &ReadRequest) -> ConnectorResult<DataFrame> {
        let ReadRequest::Query { sql, .. } = request else {
            return Err(unexpected_read(self.name(), request));
        };

        let frame = self.query(sql).await?;
        info!(
            project = %self.project_id,
            rows = frame.num_rows(),
            columns = frame.num_columns(),
            "BigQuery query returned"
        );
        Ok(frame)
    }

    async fn write_dataframe(
        &self,
        frame: &DataFrame,
        request: &WriteRequest,
    ) -> ConnectorResult<WriteSummary> {
        let WriteRequest::Table {
            table,
            database,
            schema,
            if_exists,
        } = request
        else {
            return Err(unexpected_write(self.name(), request));
        };
        if *if_exists != IfExists::Append {
            return Err(ConnectorError::invalid_request(
                "bigquery streams rows into an existing table; only if_exists=append is supported",
            ));
        }

        let (dataset, table) = split_table(table, schema.as_deref(), database.as_deref())?;
        let client = self.client().await?;
        let records = frame.to_json_records()?;

        let mut written = 0u64;
        let mut failed = 0u64;
        for chunk in records.chunks(INSERT_BATCH_SIZE) {
            let rows: Vec<TableDataInsertAllRequestRows> = chunk
                .iter()
                .map(|record| TableDataInsertAllRequestRows {
                    insert_id: Some(uuid::Uuid::new_v4().to_string()),
                    json: Value::Object(record.clone()),
                })
                .collect();

            let mut insert = TableDataInsertAllRequest::new();
            insert
                .add_rows(rows)
                .map_err(|e| ConnectorError::serialization(format!("Failed to add rows: {}", e)))?;

            let response = client
                .tabledata()
                .insert_all(&self.project_id, dataset, table, insert)
                .await
                .map_err(|e| ConnectorError::query(format!("BigQuery insert failed: {}", e)))?;

            let errors = response.insert_errors.unwrap_or_default();
            for err in errors.iter().take(5) {
                warn!(index = ?err.index, errors = ?err.errors, "BigQuery rejected row");
            }
            failed += errors.len() as u64;
            written += (chunk.len() - errors.len().min(chunk.len())) as u64;
            debug!(dataset, table, written, "Inserted batch");
        }

        let target = format!("{}.{}.{}", self.project_id, dataset, table);
        if failed > 0 {
            return Err(ConnectorError::query(format!(
                "{} of {} rows were rejected by {}",
                failed,
                records.len(),
                target
            )));
        }

        info!(table = %target, rows = written, "Wrote dataframe");
        Ok(WriteSummary::new(target, written))
    }
}

/// Factory for the `bigquery` source
pub struct BigQueryFactory;

impl ConnectorFactory for BigQueryFactory {
    fn description(&self) -> &'static str {
        "Google BigQuery data warehouse"
    }

    fn operations(&self) -> &'static [Operation] {
        QUERY_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(BigQueryConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: BigQueryConfig = parse_section(section)?;
        Ok(Box::new(BigQueryConnector::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[test]
    fn test_value_typing() {
        let s = |v: &str| Some(Value::String(v.to_string()));
        assert_eq!(bigquery_value(None, "STRING"), Value::Null);
        assert_eq!(bigquery_value(s("12"), "INTEGER"), json!(12));
        assert_eq!(bigquery_value(s("0.5"), "FLOAT"), json!(0.5));
        assert_eq!(bigquery_value(s("true"), "BOOLEAN"), json!(true));
        assert_eq!(
            bigquery_value(s("1.7104986E9"), "TIMESTAMP"),
            json!("2024-03-15T10:30:00+00:00")
        );
        assert_eq!(bigquery_value(s("abc"), "STRING"), json!("abc"));
        assert_eq!(bigquery_value(s("x"), "INTEGER"), json!("x"));
    }

    fn page(value: Value) -> QueryPage {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_waits_for_job_then_follows_page_tokens() {
        let first = page(json!({
            "jobComplete": false,
            "jobReference": {"jobId": "job_1", "location": "EU"}
        }));
        let responses = Arc::new(Mutex::new(VecDeque::from(vec![
            page(json!({
                "jobComplete": true,
                "schema": {"fields": [
                    {"name": "id", "type": "INTEGER"},
                    {"name": "name", "type": "STRING"}
                ]},
                "rows": [
                    {"f": [{"v": "1"}, {"v": "a"}]},
                    {"f": [{"v": "2"}, {"v": null}]}
                ],
                "pageToken": "page-2"
            })),
            page(json!({
                "jobComplete": true,
                "rows": [{"f": [{"v": "3"}, {"v": "c"}]}]
            })),
        ])));
        let requested = Arc::new(Mutex::new(Vec::new()));

        let frame = collect_pages(first, |token| {
            let responses = responses.clone();
            let requested = requested.clone();
            async move {
                requested.lock().push(token);
                Ok(responses.lock().pop_front().expect("no more pages"))
            }
        })
        .await
        .unwrap();

        assert_eq!(*requested.lock(), vec![None, Some("page-2".to_string())]);
        assert_eq!(frame.num_rows(), 3);
        assert_eq!(frame.column_names(), vec!["id", "name"]);

        let rows = frame.to_json_records().unwrap();
        assert_eq!(rows[0]["id"], json!(1));
        assert!(!rows[1].contains_key("name"));
        assert_eq!(rows[2]["name"], json!("c"));
    }

    #[tokio::test]
    async fn test_complete_single_page_is_not_refetched() {
        let first = page(json!({
            "jobComplete": true,
            "schema": {"fields": [{"name": "n", "type": "INT64"}]},
            "totalRows": "0"
        }));

        let frame = collect_pages(first, |_| async {
            Err::<QueryPage, _>(ConnectorError::query("unexpected fetch"))
        })
        .await
        .unwrap();
        assert!(frame.is_empty());
        assert_eq!(frame.column_names(), vec!["n"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_returned() {
        let first = page(json!({"jobComplete": false, "jobReference": {"jobId": "j"}}));

        let result = collect_pages(first, |_| async {
            Err::<QueryPage, _>(ConnectorError::query("backend down"))
        })
        .await;
        assert!(matches!(result, Err(ConnectorError::Query(ref m)) if m == "backend down"));
    }

    #[test]
    fn test_split_table() {
        assert_eq!(split_table("sales.orders", None, None).unwrap(), ("sales", "orders"));
        assert_eq!(split_table("orders", Some("sales"), None).unwrap(), ("sales", "orders"));
        assert_eq!(split_table("orders", None, Some("raw")).unwrap(), ("raw", "orders"));
        assert!(matches!(
            split_table("orders", None, None),
            Err(ConnectorError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_missing_credentials_fail_construction() {
        let section = serde_yaml::from_str(
            "GOOGLE_APPLICATION_CREDENTIALS_PATH: /nonexistent/sa.json\nPROJECT_ID: p\n",
        )
        .unwrap();
        assert!(matches!(
            BigQueryFactory.create(&section),
            Err(ConnectorError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sa.json");
        std::fs::write(&path, "{\"type\": \"service_account\"}").unwrap();

        let config = BigQueryConfig {
            credentials_path: path.to_string_lossy().into_owned(),
            project_id: "p".into(),
        };
        assert!(matches!(
            BigQueryConnector::new(config),
            Err(ConnectorError::Config(_))
        ));
    }
}
