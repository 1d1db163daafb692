//! Snowflake over the SQL API v2
//!
//! Statements are posted to `https://<account>.snowflakecomputing.com/api/v2/statements`
//! with key-pair JWT authentication:
//!
//! - `iss`: `<ACCOUNT>.<USER>.SHA256:<public_key_fingerprint>`
//! - `sub`: `<ACCOUNT>.<USER>`
//!
//! The fingerprint is the base64 SHA-256 of the DER-encoded public key. A
//! statement that has not finished within the request returns `202` and is
//! polled by handle; large results are split into partitions that are fetched
//! one by one. Every value arrives as a string and is typed from `rowType`.
//!
//! The API is stateless, so database, schema, warehouse and role travel with
//! every statement instead of being set on a session.

use crate::connector::{DataConnector, Operation, QUERY_OPERATIONS};
use crate::connectors::sql::dialect::{SnowflakeDialect, SqlDialect};
use crate::connectors::sql::{QueryResult, SqlConnector, SqlDriver, SqlSession};
use crate::error::{ConnectorError, ConnectorResult};
use crate::registry::{parse_section, ConnectorFactory};
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use reqwest::StatusCode;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;
use validator::Validate;

const JWT_LIFETIME_SECS: u64 = 3600;
const JWT_REFRESH_BUFFER: Duration = Duration::from_secs(300);
const STATEMENT_TIMEOUT_SECS: u64 = 600;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// `datawarehouses.snowflake`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct SnowflakeConfig {
    /// Account identifier, e.g. `xy12345.us-east-1`
    #[serde(rename = "ACCOUNT")]
    #[validate(length(min = 1))]
    pub account: String,

    #[serde(rename = "USERNAME")]
    #[validate(length(min = 1))]
    pub username: String,

    /// Unencrypted PKCS#8 (or PKCS#1) PEM private key
    #[serde(rename = "PRIVATE_KEY_PATH")]
    #[validate(length(min = 1))]
    pub private_key_path: String,

    #[serde(rename = "WAREHOUSE", default)]
    pub warehouse: Option<String>,

    #[serde(rename = "DATABASE", default)]
    pub database: Option<String>,

    #[serde(rename = "SCHEMA", default)]
    pub schema: Option<String>,

    #[serde(rename = "ROLE", default)]
    pub role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    iss: String,
    sub: String,
    iat: u64,
    exp: u64,
}

/// Key-pair JWT, regenerated shortly before it expires
struct KeyPairAuth {
    token: String,
    expires_at: SystemTime,
    encoding_key: EncodingKey,
    issuer: String,
    subject: String,
}

impl KeyPairAuth {
    fn new(account: &str, user: &str, private_key_pem: &str) -> ConnectorResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
            .map_err(|e| ConnectorError::config(format!("Failed to parse private key: {}", e)))?;

        let public_key_der =
            rsa::pkcs8::EncodePublicKey::to_public_key_der(&private_key.to_public_key())
                .map_err(|e| {
                    ConnectorError::config(format!("Failed to encode public key: {}", e))
                })?;

        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(public_key_der.as_bytes());
        let fingerprint = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            hasher.finalize(),
        );

        let (issuer, subject) = jwt_identity(account, user, &fingerprint);

        let private_key_der = rsa::pkcs8::EncodePrivateKey::to_pkcs8_der(&private_key)
            .map_err(|e| ConnectorError::config(format!("Failed to encode private key: {}", e)))?;
        let encoding_key = EncodingKey::from_rsa_der(private_key_der.as_bytes());

        let mut auth = Self {
            token: String::new(),
            expires_at: UNIX_EPOCH,
            encoding_key,
            issuer,
            subject,
        };
        auth.refresh()?;
        Ok(auth)
    }

    fn needs_refresh(&self) -> bool {
        match SystemTime::now().checked_add(JWT_REFRESH_BUFFER) {
            Some(check_time) => check_time >= self.expires_at,
            None => true,
        }
    }

    fn refresh(&mut self) -> ConnectorResult<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ConnectorError::auth(format!("System time error: {}", e)))?;
        let iat = now.as_secs();
        let exp = iat + JWT_LIFETIME_SECS;

        let claims = JwtClaims {
            iss: self.issuer.clone(),
            sub: self.subject.clone(),
            iat,
            exp,
        };
        self.token = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| ConnectorError::auth(format!("Failed to generate JWT: {}", e)))?;
        self.expires_at = UNIX_EPOCH + Duration::from_secs(exp);

        debug!("Generated Snowflake JWT, expires at {:?}", self.expires_at);
        Ok(())
    }

    fn token(&mut self) -> ConnectorResult<String> {
        if self.needs_refresh() {
            self.refresh()?;
        }
        Ok(self.token.clone())
    }
}

/// Issuer and subject claims. The account locator drops any region suffix.
fn jwt_identity(account: &str, user: &str, fingerprint: &str) -> (String, String) {
    let account = account
        .split('.')
        .next()
        .unwrap_or(account)
        .to_uppercase();
    let user = user.to_uppercase();
    (
        format!("{}.{}.SHA256:{}", account, user, fingerprint),
        format!("{}.{}", account, user),
    )
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
    #[serde(default)]
    stats: Option<StatementStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    scale: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementStats {
    #[serde(default)]
    num_rows_inserted: u64,
    #[serde(default)]
    num_rows_updated: u64,
    #[serde(default)]
    num_rows_deleted: u64,
}

impl StatementStats {
    fn affected(&self) -> u64 {
        self.num_rows_inserted + self.num_rows_updated + self.num_rows_deleted
    }
}

fn float_value(text: &str) -> Option<Value> {
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

/// `seconds.fraction` epoch text as a naive timestamp
fn epoch_timestamp(text: &str) -> Option<chrono::NaiveDateTime> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, "0"));
    let secs: i64 = secs.parse().ok()?;
    let nanos: u32 = format!("{:0<9}", frac).get(..9)?.parse().ok()?;
    chrono::DateTime::from_timestamp(secs, nanos).map(|t| t.naive_utc())
}

/// Type one result cell from its column metadata
fn snowflake_value(raw: Option<String>, column: &RowType) -> Value {
    let Some(text) = raw else {
        return Value::Null;
    };

    let typed = match column.kind.to_ascii_lowercase().as_str() {
        "fixed" if column.scale.unwrap_or(0) == 0 => {
            text.parse::<i64>().ok().map(Value::from)
        }
        "fixed" | "real" => float_value(&text),
        "boolean" => match text.as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        "date" => text.parse::<i64>().ok().and_then(|days| {
            chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days)))
                .map(|d| Value::String(d.to_string()))
        }),
        "timestamp_ntz" | "timestamp_ltz" | "timestamp_tz" => {
            let epoch = text.split_whitespace().next().unwrap_or(&text);
            epoch_timestamp(epoch)
                .map(|t| Value::String(t.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
        }
        "variant" | "object" | "array" => serde_json::from_str(&text).ok(),
        _ => None,
    };
    typed.unwrap_or(Value::String(text))
}

/// Connection settings shared by every session
struct SnowflakeApi {
    client: reqwest::Client,
    base_url: String,
    auth: Mutex<KeyPairAuth>,
    warehouse: Option<String>,
    role: Option<String>,
}

impl SnowflakeApi {
    fn statements_url(&self) -> String {
        format!("{}/api/v2/statements", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> ConnectorResult<reqwest::RequestBuilder> {
        let token = self.auth.lock().token()?;
        Ok(request
            .bearer_auth(token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .header("Accept", "application/json"))
    }

    async fn parse_response(response: reqwest::Response) -> ConnectorResult<(StatusCode, StatementResponse)> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::auth(format!(
                "Snowflake rejected credentials ({}): {}",
                status, body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StatementResponse>(&body)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or(body);
            return Err(ConnectorError::query(format!(
                "Snowflake API error ({}): {}",
                status, message
            )));
        }

        let body: StatementResponse = response.json().await.map_err(|e| {
            ConnectorError::serialization(format!("Failed to parse Snowflake response: {}", e))
        })?;
        Ok((status, body))
    }

    async fn run(
        &self,
        sql: &str,
        database: &str,
        schema: Option<&str>,
    ) -> ConnectorResult<(StatementResponse, Vec<Vec<Option<String>>>)> {
        let body = StatementRequest {
            statement: sql,
            timeout: STATEMENT_TIMEOUT_SECS,
            database: Some(database),
            schema,
            warehouse: self.warehouse.as_deref(),
            role: self.role.as_deref(),
        };

        let request = self
            .client
            .post(self.statements_url())
            .query(&[("requestId", uuid::Uuid::new_v4().to_string())])
            .json(&body);
        let response = self
            .authorized(request)?
            .send()
            .await
            .map_err(|e| ConnectorError::connection(format!("Snowflake request failed: {}", e)))?;
        let (mut status, mut result) = Self::parse_response(response).await?;

        let started = Instant::now();
        while status == StatusCode::ACCEPTED {
            let handle = result.statement_handle.clone().ok_or_else(|| {
                ConnectorError::query("Snowflake accepted the statement without a handle")
            })?;
            if started.elapsed() > Duration::from_secs(STATEMENT_TIMEOUT_SECS) {
                return Err(ConnectorError::query(format!(
                    "statement {} did not finish within {}s",
                    handle, STATEMENT_TIMEOUT_SECS
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            debug!(handle = %handle, "Polling Snowflake statement");

            let request = self.client.get(format!("{}/{}", self.statements_url(), handle));
            let response = self
                .authorized(request)?
                .send()
                .await
                .map_err(|e| ConnectorError::connection(format!("Snowflake poll failed: {}", e)))?;
            (status, result) = Self::parse_response(response).await?;
        }

        let mut rows = std::mem::take(&mut result.data);
        let partitions = result
            .result_set_meta_data
            .as_ref()
            .map(|m| m.partition_info.len())
            .unwrap_or(0);
        if partitions > 1 {
            let handle = result.statement_handle.clone().ok_or_else(|| {
                ConnectorError::query("partitioned Snowflake result without a handle")
            })?;
            for partition in 1..partitions {
                let request = self
                    .client
                    .get(format!("{}/{}", self.statements_url(), handle))
                    .query(&[("partition", partition)]);
                let response = self.authorized(request)?.send().await.map_err(|e| {
                    ConnectorError::connection(format!("Snowflake partition fetch failed: {}", e))
                })?;
                let (_, page) = Self::parse_response(response).await?;
                debug!(handle = %handle, partition, rows = page.data.len(), "Fetched partition");
                rows.extend(page.data);
            }
        }

        Ok((result, rows))
    }
}

struct SnowflakeSession {
    api: Arc<SnowflakeApi>,
    database: String,
    schema: Option<String>,
}

#[async_trait]
impl SqlSession for SnowflakeSession {
    async fn query(&mut self, sql: &str) -> ConnectorResult<QueryResult> {
        let (result, rows) = self.api.run(sql, &self.database, self.schema.as_deref()).await?;
        let row_type = result
            .result_set_meta_data
            .map(|m| m.row_type)
            .unwrap_or_default();

        let rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(row_type.iter())
                    .map(|(cell, column)| snowflake_value(cell, column))
                    .collect()
            })
            .collect();

        Ok(QueryResult {
            columns: row_type.into_iter().map(|c| c.name).collect(),
            rows,
        })
    }

    async fn execute(&mut self, sql: &str) -> ConnectorResult<u64> {
        let (result, _) = self.api.run(sql, &self.database, self.schema.as_deref()).await?;
        Ok(result.stats.map(|s| s.affected()).unwrap_or(0))
    }

    async fn set_schema(&mut self, _dialect: &dyn SqlDialect, schema: &str) -> ConnectorResult<()> {
        self.schema = Some(schema.to_string());
        Ok(())
    }
}

/// Driver for a Snowflake account
pub struct SnowflakeDriver {
    api: Arc<SnowflakeApi>,
    database: Option<String>,
    schema: Option<String>,
}

impl SnowflakeDriver {
    pub fn new(config: SnowflakeConfig) -> ConnectorResult<Self> {
        let pem = std::fs::read_to_string(&config.private_key_path).map_err(|e| {
            ConnectorError::config(format!(
                "Failed to read private key '{}': {}",
                config.private_key_path, e
            ))
        })?;
        let auth = KeyPairAuth::new(&config.account, &config.username, &pem)?;

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ConnectorError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api: Arc::new(SnowflakeApi {
                client,
                base_url: format!(
                    "https://{}.snowflakecomputing.com",
                    config.account.to_lowercase()
                ),
                auth: Mutex::new(auth),
                warehouse: config.warehouse,
                role: config.role,
            }),
            database: config.database,
            schema: config.schema,
        })
    }
}

#[async_trait]
impl SqlDriver for SnowflakeDriver {
    fn dialect(&self) -> &dyn SqlDialect {
        &SnowflakeDialect
    }

    fn default_database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    async fn open(&self, database: &str) -> ConnectorResult<Box<dyn SqlSession>> {
        Ok(Box::new(SnowflakeSession {
            api: self.api.clone(),
            database: database.to_string(),
            schema: self.schema.clone(),
        }))
    }
}

/// Factory for the `snowflake` source
pub struct SnowflakeFactory;

impl ConnectorFactory for SnowflakeFactory {
    fn description(&self) -> &'static str {
        "Snowflake data warehouse (SQL API, key-pair auth)"
    }

    fn operations(&self) -> &'static [Operation] {
        QUERY_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(SnowflakeConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: SnowflakeConfig = parse_section(section)?;
        Ok(Box::new(SqlConnector::new(
            "snowflake",
            Box::new(SnowflakeDriver::new(config)?),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(kind: &str, scale: Option<i64>) -> RowType {
        RowType {
            name: "c".into(),
            kind: kind.into(),
            scale,
        }
    }

    #[test]
    fn test_jwt_identity() {
        let (iss, sub) = jwt_identity("xy12345.us-east-1", "loader", "abc=");
        assert_eq!(iss, "XY12345.LOADER.SHA256:abc=");
        assert_eq!(sub, "XY12345.LOADER");
    }

    #[test]
    fn test_value_typing() {
        let s = |v: &str| Some(v.to_string());
        assert_eq!(snowflake_value(None, &column("text", None)), Value::Null);
        assert_eq!(snowflake_value(s("42"), &column("fixed", Some(0))), json!(42));
        assert_eq!(snowflake_value(s("4.25"), &column("fixed", Some(2))), json!(4.25));
        assert_eq!(snowflake_value(s("1.5"), &column("real", None)), json!(1.5));
        assert_eq!(snowflake_value(s("true"), &column("boolean", None)), json!(true));
        assert_eq!(snowflake_value(s("19797"), &column("date", None)), json!("2024-03-15"));
        assert_eq!(
            snowflake_value(s("1710498600.500000000"), &column("timestamp_ntz", None)),
            json!("2024-03-15 10:30:00.500")
        );
        assert_eq!(
            snowflake_value(s("{\"a\":1}"), &column("variant", None)),
            json!({"a": 1})
        );
        assert_eq!(snowflake_value(s("hi"), &column("text", None)), json!("hi"));
    }

    #[test]
    fn test_statement_request_omits_unset_fields() {
        let body = serde_json::to_value(StatementRequest {
            statement: "SELECT 1",
            timeout: 60,
            database: Some("DB"),
            schema: None,
            warehouse: Some("WH"),
            role: None,
        })
        .unwrap();
        assert_eq!(
            body,
            json!({"statement": "SELECT 1", "timeout": 60, "database": "DB", "warehouse": "WH"})
        );
    }

    #[test]
    fn test_response_parsing() {
        let response: StatementResponse = serde_json::from_value(json!({
            "statementHandle": "01a2",
            "resultSetMetaData": {
                "numRows": 2,
                "rowType": [{"name": "ID", "type": "fixed", "scale": 0}],
                "partitionInfo": [{"rowCount": 1}, {"rowCount": 1}]
            },
            "data": [["1"], [null]],
            "stats": {"numRowsInserted": 3}
        }))
        .unwrap();

        let meta = response.result_set_meta_data.as_ref().unwrap();
        assert_eq!(meta.partition_info.len(), 2);
        assert_eq!(meta.row_type[0].name, "ID");
        assert_eq!(response.data[1], vec![None]);
        assert_eq!(response.stats.unwrap().affected(), 3);
    }

    #[test]
    fn test_invalid_private_key() {
        assert!(matches!(
            KeyPairAuth::new("acct", "user", "not a key"),
            Err(ConnectorError::Config(_))
        ));
    }

    #[test]
    fn test_missing_key_file_fails_construction() {
        let section = serde_yaml::from_str(
            "ACCOUNT: acct\nUSERNAME: u\nPRIVATE_KEY_PATH: /nonexistent/key.p8\n",
        )
        .unwrap();
        assert!(matches!(
            SnowflakeFactory.create(&section),
            Err(ConnectorError::Config(_))
        ));
    }
}
