//! MongoDB over the official driver

use crate::connector::{
    unexpected_read, unexpected_write, DataConnector, Operation, ReadRequest, WriteRequest,
    WriteSummary, DATAFRAME_OPERATIONS,
};
use crate::error::{ConnectorError, ConnectorResult};
use crate::frame::DataFrame;
use crate::registry::{parse_section, ConnectorFactory};
use crate::types::SensitiveString;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document};
use mongodb::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::info;
use validator::{Validate, ValidationError};

/// `nosql.mongodb`
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct MongoConfig {
    /// `mongodb://` or `mongodb+srv://` connection string
    #[serde(rename = "CONN_STRING")]
    #[validate(custom(function = "validate_conn_string"))]
    pub conn_string: SensitiveString,
}

fn validate_conn_string(value: &SensitiveString) -> Result<(), ValidationError> {
    let uri = value.expose_secret();
    if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
        Ok(())
    } else {
        Err(ValidationError::new("mongodb_scheme")
            .with_message("CONN_STRING must start with mongodb:// or mongodb+srv://".into()))
    }
}

/// Convert BSON to JSON. Object ids become hex strings and dates RFC 3339.
fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::from(i),
        Bson::Int64(i) => Value::from(i),
        Bson::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or_else(|_| Value::from(dt.timestamp_millis())),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(document_to_record(doc)),
        other => other.into_relaxed_extjson(),
    }
}

fn document_to_record(doc: Document) -> Map<String, Value> {
    doc.into_iter().map(|(k, v)| (k, bson_to_json(v))).collect()
}

/// Filter document from an optional JSON object
fn filter_document(filter: Option<&Value>) -> ConnectorResult<Document> {
    match filter {
        None | Some(Value::Null) => Ok(Document::new()),
        Some(value @ Value::Object(_)) => mongodb::bson::to_document(value)
            .map_err(|e| ConnectorError::invalid_request(format!("invalid filter: {}", e))),
        Some(other) => Err(ConnectorError::invalid_request(format!(
            "filter must be a JSON object, got {}",
            other
        ))),
    }
}

/// MongoDB connector; the client is created on first use
pub struct MongoConnector {
    conn_string: SensitiveString,
    client: OnceCell<Client>,
}

impl MongoConnector {
    pub fn new(config: MongoConfig) -> Self {
        Self {
            conn_string: config.conn_string,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> ConnectorResult<&Client> {
        self.client
            .get_or_try_init(|| async {
                Client::with_uri_str(self.conn_string.expose_secret())
                    .await
                    .map_err(|e| {
                        ConnectorError::connection(format!("Failed to connect to MongoDB: {}", e))
                    })
            })
            .await
    }

    async fn collection(
        &self,
        database: &str,
        collection: &str,
    ) -> ConnectorResult<mongodb::Collection<Document>> {
        if database.is_empty() || collection.is_empty() {
            return Err(ConnectorError::invalid_request(
                "database and collection must not be empty",
            ));
        }
        Ok(self
            .client()
            .await?
            .database(database)
            .collection::<Document>(collection))
    }
}

#[async_trait]
impl DataConnector for MongoConnector {
    fn name(&self) -> &str {
        "mongodb"
    }

    fn operations(&self) -> &'static [Operation] {
        DATAFRAME_OPERATIONS
    }

    async fn read_as_dataframe(&self, request: &ReadRequest) -> ConnectorResult<DataFrame> {
        let ReadRequest::Collection {
            database,
            collection,
            filter,
        } = request
        else {
            return Err(unexpected_read(self.name(), request));
        };

        let filter = filter_document(filter.as_ref())?;
        let coll = self.collection(database, collection).await?;
        let documents: Vec<Document> = coll
            .find(filter)
            .await
            .map_err(ConnectorError::query)?
            .try_collect()
            .await
            .map_err(ConnectorError::query)?;

        let records: Vec<Map<String, Value>> =
            documents.into_iter().map(document_to_record).collect();
        info!(database = %database, collection = %collection, documents = records.len(), "Find returned");
        DataFrame::from_json_records(&records)
    }

    async fn write_dataframe(
        &self,
        frame: &DataFrame,
        request: &WriteRequest,
    ) -> ConnectorResult<WriteSummary> {
        let WriteRequest::Collection {
            database,
            collection,
        } = request
        else {
            return Err(unexpected_write(self.name(), request));
        };

        let target = format!("{}.{}", database, collection);
        let documents = frame
            .to_json_records()?
            .into_iter()
            .map(|record| {
                mongodb::bson::to_document(&record).map_err(ConnectorError::serialization)
            })
            .collect::<ConnectorResult<Vec<Document>>>()?;
        if documents.is_empty() {
            return Ok(WriteSummary::new(target, 0));
        }

        let coll = self.collection(database, collection).await?;
        let result = coll
            .insert_many(documents)
            .await
            .map_err(ConnectorError::query)?;
        let written = result.inserted_ids.len() as u64;

        info!(collection = %target, documents = written, "Wrote dataframe");
        Ok(WriteSummary::new(target, written))
    }
}

/// Factory for the `mongodb` source
pub struct MongoFactory;

impl ConnectorFactory for MongoFactory {
    fn description(&self) -> &'static str {
        "MongoDB document database"
    }

    fn operations(&self) -> &'static [Operation] {
        DATAFRAME_OPERATIONS
    }

    fn config_schema(&self) -> schemars::schema::RootSchema {
        schemars::schema_for!(MongoConfig)
    }

    fn create(&self, section: &serde_yaml::Value) -> ConnectorResult<Box<dyn DataConnector>> {
        let config: MongoConfig = parse_section(section)?;
        Ok(Box::new(MongoConnector::new(config)))
    }
}
