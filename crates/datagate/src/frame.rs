//! Columnar result type returned by `read_as_dataframe`
//!
//! A [`DataFrame`] is an Arrow schema plus zero or more record batches with
//! that schema. Row-oriented backends (SQL drivers, REST APIs, document
//! stores) build frames from JSON records and let Arrow infer the column
//! types.

use crate::error::{ConnectorError, ConnectorResult};
use arrow_array::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

type JsonRecord = Map<String, Value>;

/// Rows decoded per batch when building from JSON records
const DECODE_BATCH_SIZE: usize = 1024;

/// An Arrow-backed table
#[derive(Debug, Clone)]
pub struct DataFrame {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl DataFrame {
    /// Frame with the given schema and no rows
    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            schema,
            batches: Vec::new(),
        }
    }

    /// Frame from batches whose columns match `schema`
    pub fn from_batches(schema: SchemaRef, batches: Vec<RecordBatch>) -> ConnectorResult<Self> {
        if let Some(batch) = batches
            .iter()
            .find(|b| b.schema().fields() != schema.fields())
        {
            return Err(ConnectorError::serialization(format!(
                "batch schema {:?} does not match frame schema {:?}",
                batch.schema(),
                schema
            )));
        }
        Ok(Self { schema, batches })
    }

    /// Build a frame from JSON objects, inferring the schema.
    ///
    /// Columns that are null in every record become nullable strings.
    pub fn from_json_records(records: &[JsonRecord]) -> ConnectorResult<Self> {
        if records.is_empty() {
            return Ok(Self::empty(Arc::new(Schema::empty())));
        }

        let inferred = arrow_json::reader::infer_json_schema_from_iterator(
            records.iter().map(|r| Ok::<_, arrow_schema::ArrowError>(Value::Object(r.clone()))),
        )?;
        let fields: Vec<Field> = inferred
            .fields()
            .iter()
            .map(|f| match f.data_type() {
                DataType::Null => Field::new(f.name(), DataType::Utf8, true),
                _ => (**f).clone().with_nullable(true),
            })
            .collect();
        let schema = Arc::new(Schema::new(fields));

        Self::decode(schema, records)
    }

    /// Build a frame from positional rows.
    ///
    /// A repeated column name gets a `_1`, `_2`, ... suffix, so a join that
    /// selects `a.id` and `b.id` keeps both. With no rows every column is a
    /// nullable string.
    pub fn from_rows(columns: &[String], rows: Vec<Vec<Value>>) -> ConnectorResult<Self> {
        let columns = unique_column_names(columns);
        if rows.is_empty() {
            let fields: Vec<Field> = columns
                .iter()
                .map(|c| Field::new(c, DataType::Utf8, true))
                .collect();
            return Ok(Self::empty(Arc::new(Schema::new(fields))));
        }

        let records: Vec<JsonRecord> = rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect();
        Self::from_json_records(&records)
    }

    fn decode(schema: SchemaRef, records: &[JsonRecord]) -> ConnectorResult<Self> {
        let mut decoder = arrow_json::ReaderBuilder::new(schema.clone())
            .with_batch_size(DECODE_BATCH_SIZE)
            .with_coerce_primitive(true)
            .build_decoder()?;

        let mut batches = Vec::new();
        for chunk in records.chunks(DECODE_BATCH_SIZE) {
            decoder.serialize(chunk)?;
            if let Some(batch) = decoder.flush()? {
                batches.push(batch);
            }
        }
        Ok(Self { schema, batches })
    }

    /// Rows as JSON objects; null fields are omitted
    pub fn to_json_records(&self) -> ConnectorResult<Vec<JsonRecord>> {
        if self.num_rows() == 0 {
            return Ok(Vec::new());
        }

        let mut writer = arrow_json::ArrayWriter::new(Vec::new());
        let batches: Vec<&RecordBatch> = self.batches.iter().collect();
        writer.write_batches(&batches)?;
        writer.finish()?;
        let buf = writer.into_inner();

        Ok(serde_json::from_slice(&buf)?)
    }

    /// Append `other` to this frame.
    ///
    /// Identical schemas are appended batch-wise; otherwise the union of
    /// both frames is re-inferred from their records.
    pub fn concat(self, other: DataFrame) -> ConnectorResult<Self> {
        if self.schema.fields().is_empty() && self.num_rows() == 0 {
            return Ok(other);
        }
        if other.schema.fields().is_empty() && other.num_rows() == 0 {
            return Ok(self);
        }
        if self.schema == other.schema {
            let mut batches = self.batches;
            batches.extend(other.batches);
            return Ok(Self {
                schema: self.schema,
                batches,
            });
        }

        let mut records = self.to_json_records()?;
        records.extend(other.to_json_records()?);
        Self::from_json_records(&records)
    }

    /// Concatenate any number of frames
    pub fn concat_all(frames: impl IntoIterator<Item = DataFrame>) -> ConnectorResult<Self> {
        frames
            .into_iter()
            .try_fold(Self::empty(Arc::new(Schema::empty())), |acc, f| acc.concat(f))
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema.fields().iter().map(|f| f.name().as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }
}

/// `id, id, name` becomes `id, id_1, name`
fn unique_column_names(columns: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(columns.len());
    columns
        .iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut n = 1;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}_{}", name, n);
                n += 1;
            }
            candidate
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(values: Vec<Value>) -> Vec<JsonRecord> {
        values
            .into_iter()
            .map(|v| match v {
                Value::Object(m) => m,
                _ => panic!("not an object"),
            })
            .collect()
    }

    #[test]
    fn test_from_json_records_infers_types() {
        let df = DataFrame::from_json_records(&records(vec![
            json!({"id": 1, "name": "alice", "score": 1.5, "active": true}),
            json!({"id": 2, "name": "bob", "score": 2, "active": false}),
        ]))
        .unwrap();

        assert_eq!(df.num_rows(), 2);
        assert_eq!(df.column_names(), vec!["id", "name", "score", "active"]);
        let schema = df.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
        assert_eq!(schema.field(3).data_type(), &DataType::Boolean);
    }

    #[test]
    fn test_all_null_column_becomes_string() {
        let df = DataFrame::from_json_records(&records(vec![
            json!({"id": 1, "note": null}),
            json!({"id": 2, "note": null}),
        ]))
        .unwrap();
        assert_eq!(df.schema().field(1).data_type(), &DataType::Utf8);
    }

    #[test]
    fn test_from_rows_without_rows_keeps_columns() {
        let df = DataFrame::from_rows(&["a".to_string(), "b".to_string()], vec![]).unwrap();
        assert_eq!(df.num_rows(), 0);
        assert_eq!(df.column_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_from_rows_keeps_repeated_column_names() {
        let columns: Vec<String> = ["id", "id", "name", "id_1"].iter().map(|c| c.to_string()).collect();
        let df = DataFrame::from_rows(
            &columns,
            vec![vec![json!(1), json!(2), json!("x"), json!(3)]],
        )
        .unwrap();

        assert_eq!(df.num_columns(), 4);
        assert_eq!(df.column_names(), vec!["id", "id_1", "name", "id_1_1"]);
        let row = &df.to_json_records().unwrap()[0];
        assert_eq!(row["id"], json!(1));
        assert_eq!(row["id_1"], json!(2));
        assert_eq!(row["id_1_1"], json!(3));

        let empty = DataFrame::from_rows(&columns[..2], vec![]).unwrap();
        assert_eq!(empty.column_names(), vec!["id", "id_1"]);
    }

    #[test]
    fn test_json_records_round_trip_skips_nulls() {
        let df = DataFrame::from_rows(
            &["id".to_string(), "city".to_string()],
            vec![vec![json!(1), json!("Oslo")], vec![json!(2), Value::Null]],
        )
        .unwrap();

        let out = df.to_json_records().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["city"], json!("Oslo"));
        assert!(!out[1].contains_key("city"));
    }

    #[test]
    fn test_concat_same_schema_appends_batches() {
        let a = DataFrame::from_json_records(&records(vec![json!({"x": 1})])).unwrap();
        let b = DataFrame::from_json_records(&records(vec![json!({"x": 2}), json!({"x": 3})])).unwrap();

        let merged = a.concat(b).unwrap();
        assert_eq!(merged.num_rows(), 3);
        assert_eq!(merged.batches().len(), 2);
    }

    #[test]
    fn test_concat_different_schema_unifies() {
        let a = DataFrame::from_json_records(&records(vec![json!({"x": 1})])).unwrap();
        let b = DataFrame::from_json_records(&records(vec![json!({"x": 2, "y": "b"})])).unwrap();

        let merged = DataFrame::concat_all([a, b]).unwrap();
        assert_eq!(merged.num_rows(), 2);
        assert_eq!(merged.column_names(), vec!["x", "y"]);
    }

    #[test]
    fn test_many_rows_decode_in_batches() {
        let rows: Vec<JsonRecord> = (0..2500)
            .map(|i| records(vec![json!({"n": i})]).remove(0))
            .collect();
        let df = DataFrame::from_json_records(&rows).unwrap();
        assert_eq!(df.num_rows(), 2500);
        assert_eq!(df.batches().len(), 3);
    }
}
