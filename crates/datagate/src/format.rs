//! File formats for dataframe reads and writes
//!
//! Formats are **how** a frame is serialized; connectors decide **where** the
//! bytes go.
//!
//! | Format  | Extensions                  | Reader                | Writer          |
//! |---------|-----------------------------|-----------------------|-----------------|
//! | CSV     | `.csv`, `.txt`              | arrow-csv (inferred)  | arrow-csv       |
//! | JSON    | `.json`                     | array of objects      | arrow-json      |
//! | JSONL   | `.jsonl`, `.ndjson`         | one object per line   | arrow-json      |
//! | Parquet | `.parquet`, `.pq`           | parquet arrow reader  | ArrowWriter     |
//! | Feather | `.feather`, `.arrow`, `.ipc`| Arrow IPC file        | Arrow IPC file  |
//! | Excel   | `.xlsx`, `.xlsm`            | calamine, first sheet | rust_xlsxwriter |
//! | XLS     | `.xls`                      | calamine, first sheet | -               |
//! | ODS     | `.ods`                      | calamine, first sheet | -               |
//!
//! Any other extension fails with `UnsupportedExtension`. Spreadsheets take
//! their column names from the first row.

use crate::error::{ConnectorError, ConnectorResult};
use crate::frame::DataFrame;
use arrow_array::RecordBatch;
use bytes::Bytes;
use calamine::{Data, Reader};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, Cursor};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Rows sampled when inferring a CSV schema
const CSV_INFER_RECORDS: usize = 1000;

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Csv,
    Json,
    Jsonl,
    Parquet,
    Feather,
    Excel,
    Xls,
    Ods,
}

impl FileFormat {
    /// Format for a file extension (without the dot, any case)
    pub fn from_extension(ext: &str) -> ConnectorResult<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "txt" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            "parquet" | "pq" => Ok(Self::Parquet),
            "feather" | "arrow" | "ipc" => Ok(Self::Feather),
            "xlsx" | "xlsm" => Ok(Self::Excel),
            "xls" => Ok(Self::Xls),
            "ods" => Ok(Self::Ods),
            other => Err(ConnectorError::UnsupportedExtension(other.to_string())),
        }
    }

    /// Format named by a path's extension
    pub fn from_path(path: &Path) -> ConnectorResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| {
                ConnectorError::UnsupportedExtension(format!(
                    "no extension on '{}'",
                    path.display()
                ))
            })?;
        Self::from_extension(ext)
    }

    /// Pick the format for an object key.
    ///
    /// The key's own extension wins over `requested`; with neither, CSV.
    pub fn resolve(key: &str, requested: Option<FileFormat>) -> ConnectorResult<Self> {
        let ext = Path::new(key.trim_end_matches('/'))
            .extension()
            .and_then(|e| e.to_str());
        match ext {
            Some(ext) => Self::from_extension(ext),
            None => Ok(requested.unwrap_or_default()),
        }
    }

    /// Canonical extension
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Parquet => "parquet",
            Self::Feather => "feather",
            Self::Excel => "xlsx",
            Self::Xls => "xls",
            Self::Ods => "ods",
        }
    }
}

impl std::str::FromStr for FileFormat {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s.trim_start_matches('.'))
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Decode a frame from bytes
pub fn read_frame(format: FileFormat, data: Bytes) -> ConnectorResult<DataFrame> {
    match format {
        FileFormat::Csv => read_csv(data),
        FileFormat::Json => {
            let records: Vec<serde_json::Map<String, serde_json::Value>> =
                serde_json::from_slice(&data)?;
            DataFrame::from_json_records(&records)
        }
        FileFormat::Jsonl => {
            let mut records = Vec::new();
            for line in Cursor::new(&data[..]).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                records.push(serde_json::from_str(&line)?);
            }
            DataFrame::from_json_records(&records)
        }
        FileFormat::Parquet => {
            let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
            let schema = builder.schema().clone();
            let batches = builder.build()?.collect::<Result<Vec<_>, _>>()?;
            DataFrame::from_batches(schema, batches)
        }
        FileFormat::Feather => {
            let reader = arrow_ipc::reader::FileReader::try_new(Cursor::new(data), None)?;
            let schema = reader.schema();
            let batches = reader.collect::<Result<Vec<_>, _>>()?;
            DataFrame::from_batches(schema, batches)
        }
        FileFormat::Excel | FileFormat::Xls | FileFormat::Ods => read_spreadsheet(data),
    }
}

fn spreadsheet_err(e: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::serialization(format!("Spreadsheet error: {}", e))
}

/// Whole floats come back as integers, the way spreadsheets display them
fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::Int(i) => Value::from(*i),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Value::from(*f as i64),
        Data::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Data::String(s) => Value::String(s.clone()),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => Value::String(dt.to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
    }
}

/// First sheet of an xlsx/xls/ods workbook; the first row holds the headers
fn read_spreadsheet(data: Bytes) -> ConnectorResult<DataFrame> {
    let mut workbook =
        calamine::open_workbook_auto_from_rs(Cursor::new(data.to_vec())).map_err(spreadsheet_err)?;
    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        return Ok(DataFrame::empty(Arc::new(arrow_schema::Schema::empty())));
    };
    let range = workbook.worksheet_range(&sheet).map_err(spreadsheet_err)?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(DataFrame::empty(Arc::new(arrow_schema::Schema::empty())));
    };
    let columns: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, cell)| match cell {
            Data::Empty => format!("column_{}", i),
            other => other.to_string(),
        })
        .collect();

    let values: Vec<Vec<Value>> = rows
        .filter(|row| row.iter().any(|c| !matches!(c, Data::Empty)))
        .map(|row| row.iter().map(cell_to_value).collect())
        .collect();

    debug!(sheet = %sheet, rows = values.len(), "Read spreadsheet");
    DataFrame::from_rows(&columns, values)
}

/// One sheet, header row first; null cells stay blank
fn write_xlsx(frame: &DataFrame) -> ConnectorResult<Vec<u8>> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let worksheet = workbook.add_worksheet();

    let columns = frame.column_names();
    for (col, name) in columns.iter().enumerate() {
        worksheet
            .write_string(0, col as u16, *name)
            .map_err(spreadsheet_err)?;
    }

    for (idx, record) in frame.to_json_records()?.iter().enumerate() {
        let row = idx as u32 + 1;
        for (col, name) in columns.iter().enumerate() {
            let col = col as u16;
            match record.get(*name) {
                None | Some(Value::Null) => continue,
                Some(Value::Bool(b)) => worksheet.write_boolean(row, col, *b),
                Some(Value::Number(n)) => {
                    worksheet.write_number(row, col, n.as_f64().unwrap_or_default())
                }
                Some(Value::String(s)) => worksheet.write_string(row, col, s.as_str()),
                Some(other) => worksheet.write_string(row, col, other.to_string()),
            }
            .map_err(spreadsheet_err)?;
        }
    }

    workbook.save_to_buffer().map_err(spreadsheet_err)
}

fn read_csv(data: Bytes) -> ConnectorResult<DataFrame> {
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(DataFrame::empty(Arc::new(arrow_schema::Schema::empty())));
    }

    let (schema, _) = arrow_csv::reader::Format::default()
        .with_header(true)
        .infer_schema(Cursor::new(&data[..]), Some(CSV_INFER_RECORDS))?;
    let schema = Arc::new(schema);

    let reader = arrow_csv::ReaderBuilder::new(schema.clone())
        .with_header(true)
        .build(Cursor::new(data))?;
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    DataFrame::from_batches(schema, batches)
}

/// Encode a frame to bytes
pub fn write_frame(format: FileFormat, frame: &DataFrame) -> ConnectorResult<Vec<u8>> {
    let mut buf = Vec::new();
    let batches: Vec<&RecordBatch> = frame.batches().iter().collect();

    match format {
        FileFormat::Csv => {
            if batches.is_empty() {
                if !frame.column_names().is_empty() {
                    buf.extend_from_slice(frame.column_names().join(",").as_bytes());
                    buf.push(b'\n');
                }
            } else {
                let mut writer = arrow_csv::WriterBuilder::new()
                    .with_header(true)
                    .build(&mut buf);
                for batch in &batches {
                    writer.write(batch)?;
                }
            }
        }
        FileFormat::Json => {
            if batches.is_empty() {
                buf.extend_from_slice(b"[]");
            } else {
                let mut writer = arrow_json::ArrayWriter::new(&mut buf);
                writer.write_batches(&batches)?;
                writer.finish()?;
            }
        }
        FileFormat::Jsonl => {
            let mut writer = arrow_json::LineDelimitedWriter::new(&mut buf);
            writer.write_batches(&batches)?;
            writer.finish()?;
        }
        FileFormat::Parquet => {
            let props = WriterProperties::builder()
                .set_compression(Compression::SNAPPY)
                .build();
            let mut writer = ArrowWriter::try_new(&mut buf, frame.schema().clone(), Some(props))?;
            for batch in &batches {
                writer.write(batch)?;
            }
            writer.close()?;
        }
        FileFormat::Feather => {
            let mut writer = arrow_ipc::writer::FileWriter::try_new(&mut buf, frame.schema())?;
            for batch in &batches {
                writer.write(batch)?;
            }
            writer.finish()?;
        }
        FileFormat::Excel => buf = write_xlsx(frame)?,
        FileFormat::Xls | FileFormat::Ods => {
            return Err(ConnectorError::invalid_request(format!(
                ".{} files can be read but not written; write .xlsx instead",
                format
            )));
        }
    }

    debug!(format = %format, rows = frame.num_rows(), bytes = buf.len(), "Encoded frame");
    Ok(buf)
}

/// Read a local file, format chosen by its extension
pub async fn read_local(path: &Path) -> ConnectorResult<DataFrame> {
    let format = FileFormat::from_path(path)?;
    let data = tokio::fs::read(path).await?;
    read_frame(format, Bytes::from(data))
}

/// Write a frame to a local file, creating parent directories
pub async fn write_local(frame: &DataFrame, path: &Path, format: FileFormat) -> ConnectorResult<()> {
    let data = write_frame(format, frame)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::DataType;
    use serde_json::json;

    fn sample() -> DataFrame {
        let records: Vec<serde_json::Map<String, serde_json::Value>> = vec![
            json!({"id": 1, "city": "Oslo", "temp": 3.5}),
            json!({"id": 2, "city": "Lima", "temp": 19.0}),
            json!({"id": 3, "city": "Pune", "temp": 27.25}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
        DataFrame::from_json_records(&records).unwrap()
    }

    #[test]
    fn test_extension_mapping() {
        assert_eq!(FileFormat::from_extension("CSV").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::from_extension("txt").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::from_extension("ndjson").unwrap(), FileFormat::Jsonl);
        assert_eq!(FileFormat::from_extension("arrow").unwrap(), FileFormat::Feather);
        assert_eq!(FileFormat::from_extension("XLSX").unwrap(), FileFormat::Excel);
        assert_eq!(FileFormat::from_extension("ods").unwrap(), FileFormat::Ods);
        assert!(matches!(
            FileFormat::from_extension("avro"),
            Err(ConnectorError::UnsupportedExtension(ref e)) if e == "avro"
        ));
    }

    #[test]
    fn test_resolve_prefers_key_extension() {
        assert_eq!(
            FileFormat::resolve("raw/data.parquet", Some(FileFormat::Json)).unwrap(),
            FileFormat::Parquet
        );
        assert_eq!(
            FileFormat::resolve("raw/data", Some(FileFormat::Json)).unwrap(),
            FileFormat::Json
        );
        assert_eq!(FileFormat::resolve("raw/data", None).unwrap(), FileFormat::Csv);
        assert!(FileFormat::resolve("raw/data.avro", None).is_err());
    }

    #[test]
    fn test_csv_infers_numeric_columns() {
        let df = read_frame(FileFormat::Csv, Bytes::from_static(b"id,name,score\n1,a,0.5\n2,b,1.5\n"))
            .unwrap();
        assert_eq!(df.num_rows(), 2);
        assert_eq!(df.schema().field(0).data_type(), &DataType::Int64);
        assert_eq!(df.schema().field(2).data_type(), &DataType::Float64);
    }

    #[test]
    fn test_every_format_preserves_rows() {
        let df = sample();
        for format in [
            FileFormat::Csv,
            FileFormat::Json,
            FileFormat::Jsonl,
            FileFormat::Parquet,
            FileFormat::Feather,
            FileFormat::Excel,
        ] {
            let bytes = write_frame(format, &df).unwrap();
            let back = read_frame(format, Bytes::from(bytes)).unwrap();
            assert_eq!(back.num_rows(), 3, "format {}", format);
            assert_eq!(back.column_names(), vec!["id", "city", "temp"], "format {}", format);
        }
    }

    #[test]
    fn test_excel_cells_keep_types() {
        let records: Vec<serde_json::Map<String, Value>> = vec![
            json!({"id": 1, "name": "Ada", "score": 9.5, "active": true}),
            json!({"id": 2, "score": 7.0, "active": false}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
        let df = DataFrame::from_json_records(&records).unwrap();

        let bytes = write_frame(FileFormat::Excel, &df).unwrap();
        let back = read_frame(FileFormat::Excel, Bytes::from(bytes)).unwrap();

        assert_eq!(back.column_names(), vec!["id", "name", "score", "active"]);
        assert_eq!(back.schema().field(0).data_type(), &DataType::Int64);
        assert_eq!(back.schema().field(2).data_type(), &DataType::Float64);
        let rows = back.to_json_records().unwrap();
        assert_eq!(rows[0]["name"], json!("Ada"));
        assert_eq!(rows[1]["active"], json!(false));
        assert!(!rows[1].contains_key("name"));
    }

    #[test]
    fn test_legacy_spreadsheets_are_read_only() {
        for format in [FileFormat::Xls, FileFormat::Ods] {
            assert!(matches!(
                write_frame(format, &sample()),
                Err(ConnectorError::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn test_empty_frame_csv_keeps_header() {
        let df = DataFrame::from_rows(&["a".into(), "b".into()], vec![]).unwrap();
        let bytes = write_frame(FileFormat::Csv, &df).unwrap();
        assert_eq!(bytes, b"a,b\n");
    }

    #[tokio::test]
    async fn test_local_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/data.parquet");

        write_local(&sample(), &path, FileFormat::Parquet).await.unwrap();
        let back = read_local(&path).await.unwrap();
        assert_eq!(back.num_rows(), 3);
    }
}
