//! SQL dialects for DDL and literal INSERT generation
//!
//! Frames are written with plain SQL text: a `CREATE TABLE` derived from the
//! Arrow schema, then multi-row `INSERT ... VALUES` statements with escaped
//! literals. Each dialect decides identifier quoting, literal escaping and the
//! native type for each column kind.

use arrow_schema::{DataType, Schema};
use serde_json::Value;

/// Storage class of a column, derived from its Arrow type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Boolean,
    Integer,
    Float,
    Text,
    Date,
    Timestamp,
    Binary,
    Json,
}

impl ColumnKind {
    pub fn from_data_type(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean => Self::Boolean,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => Self::Integer,
            DataType::Float16
            | DataType::Float32
            | DataType::Float64
            | DataType::Decimal128(_, _)
            | DataType::Decimal256(_, _) => Self::Float,
            DataType::Date32 | DataType::Date64 => Self::Date,
            DataType::Timestamp(_, _) => Self::Timestamp,
            DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => {
                Self::Binary
            }
            DataType::List(_)
            | DataType::LargeList(_)
            | DataType::FixedSizeList(_, _)
            | DataType::Struct(_)
            | DataType::Map(_, _) => Self::Json,
            _ => Self::Text,
        }
    }
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Native type for a column kind
    fn native_type(&self, kind: ColumnKind) -> &'static str;

    /// Escape a string literal (without the surrounding quotes)
    fn escape_string(&self, value: &str) -> String {
        value.replace('\'', "''")
    }

    /// Quoted string literal
    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", self.escape_string(value))
    }

    /// Get the boolean literal
    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    /// Statement switching the session's default schema, if the dialect has one
    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        let _ = schema;
        None
    }

    /// Most rows a single INSERT may carry
    fn max_rows_per_insert(&self) -> usize {
        500
    }

    /// `schema.table`, quoted
    fn qualified_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(s) => format!("{}.{}", self.quote_identifier(s), self.quote_identifier(table)),
            None => self.quote_identifier(table),
        }
    }

    /// CREATE TABLE for an Arrow schema; every column is nullable
    fn create_table_sql(&self, table: &str, schema: &Schema, if_not_exists: bool) -> String {
        let columns = schema
            .fields()
            .iter()
            .map(|f| {
                format!(
                    "{} {}",
                    self.quote_identifier(f.name()),
                    self.native_type(ColumnKind::from_data_type(f.data_type()))
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
        format!("CREATE TABLE {}{} ({})", guard, table, columns)
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", table)
    }

    /// SQL literal for a JSON value
    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => self.boolean_literal(*b).to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => self.string_literal(s),
            nested => self.string_literal(&nested.to_string()),
        }
    }

    /// One multi-row INSERT statement
    fn insert_sql(&self, table: &str, columns: &[&str], rows: &[Vec<Value>]) -> String {
        let cols = columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let values = rows
            .iter()
            .map(|row| {
                let literals = row.iter().map(|v| self.literal(v)).collect::<Vec<_>>();
                format!("({})", literals.join(", "))
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} ({}) VALUES {}", table, cols, values)
    }
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn native_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Float => "DOUBLE PRECISION",
            ColumnKind::Text => "TEXT",
            ColumnKind::Date => "DATE",
            ColumnKind::Timestamp => "TIMESTAMP",
            ColumnKind::Binary => "BYTEA",
            ColumnKind::Json => "JSONB",
        }
    }

    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!("SET search_path TO {}", self.quote_identifier(schema)))
    }
}

/// Amazon Redshift dialect
#[derive(Debug, Clone, Default)]
pub struct RedshiftDialect;

impl SqlDialect for RedshiftDialect {
    fn name(&self) -> &'static str {
        "Redshift"
    }

    fn native_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Float => "DOUBLE PRECISION",
            ColumnKind::Text | ColumnKind::Json => "VARCHAR(65535)",
            ColumnKind::Date => "DATE",
            ColumnKind::Timestamp => "TIMESTAMP",
            ColumnKind::Binary => "VARBYTE",
        }
    }

    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!("SET search_path TO {}", self.quote_identifier(schema)))
    }
}

/// MySQL / MariaDB dialect
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn native_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Float => "DOUBLE",
            ColumnKind::Text => "TEXT",
            ColumnKind::Date => "DATE",
            ColumnKind::Timestamp => "DATETIME(6)",
            ColumnKind::Binary => "LONGBLOB",
            ColumnKind::Json => "JSON",
        }
    }

    fn escape_string(&self, value: &str) -> String {
        value.replace('\\', "\\\\").replace('\'', "''")
    }

    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!("USE {}", self.quote_identifier(schema)))
    }
}

/// StarRocks dialect: MySQL wire syntax with StarRocks column types
#[derive(Debug, Clone, Default)]
pub struct StarRocksDialect;

impl SqlDialect for StarRocksDialect {
    fn name(&self) -> &'static str {
        "StarRocks"
    }

    fn quote_identifier(&self, name: &str) -> String {
        MySqlDialect.quote_identifier(name)
    }

    fn native_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Float => "DOUBLE",
            ColumnKind::Text => "STRING",
            ColumnKind::Date => "DATE",
            ColumnKind::Timestamp => "DATETIME",
            ColumnKind::Binary => "VARBINARY",
            ColumnKind::Json => "JSON",
        }
    }

    fn escape_string(&self, value: &str) -> String {
        MySqlDialect.escape_string(value)
    }

    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        MySqlDialect.set_schema_sql(schema)
    }
}

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn native_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Boolean => "BIT",
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Float => "FLOAT",
            ColumnKind::Text | ColumnKind::Json => "NVARCHAR(MAX)",
            ColumnKind::Date => "DATE",
            ColumnKind::Timestamp => "DATETIME2",
            ColumnKind::Binary => "VARBINARY(MAX)",
        }
    }

    fn string_literal(&self, value: &str) -> String {
        format!("N'{}'", self.escape_string(value))
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn create_table_sql(&self, table: &str, schema: &Schema, if_not_exists: bool) -> String {
        let columns = schema
            .fields()
            .iter()
            .map(|f| {
                format!(
                    "{} {}",
                    self.quote_identifier(f.name()),
                    self.native_type(ColumnKind::from_data_type(f.data_type()))
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let create = format!("CREATE TABLE {} ({})", table, columns);
        if if_not_exists {
            format!(
                "IF OBJECT_ID(N'{}', N'U') IS NULL {}",
                self.escape_string(table),
                create
            )
        } else {
            create
        }
    }
}

/// SQLite dialect
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn native_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Boolean | ColumnKind::Integer => "INTEGER",
            ColumnKind::Float => "REAL",
            ColumnKind::Binary => "BLOB",
            ColumnKind::Text | ColumnKind::Json | ColumnKind::Date | ColumnKind::Timestamp => {
                "TEXT"
            }
        }
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }
}

/// Snowflake dialect
#[derive(Debug, Clone, Default)]
pub struct SnowflakeDialect;

impl SqlDialect for SnowflakeDialect {
    fn name(&self) -> &'static str {
        "Snowflake"
    }

    fn native_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Integer => "NUMBER(38,0)",
            ColumnKind::Float => "FLOAT",
            ColumnKind::Text | ColumnKind::Json => "VARCHAR",
            ColumnKind::Date => "DATE",
            ColumnKind::Timestamp => "TIMESTAMP_NTZ",
            ColumnKind::Binary => "BINARY",
        }
    }

    fn escape_string(&self, value: &str) -> String {
        value.replace('\\', "\\\\").replace('\'', "''")
    }

    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!("USE SCHEMA {}", self.quote_identifier(schema)))
    }

    fn max_rows_per_insert(&self) -> usize {
        1000
    }
}
