//! datagate - command-line access to every configured data source
//!
//! ```bash
//! # List supported sources (no configuration needed)
//! datagate sources
//!
//! # Show the configuration schema of a source
//! datagate schema snowflake
//!
//! # Check that a source's section builds a connector
//! datagate -c datagate.yaml check postgresql
//!
//! # Query into a local Parquet file
//! datagate -c datagate.yaml read postgresql --query "SELECT * FROM orders" --output orders.parquet
//!
//! # Load a CSV into a table
//! datagate -c datagate.yaml write mysql --input orders.csv --table orders --if-exists replace
//!
//! # Scan a DynamoDB table into a spreadsheet
//! datagate -c datagate.yaml read dynamodb --table sessions --output sessions.xlsx
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use datagate::{
    format, DataGate, DownloadRequest, FileFormat, IfExists, ObjectLocation, ReadRequest,
    WriteRequest,
};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "datagate")]
#[command(version, about = "Unified access to data lakes, warehouses, databases and NoSQL stores")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "datagate.yaml", env = "DATAGATE_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported data sources
    Sources,
    /// Show the configuration schema for a source
    Schema {
        /// Source id (e.g. s3, postgresql)
        source: String,
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
    /// Build a connector from the configuration without using it
    Check {
        source: String,
    },
    /// Read data and print it as CSV or write it to a file
    Read {
        source: String,
        #[command(flatten)]
        target: ReadArgs,
        /// Local file to write; format follows the extension
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a local file to a source
    Write {
        source: String,
        /// Local CSV, JSON, JSONL, Parquet, Feather or Excel file
        #[arg(short, long)]
        input: PathBuf,
        #[command(flatten)]
        target: WriteArgs,
    },
    /// Download an object or a query result
    Download {
        source: String,
        /// Object URI, e.g. s3://bucket/key
        #[arg(long, conflicts_with = "query")]
        path: Option<String>,
        /// Query whose result is downloaded
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        database: Option<String>,
        #[arg(long)]
        schema: Option<String>,
        /// Download every object under the path prefix
        #[arg(long, requires = "path")]
        folder: bool,
        /// Directory for objects, file for query results
        #[arg(long)]
        dest: PathBuf,
    },
    /// Upload a local file or folder to an object store
    Upload {
        source: String,
        #[arg(long, conflicts_with = "folder")]
        file: Option<PathBuf>,
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Destination URI, e.g. s3://bucket/prefix/
        #[arg(long)]
        path: String,
    },
}

#[derive(Args)]
struct ReadArgs {
    /// Object URI or prefix, e.g. gs://bucket/exports/*
    #[arg(long)]
    path: Option<String>,
    /// Override the object format (csv, json, jsonl, parquet, feather, xlsx)
    #[arg(long, requires = "path")]
    format: Option<String>,
    /// SQL query
    #[arg(long)]
    query: Option<String>,
    #[arg(long)]
    database: Option<String>,
    #[arg(long)]
    schema: Option<String>,
    /// `database.collection`
    #[arg(long)]
    collection: Option<String>,
    /// JSON filter document
    #[arg(long, requires = "collection")]
    filter: Option<String>,
    #[arg(long)]
    index: Option<String>,
    /// JSON search body
    #[arg(long, requires = "index")]
    search: Option<String>,
    /// Whole table, for key-value stores
    #[arg(long)]
    table: Option<String>,
}

#[derive(Args)]
struct WriteArgs {
    /// Object URI
    #[arg(long)]
    path: Option<String>,
    #[arg(long)]
    table: Option<String>,
    #[arg(long)]
    database: Option<String>,
    #[arg(long)]
    schema: Option<String>,
    /// append, replace or fail
    #[arg(long, default_value = "append")]
    if_exists: String,
    /// `database.collection`
    #[arg(long)]
    collection: Option<String>,
    #[arg(long)]
    index: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Commands that don't need config
    match &cli.command {
        Commands::Sources => return list_sources(),
        Commands::Schema { source, format } => return show_schema(source, format),
        _ => {}
    }

    let gate = DataGate::from_config_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Check { source } => check_source(&gate, &source),
        Commands::Read {
            source,
            target,
            output,
        } => read(&gate, &source, target, output).await,
        Commands::Write {
            source,
            input,
            target,
        } => write(&gate, &source, input, target).await,
        Commands::Download {
            source,
            path,
            query,
            database,
            schema,
            folder,
            dest,
        } => {
            let connector = gate.connect(&source)?;
            let written = match (path, query) {
                (Some(path), None) if folder => {
                    connector
                        .download_folder(&ObjectLocation::parse(&path)?, &dest)
                        .await?
                }
                (Some(path), None) => {
                    connector
                        .download_file(&DownloadRequest::Object {
                            location: ObjectLocation::parse(&path)?,
                            destination_dir: dest,
                        })
                        .await?
                }
                (None, Some(sql)) => {
                    connector
                        .download_file(&DownloadRequest::Query {
                            sql,
                            database,
                            schema,
                            destination: dest,
                        })
                        .await?
                }
                _ => bail!("pass exactly one of --path or --query"),
            };
            println!("{}", written.display());
            Ok(())
        }
        Commands::Upload {
            source,
            file,
            folder,
            path,
        } => {
            let connector = gate.connect(&source)?;
            let location = ObjectLocation::parse(&path)?;
            match (file, folder) {
                (Some(file), None) => {
                    let uploaded = connector.upload_file(&file, &location).await?;
                    println!("{}", uploaded);
                }
                (None, Some(folder)) => {
                    for uploaded in connector.upload_folder(&folder, &location).await? {
                        println!("{}", uploaded);
                    }
                }
                _ => bail!("pass exactly one of --file or --folder"),
            }
            Ok(())
        }
        Commands::Sources | Commands::Schema { .. } => unreachable!(), // handled above
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn list_sources() -> Result<()> {
    let gate = DataGate::builtin();
    let groups = gate.resolver().groups();

    println!(
        "{:<14} {:<15} {:<48} OPERATIONS",
        "SOURCE", "GROUP", "DESCRIPTION"
    );
    for (id, factory) in gate.registry().iter() {
        let operations: Vec<&str> = factory.operations().iter().map(|op| op.as_str()).collect();
        println!(
            "{:<14} {:<15} {:<48} {}",
            id,
            groups.group_of(id).unwrap_or("-"),
            factory.description(),
            operations.join(", ")
        );
    }
    Ok(())
}

fn show_schema(source: &str, format: &str) -> Result<()> {
    let gate = DataGate::builtin();
    let factory = gate.registry().factory_for(source)?;
    let schema = serde_json::to_value(factory.config_schema())?;

    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        _ => println!("{}", serde_json::to_string_pretty(&schema)?),
    }
    Ok(())
}

fn check_source(gate: &DataGate, source: &str) -> Result<()> {
    let connector = gate
        .connect(source)
        .with_context(|| format!("Check failed for '{}'", source))?;
    let operations: Vec<&str> = connector.operations().iter().map(|op| op.as_str()).collect();
    println!("✓ {}: ready ({})", connector.name(), operations.join(", "));
    Ok(())
}

/// `database.collection` into its two parts
fn split_collection(value: &str) -> Result<(String, String)> {
    match value.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {
            Ok((db.to_string(), coll.to_string()))
        }
        _ => bail!("--collection must be database.collection, got '{}'", value),
    }
}

fn parse_json(flag: &str, value: Option<String>) -> Result<Option<serde_json::Value>> {
    value
        .map(|v| serde_json::from_str(&v).with_context(|| format!("{} is not valid JSON", flag)))
        .transpose()
}

fn read_request(args: ReadArgs) -> Result<ReadRequest> {
    let request = match (args.path, args.query, args.collection, args.index, args.table) {
        (Some(path), None, None, None, None) => ReadRequest::Object {
            location: ObjectLocation::parse(&path)?,
            format: args.format.map(|f| f.parse::<FileFormat>()).transpose()?,
        },
        (None, Some(sql), None, None, None) => ReadRequest::Query {
            sql,
            database: args.database,
            schema: args.schema,
        },
        (None, None, Some(collection), None, None) => {
            let (database, collection) = split_collection(&collection)?;
            ReadRequest::Collection {
                database,
                collection,
                filter: parse_json("--filter", args.filter)?,
            }
        }
        (None, None, None, Some(index), None) => ReadRequest::Search {
            index,
            query: parse_json("--search", args.search)?.unwrap_or(serde_json::Value::Null),
        },
        (None, None, None, None, Some(table)) => ReadRequest::Table { table },
        _ => bail!("pass exactly one of --path, --query, --collection, --index or --table"),
    };
    Ok(request)
}

fn write_request(args: WriteArgs) -> Result<WriteRequest> {
    let request = match (args.path, args.table, args.collection, args.index) {
        (Some(path), None, None, None) => WriteRequest::Object {
            location: ObjectLocation::parse(&path)?,
            format: None,
        },
        (None, Some(table), None, None) => WriteRequest::Table {
            table,
            database: args.database,
            schema: args.schema,
            if_exists: args.if_exists.parse::<IfExists>()?,
        },
        (None, None, Some(collection), None) => {
            let (database, collection) = split_collection(&collection)?;
            WriteRequest::Collection {
                database,
                collection,
            }
        }
        (None, None, None, Some(index)) => WriteRequest::Index { index },
        _ => bail!("pass exactly one of --path, --table, --collection or --index"),
    };
    Ok(request)
}

async fn read(
    gate: &DataGate,
    source: &str,
    target: ReadArgs,
    output: Option<PathBuf>,
) -> Result<()> {
    let request = read_request(target)?;
    let connector = gate.connect(source)?;
    let frame = connector.read_as_dataframe(&request).await?;

    match output {
        Some(path) => {
            let file_format = FileFormat::from_path(&path)?;
            format::write_local(&frame, &path, file_format).await?;
            info!(rows = frame.num_rows(), path = %path.display(), "Wrote output");
        }
        None => {
            let csv = format::write_frame(FileFormat::Csv, &frame)?;
            std::io::stdout()
                .write_all(&csv)
                .context("Failed to write to stdout")?;
        }
    }
    Ok(())
}

async fn write(gate: &DataGate, source: &str, input: PathBuf, target: WriteArgs) -> Result<()> {
    let request = write_request(target)?;
    let frame = format::read_local(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let connector = gate.connect(source)?;
    let summary = connector.write_dataframe(&frame, &request).await?;
    println!("{} rows written to {}", summary.rows_written, summary.target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_split_collection() {
        assert_eq!(
            split_collection("shop.orders").unwrap(),
            ("shop".to_string(), "orders".to_string())
        );
        assert!(split_collection("orders").is_err());
        assert!(split_collection(".orders").is_err());
    }

    #[test]
    fn test_read_request_requires_one_target() {
        let cli = Cli::parse_from(["datagate", "read", "postgresql", "--query", "SELECT 1"]);
        let Commands::Read { target, .. } = cli.command else {
            panic!("expected read");
        };
        assert!(matches!(read_request(target).unwrap(), ReadRequest::Query { .. }));

        let cli = Cli::parse_from([
            "datagate", "read", "x", "--query", "SELECT 1", "--index", "logs",
        ]);
        let Commands::Read { target, .. } = cli.command else {
            panic!("expected read");
        };
        assert!(read_request(target).is_err());

        let cli = Cli::parse_from(["datagate", "read", "dynamodb", "--table", "orders"]);
        let Commands::Read { target, .. } = cli.command else {
            panic!("expected read");
        };
        match read_request(target).unwrap() {
            ReadRequest::Table { table } => assert_eq!(table, "orders"),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_write_request_if_exists() {
        let cli = Cli::parse_from([
            "datagate", "write", "sqlite", "--input", "a.csv", "--table", "t", "--if-exists",
            "replace",
        ]);
        let Commands::Write { target, .. } = cli.command else {
            panic!("expected write");
        };
        match write_request(target).unwrap() {
            WriteRequest::Table { if_exists, .. } => assert_eq!(if_exists, IfExists::Replace),
            _ => panic!("expected table request"),
        }
    }
}
