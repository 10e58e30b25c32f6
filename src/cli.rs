//! Command-line argument parsing and output formatting for Multicon.

use crate::backend::{ExecResult, Table};
use crate::error::{ConnectorError, Result};
use crate::session::{PeekedTable, DEFAULT_CHUNK_SIZE, DEFAULT_PEEK_LIMIT};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};

/// How results are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Aligned plain text.
    #[default]
    Text,
    /// Pretty-printed JSON, readable back by `write`.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid output format: {s}. Expected: text or json")),
        }
    }
}

/// Query Redshift, BigQuery and Databricks through named profiles.
#[derive(Parser, Debug)]
#[command(name = "multicon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Profile document path
    #[arg(long, value_name = "PATH", env = "MULTICON_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Profile to use instead of the document's default
    #[arg(short = 'p', long, value_name = "NAME", global = true)]
    pub profile: Option<String>,

    /// Write logs to the state directory instead of stderr
    #[arg(long, global = true)]
    pub log_file: bool,

    /// Output format (text or json)
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run a statement and print its rows
    Query {
        sql: String,
        /// Rows fetched per page; 0 reads everything at once
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Run a statement for its side effects
    Exec { sql: String },

    /// Run `select <FRAGMENT>`
    Select {
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        fragment: Vec<String>,
    },

    /// Run a statement file, optionally saving the result and filling in parameters
    Sql {
        /// Statement file, or - for stdin
        #[arg(default_value = "-")]
        file: String,
        /// Result name followed by key=value template parameters
        args: Vec<String>,
    },

    /// List schemas
    Schemas,

    /// List the tables of a schema
    Tables { schema: String },

    /// List the columns of every table in a schema
    Columns { schema: String },

    /// Show the first rows of a table, transposed
    Peek {
        table: String,
        #[arg(long, default_value_t = DEFAULT_PEEK_LIMIT)]
        limit: usize,
    },

    /// Peek every non-empty table of a schema
    PeekSchema {
        schema: String,
        #[arg(long, default_value_t = DEFAULT_PEEK_LIMIT)]
        limit: usize,
    },

    /// Replace a table with rows from a JSON file
    Write {
        schema: String,
        table: String,
        file: PathBuf,
        /// Rows per INSERT statement
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Reads a statement from `source`, or stdin when it is `-`.
pub fn read_source(source: &str) -> Result<String> {
    if source == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .map_err(|e| ConnectorError::config(format!("Failed to read stdin: {e}")))?;
        return Ok(content);
    }

    std::fs::read_to_string(source)
        .map_err(|e| ConnectorError::config(format!("Failed to read {source}: {e}")))
}

/// Loads a table previously saved as JSON.
pub fn load_table(path: &Path) -> Result<Table> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConnectorError::config(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| ConnectorError::config(format!("Invalid table in {}: {e}", path.display())))
}

/// Saves `table` as `<target>.json` inside `dir` and returns the file path.
pub fn save_table(table: &Table, target: &str, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(format!("{target}.json"));
    let json = to_json(table)?;
    std::fs::write(&path, json)
        .map_err(|e| ConnectorError::config(format!("Failed to write {}: {e}", path.display())))?;
    Ok(path)
}

/// Formats a table for printing.
pub fn render_table(table: &Table, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(table.to_string()),
        OutputFormat::Json => to_json(table),
    }
}

/// Formats the outcome of a raw statement.
pub fn render_exec(result: &ExecResult, format: OutputFormat) -> Result<String> {
    match (format, result.rows_affected) {
        (OutputFormat::Json, rows) => to_json(&serde_json::json!({ "rows_affected": rows })),
        (OutputFormat::Text, Some(rows)) => Ok(format!("OK ({rows} rows affected)")),
        (OutputFormat::Text, None) => Ok("OK".to_string()),
    }
}

/// Formats the previews of a schema, one block per table.
pub fn render_peeked(tables: &[PeekedTable], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(tables
            .iter()
            .map(|t| format!("{}\n{}", t.name, t.data))
            .collect::<Vec<_>>()
            .join("\n\n")),
        OutputFormat::Json => {
            let mut map = serde_json::Map::new();
            for table in tables {
                let value = serde_json::to_value(&table.data)
                    .map_err(|e| ConnectorError::internal(format!("JSON encoding failed: {e}")))?;
                map.insert(table.name.clone(), value);
            }
            to_json(&map)
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ConnectorError::internal(format!("JSON encoding failed: {e}")))
}
