//! SQL generation for replacing a table with in-memory rows.
//!
//! A write is `DROP TABLE IF EXISTS`, `CREATE TABLE`, then multi-row
//! `INSERT ... VALUES` batches. Column types are inferred from the first
//! non-null value of each column.

use super::{BackendKind, Table, Value};
use crate::error::{ConnectorError, Result};

/// SQL flavour used for types and literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Redshift,
    BigQuery,
}

impl Dialect {
    fn for_kind(kind: BackendKind) -> Result<Self> {
        match kind {
            BackendKind::Redshift => Ok(Self::Redshift),
            BackendKind::BigQuery => Ok(Self::BigQuery),
            BackendKind::Databricks => Err(ConnectorError::not_implemented(
                "write_table",
                kind.as_str(),
            )),
        }
    }

    fn column_type(self, sample: Option<&Value>) -> &'static str {
        match (self, sample) {
            (Self::Redshift, Some(Value::Bool(_))) => "BOOLEAN",
            (Self::Redshift, Some(Value::Int(_))) => "BIGINT",
            (Self::Redshift, Some(Value::Float(_))) => "DOUBLE PRECISION",
            (Self::Redshift, Some(Value::Bytes(_))) => "VARBYTE(65535)",
            (Self::Redshift, _) => "VARCHAR(MAX)",
            (Self::BigQuery, Some(Value::Bool(_))) => "BOOL",
            (Self::BigQuery, Some(Value::Int(_))) => "INT64",
            (Self::BigQuery, Some(Value::Float(_))) => "FLOAT64",
            (Self::BigQuery, Some(Value::Bytes(_))) => "BYTES",
            (Self::BigQuery, _) => "STRING",
        }
    }

    fn quote_column(self, name: &str) -> String {
        match self {
            Self::Redshift => format!("\"{}\"", name.replace('"', "\"\"")),
            Self::BigQuery => format!("`{}`", name.replace('`', "\\`")),
        }
    }

    fn literal(self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => self.float_literal(*f),
            Value::String(s) => self.string_literal(s),
            Value::Bytes(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                match self {
                    Self::Redshift => format!("from_hex('{hex}')"),
                    Self::BigQuery => format!("FROM_HEX('{hex}')"),
                }
            }
        }
    }

    fn float_literal(self, f: f64) -> String {
        if f.is_finite() {
            return format!("{f:?}");
        }
        let special = if f.is_nan() {
            "NaN"
        } else if f > 0.0 {
            "Infinity"
        } else {
            "-Infinity"
        };
        match self {
            Self::Redshift => format!("'{special}'::double precision"),
            Self::BigQuery => {
                let special = special.to_lowercase().replace("infinity", "inf");
                format!("CAST('{special}' AS FLOAT64)")
            }
        }
    }

    fn string_literal(self, s: &str) -> String {
        match self {
            Self::Redshift => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
            Self::BigQuery => {
                let mut out = String::with_capacity(s.len() + 2);
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\\' => out.push_str("\\\\"),
                        '\'' => out.push_str("\\'"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        _ => out.push(c),
                    }
                }
                out.push('\'');
                out
            }
        }
    }
}

/// Builds the statements that replace `schema.name` with `table`.
///
/// Rows are inserted `chunk_size` at a time; zero puts every row in one
/// statement. Databricks is not supported.
pub fn write_statements(
    kind: BackendKind,
    table: &Table,
    schema: &str,
    name: &str,
    chunk_size: usize,
) -> Result<Vec<String>> {
    let dialect = Dialect::for_kind(kind)?;
    if table.columns.is_empty() {
        return Err(ConnectorError::config(format!(
            "Cannot write {schema}.{name}: the table has no columns"
        )));
    }

    let target = format!("{schema}.{name}");
    let quoted: Vec<String> = table
        .columns
        .iter()
        .map(|c| dialect.quote_column(&c.name))
        .collect();

    let definitions: Vec<String> = quoted
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let sample = table
                .rows
                .iter()
                .filter_map(|row| row.get(i))
                .find(|v| !v.is_null());
            format!("{} {}", column, dialect.column_type(sample))
        })
        .collect();

    let mut statements = vec![
        format!("DROP TABLE IF EXISTS {target}"),
        format!("CREATE TABLE {target} ({})", definitions.join(", ")),
    ];

    let batch = if chunk_size == 0 {
        table.rows.len().max(1)
    } else {
        chunk_size
    };
    let column_list = quoted.join(", ");

    for chunk in table.rows.chunks(batch) {
        let values: Vec<String> = chunk
            .iter()
            .map(|row| {
                let literals: Vec<String> = (0..table.columns.len())
                    .map(|i| dialect.literal(row.get(i).unwrap_or(&Value::Null)))
                    .collect();
                format!("({})", literals.join(", "))
            })
            .collect();
        statements.push(format!(
            "INSERT INTO {target} ({column_list}) VALUES {}",
            values.join(", ")
        ));
    }

    Ok(statements)
}
