//! Catalog queries for listing schemas, tables and columns.
//!
//! Schema and table names are spliced into the SQL verbatim. They are
//! trusted input from the caller and are neither quoted nor escaped.

use super::{BackendKind, ColumnInfo, Table, Value};
use crate::error::{ConnectorError, Result};
use regex::Regex;

/// Columns of a [`list_columns`](crate::session::Session::list_columns) result.
pub const COLUMN_FIELDS: [&str; 5] = [
    "table_schema",
    "table_name",
    "column_name",
    "data_type",
    "ordinal_position",
];

/// Packed late-binding view column: `(schema,view,column,type,ordinal)`.
/// The type may itself contain commas, as in `numeric(10,2)`.
const PACKED_COLUMN: &str = r"^\(([^,]*),([^,]*),([^,]*),(.*),(\d+)\)$";

/// Statements answering a column listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnsQuery {
    /// Query returning [`COLUMN_FIELDS`] directly.
    pub columns: String,
    /// Query returning one packed text value per late-binding view column.
    pub late_binding: Option<String>,
}

/// Returns the statement listing every schema.
pub fn list_schemas_sql(kind: BackendKind) -> String {
    match kind {
        BackendKind::Redshift => "select s.nspname as table_schema, \
                s.oid as schema_id, \
                u.usename as owner \
             from pg_catalog.pg_namespace s \
             join pg_catalog.pg_user u on u.usesysid = s.nspowner \
             order by table_schema"
            .to_string(),
        BackendKind::BigQuery => "select schema_name from INFORMATION_SCHEMA.SCHEMATA".to_string(),
        BackendKind::Databricks => {
            "select schema_name from information_schema.schemata order by schema_name".to_string()
        }
    }
}

/// Returns the statement listing the tables of `schema`.
///
/// Every variant yields a `table_name` column.
pub fn list_tables_sql(kind: BackendKind, schema: &str) -> String {
    match kind {
        BackendKind::Redshift | BackendKind::Databricks => format!(
            "select table_name, table_type \
             from information_schema.tables t \
             where t.table_schema = '{schema}' \
             order by t.table_name"
        ),
        BackendKind::BigQuery => format!("select * from {schema}.INFORMATION_SCHEMA.TABLES"),
    }
}

/// Returns the statements listing the columns of every table in `schema`.
pub fn list_columns_sql(kind: BackendKind, schema: &str) -> ColumnsQuery {
    let fields = COLUMN_FIELDS.join(", ");
    match kind {
        BackendKind::Redshift => ColumnsQuery {
            columns: format!(
                "select {fields} from information_schema.columns \
                 where table_schema = '{schema}' \
                 order by table_name, ordinal_position"
            ),
            late_binding: Some(
                "select pg_get_late_binding_view_cols()::text as packed".to_string(),
            ),
        },
        BackendKind::BigQuery => ColumnsQuery {
            columns: format!(
                "select {fields} from {schema}.INFORMATION_SCHEMA.COLUMNS \
                 order by table_name, ordinal_position"
            ),
            late_binding: None,
        },
        BackendKind::Databricks => ColumnsQuery {
            columns: format!(
                "select {fields} from information_schema.columns \
                 where table_schema = '{schema}' \
                 order by table_name, ordinal_position"
            ),
            late_binding: None,
        },
    }
}

/// Unpacks late-binding view columns belonging to `schema` into
/// [`COLUMN_FIELDS`] rows. Values that do not look packed are skipped.
pub fn unpack_late_binding(packed: &Table, schema: &str) -> Result<Table> {
    let pattern = Regex::new(PACKED_COLUMN)
        .map_err(|e| ConnectorError::internal(format!("Invalid pattern: {e}")))?;

    let columns = COLUMN_FIELDS
        .iter()
        .map(|name| {
            let data_type = if *name == "ordinal_position" { "int8" } else { "text" };
            ColumnInfo::new(*name, data_type)
        })
        .collect();

    let rows = packed
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(Value::as_str))
        .filter_map(|text| pattern.captures(text.trim()))
        .filter(|captures| &captures[1] == schema)
        .map(|captures| {
            let data_type = captures[4].trim_matches('"');
            vec![
                Value::from(&captures[1]),
                Value::from(&captures[2]),
                Value::from(&captures[3]),
                Value::from(data_type),
                captures[5]
                    .parse::<i64>()
                    .map(Value::Int)
                    .unwrap_or(Value::Null),
            ]
        })
        .collect();

    Ok(Table::with_data(columns, rows))
}
