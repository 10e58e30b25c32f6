//! Redshift backend over the Postgres wire protocol.

use super::credentials;
use super::{
    BackendKind, ColumnInfo, Connection, Engine, ExecResult, PageBuffer, PageSink, RedshiftAuth,
    RedshiftSpec, Row, Value,
};
use crate::error::{ConnectorError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgValueFormat};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, Statement, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Connection timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Produces Postgres-protocol connections to a Redshift cluster.
#[derive(Debug, Clone)]
pub struct RedshiftEngine {
    spec: RedshiftSpec,
    options: PgConnectOptions,
}

impl RedshiftEngine {
    /// Creates an engine. Performs no network I/O.
    pub fn new(spec: RedshiftSpec) -> Result<Self> {
        let options: PgConnectOptions = spec
            .connection_url()?
            .parse()
            .map_err(|e| ConnectorError::config(format!("Invalid Redshift connection: {e}")))?;
        Ok(Self { spec, options })
    }

    async fn connect_options(&self) -> Result<PgConnectOptions> {
        match &self.spec.auth {
            RedshiftAuth::Password(_) => Ok(self.options.clone()),
            RedshiftAuth::Iam(iam) => {
                let creds = credentials::cluster_credentials(iam).await?;
                debug!("Obtained IAM credentials for {}", creds.db_user);
                Ok(self
                    .options
                    .clone()
                    .username(&creds.db_user)
                    .password(&creds.db_password))
            }
        }
    }
}

#[async_trait]
impl Engine for RedshiftEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Redshift
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let options = self.connect_options().await?;

        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!("Connection attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

            // One pooled connection keeps session state across statements
            let result = tokio::time::timeout(
                Duration::from_secs(CONNECT_TIMEOUT_SECS),
                PgPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                    .connect_with(options.clone()),
            )
            .await;

            let error = match result {
                Ok(Ok(pool)) => {
                    debug!("Connected to {}", self.spec.display_string());
                    return Ok(Box::new(RedshiftConnection { pool: Some(pool) }));
                }
                Ok(Err(e)) => e,
                Err(_) => {
                    return Err(ConnectorError::connection(format!(
                        "Connection to {}:{} timed out after {} seconds",
                        self.spec.host, self.spec.port, CONNECT_TIMEOUT_SECS
                    )))
                }
            };

            let transient = is_transient_error(&error);
            last_error = Some(error);

            if attempt < MAX_RETRY_ATTEMPTS && transient {
                warn!(
                    "Connection attempt {} failed (transient error), retrying in {:?}",
                    attempt, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            } else {
                break;
            }
        }

        Err(match last_error {
            Some(e) => map_connection_error(e, &self.spec),
            None => ConnectorError::connection("No connection attempt was made"),
        })
    }
}

/// A live Redshift session.
#[derive(Debug)]
pub struct RedshiftConnection {
    pool: Option<PgPool>,
}

impl RedshiftConnection {
    fn pool(&self) -> Result<&PgPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| ConnectorError::connection("Connection is closed"))
    }
}

#[async_trait]
impl Connection for RedshiftConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::Redshift
    }

    async fn query_pages(
        &mut self,
        sql: &str,
        page_size: Option<usize>,
        on_page: PageSink<'_>,
    ) -> Result<()> {
        let pool = self.pool()?;
        let mut buffer = PageBuffer::new(page_size);

        {
            let mut rows = sqlx::query(sql).fetch(pool);
            while let Some(row) = rows
                .try_next()
                .await
                .map_err(|e| ConnectorError::query(format_query_error(e)))?
            {
                if !buffer.has_columns() {
                    buffer.set_columns(columns_of(&row));
                }
                buffer.push(convert_row(&row), &mut *on_page);
            }
        }

        if !buffer.has_columns() {
            // Empty result: describe the statement to recover column metadata
            match sqlx::Executor::prepare(pool, sql).await {
                Ok(statement) => buffer.set_columns(
                    statement
                        .columns()
                        .iter()
                        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                        .collect(),
                ),
                Err(e) => debug!("Could not describe empty result: {}", e),
            }
        }

        buffer.finish(on_page);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<ExecResult> {
        let pool = self.pool()?;
        let result = sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| ConnectorError::query(format_query_error(e)))?;
        Ok(ExecResult {
            rows_affected: Some(result.rows_affected()),
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}

fn columns_of(row: &PgRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    fn get<'r, T>(row: &'r PgRow, index: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(index).ok().flatten()
    }

    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => get::<bool>(row, index).map(Value::Bool).into(),
        "INT2" | "SMALLINT" => get::<i16>(row, index).map(|v| Value::Int(v as i64)).into(),
        "INT4" | "INT" | "INTEGER" => get::<i32>(row, index).map(|v| Value::Int(v as i64)).into(),
        "INT8" | "BIGINT" => get::<i64>(row, index).map(Value::Int).into(),
        "FLOAT4" | "REAL" => get::<f32>(row, index).map(|v| Value::Float(v as f64)).into(),
        "FLOAT8" | "DOUBLE PRECISION" => get::<f64>(row, index).map(Value::Float).into(),
        "NUMERIC" | "DECIMAL" => numeric_value(row, index),
        "DATE" => get::<chrono::NaiveDate>(row, index)
            .map(|v| Value::String(v.to_string()))
            .into(),
        "TIME" => get::<chrono::NaiveTime>(row, index)
            .map(|v| Value::String(v.to_string()))
            .into(),
        "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, index)
            .map(|v| Value::String(v.to_string()))
            .into(),
        "TIMESTAMPTZ" => get::<chrono::DateTime<chrono::Utc>>(row, index)
            .map(|v| Value::String(v.to_rfc3339()))
            .into(),
        "BYTEA" => get::<Vec<u8>>(row, index).map(Value::Bytes).into(),
        _ => get::<String>(row, index).map(Value::String).into(),
    }
}

/// Reads a NUMERIC column without an arbitrary-precision decimal type.
fn numeric_value(row: &PgRow, index: usize) -> Value {
    let Ok(raw) = row.try_get_raw(index) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    let text = match raw.format() {
        PgValueFormat::Text => raw.as_str().ok().map(str::to_string),
        PgValueFormat::Binary => raw.as_bytes().ok().and_then(decode_numeric),
    };
    text.map(Value::String).unwrap_or(Value::Null)
}

/// Decodes the binary NUMERIC wire format into its decimal text.
///
/// The payload is `ndigits`, `weight`, `sign`, `dscale` (all 16-bit) followed
/// by `ndigits` base-10000 digits, the first one worth `10000^weight`.
fn decode_numeric(bytes: &[u8]) -> Option<String> {
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;

    let word = |i: usize| -> Option<u16> {
        Some(u16::from_be_bytes([*bytes.get(i)?, *bytes.get(i + 1)?]))
    };

    let ndigits = word(0)? as usize;
    let weight = word(2)? as i16 as i32;
    let sign = word(4)?;
    let dscale = word(6)? as usize;

    if sign == NAN {
        return Some("NaN".to_string());
    }

    let digits = (0..ndigits)
        .map(|i| word(8 + 2 * i))
        .collect::<Option<Vec<u16>>>()?;
    let digit = |i: i32| -> u16 {
        if i < 0 {
            0
        } else {
            digits.get(i as usize).copied().unwrap_or(0)
        }
    };

    let mut text = String::new();
    if sign == NEGATIVE {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for i in 1..=weight {
            text.push_str(&format!("{:04}", digit(i)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut i = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Some(text)
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, spec: &RedshiftSpec) -> ConnectorError {
    let host = &spec.host;
    let port = spec.port;
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        let hint = if spec.tunnel.is_some() {
            " Check that the SSH tunnel is up."
        } else {
            " Check that the cluster is reachable."
        };
        ConnectorError::connection(format!("Cannot connect to {host}:{port}.{hint}"))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        ConnectorError::connection(format!(
            "Authentication failed for user '{}'. Check your credentials.",
            spec.user
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        ConnectorError::connection(format!("Database '{}' does not exist.", spec.dbname))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        ConnectorError::connection(format!(
            "Connection to {host}:{port} timed out. The cluster may be paused or unreachable."
        ))
    } else {
        ConnectorError::connection(error.to_string())
    }
}

/// Formats a query error with detail and hint if available.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = format!("ERROR: {}", db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
        if let Some(table) = pg_error.table() {
            result.push_str("\n  TABLE: ");
            result.push_str(table);
        }
    }

    result
}
