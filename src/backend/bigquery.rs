//! BigQuery backend over the v2 REST API.
//!
//! Statements go through `jobs.query`; results are paged with
//! `jobs.getQueryResults`, asking for `page_size` rows per page.

use super::credentials;
use super::http;
use super::{
    BackendKind, BigQuerySpec, ColumnInfo, Connection, Engine, ExecResult, PageBuffer, PageSink,
    Row, Value,
};
use crate::error::{ConnectorError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

/// BigQuery REST API base URL.
const BIGQUERY_API_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// How long the server may hold each request waiting for the job (milliseconds).
const WAIT_TIMEOUT_MS: u64 = 10_000;

/// Produces REST sessions against one project.
#[derive(Debug, Clone)]
pub struct BigQueryEngine {
    spec: BigQuerySpec,
    base_url: String,
    client: Client,
}

impl BigQueryEngine {
    /// Creates an engine. Performs no network I/O.
    pub fn new(spec: BigQuerySpec) -> Result<Self> {
        Ok(Self {
            spec,
            base_url: BIGQUERY_API_URL.to_string(),
            client: http::client()?,
        })
    }

    /// Points the engine at another API root, such as a local emulator.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Engine for BigQueryEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::BigQuery
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let token = credentials::google_access_token(self.spec.token.as_deref()).await?;
        debug!("Using BigQuery project {}", self.spec.project);
        Ok(Box::new(BigQueryConnection {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            project: self.spec.project.clone(),
            token,
        }))
    }
}

/// A BigQuery session: an authenticated client bound to a project.
#[derive(Debug)]
pub struct BigQueryConnection {
    client: Client,
    base_url: String,
    project: String,
    token: String,
}

impl BigQueryConnection {
    async fn start_query(&self, sql: &str, page_size: Option<usize>) -> Result<QueryResponse> {
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            max_results: page_size,
            timeout_ms: WAIT_TIMEOUT_MS,
        };
        let url = format!("{}/projects/{}/queries", self.base_url, self.project);
        let builder = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&request);
        http::send_json(builder, "BigQuery").await
    }

    async fn query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<QueryResponse> {
        let mut url = url::Url::parse(&format!(
            "{}/projects/{}/queries/{}",
            self.base_url, job.project_id, job.job_id
        ))
        .map_err(|e| ConnectorError::internal(format!("Invalid BigQuery URL: {e}")))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("timeoutMs", &WAIT_TIMEOUT_MS.to_string());
            if let Some(location) = &job.location {
                pairs.append_pair("location", location);
            }
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
            if let Some(size) = page_size {
                pairs.append_pair("maxResults", &size.to_string());
            }
        }

        let builder = self.client.get(url).bearer_auth(&self.token);
        http::send_json(builder, "BigQuery").await
    }

    /// Runs `sql` and polls until the job completes.
    async fn run(&self, sql: &str, page_size: Option<usize>) -> Result<QueryResponse> {
        let mut response = self.start_query(sql, page_size).await?;
        while !response.is_complete() {
            let job = response.job()?.clone();
            debug!("Waiting for BigQuery job {}", job.job_id);
            response = self.query_results(&job, None, page_size).await?;
        }
        Ok(response)
    }
}

#[async_trait]
impl Connection for BigQueryConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::BigQuery
    }

    async fn query_pages(
        &mut self,
        sql: &str,
        page_size: Option<usize>,
        on_page: PageSink<'_>,
    ) -> Result<()> {
        let page_size = page_size.filter(|size| *size > 0);
        let mut response = self.run(sql, page_size).await?;
        let fields = response.schema.take().map(|s| s.fields).unwrap_or_default();

        let mut buffer = PageBuffer::new(page_size);
        buffer.set_columns(columns_of(&fields));

        loop {
            for row in std::mem::take(&mut response.rows) {
                buffer.push(decode_row(&fields, &row), &mut *on_page);
            }
            let Some(token) = response.page_token.take() else {
                break;
            };
            let job = response.job()?.clone();
            response = self.query_results(&job, Some(&token), page_size).await?;
        }

        buffer.finish(on_page);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<ExecResult> {
        let response = self.run(sql, Some(0)).await?;
        Ok(ExecResult {
            rows_affected: response
                .num_dml_affected_rows
                .as_deref()
                .and_then(|n| n.parse().ok()),
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_results: Option<usize>,
    timeout_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    schema: Option<TableSchema>,
    job_reference: Option<JobReference>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
    job_complete: Option<bool>,
    num_dml_affected_rows: Option<String>,
}

impl QueryResponse {
    fn is_complete(&self) -> bool {
        self.job_complete.unwrap_or(true)
    }

    fn job(&self) -> Result<&JobReference> {
        self.job_reference
            .as_ref()
            .ok_or_else(|| ConnectorError::query("BigQuery response has no job reference"))
    }
}

#[derive(Debug, Default, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

impl FieldSchema {
    fn is_repeated(&self) -> bool {
        self.mode.as_deref() == Some("REPEATED")
    }

    fn is_record(&self) -> bool {
        matches!(self.field_type.as_str(), "RECORD" | "STRUCT")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: JsonValue,
}

fn columns_of(fields: &[FieldSchema]) -> Vec<ColumnInfo> {
    fields
        .iter()
        .map(|f| {
            let data_type = if f.is_repeated() {
                format!("ARRAY<{}>", f.field_type)
            } else {
                f.field_type.clone()
            };
            ColumnInfo::new(&f.name, data_type)
        })
        .collect()
}

fn decode_row(fields: &[FieldSchema], row: &TableRow) -> Row {
    fields
        .iter()
        .enumerate()
        .map(|(i, field)| match row.f.get(i) {
            Some(cell) => decode_value(field, &cell.v),
            None => Value::Null,
        })
        .collect()
}

/// Decodes one cell. Every scalar arrives as a JSON string.
fn decode_value(field: &FieldSchema, v: &JsonValue) -> Value {
    if v.is_null() {
        return Value::Null;
    }
    if field.is_repeated() || field.is_record() {
        return Value::String(to_json(field, v).to_string());
    }

    let Some(text) = v.as_str() else {
        return Value::String(v.to_string());
    };

    match field.field_type.as_str() {
        "INTEGER" | "INT64" => text
            .parse()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "FLOAT" | "FLOAT64" => text
            .parse()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "BOOLEAN" | "BOOL" => Value::Bool(text.eq_ignore_ascii_case("true")),
        "BYTES" => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map(Value::Bytes)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "TIMESTAMP" => Value::String(timestamp_text(text)),
        _ => Value::String(text.to_string()),
    }
}

/// Renders epoch seconds (e.g. `1.7040672E9`) as RFC 3339.
fn timestamp_text(epoch_seconds: &str) -> String {
    epoch_seconds
        .parse::<f64>()
        .ok()
        .and_then(|secs| {
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round() as u32;
            chrono::DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
        })
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| epoch_seconds.to_string())
}

/// Unwraps the `{"f": [{"v": ...}]}` row encoding into plain JSON.
fn to_json(field: &FieldSchema, v: &JsonValue) -> JsonValue {
    if field.is_repeated() {
        let items = v
            .as_array()
            .map(|items| items.iter().map(|item| element_json(field, &item["v"])).collect())
            .unwrap_or_default();
        return JsonValue::Array(items);
    }
    element_json(field, v)
}

fn element_json(field: &FieldSchema, v: &JsonValue) -> JsonValue {
    if !field.is_record() {
        return v.clone();
    }
    let mut map = serde_json::Map::new();
    if let Some(cells) = v.get("f").and_then(JsonValue::as_array) {
        for (sub, cell) in field.fields.iter().zip(cells) {
            map.insert(sub.name.clone(), to_json(sub, &cell["v"]));
        }
    }
    JsonValue::Object(map)
}
