//! Databricks backend over the SQL Statement Execution API.
//!
//! Statements run on the SQL warehouse named by the profile's `http_path`.
//! Results come back inline as JSON arrays, split into chunks that are
//! followed through `next_chunk_internal_link`.

use super::http;
use super::{
    BackendKind, ColumnInfo, Connection, DatabricksSpec, Engine, ExecResult, PageBuffer, PageSink,
    Row, Table, Value,
};
use crate::error::{ConnectorError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Statement API path, relative to the workspace host.
const STATEMENTS_PATH: &str = "/api/2.0/sql/statements";

/// How long the server holds the submit request before answering `PENDING`.
const WAIT_TIMEOUT: &str = "30s";

/// Delay between polls of a pending statement.
const POLL_INTERVAL_MS: u64 = 1000;

/// Produces sessions against one SQL warehouse.
#[derive(Debug, Clone)]
pub struct DatabricksEngine {
    spec: DatabricksSpec,
    client: Client,
}

impl DatabricksEngine {
    /// Creates an engine. Performs no network I/O.
    pub fn new(spec: DatabricksSpec) -> Result<Self> {
        Ok(Self {
            spec,
            client: http::client()?,
        })
    }
}

#[async_trait]
impl Engine for DatabricksEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Databricks
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        debug!(
            "Using Databricks warehouse {} on {}",
            self.spec.warehouse_id, self.spec.host
        );
        Ok(Box::new(DatabricksConnection {
            client: self.client.clone(),
            spec: self.spec.clone(),
        }))
    }
}

/// A Databricks session. The API is stateless, so this only carries auth.
#[derive(Debug)]
pub struct DatabricksConnection {
    client: Client,
    spec: DatabricksSpec,
}

impl DatabricksConnection {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.spec.host, path)
    }

    async fn get(&self, path: &str) -> Result<StatementResponse> {
        let builder = self.client.get(self.url(path)).bearer_auth(&self.spec.token);
        http::send_json(builder, "Databricks").await
    }

    /// Submits `sql` and polls until it leaves the pending states.
    async fn run(&self, sql: &str) -> Result<StatementResponse> {
        let request = StatementRequest {
            statement: sql,
            warehouse_id: &self.spec.warehouse_id,
            catalog: self.spec.catalog.as_deref(),
            wait_timeout: WAIT_TIMEOUT,
            on_wait_timeout: "CONTINUE",
            disposition: "INLINE",
            format: "JSON_ARRAY",
        };
        let builder = self
            .client
            .post(self.url(STATEMENTS_PATH))
            .bearer_auth(&self.spec.token)
            .json(&request);
        let mut response: StatementResponse = http::send_json(builder, "Databricks").await?;

        while response.status.state.is_pending() {
            debug!("Waiting for Databricks statement {}", response.statement_id);
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            response = self
                .get(&format!("{}/{}", STATEMENTS_PATH, response.statement_id))
                .await?;
        }

        response.check()?;
        Ok(response)
    }
}

#[async_trait]
impl Connection for DatabricksConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::Databricks
    }

    async fn query_pages(
        &mut self,
        sql: &str,
        page_size: Option<usize>,
        on_page: PageSink<'_>,
    ) -> Result<()> {
        let response = self.run(sql).await?;
        let columns = response
            .manifest
            .as_ref()
            .map(|m| m.schema.columns.clone())
            .unwrap_or_default();

        let mut buffer = PageBuffer::new(page_size);
        buffer.set_columns(columns_of(&columns));

        let mut chunk = response.result;
        while let Some(data) = chunk {
            for row in &data.data_array {
                buffer.push(decode_row(&columns, row), &mut *on_page);
            }
            chunk = match &data.next_chunk_internal_link {
                Some(link) => {
                    let builder = self.client.get(self.url(link)).bearer_auth(&self.spec.token);
                    Some(http::send_json::<ResultData>(builder, "Databricks").await?)
                }
                None => None,
            };
        }

        buffer.finish(on_page);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<ExecResult> {
        let response = self.run(sql).await?;
        Ok(ExecResult {
            rows_affected: response.rows_affected(),
        })
    }

    async fn write_table(
        &mut self,
        _table: &Table,
        _schema: &str,
        _name: &str,
        _chunk_size: usize,
    ) -> Result<()> {
        Err(ConnectorError::not_implemented(
            "write_table",
            BackendKind::Databricks.as_str(),
        ))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    warehouse_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog: Option<&'a str>,
    wait_timeout: &'a str,
    on_wait_timeout: &'a str,
    disposition: &'a str,
    format: &'a str,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
    manifest: Option<Manifest>,
    result: Option<ResultData>,
}

impl StatementResponse {
    fn check(&self) -> Result<()> {
        match self.status.state {
            StatementState::Succeeded => Ok(()),
            state => {
                let message = self
                    .status
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| format!("statement {:?}", state));
                Err(ConnectorError::query(message))
            }
        }
    }

    /// Reads `num_affected_rows` from a DML result.
    fn rows_affected(&self) -> Option<u64> {
        let index = self
            .manifest
            .as_ref()?
            .schema
            .columns
            .iter()
            .position(|c| c.name == "num_affected_rows")?;
        self.result
            .as_ref()?
            .data_array
            .first()?
            .get(index)?
            .as_deref()?
            .parse()
            .ok()
    }
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: StatementState,
    error: Option<StatementError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum StatementState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Closed,
}

impl StatementState {
    fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Deserialize)]
struct StatementError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: ResultSchema,
}

#[derive(Debug, Deserialize)]
struct ResultSchema {
    #[serde(default)]
    columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnSchema {
    name: String,
    #[serde(default)]
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    #[serde(default)]
    data_array: Vec<Vec<Option<String>>>,
    next_chunk_internal_link: Option<String>,
}

fn columns_of(columns: &[ColumnSchema]) -> Vec<ColumnInfo> {
    columns
        .iter()
        .map(|c| ColumnInfo::new(&c.name, &c.type_name))
        .collect()
}

fn decode_row(columns: &[ColumnSchema], row: &[Option<String>]) -> Row {
    columns
        .iter()
        .enumerate()
        .map(|(i, column)| match row.get(i) {
            Some(Some(text)) => decode_value(&column.type_name, text),
            _ => Value::Null,
        })
        .collect()
}

/// Decodes one cell. `JSON_ARRAY` results carry every value as a string.
fn decode_value(type_name: &str, text: &str) -> Value {
    let parsed = match type_name {
        "BYTE" | "SHORT" | "INT" | "LONG" => text.parse().ok().map(Value::Int),
        "FLOAT" | "DOUBLE" => text.parse().ok().map(Value::Float),
        "BOOLEAN" => text.parse().ok().map(Value::Bool),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::http::testing::FakeApi;
    use pretty_assertions::assert_eq;

    const SUCCEEDED: &str = r#"{
        "statement_id": "01ed-abc",
        "status": {"state": "SUCCEEDED"},
        "manifest": {
            "format": "JSON_ARRAY",
            "schema": {"column_count": 4, "columns": [
                {"name": "id", "type_name": "LONG", "position": 0},
                {"name": "ratio", "type_name": "DOUBLE", "position": 1},
                {"name": "ok", "type_name": "BOOLEAN", "position": 2},
                {"name": "label", "type_name": "STRING", "position": 3}
            ]},
            "total_chunk_count": 2
        },
        "result": {
            "chunk_index": 0,
            "row_count": 2,
            "data_array": [["1", "0.5", "true", "a"], ["2", null, "false", null]],
            "next_chunk_index": 1,
            "next_chunk_internal_link": "/api/2.0/sql/statements/01ed-abc/result/chunks/1"
        }
    }"#;

    #[test]
    fn test_decode_statement_response() {
        let response: StatementResponse = serde_json::from_str(SUCCEEDED).unwrap();
        assert!(response.check().is_ok());

        let columns = response.manifest.as_ref().unwrap().schema.columns.clone();
        let data = response.result.as_ref().unwrap();
        assert_eq!(
            data.next_chunk_internal_link.as_deref(),
            Some("/api/2.0/sql/statements/01ed-abc/result/chunks/1")
        );

        assert_eq!(
            decode_row(&columns, &data.data_array[0]),
            vec![
                Value::Int(1),
                Value::Float(0.5),
                Value::Bool(true),
                Value::from("a")
            ]
        );
        assert_eq!(
            decode_row(&columns, &data.data_array[1]),
            vec![Value::Int(2), Value::Null, Value::Bool(false), Value::Null]
        );
    }

    #[test]
    fn test_failed_statement_is_query_error() {
        let response: StatementResponse = serde_json::from_str(
            r#"{
                "statement_id": "01ed-def",
                "status": {"state": "FAILED", "error": {
                    "error_code": "BAD_REQUEST",
                    "message": "[TABLE_OR_VIEW_NOT_FOUND] nope"
                }}
            }"#,
        )
        .unwrap();
        let err = response.check().unwrap_err();
        assert!(matches!(err, ConnectorError::Query(_)));
        assert!(err.to_string().contains("TABLE_OR_VIEW_NOT_FOUND"));
    }

    #[test]
    fn test_pending_states() {
        assert!(StatementState::Pending.is_pending());
        assert!(StatementState::Running.is_pending());
        assert!(!StatementState::Succeeded.is_pending());
        assert!(!StatementState::Canceled.is_pending());
    }

    #[test]
    fn test_rows_affected() {
        let response: StatementResponse = serde_json::from_str(
            r#"{
                "statement_id": "01ed-ghi",
                "status": {"state": "SUCCEEDED"},
                "manifest": {"schema": {"columns": [
                    {"name": "num_affected_rows", "type_name": "LONG"},
                    {"name": "num_inserted_rows", "type_name": "LONG"}
                ]}},
                "result": {"data_array": [["3", "3"]]}
            }"#,
        )
        .unwrap();
        assert_eq!(response.rows_affected(), Some(3));
    }

    #[test]
    fn test_request_serialization() {
        let request = StatementRequest {
            statement: "select 1",
            warehouse_id: "abc123",
            catalog: None,
            wait_timeout: WAIT_TIMEOUT,
            on_wait_timeout: "CONTINUE",
            disposition: "INLINE",
            format: "JSON_ARRAY",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["warehouse_id"], "abc123");
        assert!(json.get("catalog").is_none());
    }

    #[tokio::test]
    async fn test_query_follows_chunk_links_and_repages() {
        let chunk_link = |i: usize| format!("/api/2.0/sql/statements/s1/result/chunks/{i}");
        let api = FakeApi::serve(vec![
            format!(
                r#"{{"statement_id": "s1", "status": {{"state": "SUCCEEDED"}},
                    "manifest": {{"schema": {{"columns": [{{"name": "n", "type_name": "LONG"}}]}}}},
                    "result": {{"data_array": [["1"], ["2"]], "next_chunk_internal_link": "{}"}}}}"#,
                chunk_link(1)
            ),
            format!(
                r#"{{"data_array": [["3"], ["4"], ["5"]], "next_chunk_internal_link": "{}"}}"#,
                chunk_link(2)
            ),
            r#"{"data_array": [["6"], [null]]}"#.to_string(),
        ])
        .await;

        let engine = DatabricksEngine::new(DatabricksSpec {
            host: api.base_url.clone(),
            http_path: "/sql/1.0/warehouses/abc123".to_string(),
            warehouse_id: "abc123".to_string(),
            catalog: Some("main".to_string()),
            token: "dapi-secret".to_string(),
        })
        .unwrap();
        let mut conn = engine.connect().await.unwrap();

        let mut pages = Vec::new();
        let mut sink = |t: Table| pages.push(t);
        conn.query_pages("select n from t", Some(3), &mut sink).await.unwrap();

        assert_eq!(
            pages.iter().map(Table::row_count).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        let values: Vec<Value> = pages.iter().flat_map(|p| p.rows.clone()).flatten().collect();
        let mut expected: Vec<Value> = (1..=6).map(Value::Int).collect();
        expected.push(Value::Null);
        assert_eq!(values, expected);

        let requests = api.requests();
        assert_eq!(
            requests,
            vec![
                format!("POST {STATEMENTS_PATH} HTTP/1.1"),
                format!("GET {} HTTP/1.1", chunk_link(1)),
                format!("GET {} HTTP/1.1", chunk_link(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_write_table_not_implemented() {
        let engine = DatabricksEngine::new(DatabricksSpec {
            host: "https://adb-123.azuredatabricks.net".to_string(),
            http_path: "/sql/1.0/warehouses/abc123".to_string(),
            warehouse_id: "abc123".to_string(),
            catalog: None,
            token: "dapi-secret".to_string(),
        })
        .unwrap();
        let mut conn = engine.connect().await.ok().unwrap();
        let err = conn.write_table(&Table::new(), "s", "t", 10).await.unwrap_err();
        assert!(matches!(err, ConnectorError::NotImplemented(_)));
    }
}
