//! Session lifecycle and query execution.
//!
//! A [`Session`] owns everything derived from one profile: the resolved
//! parameters, the engine that makes connections, and the optional SSH
//! tunnel. Each public call opens a connection, does its work, and releases
//! the connection and tunnel again before returning.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::backend::introspect::{self, ColumnsQuery};
use crate::backend::{self, BackendKind, Connection, ConnectionSpec, Engine, ExecResult, Table};
use crate::config::{self, ConnectionParams};
use crate::error::{ConnectorError, Result};
use crate::tunnel::{SshForwarder, TunnelManager, TunnelState};

/// Page size used by `query` and the introspection helpers.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Rows shown per table by `peek` and `peek_schema`.
pub const DEFAULT_PEEK_LIMIT: usize = 3;

/// One table's preview from [`Session::peek_schema`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeekedTable {
    /// Table name, without the schema.
    pub name: String,
    /// Transposed preview rows.
    pub data: Table,
}

/// State derived from a single profile.
pub struct Session {
    params: ConnectionParams,
    spec: Option<ConnectionSpec>,
    engine: Box<dyn Engine>,
    tunnel: TunnelManager,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("profile", &self.params.profile_name())
            .field("kind", &self.engine.kind())
            .field("tunnel", &self.tunnel.state())
            .finish()
    }
}

impl Session {
    /// Resolves `name` from the document at `path` and prepares a session.
    ///
    /// Builds the engine without touching the network. When the profile asks
    /// for a bastion, the tunnel is probed once here.
    pub async fn open(name: Option<&str>, path: Option<&Path>) -> Result<Self> {
        let params = config::resolve(name, path)?;
        Self::from_params(params).await
    }

    /// Prepares a session from already-resolved parameters.
    pub async fn from_params(params: ConnectionParams) -> Result<Self> {
        let spec = ConnectionSpec::from_params(&params)?;
        let engine = backend::engine_for(&spec)?;

        let tunnel = match spec.tunnel() {
            Some(tunnel_spec) => {
                let forwarder = SshForwarder::new(tunnel_spec.clone());
                TunnelManager::probe(Box::new(forwarder)).await
            }
            None => TunnelManager::disabled(),
        };

        info!(
            "Using profile '{}': {}",
            params.profile_name().unwrap_or("default"),
            spec.display_string()
        );

        Ok(Self {
            params,
            spec: Some(spec),
            engine,
            tunnel,
        })
    }

    /// Creates a session around an existing engine and tunnel.
    pub fn with_engine(
        params: ConnectionParams,
        engine: Box<dyn Engine>,
        tunnel: TunnelManager,
    ) -> Self {
        Self {
            params,
            spec: None,
            engine,
            tunnel,
        }
    }

    /// Switches to another profile.
    ///
    /// Nothing changes if the new profile cannot be resolved or built. On
    /// success the old tunnel is shut down and the old engine dropped.
    pub async fn change(&mut self, name: Option<&str>, path: Option<&Path>) -> Result<()> {
        let next = Self::open(name, path).await?;
        let mut previous = std::mem::replace(self, next);
        previous.tunnel.shutdown().await;
        Ok(())
    }

    /// Returns the name of the active profile.
    pub fn profile_name(&self) -> Option<&str> {
        self.params.profile_name()
    }

    /// Returns the resolved parameters.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Returns the connection descriptor, unless the engine was injected.
    pub fn spec(&self) -> Option<&ConnectionSpec> {
        self.spec.as_ref()
    }

    /// Returns the backend of the active profile.
    pub fn kind(&self) -> BackendKind {
        self.engine.kind()
    }

    /// Returns the current tunnel state.
    pub fn tunnel_state(&self) -> TunnelState {
        self.tunnel.state()
    }

    /// Stops the tunnel for good. The session still works without it.
    pub async fn shutdown(&mut self) {
        self.tunnel.shutdown().await;
    }

    /// Runs `sql` and collects every row into one table.
    ///
    /// With a chunk size, each page is placed in front of the pages fetched
    /// before it. `None` or zero reads the result in one pass.
    pub async fn query(&mut self, sql: &str, chunk_size: Option<usize>) -> Result<Table> {
        let mut conn = self.acquire().await?;
        let result = collect(conn.as_mut(), sql, chunk_size).await;
        self.release(conn).await;
        result
    }

    /// Runs a statement for its side effects.
    pub async fn query_raw(&mut self, sql: &str) -> Result<ExecResult> {
        let mut conn = self.acquire().await?;
        debug!("Executing: {}", sql);
        let result = conn.execute(sql).await;
        self.release(conn).await;
        result
    }

    /// Lists the schemas of the active database.
    pub async fn list_schemas(&mut self) -> Result<Table> {
        let sql = introspect::list_schemas_sql(self.kind());
        self.query(&sql, Some(DEFAULT_CHUNK_SIZE)).await
    }

    /// Lists the tables of `schema`. The result has a `table_name` column.
    pub async fn list_tables(&mut self, schema: &str) -> Result<Table> {
        let sql = introspect::list_tables_sql(self.kind(), schema);
        self.query(&sql, Some(DEFAULT_CHUNK_SIZE)).await
    }

    /// Lists the columns of every table and view in `schema`.
    pub async fn list_columns(&mut self, schema: &str) -> Result<Table> {
        let plan = introspect::list_columns_sql(self.kind(), schema);
        let mut conn = self.acquire().await?;
        let result = collect_columns(conn.as_mut(), &plan, schema).await;
        self.release(conn).await;
        result
    }

    /// Replaces `schema.name` with `table`, inserting `chunk_size` rows per statement.
    pub async fn write_table(
        &mut self,
        table: &Table,
        schema: &str,
        name: &str,
        chunk_size: usize,
    ) -> Result<()> {
        let mut conn = self.acquire().await?;
        info!(
            "Writing {} rows to {}.{}",
            table.row_count(),
            schema,
            name
        );
        let result = conn.write_table(table, schema, name, chunk_size).await;
        self.release(conn).await;
        result
    }

    /// Returns the first `limit` rows of `table`, transposed.
    pub async fn peek(&mut self, table: &str, limit: usize) -> Result<Table> {
        Ok(self.peek_rows(table, limit).await?.transpose())
    }

    /// Peeks every table in `schema`, skipping tables without rows.
    pub async fn peek_schema(&mut self, schema: &str, limit: usize) -> Result<Vec<PeekedTable>> {
        let tables = self.list_tables(schema).await?;
        let names: Vec<String> = tables
            .column_values("table_name")
            .ok_or_else(|| ConnectorError::query("Table listing has no table_name column"))?
            .into_iter()
            .map(|value| value.to_display_string())
            .collect();

        let mut peeked = Vec::new();
        for name in names {
            let rows = self.peek_rows(&format!("{schema}.{name}"), limit).await?;
            if rows.is_empty() {
                debug!("Skipping empty table {}.{}", schema, name);
                continue;
            }
            peeked.push(PeekedTable {
                name,
                data: rows.transpose(),
            });
        }
        Ok(peeked)
    }

    async fn peek_rows(&mut self, table: &str, limit: usize) -> Result<Table> {
        let sql = format!("select * from {table} limit {limit}");
        self.query(&sql, Some(DEFAULT_CHUNK_SIZE)).await
    }

    /// Opens the tunnel (if any) and a connection. The tunnel is closed
    /// again when connecting fails.
    async fn acquire(&mut self) -> Result<Box<dyn Connection>> {
        self.tunnel.open().await;
        match self.engine.connect().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.tunnel.close().await;
                Err(e)
            }
        }
    }

    async fn release(&mut self, mut conn: Box<dyn Connection>) {
        if let Err(e) = conn.close().await {
            warn!("Failed to close connection: {}", e);
        }
        self.tunnel.close().await;
    }
}

async fn collect(conn: &mut dyn Connection, sql: &str, chunk_size: Option<usize>) -> Result<Table> {
    debug!("Executing: {}", sql);
    let mut table = Table::new();
    let mut pages = 0usize;
    let mut on_page = |page: Table| {
        pages += 1;
        table.prepend(page);
    };
    conn.query_pages(sql, chunk_size.filter(|size| *size > 0), &mut on_page)
        .await?;
    debug!("Fetched {} rows in {} pages", table.row_count(), pages);
    Ok(table)
}

async fn collect_columns(
    conn: &mut dyn Connection,
    plan: &ColumnsQuery,
    schema: &str,
) -> Result<Table> {
    let mut columns = collect(conn, &plan.columns, Some(DEFAULT_CHUNK_SIZE)).await?;
    if let Some(sql) = &plan.late_binding {
        let packed = collect(conn, sql, Some(DEFAULT_CHUNK_SIZE)).await?;
        columns.append(introspect::unpack_late_binding(&packed, schema)?);
    }
    Ok(columns)
}
