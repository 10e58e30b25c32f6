//! Database abstraction layer for Multicon.
//!
//! A resolved profile is turned into a [`ConnectionSpec`] (pure, no I/O),
//! which is turned into an [`Engine`]: a reusable handle that produces live
//! [`Connection`]s on demand. Each backend lives in its own module.

mod bigquery;
mod credentials;
mod databricks;
mod http;
pub mod introspect;
mod memory;
mod redshift;
mod types;
pub mod write;

pub use bigquery::BigQueryEngine;
pub use databricks::DatabricksEngine;
pub use memory::{MemoryEngine, MemoryStore};
pub use redshift::RedshiftEngine;
pub use types::{ColumnInfo, Row, Table, Value, TRANSPOSED_HEADER};

use crate::config::ConnectionParams;
use crate::error::{ConnectorError, Result};
use crate::tunnel::{SshAuth, TunnelSpec};
use async_trait::async_trait;
use tracing::warn;

/// Loopback address the SSH tunnel listens on.
pub const LOCALHOST: &str = "127.0.0.1";

/// Default Redshift port, also used for both ends of the bastion tunnel.
pub const REDSHIFT_PORT: u16 = 5439;

/// Default SSH port on the bastion server.
pub const SSH_PORT: u16 = 22;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Columnar warehouse reached over the Postgres wire protocol.
    Redshift,
    /// Cloud SQL engine identified by a project id.
    BigQuery,
    /// Spark-based lakehouse reached through a SQL warehouse.
    Databricks,
}

impl BackendKind {
    /// Returns the type tag used in profiles.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redshift => "redshift",
            Self::BigQuery => "bigquery",
            Self::Databricks => "databricks",
        }
    }

    /// Parses a type tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "redshift" => Some(Self::Redshift),
            "bigquery" => Some(Self::BigQuery),
            "databricks" => Some(Self::Databricks),
            _ => None,
        }
    }

    /// Returns true if connections may be routed through a bastion tunnel.
    pub fn supports_tunnel(&self) -> bool {
        matches!(self, Self::Redshift)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a Redshift connection authenticates.
#[derive(Debug, Clone, PartialEq)]
pub enum RedshiftAuth {
    /// Static password from the profile (may be absent for trust auth).
    Password(Option<String>),
    /// Temporary credentials issued through IAM at connect time.
    Iam(IamAuth),
}

/// Parameters for IAM-issued Redshift credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct IamAuth {
    /// Named AWS profile used to request credentials.
    pub profile: String,
    /// Redshift cluster identifier.
    pub cluster_id: String,
    /// Database user the credentials are issued for.
    pub db_user: String,
    /// Database groups joined for the session.
    pub db_groups: Vec<String>,
    /// Create the database user if it does not exist.
    pub auto_create: bool,
}

/// Connection descriptor for the columnar warehouse.
#[derive(Debug, Clone, PartialEq)]
pub struct RedshiftSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub dbname: String,
    pub auth: RedshiftAuth,
    /// Bastion tunnel the connection goes through, if any.
    pub tunnel: Option<TunnelSpec>,
}

impl RedshiftSpec {
    /// Builds the connection URL. IAM auth leaves the password out; it is
    /// filled in when credentials are issued.
    pub fn connection_url(&self) -> Result<String> {
        let mut url = url::Url::parse(&format!(
            "postgres://{}:{}/{}",
            self.host, self.port, self.dbname
        ))
        .map_err(|e| ConnectorError::config(format!("Invalid Redshift address: {e}")))?;

        url.set_username(&self.user)
            .map_err(|_| ConnectorError::config("Invalid Redshift user"))?;

        if let RedshiftAuth::Password(Some(password)) = &self.auth {
            url.set_password(Some(password))
                .map_err(|_| ConnectorError::config("Invalid Redshift password"))?;
        }

        let sslmode = match self.auth {
            RedshiftAuth::Password(_) => "prefer",
            RedshiftAuth::Iam(_) => "require",
        };
        url.query_pairs_mut().append_pair("sslmode", sslmode);

        Ok(url.to_string())
    }

    /// Returns a display-safe description (no password).
    pub fn display_string(&self) -> String {
        format!("{} @ {}:{}", self.dbname, self.host, self.port)
    }
}

/// Connection descriptor for the cloud SQL engine.
#[derive(Debug, Clone, PartialEq)]
pub struct BigQuerySpec {
    pub project: String,
    /// Static OAuth access token. When absent the token is obtained at
    /// connect time from the environment or the gcloud CLI.
    pub token: Option<String>,
}

/// Connection descriptor for the lakehouse.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabricksSpec {
    pub host: String,
    pub http_path: String,
    pub warehouse_id: String,
    pub catalog: Option<String>,
    pub token: String,
}

/// Backend-specific connection descriptor, selected by the type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSpec {
    Redshift(RedshiftSpec),
    BigQuery(BigQuerySpec),
    Databricks(DatabricksSpec),
}

impl ConnectionSpec {
    /// Builds a descriptor from resolved parameters.
    ///
    /// An empty type tag means the profile could not be found; any other
    /// unknown tag is an unsupported backend.
    pub fn from_params(params: &ConnectionParams) -> Result<Self> {
        let Some(tag) = params.text("type") else {
            return Err(ConnectorError::profile_not_found(
                params.profile_name().unwrap_or(crate::config::DEFAULT_KEY),
            ));
        };

        let kind =
            BackendKind::parse(&tag).ok_or_else(|| ConnectorError::unsupported_backend(tag))?;

        if params.flag("use_bastion") && !kind.supports_tunnel() {
            warn!("Bastion tunnels are not supported for {}, connecting directly", kind);
        }

        match kind {
            BackendKind::Redshift => redshift_spec(params).map(Self::Redshift),
            BackendKind::BigQuery => Ok(Self::BigQuery(BigQuerySpec {
                project: required(params, "project")?,
                token: params.text("token"),
            })),
            BackendKind::Databricks => databricks_spec(params).map(Self::Databricks),
        }
    }

    /// Returns the backend this descriptor targets.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Redshift(_) => BackendKind::Redshift,
            Self::BigQuery(_) => BackendKind::BigQuery,
            Self::Databricks(_) => BackendKind::Databricks,
        }
    }

    /// Returns the tunnel this descriptor needs, if any.
    pub fn tunnel(&self) -> Option<&TunnelSpec> {
        match self {
            Self::Redshift(spec) => spec.tunnel.as_ref(),
            _ => None,
        }
    }

    /// Returns a display-safe description (no secrets).
    pub fn display_string(&self) -> String {
        match self {
            Self::Redshift(spec) => spec.display_string(),
            Self::BigQuery(spec) => format!("bigquery://{}", spec.project),
            Self::Databricks(spec) => format!("{}{}", spec.host, spec.http_path),
        }
    }
}

fn required(params: &ConnectionParams, key: &str) -> Result<String> {
    params.text(key).ok_or_else(|| {
        ConnectorError::config(format!(
            "Missing required parameter '{}' in profile '{}'",
            key,
            params.profile_name().unwrap_or("?")
        ))
    })
}

fn redshift_spec(params: &ConnectionParams) -> Result<RedshiftSpec> {
    let port = params.port("port")?.unwrap_or(REDSHIFT_PORT);
    let user = required(params, "user")?;
    let dbname = required(params, "dbname")?;

    let tunnel = if params.flag("use_bastion") {
        Some(tunnel_spec(params, port)?)
    } else {
        None
    };

    let host = match tunnel {
        Some(_) => LOCALHOST.to_string(),
        None => required(params, "host")?,
    };

    let auth = match params.text("iam_profile") {
        Some(profile) => RedshiftAuth::Iam(IamAuth {
            profile,
            cluster_id: required(params, "cluster_id")?,
            db_user: params.text("db_user").unwrap_or_else(|| user.clone()),
            db_groups: params.list("db_groups"),
            auto_create: params.flag("auto_create"),
        }),
        None => RedshiftAuth::Password(params.text("pass")),
    };

    Ok(RedshiftSpec {
        host,
        port,
        user,
        dbname,
        auth,
        tunnel,
    })
}

fn tunnel_spec(params: &ConnectionParams, port: u16) -> Result<TunnelSpec> {
    let server = required(params, "bastion_server")?;
    let (server, server_port) = match server.rsplit_once(':') {
        Some((host, p)) => {
            let p = p.parse::<u16>().map_err(|_| {
                ConnectorError::config(format!("Invalid bastion server address: {server}"))
            })?;
            (host.to_string(), p)
        }
        None => (server, SSH_PORT),
    };

    let user = params
        .text("bastion_user")
        .or_else(|| std::env::var("USER").ok())
        .ok_or_else(|| ConnectorError::config("Missing required parameter 'bastion_user'"))?;

    let auth = match params.text("bastion_key") {
        Some(path) => SshAuth::KeyFile {
            path: path.into(),
            passphrase: params.text("bastion_key_passphrase"),
        },
        None => SshAuth::Agent,
    };

    Ok(TunnelSpec {
        server,
        server_port,
        user,
        remote_host: required(params, "bastion_host")?,
        remote_port: port,
        local_port: port,
        auth,
    })
}

fn databricks_spec(params: &ConnectionParams) -> Result<DatabricksSpec> {
    let host = required(params, "host")?;
    let host = if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    };

    let http_path = required(params, "http_path")?;
    let warehouse_id = http_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            ConnectorError::config(format!("Cannot find a warehouse id in '{http_path}'"))
        })?;

    Ok(DatabricksSpec {
        host,
        http_path,
        warehouse_id,
        catalog: params.text("catalog"),
        token: required(params, "token")?,
    })
}

/// Creates the engine for a descriptor. Performs no network I/O.
pub fn engine_for(spec: &ConnectionSpec) -> Result<Box<dyn Engine>> {
    Ok(match spec {
        ConnectionSpec::Redshift(spec) => Box::new(RedshiftEngine::new(spec.clone())?),
        ConnectionSpec::BigQuery(spec) => Box::new(BigQueryEngine::new(spec.clone())?),
        ConnectionSpec::Databricks(spec) => Box::new(DatabricksEngine::new(spec.clone())?),
    })
}

/// Outcome of a raw statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Rows touched by DML, when the backend reports it.
    pub rows_affected: Option<u64>,
}

/// Callback receiving result pages in order.
pub type PageSink<'a> = &'a mut (dyn FnMut(Table) + Send);

/// A reusable handle capable of producing live connections.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Returns the backend this engine talks to.
    fn kind(&self) -> BackendKind;

    /// Opens a live connection.
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// A live connection, used for one public call and then closed.
#[async_trait]
pub trait Connection: Send {
    /// Returns the backend this connection talks to.
    fn kind(&self) -> BackendKind;

    /// Runs a statement and hands its rows to `on_page` in pages of
    /// `page_size` rows (a single page when `None`).
    ///
    /// At least one page is always delivered so that column metadata is
    /// available for empty results.
    async fn query_pages(
        &mut self,
        sql: &str,
        page_size: Option<usize>,
        on_page: PageSink<'_>,
    ) -> Result<()>;

    /// Runs a statement for its side effects.
    async fn execute(&mut self, sql: &str) -> Result<ExecResult>;

    /// Replaces `schema.name` with the contents of `table`.
    async fn write_table(
        &mut self,
        table: &Table,
        schema: &str,
        name: &str,
        chunk_size: usize,
    ) -> Result<()> {
        for statement in write::write_statements(self.kind(), table, schema, name, chunk_size)? {
            self.execute(&statement).await?;
        }
        Ok(())
    }

    /// Closes the connection.
    async fn close(&mut self) -> Result<()>;
}

/// Re-chunks rows arriving in arbitrary batches into pages of a fixed size.
#[derive(Debug)]
pub struct PageBuffer {
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
    page_size: Option<usize>,
    emitted: bool,
}

impl PageBuffer {
    /// Creates a buffer. A page size of `None` or zero yields a single page.
    pub fn new(page_size: Option<usize>) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            page_size: page_size.filter(|size| *size > 0),
            emitted: false,
        }
    }

    /// Sets the column metadata attached to every page.
    pub fn set_columns(&mut self, columns: Vec<ColumnInfo>) {
        self.columns = columns;
    }

    /// Returns true once column metadata has been set.
    pub fn has_columns(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Adds a row, emitting a page when the buffer is full.
    pub fn push(&mut self, row: Row, on_page: PageSink<'_>) {
        self.rows.push(row);
        if self.page_size.is_some_and(|size| self.rows.len() >= size) {
            self.flush(on_page);
        }
    }

    /// Emits the remaining rows. Emits an empty page if nothing was emitted yet.
    pub fn finish(mut self, on_page: PageSink<'_>) {
        if !self.rows.is_empty() || !self.emitted {
            self.flush(on_page);
        }
    }

    fn flush(&mut self, on_page: PageSink<'_>) {
        let rows = std::mem::take(&mut self.rows);
        on_page(Table::with_data(self.columns.clone(), rows));
        self.emitted = true;
    }
}
