//! Session behaviour against the in-memory engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use multicon::backend::{BackendKind, ColumnInfo, MemoryEngine, MemoryStore, Table, Value};
use multicon::config::ConnectionParams;
use multicon::error::ConnectorError;
use multicon::session::Session;
use multicon::tunnel::{Forwarder, TunnelError, TunnelManager, TunnelState};
use pretty_assertions::assert_eq;

/// Counts starts and stops; optionally reports the port as taken.
struct CountingForwarder {
    counts: Arc<Mutex<(usize, usize)>>,
    port_taken: bool,
}

#[async_trait]
impl Forwarder for CountingForwarder {
    async fn start(&mut self) -> Result<(), TunnelError> {
        self.counts.lock().unwrap().0 += 1;
        if self.port_taken {
            return Err(TunnelError::PortInUse(self.local_port()));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TunnelError> {
        self.counts.lock().unwrap().1 += 1;
        Ok(())
    }

    fn local_port(&self) -> u16 {
        5439
    }
}

fn orders(n: i64) -> Table {
    Table::with_data(
        vec![
            ColumnInfo::new("order_id", "int8"),
            ColumnInfo::new("amount", "float8"),
            ColumnInfo::new("note", "text"),
        ],
        (0..n)
            .map(|i| {
                vec![
                    Value::Int(i),
                    Value::Float(i as f64 * 1.5),
                    if i % 3 == 0 {
                        Value::Null
                    } else {
                        Value::String(format!("order {i}"))
                    },
                ]
            })
            .collect(),
    )
}

fn session(store: &MemoryStore, tunnel: TunnelManager) -> Session {
    Session::with_engine(
        ConnectionParams::empty(Some("memory".to_string())),
        Box::new(MemoryEngine::new(store.clone())),
        tunnel,
    )
}

fn row_ids(table: &Table) -> Vec<i64> {
    let mut ids: Vec<i64> = table
        .column_values("order_id")
        .unwrap()
        .into_iter()
        .filter_map(|v| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        })
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_chunked_query_matches_unchunked() {
    let store = MemoryStore::new();
    store.put_table("sales.orders", orders(103));
    let mut session = session(&store, TunnelManager::disabled());

    let whole = session.query("select * from sales.orders", None).await.unwrap();
    for k in [1, 2, 10, 102, 103, 104, 10_000] {
        let chunked = session
            .query("select * from sales.orders", Some(k))
            .await
            .unwrap();
        assert_eq!(chunked.row_count(), 103, "k = {k}");
        assert_eq!(chunked.columns, whole.columns, "k = {k}");
        assert_eq!(row_ids(&chunked), row_ids(&whole), "k = {k}");
    }
}

#[tokio::test]
async fn test_write_then_read_back() {
    let store = MemoryStore::new();
    let mut session = session(&store, TunnelManager::disabled());

    session.write_table(&orders(10), "sales", "orders", 3).await.unwrap();
    session.write_table(&orders(4), "sales", "orders", 3).await.unwrap();

    let table = session.query("select * from sales.orders", None).await.unwrap();
    assert_eq!(table.rows, orders(4).rows);
    assert_eq!(table.column_names(), vec!["order_id", "amount", "note"]);
    assert_eq!(table.columns[1].data_type, "double precision");
}

#[tokio::test]
async fn test_databricks_write_not_implemented() {
    let store = MemoryStore::new();
    let mut session = Session::with_engine(
        ConnectionParams::empty(None),
        Box::new(MemoryEngine::new(store.clone()).with_kind(BackendKind::Databricks)),
        TunnelManager::disabled(),
    );

    let err = session
        .write_table(&orders(1), "sales", "orders", 10)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::NotImplemented(_)));
    assert_eq!(store.connects(), store.closes());
}

#[tokio::test]
async fn test_tunnel_started_and_stopped_around_every_call() {
    let store = MemoryStore::new();
    store.put_table("sales.orders", orders(3));
    let counts = Arc::new(Mutex::new((0, 0)));
    let tunnel = TunnelManager::probe(Box::new(CountingForwarder {
        counts: counts.clone(),
        port_taken: false,
    }))
    .await;
    let mut session = session(&store, tunnel);

    session.query("select * from sales.orders", None).await.unwrap();
    session.query("select * from missing.table", None).await.unwrap_err();
    session.peek("sales.orders", 2).await.unwrap();

    // probe + three calls
    assert_eq!(*counts.lock().unwrap(), (4, 4));
    assert_eq!(session.tunnel_state(), TunnelState::Idle);

    session.shutdown().await;
    assert_eq!(session.tunnel_state(), TunnelState::Closed);
    session.query("select * from sales.orders", None).await.unwrap();
    assert_eq!(*counts.lock().unwrap(), (4, 4));
}

#[tokio::test]
async fn test_taken_port_is_not_fatal() {
    let store = MemoryStore::new();
    store.put_table("sales.orders", orders(3));
    let counts = Arc::new(Mutex::new((0, 0)));
    let tunnel = TunnelManager::probe(Box::new(CountingForwarder {
        counts: counts.clone(),
        port_taken: true,
    }))
    .await;
    assert_eq!(tunnel.state(), TunnelState::Degraded);
    let mut session = session(&store, tunnel);

    let table = session.query("select * from sales.orders", None).await.unwrap();
    assert_eq!(table.row_count(), 3);
    assert_eq!(*counts.lock().unwrap(), (2, 0));
}

#[tokio::test]
async fn test_peek_schema_lists_only_tables_with_rows() {
    let store = MemoryStore::new();
    store.set_result(
        "select table_name, table_type from information_schema.tables t \
         where t.table_schema = 'sales' order by t.table_name",
        Table::with_data(
            vec![
                ColumnInfo::new("table_name", "text"),
                ColumnInfo::new("table_type", "text"),
            ],
            vec![
                vec![Value::from("archive"), Value::from("BASE TABLE")],
                vec![Value::from("orders"), Value::from("BASE TABLE")],
            ],
        ),
    );
    store.put_table("sales.archive", orders(0));
    store.put_table("sales.orders", orders(7));
    let mut session = session(&store, TunnelManager::disabled());

    let peeked = session.peek_schema("sales", 3).await.unwrap();
    let names: Vec<&str> = peeked.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["orders"]);
    assert_eq!(peeked[0].data.row_count(), 3);
    assert_eq!(peeked[0].data.column_names(), vec!["column", "0", "1", "2"]);
}

#[tokio::test]
async fn test_change_to_missing_profile_keeps_state() {
    let store = MemoryStore::new();
    store.put_table("sales.orders", orders(2));
    let mut session = session(&store, TunnelManager::disabled());
    let fixture = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("config.yml");

    let err = session
        .change(Some("totally-exists"), Some(&fixture))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::ProfileNotFound(_)));

    let table = session.query("select * from sales.orders", None).await.unwrap();
    assert_eq!(table.row_count(), 2);
    assert_eq!(session.profile_name(), Some("memory"));
}

#[tokio::test]
async fn test_change_to_default_profile() {
    let store = MemoryStore::new();
    let mut session = session(&store, TunnelManager::disabled());
    let fixture = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("config.yml");

    session.change(None, Some(&fixture)).await.unwrap();
    assert_eq!(session.profile_name(), Some("totally-real-gcp"));
    assert_eq!(session.kind(), BackendKind::BigQuery);
}
