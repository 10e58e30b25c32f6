//! Profile resolution and connection building against a fixture document.

use std::collections::HashMap;
use std::path::PathBuf;

use multicon::backend::{BackendKind, ConnectionSpec, RedshiftAuth};
use multicon::config::{self, ConnectionParams};
use multicon::error::ConnectorError;
use multicon::tunnel::SshAuth;

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("config.yml")
}

fn resolve(name: Option<&str>) -> multicon::error::Result<ConnectionParams> {
    config::resolve_with_env(name, Some(&fixture()), |_| None)
}

fn resolve_with(name: Option<&str>, env: &[(&str, &str)]) -> ConnectionParams {
    let env: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    config::resolve_with_env(name, Some(&fixture()), |var| env.get(var).cloned()).unwrap()
}

#[test]
fn test_every_profile_keeps_its_type() {
    for (name, tag) in [
        ("totally-real-gcp", "bigquery"),
        ("warehouse", "redshift"),
        ("lakehouse", "databricks"),
        ("broken", "oracle"),
    ] {
        let params = resolve(Some(name)).unwrap();
        assert_eq!(params.text("type").as_deref(), Some(tag), "profile {name}");
        assert_eq!(params.profile_name(), Some(name));
    }
}

#[test]
fn test_default_matches_explicit_name() {
    let implicit = resolve(None).unwrap();
    let explicit = resolve(Some("totally-real-gcp")).unwrap();
    assert_eq!(implicit, explicit);
    assert_eq!(implicit.text("type").as_deref(), Some("bigquery"));
}

#[test]
fn test_missing_profile_raises() {
    let err = resolve(Some("totally-exists")).unwrap_err();
    assert!(matches!(err, ConnectorError::ProfileNotFound(ref name) if name == "totally-exists"));
}

#[test]
fn test_missing_document_gives_empty_params_then_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.yml");

    let params = config::resolve_with_env(Some("anything"), Some(&path), |_| None).unwrap();
    assert!(params.is_empty());
    assert!(!params.flag("use_bastion"));

    let err = ConnectionSpec::from_params(&params).unwrap_err();
    assert!(matches!(err, ConnectorError::ProfileNotFound(_)));
}

#[test]
fn test_env_override_wins() {
    let params = resolve_with(
        Some("warehouse"),
        &[("MULTICON_HOST", "override.example.com"), ("MULTICON_PORT", "5440")],
    );
    let ConnectionSpec::Redshift(spec) = ConnectionSpec::from_params(&params).unwrap() else {
        panic!("expected redshift");
    };
    assert_eq!(spec.host, "override.example.com");
    assert_eq!(spec.port, 5440);
}

#[test]
fn test_unsupported_backend() {
    let params = resolve(Some("broken")).unwrap();
    let err = ConnectionSpec::from_params(&params).unwrap_err();
    assert!(matches!(err, ConnectorError::UnsupportedBackend(ref tag) if tag == "oracle"));
}

#[test]
fn test_iam_profile_switches_auth() {
    let params = resolve(Some("warehouse-iam")).unwrap();
    let ConnectionSpec::Redshift(spec) = ConnectionSpec::from_params(&params).unwrap() else {
        panic!("expected redshift");
    };
    let RedshiftAuth::Iam(iam) = &spec.auth else {
        panic!("expected IAM auth");
    };
    assert_eq!(iam.profile, "analytics");
    assert_eq!(iam.cluster_id, "example");
    assert_eq!(iam.db_user, "analyst");
    assert_eq!(iam.db_groups, vec!["readers", "writers"]);
    assert!(iam.auto_create);
    assert!(spec.connection_url().unwrap().ends_with("sslmode=require"));
}

#[test]
fn test_bastion_profile_goes_through_loopback() {
    let params = resolve(Some("warehouse-bastion")).unwrap();
    let spec = ConnectionSpec::from_params(&params).unwrap();
    assert_eq!(spec.kind(), BackendKind::Redshift);

    let tunnel = spec.tunnel().expect("tunnel").clone();
    assert_eq!(tunnel.server, "bastion.example.com");
    assert_eq!(tunnel.server_port, 2222);
    assert_eq!(tunnel.user, "jump");
    assert_eq!(tunnel.remote_port, 5439);
    assert_eq!(tunnel.local_port, 5439);
    assert_eq!(tunnel.auth, SshAuth::Agent);

    let ConnectionSpec::Redshift(redshift) = spec else {
        panic!("expected redshift");
    };
    assert_eq!(redshift.host, "127.0.0.1");
}

#[test]
fn test_bastion_flag_from_env_is_truthy() {
    let params = resolve_with(Some("warehouse"), &[("MULTICON_USE_BASTION", "yes")]);
    assert!(params.flag("use_bastion"));

    let params = resolve_with(Some("warehouse"), &[("MULTICON_USE_BASTION", "0")]);
    assert!(!params.flag("use_bastion"));
}

#[test]
fn test_lakehouse_spec() {
    let params = resolve(Some("lakehouse")).unwrap();
    let ConnectionSpec::Databricks(spec) = ConnectionSpec::from_params(&params).unwrap() else {
        panic!("expected databricks");
    };
    assert_eq!(spec.host, "https://dbc-1234.cloud.databricks.com");
    assert_eq!(spec.warehouse_id, "abc123");
    assert_eq!(spec.catalog.as_deref(), Some("main"));
    assert!(spec_has_no_tunnel(&params));
}

fn spec_has_no_tunnel(params: &ConnectionParams) -> bool {
    ConnectionSpec::from_params(params)
        .map(|spec| spec.tunnel().is_none())
        .unwrap_or(false)
}
