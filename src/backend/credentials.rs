//! Short-lived credentials obtained from cloud provider CLIs.
//!
//! Redshift IAM passwords come from `aws redshift get-cluster-credentials`;
//! BigQuery access tokens come from the profile, the environment, or
//! `gcloud auth print-access-token`, in that order.

use super::IamAuth;
use crate::error::{ConnectorError, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

/// Environment variable holding a ready-made Google OAuth access token.
pub const GOOGLE_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Temporary database credentials issued through IAM.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterCredentials {
    #[serde(rename = "DbUser")]
    pub db_user: String,
    #[serde(rename = "DbPassword")]
    pub db_password: String,
}

/// Captured output of a CLI invocation.
#[derive(Debug, Clone)]
struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl From<std::process::Output> for CliOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

async fn run_cli(program: &str, args: &[String]) -> Result<CliOutput> {
    debug!("Running {} {}", program, args.first().map(String::as_str).unwrap_or(""));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ConnectorError::connection(format!("Failed to run {program}: {e}")))?;
    Ok(output.into())
}

/// Builds the `aws` arguments requesting cluster credentials.
pub fn cluster_credentials_args(iam: &IamAuth) -> Vec<String> {
    let mut args: Vec<String> = [
        "redshift",
        "get-cluster-credentials",
        "--profile",
        &iam.profile,
        "--cluster-identifier",
        &iam.cluster_id,
        "--db-user",
        &iam.db_user,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if !iam.db_groups.is_empty() {
        args.push("--db-groups".to_string());
        args.extend(iam.db_groups.iter().cloned());
    }
    if iam.auto_create {
        args.push("--auto-create".to_string());
    }
    args.extend(["--output".to_string(), "json".to_string()]);
    args
}

/// Parses the JSON printed by `get-cluster-credentials`.
pub fn parse_cluster_credentials(json: &str) -> Result<ClusterCredentials> {
    serde_json::from_str(json)
        .map_err(|e| ConnectorError::connection(format!("Unexpected IAM credentials output: {e}")))
}

/// Requests temporary Redshift credentials for `iam`.
pub async fn cluster_credentials(iam: &IamAuth) -> Result<ClusterCredentials> {
    let output = run_cli("aws", &cluster_credentials_args(iam)).await?;
    if !output.success {
        return Err(ConnectorError::connection(format!(
            "Failed to get IAM credentials for cluster '{}': {}",
            iam.cluster_id,
            output.stderr.trim()
        )));
    }
    parse_cluster_credentials(&output.stdout)
}

/// Returns an access token for the BigQuery REST API.
pub async fn google_access_token(configured: Option<&str>) -> Result<String> {
    if let Some(token) = configured.filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }
    if let Ok(token) = std::env::var(GOOGLE_TOKEN_ENV) {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }

    let args = ["auth".to_string(), "print-access-token".to_string()];
    let output = run_cli("gcloud", &args).await?;
    let token = output.stdout.trim();
    if !output.success || token.is_empty() {
        return Err(ConnectorError::connection(format!(
            "No Google credentials: set 'token', {} or log in with gcloud ({})",
            GOOGLE_TOKEN_ENV,
            output.stderr.trim()
        )));
    }
    Ok(token.to_string())
}
