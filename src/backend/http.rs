//! JSON-over-HTTPS plumbing shared by the REST-based backends.

use crate::error::{ConnectorError, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Maximum number of retry attempts for transient errors.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Creates an HTTP client with the default timeout.
pub fn client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()
        .map_err(|e| ConnectorError::connection(format!("Failed to create HTTP client: {}", e)))
}

/// Sends `request` and decodes a JSON response, retrying transient failures.
///
/// `service` names the remote API in error messages.
pub async fn send_json<T: DeserializeOwned>(request: RequestBuilder, service: &str) -> Result<T> {
    let mut last_error = None;
    let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

    for attempt in 1..=MAX_RETRY_ATTEMPTS {
        let Some(attempt_request) = request.try_clone() else {
            return Err(ConnectorError::internal("HTTP request body cannot be retried"));
        };
        debug!("{} request attempt {} of {}", service, attempt, MAX_RETRY_ATTEMPTS);

        let retryable = match attempt_request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.map_err(|e| {
                    ConnectorError::connection(format!("Failed to read {} response: {}", service, e))
                })?;

                if status.is_success() {
                    return serde_json::from_str(&body).map_err(|e| {
                        ConnectorError::query(format!("Failed to parse {} response: {}", service, e))
                    });
                }

                let (error, retryable) = parse_error(status, &body, service);
                last_error = Some(error);
                retryable
            }
            Err(e) => {
                let retryable = e.is_timeout() || e.is_connect();
                last_error = Some(if e.is_timeout() {
                    ConnectorError::connection(format!("{} request timed out", service))
                } else if e.is_connect() {
                    ConnectorError::connection(format!(
                        "Failed to connect to {}. Check your network.",
                        service
                    ))
                } else {
                    ConnectorError::connection(format!("{} request failed: {}", service, e))
                });
                retryable
            }
        };

        if !retryable || attempt >= MAX_RETRY_ATTEMPTS {
            break;
        }

        warn!(
            "{} request failed (attempt {}), retrying in {:?}",
            service, attempt, delay
        );
        tokio::time::sleep(delay).await;
        delay *= 2;
    }

    Err(last_error.unwrap_or_else(|| ConnectorError::internal("No request attempt was made")))
}

/// Maps an error response to a typed error and whether it is worth retrying.
pub fn parse_error(status: StatusCode, body: &str, service: &str) -> (ConnectorError, bool) {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let detail = error_message(body).unwrap_or_else(|| status.to_string());
        return (
            ConnectorError::connection(format!(
                "{} rejected the credentials: {}",
                service, detail
            )),
            false,
        );
    }

    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();

    let error = match error_message(body) {
        Some(message) if status.is_client_error() => {
            ConnectorError::query(format!("{} error: {}", service, message))
        }
        Some(message) => ConnectorError::connection(format!("{} error: {}", service, message)),
        None => ConnectorError::connection(format!("{} error ({}): {}", service, status, body)),
    };

    (error, retryable)
}

/// Extracts the message from the error shapes used by Google and Databricks.
fn error_message(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json.pointer("/error/message")
        .or_else(|| json.get("message"))
        .and_then(|m| m.as_str())
        .map(String::from)
}


/// A local HTTP server answering each request with the next canned JSON body.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    pub struct FakeApi {
        pub base_url: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl FakeApi {
        pub async fn serve(bodies: Vec<String>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));
            let log = requests.clone();

            tokio::spawn(async move {
                for body in bodies {
                    let Ok((mut stream, _)) = listener.accept().await else {
                        return;
                    };
                    let request_line = read_request(&mut stream).await;
                    log.lock().unwrap().push(request_line);

                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                         content-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            });

            Self { base_url, requests }
        }

        /// Request lines received so far, e.g. `GET /path?query HTTP/1.1`.
        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    /// Reads one request, body included, and returns its request line.
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        let mut expected = None;

        loop {
            if expected.is_none() {
                if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&data[..end]);
                    let length = head
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    expected = Some(end + 4 + length);
                }
            }
            if expected.is_some_and(|total| data.len() >= total) {
                break;
            }
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => data.extend_from_slice(&buf[..n]),
            }
        }

        String::from_utf8_lossy(&data)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    }
}
