//! SSH local port forwarding through a bastion server.

use super::{Forwarder, SshAuth, TunnelError, TunnelSpec};
use crate::backend::LOCALHOST;
use async_trait::async_trait;
use russh::client;
use russh_keys::key::{KeyPair, PublicKey};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type SshHandle = Arc<Mutex<client::Handle<KnownHostsHandler>>>;

/// Key files tried when no key is configured and the agent has nothing usable.
const DEFAULT_KEYS: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Verifies the bastion's host key against `~/.ssh/known_hosts`.
///
/// Unknown hosts are accepted with a warning; a changed key is rejected.
struct KnownHostsHandler {
    host: String,
    port: u16,
}

#[async_trait]
impl client::Handler for KnownHostsHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(
                    "Host key for {}:{} is not in known_hosts, accepting",
                    self.host,
                    self.port
                );
                Ok(true)
            }
            Err(e) => {
                tracing::error!("Host key check failed for {}: {}", self.host, e);
                Ok(false)
            }
        }
    }
}

/// A spawned accept loop and the token that stops it.
struct AcceptLoop {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl AcceptLoop {
    /// Serves `listener` until shut down, handing each accepted stream to
    /// `on_accept` on its own task.
    fn spawn<F, Fut>(listener: TcpListener, on_accept: F) -> Self
    where
        F: Fn(TcpStream, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(run_accept_loop(listener, on_accept, cancel_token.clone()));
        Self { cancel_token, task }
    }

    /// Cancels the loop and waits for it, so the local port is free on return.
    async fn shutdown(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Tunnel accept loop ended abnormally: {}", e);
        }
    }
}

/// Forwards `127.0.0.1:<local_port>` to the remote database through SSH.
///
/// Each `start` binds the local port, connects and authenticates, then spawns
/// an accept loop. `stop` cancels the loop and every forwarded connection, and
/// returns once the local port is released.
pub struct SshForwarder {
    spec: TunnelSpec,
    accept_loop: Option<AcceptLoop>,
}

impl SshForwarder {
    pub fn new(spec: TunnelSpec) -> Self {
        Self {
            spec,
            accept_loop: None,
        }
    }

    async fn connect_ssh(&self) -> Result<client::Handle<KnownHostsHandler>, TunnelError> {
        let config = Arc::new(client::Config::default());
        let handler = KnownHostsHandler {
            host: self.spec.server.clone(),
            port: self.spec.server_port,
        };

        let mut handle = client::connect(
            config,
            (self.spec.server.as_str(), self.spec.server_port),
            handler,
        )
        .await
        .map_err(|e| {
            TunnelError::Ssh(format!(
                "Failed to connect to {}:{}: {}",
                self.spec.server, self.spec.server_port, e
            ))
        })?;

        let user = self.spec.user.as_str();
        let authenticated = match &self.spec.auth {
            SshAuth::KeyFile { path, passphrase } => {
                let key = load_key(path, passphrase.as_deref()).await?;
                authenticate_key(&mut handle, user, key).await?
            }
            SshAuth::Agent => {
                authenticate_with_agent(&mut handle, user).await?
                    || authenticate_default_keys(&mut handle, user).await?
            }
        };

        if !authenticated {
            return Err(TunnelError::Ssh(format!(
                "Authentication failed for {}@{}",
                user, self.spec.server
            )));
        }

        tracing::debug!("SSH authentication successful for {}@{}", user, self.spec.server);
        Ok(handle)
    }
}

impl std::fmt::Debug for SshForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshForwarder")
            .field("server", &self.spec.server)
            .field("local_port", &self.spec.local_port)
            .field("running", &self.accept_loop.is_some())
            .finish()
    }
}

#[async_trait]
impl Forwarder for SshForwarder {
    async fn start(&mut self) -> Result<(), TunnelError> {
        if self.accept_loop.is_some() {
            return Ok(());
        }

        // Bind first: an occupied port usually means another tunnel is serving it
        let port = self.spec.local_port;
        let listener = TcpListener::bind((LOCALHOST, port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => TunnelError::PortInUse(port),
                _ => TunnelError::Io(e),
            })?;

        let handle: SshHandle = Arc::new(Mutex::new(self.connect_ssh().await?));
        let remote_host = self.spec.remote_host.clone();
        let remote_port = self.spec.remote_port;

        let accept_loop = AcceptLoop::spawn(listener, move |local_stream, cancel| {
            let handle = handle.clone();
            let remote_host = remote_host.clone();
            async move {
                if let Err(e) =
                    forward_connection(local_stream, handle, &remote_host, remote_port, cancel)
                        .await
                {
                    tracing::warn!("Tunnel forwarding error: {}", e);
                }
            }
        });

        tracing::info!(
            "SSH tunnel listening on {} -> {}:{} via {}",
            port,
            self.spec.remote_host,
            self.spec.remote_port,
            self.spec.server
        );
        self.accept_loop = Some(accept_loop);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TunnelError> {
        if let Some(accept_loop) = self.accept_loop.take() {
            accept_loop.shutdown().await;
        }
        Ok(())
    }

    fn local_port(&self) -> u16 {
        self.spec.local_port
    }
}

impl Drop for SshForwarder {
    fn drop(&mut self) {
        if let Some(accept_loop) = &self.accept_loop {
            accept_loop.cancel_token.cancel();
        }
    }
}

async fn load_key(path: &Path, passphrase: Option<&str>) -> Result<Arc<KeyPair>, TunnelError> {
    let key_data = tokio::fs::read_to_string(path).await.map_err(|e| {
        TunnelError::Ssh(format!("Failed to read SSH key {}: {}", path.display(), e))
    })?;

    russh_keys::decode_secret_key(&key_data, passphrase)
        .map(Arc::new)
        .map_err(|e| TunnelError::Ssh(format!("Failed to decode SSH key {}: {}", path.display(), e)))
}

async fn authenticate_key(
    handle: &mut client::Handle<KnownHostsHandler>,
    user: &str,
    key: Arc<KeyPair>,
) -> Result<bool, TunnelError> {
    handle
        .authenticate_publickey(user, key)
        .await
        .map_err(|e| TunnelError::Ssh(format!("SSH key authentication failed: {}", e)))
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut client::Handle<KnownHostsHandler>,
    user: &str,
) -> Result<bool, TunnelError> {
    use russh_keys::agent::client::AgentClient;

    let Ok(socket_path) = std::env::var("SSH_AUTH_SOCK") else {
        tracing::debug!("SSH_AUTH_SOCK not set, skipping agent");
        return Ok(false);
    };

    let stream = match tokio::net::UnixStream::connect(&socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Failed to connect to SSH agent: {}", e);
            return Ok(false);
        }
    };

    let mut agent = AgentClient::connect(stream);
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| TunnelError::Ssh(format!("Failed to list SSH agent identities: {}", e)))?;

    for identity in identities {
        let (returned_agent, auth_result) = handle.authenticate_future(user, identity, agent).await;
        agent = returned_agent;
        match auth_result {
            Ok(true) => return Ok(true),
            Ok(false) => continue,
            Err(e) => {
                tracing::debug!("SSH agent auth error: {}, trying next", e);
                continue;
            }
        }
    }

    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut client::Handle<KnownHostsHandler>,
    _user: &str,
) -> Result<bool, TunnelError> {
    Ok(false)
}

async fn authenticate_default_keys(
    handle: &mut client::Handle<KnownHostsHandler>,
    user: &str,
) -> Result<bool, TunnelError> {
    let Some(ssh_dir) = dirs::home_dir().map(|home| home.join(".ssh")) else {
        return Ok(false);
    };

    for name in DEFAULT_KEYS {
        let path = ssh_dir.join(name);
        if !path.exists() {
            continue;
        }
        match load_key(&path, None).await {
            Ok(key) => {
                if authenticate_key(handle, user, key).await? {
                    return Ok(true);
                }
            }
            Err(e) => tracing::debug!("Skipping {}: {}", path.display(), e),
        }
    }

    Ok(false)
}

async fn run_accept_loop<F, Fut>(
    listener: TcpListener,
    on_accept: F,
    cancel_token: CancellationToken,
) where
    F: Fn(TcpStream, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((local_stream, peer_addr)) => {
                        tracing::debug!("New tunnel connection from {}", peer_addr);
                        tokio::spawn(on_accept(local_stream, cancel_token.clone()));
                    }
                    Err(e) => tracing::error!("Failed to accept tunnel connection: {}", e),
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}

async fn forward_connection(
    mut local_stream: TcpStream,
    handle: SshHandle,
    remote_host: &str,
    remote_port: u16,
    cancel_token: CancellationToken,
) -> Result<(), TunnelError> {
    let channel = {
        let handle = handle.lock().await;
        handle
            .channel_open_direct_tcpip(remote_host, remote_port as u32, LOCALHOST, 0)
            .await
            .map_err(|e| TunnelError::Ssh(format!("Failed to open SSH channel: {}", e)))?
    };

    let mut channel = channel.into_stream();
    let mut buf_local = [0u8; 8192];
    let mut buf_remote = [0u8; 8192];

    loop {
        tokio::select! {
            n = local_stream.read(&mut buf_local) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if channel.write_all(&buf_local[..n]).await.is_err() {
                        break;
                    }
                }
            },
            n = channel.read(&mut buf_remote) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if local_stream.write_all(&buf_remote[..n]).await.is_err() {
                        break;
                    }
                }
            },
            _ = cancel_token.cancelled() => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(port: u16) -> TunnelSpec {
        TunnelSpec {
            server: "bastion.invalid".to_string(),
            server_port: 22,
            user: "ec2-user".to_string(),
            remote_host: "private.redshift.internal".to_string(),
            remote_port: port,
            local_port: port,
            auth: SshAuth::Agent,
        }
    }

    #[tokio::test]
    async fn test_occupied_port_reports_port_in_use() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut forwarder = SshForwarder::new(spec(port));
        let err = forwarder.start().await.unwrap_err();
        assert!(matches!(err, TunnelError::PortInUse(p) if p == port));
        assert_eq!(forwarder.local_port(), port);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut forwarder = SshForwarder::new(spec(15439));
        forwarder.stop().await.unwrap();
        assert!(format!("{:?}", forwarder).contains("running: false"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_port_is_free_once_accept_loop_shuts_down() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut accept_loop = AcceptLoop::spawn(listener, |_, _| async {});

        for _ in 0..50 {
            accept_loop.shutdown().await;
            let listener = TcpListener::bind((LOCALHOST, port)).await.unwrap();
            accept_loop = AcceptLoop::spawn(listener, |_, _| async {});
        }
        accept_loop.shutdown().await;
    }

    #[tokio::test]
    async fn test_accepted_streams_reach_handler() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let accept_loop = AcceptLoop::spawn(listener, move |mut stream, _| {
            let tx = tx.clone();
            async move {
                let mut buf = [0u8; 4];
                if stream.read_exact(&mut buf).await.is_ok() {
                    let _ = tx.send(buf);
                }
            }
        });

        let mut client = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        assert_eq!(&rx.recv().await.unwrap(), b"ping");

        accept_loop.shutdown().await;
        assert!(TcpStream::connect((LOCALHOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_key_file_is_ssh_error() {
        let err = load_key(Path::new("/nonexistent/id_rsa"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Ssh(_)));
    }
}
