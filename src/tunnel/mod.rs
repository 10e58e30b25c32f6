//! Bastion tunnel lifecycle.
//!
//! A [`TunnelManager`] owns at most one [`Forwarder`] bound to a fixed local
//! port. The forwarder is probed once when a profile is activated, then
//! opened just before each call and closed right after it.
//!
//! Tunnel failures are never fatal: a port that is already bound is taken
//! as a sign that a tunnel opened elsewhere is still serving it.

mod ssh;

pub use ssh::SshForwarder;

use crate::error::ConnectorError;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How to authenticate against the bastion server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// Private key file, optionally encrypted.
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Keys held by the running SSH agent, falling back to `~/.ssh/id_*`.
    Agent,
}

/// Where the tunnel goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Bastion server host name.
    pub server: String,
    /// Bastion server SSH port.
    pub server_port: u16,
    /// User on the bastion server.
    pub user: String,
    /// Database host as seen from the bastion.
    pub remote_host: String,
    /// Database port as seen from the bastion.
    pub remote_port: u16,
    /// Loopback port the tunnel listens on.
    pub local_port: u16,
    /// Authentication method.
    pub auth: SshAuth,
}

/// Errors reported by a [`Forwarder`].
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("local port {0} is already bound")]
    PortInUse(u16),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TunnelError> for ConnectorError {
    fn from(e: TunnelError) -> Self {
        ConnectorError::tunnel(e.to_string())
    }
}

/// Something that can forward a local port, started and stopped repeatedly.
#[async_trait]
pub trait Forwarder: Send {
    /// Starts forwarding. Starting a running forwarder is a no-op.
    async fn start(&mut self) -> std::result::Result<(), TunnelError>;

    /// Stops forwarding. Stopping a stopped forwarder is a no-op.
    async fn stop(&mut self) -> std::result::Result<(), TunnelError>;

    /// Returns the local port this forwarder binds.
    fn local_port(&self) -> u16;
}

/// Lifecycle state of a [`TunnelManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No bastion; connections go direct.
    Disabled,
    /// Probe succeeded; the tunnel is started around each call.
    Idle,
    /// Probe failed; a tunnel is assumed to be open elsewhere, but starting
    /// is still attempted around each call.
    Degraded,
    /// Forwarding for an in-flight call.
    Active,
    /// Shut down; no further starts.
    Closed,
}

/// Owns the single tunnel of a session.
pub struct TunnelManager {
    forwarder: Option<Box<dyn Forwarder>>,
    state: TunnelState,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("state", &self.state)
            .field("local_port", &self.forwarder.as_ref().map(|f| f.local_port()))
            .finish()
    }
}

impl TunnelManager {
    /// Creates a manager with no tunnel.
    pub fn disabled() -> Self {
        Self {
            forwarder: None,
            state: TunnelState::Disabled,
        }
    }

    /// Creates a manager for `forwarder` after checking it can start.
    ///
    /// The forwarder is started and immediately stopped. A failure leaves the
    /// manager degraded rather than returning an error.
    pub async fn probe(mut forwarder: Box<dyn Forwarder>) -> Self {
        let port = forwarder.local_port();
        info!("Using bastion, testing SSH tunnel on local port {}", port);

        let state = match forwarder.start().await {
            Ok(()) => {
                info!("SSH tunnel works");
                if let Err(e) = forwarder.stop().await {
                    warn!("Failed to stop probe tunnel: {}", e);
                }
                TunnelState::Idle
            }
            Err(e) => {
                warn!(
                    "Couldn't open SSH tunnel to bastion ({}). Assuming a tunnel is already open on port {}",
                    e, port
                );
                TunnelState::Degraded
            }
        };

        Self {
            forwarder: Some(forwarder),
            state,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Starts the tunnel for a call. Never fails; problems are logged.
    pub async fn open(&mut self) {
        if !matches!(self.state, TunnelState::Idle | TunnelState::Degraded) {
            return;
        }
        let Some(forwarder) = self.forwarder.as_mut() else {
            return;
        };

        match forwarder.start().await {
            Ok(()) => {
                debug!("SSH tunnel started on port {}", forwarder.local_port());
                self.state = TunnelState::Active;
            }
            Err(TunnelError::PortInUse(port)) => {
                info!("Tunnel to {} already opened, moving on", port);
            }
            Err(e) => {
                warn!("Failed to start SSH tunnel, connecting anyway: {}", e);
            }
        }
    }

    /// Stops the tunnel after a call, if this manager started it.
    pub async fn close(&mut self) {
        if self.state != TunnelState::Active {
            return;
        }
        if let Some(forwarder) = self.forwarder.as_mut() {
            if let Err(e) = forwarder.stop().await {
                warn!("Failed to stop SSH tunnel: {}", e);
            }
            debug!("SSH tunnel stopped on port {}", forwarder.local_port());
        }
        self.state = TunnelState::Idle;
    }

    /// Stops the tunnel for good.
    pub async fn shutdown(&mut self) {
        self.close().await;
        if self.forwarder.take().is_some() {
            self.state = TunnelState::Closed;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted forwarder for lifecycle tests.

    use super::*;
    use std::sync::{Arc, Mutex};

    /// Shared record of what a [`ScriptedForwarder`] was asked to do.
    #[derive(Debug, Default)]
    pub struct ForwarderLog {
        pub events: Vec<&'static str>,
        pub running: bool,
    }

    /// A forwarder whose start results are scripted in advance.
    pub struct ScriptedForwarder {
        pub log: Arc<Mutex<ForwarderLog>>,
        /// Results returned by successive `start` calls; `Ok` once exhausted.
        pub starts: Vec<std::result::Result<(), TunnelError>>,
        pub port: u16,
    }

    impl ScriptedForwarder {
        pub fn new(starts: Vec<std::result::Result<(), TunnelError>>) -> Self {
            Self {
                log: Arc::new(Mutex::new(ForwarderLog::default())),
                starts,
                port: 5439,
            }
        }
    }

    #[async_trait]
    impl Forwarder for ScriptedForwarder {
        async fn start(&mut self) -> std::result::Result<(), TunnelError> {
            let result = if self.starts.is_empty() {
                Ok(())
            } else {
                self.starts.remove(0)
            };
            let mut log = self.log.lock().unwrap();
            log.events.push("start");
            if result.is_ok() {
                log.running = true;
            }
            result
        }

        async fn stop(&mut self) -> std::result::Result<(), TunnelError> {
            let mut log = self.log.lock().unwrap();
            log.events.push("stop");
            log.running = false;
            Ok(())
        }

        fn local_port(&self) -> u16 {
            self.port
        }
    }
}
