//! Connection session: owns one transport connection for one deployment run.
//!
//! ```text
//! Disconnected -> Connecting -> Ready -> Closing -> Closed
//!                     |           |
//!                     +-> Errored <-+
//! ```
//!
//! A connect timeout forces `Closed`. Once `Ready`, the session exposes the
//! primitives the orchestrator and the publisher drive, one call at a time.

pub mod ftp;
pub mod memory;
pub mod sftp;
pub mod transport;

pub use transport::{Credentials, Endpoint, Transport, TransportError};

use crate::manifest::{remote_join, DEFAULT_MANIFEST_FILE};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Consecutive connection resets tolerated before giving up.
pub const DEFAULT_MAX_RESETS: u32 = 5;

/// Session-wide timeout for a full deployment.
pub const DEPLOY_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Shorter budget for the connectivity test.
pub const TEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
    Errored,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gave up after {count} consecutive connection resets: {source}")]
    TooManyResets {
        count: u32,
        #[source]
        source: TransportError,
    },

    #[error("Connection lost: {0}")]
    ConnectionLost(#[source] TransportError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// The session can no longer serve requests.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionLost(_)
                | SessionError::InvalidState {
                    actual: SessionState::Errored | SessionState::Closed,
                    ..
                }
        )
    }

    /// A failure of a single remote operation, worth retrying.
    pub fn is_operation_failure(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_resets: u32,

    /// Pause between reconnect attempts after a reset
    pub reset_pause: Duration,

    /// Manifest file name under the remote root
    pub manifest_file: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_resets: DEFAULT_MAX_RESETS,
            reset_pause: Duration::from_millis(200),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
        }
    }
}

pub struct ConnectionSession<T> {
    transport: T,
    state: SessionState,
    endpoint: Option<Endpoint>,
    consecutive_resets: u32,
    options: SessionOptions,
}

impl<T: Transport> ConnectionSession<T> {
    /// Fresh session; every deployment run builds its own.
    pub fn new(transport: T, options: SessionOptions) -> Self {
        Self {
            transport,
            state: SessionState::Disconnected,
            endpoint: None,
            consecutive_resets: 0,
            options,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Remote site root, known once connected.
    pub fn remote_root(&self) -> Option<&str> {
        self.endpoint.as_ref().map(|e| e.root.as_str())
    }

    /// Connect and authenticate within `timeout`.
    ///
    /// Connection resets are retried until more than `max_resets` happen in
    /// a row; any other error is fatal right away. Hitting the timeout
    /// tears the transport down and leaves the session `Closed`.
    pub async fn connect(
        &mut self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.expect_state(SessionState::Disconnected)?;
        self.state = SessionState::Connecting;
        info!(
            "Connecting to {}:{} as {} (timeout {:?})",
            endpoint.host, endpoint.port, credentials.username, timeout
        );

        match tokio::time::timeout(timeout, self.establish(endpoint, credentials)).await {
            Ok(Ok(())) => {
                self.state = SessionState::Ready;
                self.endpoint = Some(endpoint.clone());
                info!("Connected to {}:{}", endpoint.host, endpoint.port);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", endpoint.host, e);
                self.transport.destroy();
                self.state = SessionState::Errored;
                Err(e)
            }
            Err(_) => {
                warn!("Connection to {} timed out after {:?}", endpoint.host, timeout);
                self.transport.destroy();
                self.state = SessionState::Closed;
                Err(SessionError::Timeout(timeout))
            }
        }
    }

    async fn establish(&mut self, endpoint: &Endpoint, credentials: &Credentials) -> Result<(), SessionError> {
        loop {
            match self.transport.connect(endpoint, credentials).await {
                Ok(()) => {
                    self.consecutive_resets = 0;
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    self.consecutive_resets += 1;
                    if self.consecutive_resets > self.options.max_resets {
                        return Err(SessionError::TooManyResets {
                            count: self.consecutive_resets,
                            source: e,
                        });
                    }
                    warn!(
                        "Transient connection error ({}/{}): {}",
                        self.consecutive_resets, self.options.max_resets, e
                    );
                    tokio::time::sleep(self.options.reset_pause).await;
                }
                Err(e) => return Err(SessionError::Transport(e)),
            }
        }
    }

    /// Download the manifest left by the previous deployment.
    pub async fn fetch_manifest(&mut self) -> Result<Vec<u8>, SessionError> {
        let remote = self.manifest_remote_path()?;
        self.expect_state(SessionState::Ready)?;
        debug!("<- {}", remote);
        let result = self.transport.get(&remote).await;
        self.settle(result)
    }

    pub async fn put_file(&mut self, local: &Path, remote: &str) -> Result<(), SessionError> {
        self.expect_state(SessionState::Ready)?;
        let result = self.transport.put(local, remote).await;
        self.settle(result)
    }

    pub async fn put_bytes(&mut self, data: Vec<u8>, remote: &str) -> Result<(), SessionError> {
        self.expect_state(SessionState::Ready)?;
        let result = self.transport.put_bytes(data, remote).await;
        self.settle(result)
    }

    pub async fn make_directory(&mut self, remote: &str) -> Result<(), SessionError> {
        self.expect_state(SessionState::Ready)?;
        let result = self.transport.mkdir(remote).await;
        self.settle(result)
    }

    pub async fn delete_file(&mut self, remote: &str) -> Result<(), SessionError> {
        self.expect_state(SessionState::Ready)?;
        let result = self.transport.delete(remote).await;
        self.settle(result)
    }

    pub async fn remove_directory(&mut self, remote: &str) -> Result<(), SessionError> {
        self.expect_state(SessionState::Ready)?;
        let result = self.transport.rmdir(remote).await;
        self.settle(result)
    }

    /// Upload the local manifest file to its well-known remote location.
    pub async fn put_manifest(&mut self, local: &Path) -> Result<(), SessionError> {
        let remote = self.manifest_remote_path()?;
        debug!("-> {}", remote);
        self.put_file(local, &remote).await
    }

    /// Log out if possible, then tear down. Always ends `Closed`.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        if self.state == SessionState::Ready {
            self.state = SessionState::Closing;
            match tokio::time::timeout(LOGOUT_TIMEOUT, self.transport.logout()).await {
                Ok(Ok(())) => debug!("Logged out"),
                Ok(Err(e)) => warn!("Logout failed: {}", e),
                Err(_) => warn!("Logout timed out"),
            }
        }

        self.transport.destroy();
        self.state = SessionState::Closed;
        info!("Connection closed");
    }

    fn manifest_remote_path(&self) -> Result<String, SessionError> {
        let root = self.remote_root().ok_or(SessionError::InvalidState {
            expected: SessionState::Ready,
            actual: self.state,
        })?;
        Ok(remote_join(root, &self.options.manifest_file))
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Once `Ready`, a reset or a socket timeout means the connection is gone.
    fn settle<R>(&mut self, result: Result<R, TransportError>) -> Result<R, SessionError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_connection_lost() || e.is_transient() => {
                warn!("Connection lost: {}", e);
                self.state = SessionState::Errored;
                Err(SessionError::ConnectionLost(e))
            }
            Err(e) => Err(SessionError::Transport(e)),
        }
    }
}
