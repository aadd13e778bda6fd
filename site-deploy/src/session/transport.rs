//! The primitive set a remote file store has to offer.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Where to connect and which directory is the site root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,

    /// Remote directory the site is deployed into
    pub root: String,
}

/// Login for the remote store. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"******")
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// Low-level reset; tolerated a bounded number of times while connecting
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The established connection is gone
    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Connection timed out: {0}")]
    TimedOut(String),

    #[error("No such remote path: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::ConnectionReset(_) => true,
            TransportError::Io(e) => e.kind() == io::ErrorKind::ConnectionReset,
            _ => false,
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        match self {
            TransportError::Disconnected(_) | TransportError::TimedOut(_) => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Remote file store operations. One call is outstanding at a time.
#[async_trait]
pub trait Transport: Send {
    /// Open and authenticate the connection.
    async fn connect(&mut self, endpoint: &Endpoint, credentials: &Credentials) -> Result<(), TransportError>;

    /// Read a whole remote file.
    async fn get(&mut self, remote: &str) -> Result<Vec<u8>, TransportError>;

    /// Write `data` to a remote file, replacing it.
    async fn put_bytes(&mut self, data: Vec<u8>, remote: &str) -> Result<(), TransportError>;

    /// Copy a local file to the remote store.
    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let data = tokio::fs::read(local).await?;
        self.put_bytes(data, remote).await
    }

    /// Create a directory; an existing directory is not an error.
    async fn mkdir(&mut self, remote: &str) -> Result<(), TransportError>;

    async fn delete(&mut self, remote: &str) -> Result<(), TransportError>;

    /// Remove an empty directory.
    async fn rmdir(&mut self, remote: &str) -> Result<(), TransportError>;

    /// Polite goodbye to the server.
    async fn logout(&mut self) -> Result<(), TransportError>;

    /// Drop the connection without ceremony.
    fn destroy(&mut self);
}

/// Backend chosen at runtime from configuration.
#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn connect(&mut self, endpoint: &Endpoint, credentials: &Credentials) -> Result<(), TransportError> {
        (**self).connect(endpoint, credentials).await
    }

    async fn get(&mut self, remote: &str) -> Result<Vec<u8>, TransportError> {
        (**self).get(remote).await
    }

    async fn put_bytes(&mut self, data: Vec<u8>, remote: &str) -> Result<(), TransportError> {
        (**self).put_bytes(data, remote).await
    }

    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        (**self).put(local, remote).await
    }

    async fn mkdir(&mut self, remote: &str) -> Result<(), TransportError> {
        (**self).mkdir(remote).await
    }

    async fn delete(&mut self, remote: &str) -> Result<(), TransportError> {
        (**self).delete(remote).await
    }

    async fn rmdir(&mut self, remote: &str) -> Result<(), TransportError> {
        (**self).rmdir(remote).await
    }

    async fn logout(&mut self) -> Result<(), TransportError> {
        (**self).logout().await
    }

    fn destroy(&mut self) {
        (**self).destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TransportError::ConnectionReset("ECONNRESET".into()).is_transient());
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_transient());
        assert!(!TransportError::Authentication("bad password".into()).is_transient());

        assert!(TransportError::Disconnected("eof".into()).is_connection_lost());
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_connection_lost());
        assert!(!TransportError::NotFound("/x".into()).is_connection_lost());
        assert!(TransportError::TimedOut("socket".into()).is_connection_lost());
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_connection_lost());
    }

    #[test]
    fn test_credentials_debug_masks_password() {
        let credentials = Credentials {
            username: "deploy".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("deploy"));
        assert!(!printed.contains("hunter2"));
    }
}
