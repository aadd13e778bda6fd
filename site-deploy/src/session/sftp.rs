//! SFTP transport over `ssh2`.
//!
//! libssh2 is blocking, so every call runs on the blocking thread pool
//! against a connection shared behind a mutex.

use super::transport::{Credentials, Endpoint, Transport, TransportError};
use async_trait::async_trait;
use ssh2::{ErrorCode, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

// libssh2 session error codes
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

// SFTP status codes
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;

const DIR_MODE: i32 = 0o755;

impl From<ssh2::Error> for TransportError {
    fn from(e: ssh2::Error) -> Self {
        match e.code() {
            ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => {
                TransportError::Authentication(e.message().to_string())
            }
            ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT) => TransportError::Disconnected(e.to_string()),
            ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV | LIBSSH2_ERROR_SOCKET_SEND) => {
                TransportError::ConnectionReset(e.to_string())
            }
            ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT | LIBSSH2_ERROR_SOCKET_TIMEOUT) => {
                TransportError::TimedOut(e.to_string())
            }
            ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => TransportError::NotFound(e.message().to_string()),
            _ => TransportError::Protocol(e.to_string()),
        }
    }
}

struct SftpConnection {
    session: Session,
    sftp: Sftp,
}

/// Production transport: one SSH session with an SFTP channel.
pub struct SftpTransport {
    connection: Option<Arc<Mutex<SftpConnection>>>,
    io_timeout: Duration,
}

impl SftpTransport {
    /// `io_timeout` bounds every blocking socket operation.
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            connection: None,
            io_timeout,
        }
    }

    /// Run `op` on the blocking pool with exclusive access to the connection.
    async fn blocking<R, F>(&self, op: F) -> Result<R, TransportError>
    where
        R: Send + 'static,
        F: FnOnce(&mut SftpConnection) -> Result<R, TransportError> + Send + 'static,
    {
        let connection = self
            .connection
            .clone()
            .ok_or_else(|| TransportError::Disconnected("not connected".into()))?;

        tokio::task::spawn_blocking(move || {
            let mut guard = connection
                .lock()
                .map_err(|_| TransportError::Protocol("connection lock poisoned".into()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| TransportError::Protocol(format!("transport task failed: {}", e)))?
    }
}

fn open_connection(
    endpoint: &Endpoint,
    credentials: &Credentials,
    io_timeout: Duration,
) -> Result<SftpConnection, TransportError> {
    let addr = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Protocol(format!("cannot resolve {}", endpoint.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, io_timeout)?;
    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(io_timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake()?;

    session.userauth_password(&credentials.username, &credentials.password)?;
    if !session.authenticated() {
        return Err(TransportError::Authentication(format!(
            "server rejected {}",
            credentials.username
        )));
    }

    let sftp = session.sftp()?;
    Ok(SftpConnection { session, sftp })
}

#[async_trait]
impl Transport for SftpTransport {
    async fn connect(&mut self, endpoint: &Endpoint, credentials: &Credentials) -> Result<(), TransportError> {
        let endpoint = endpoint.clone();
        let credentials = credentials.clone();
        let io_timeout = self.io_timeout;

        let connection = tokio::task::spawn_blocking(move || open_connection(&endpoint, &credentials, io_timeout))
            .await
            .map_err(|e| TransportError::Protocol(format!("connect task failed: {}", e)))??;

        self.connection = Some(Arc::new(Mutex::new(connection)));
        Ok(())
    }

    async fn get(&mut self, remote: &str) -> Result<Vec<u8>, TransportError> {
        let remote = PathBuf::from(remote);
        self.blocking(move |conn| {
            let mut file = conn.sftp.open(&remote)?;
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            Ok(data)
        })
        .await
    }

    async fn put_bytes(&mut self, data: Vec<u8>, remote: &str) -> Result<(), TransportError> {
        let remote = PathBuf::from(remote);
        self.blocking(move |conn| {
            let mut file = conn.sftp.create(&remote)?;
            file.write_all(&data)?;
            Ok(())
        })
        .await
    }

    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let local = local.to_path_buf();
        let remote = PathBuf::from(remote);
        self.blocking(move |conn| {
            let mut source = std::fs::File::open(&local)?;
            let mut file = conn.sftp.create(&remote)?;
            let bytes = std::io::copy(&mut source, &mut file)?;
            debug!("Wrote {} bytes to {}", bytes, remote.display());
            Ok(())
        })
        .await
    }

    async fn mkdir(&mut self, remote: &str) -> Result<(), TransportError> {
        let remote = PathBuf::from(remote);
        self.blocking(move |conn| match conn.sftp.mkdir(&remote, DIR_MODE) {
            Ok(()) => Ok(()),
            Err(e) => match conn.sftp.stat(&remote) {
                Ok(stat) if stat.is_dir() => Ok(()),
                _ => Err(e.into()),
            },
        })
        .await
    }

    async fn delete(&mut self, remote: &str) -> Result<(), TransportError> {
        let remote = PathBuf::from(remote);
        self.blocking(move |conn| Ok(conn.sftp.unlink(&remote)?)).await
    }

    async fn rmdir(&mut self, remote: &str) -> Result<(), TransportError> {
        let remote = PathBuf::from(remote);
        self.blocking(move |conn| Ok(conn.sftp.rmdir(&remote)?)).await
    }

    async fn logout(&mut self) -> Result<(), TransportError> {
        self.blocking(|conn| Ok(conn.session.disconnect(None, "deployment finished", None)?))
            .await
    }

    fn destroy(&mut self) {
        self.connection = None;
    }
}
