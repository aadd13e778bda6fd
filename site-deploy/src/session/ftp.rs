//! FTP and explicit FTPS transport over `suppaftp`.
//!
//! The client is blocking, so every call runs on the blocking thread pool
//! against a stream shared behind a mutex. FTPS upgrades the control
//! channel with `AUTH TLS` right after connecting.

use super::transport::{Credentials, Endpoint, Transport, TransportError};
use async_trait::async_trait;
use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, NativeTlsConnector, NativeTlsFtpStream};
use tracing::debug;

// FTP reply codes
const SERVICE_NOT_AVAILABLE: u32 = 421;
const NOT_LOGGED_IN: u32 = 530;
const FILE_UNAVAILABLE: u32 = 550;

impl From<FtpError> for TransportError {
    fn from(e: FtpError) -> Self {
        match e {
            FtpError::ConnectionError(io) => TransportError::Io(io),
            FtpError::UnexpectedResponse(ref response) => match response.status.code() {
                SERVICE_NOT_AVAILABLE => TransportError::Disconnected(e.to_string()),
                NOT_LOGGED_IN => TransportError::Authentication(e.to_string()),
                _ => TransportError::Protocol(e.to_string()),
            },
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

fn reply_code(e: &FtpError) -> Option<u32> {
    match e {
        FtpError::UnexpectedResponse(response) => Some(response.status.code()),
        _ => None,
    }
}

/// TLS settings for FTPS; `None` means plain FTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtpsOptions {
    /// Refuse self-signed or mismatched server certificates
    pub reject_unauthorized: bool,
}

/// FTP transport; FTPS when built with [`FtpsOptions`].
pub struct FtpTransport {
    stream: Option<Arc<Mutex<NativeTlsFtpStream>>>,
    tls: Option<FtpsOptions>,
    io_timeout: Duration,
}

impl FtpTransport {
    pub fn new(tls: Option<FtpsOptions>, io_timeout: Duration) -> Self {
        Self {
            stream: None,
            tls,
            io_timeout,
        }
    }

    async fn blocking<R, F>(&self, op: F) -> Result<R, TransportError>
    where
        R: Send + 'static,
        F: FnOnce(&mut NativeTlsFtpStream) -> Result<R, TransportError> + Send + 'static,
    {
        let stream = self
            .stream
            .clone()
            .ok_or_else(|| TransportError::Disconnected("not connected".into()))?;

        tokio::task::spawn_blocking(move || {
            let mut guard = stream
                .lock()
                .map_err(|_| TransportError::Protocol("connection lock poisoned".into()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| TransportError::Protocol(format!("transport task failed: {}", e)))?
    }
}

fn open_stream(
    endpoint: &Endpoint,
    credentials: &Credentials,
    tls: Option<FtpsOptions>,
    io_timeout: Duration,
) -> Result<NativeTlsFtpStream, TransportError> {
    let addr = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Protocol(format!("cannot resolve {}", endpoint.host)))?;

    let mut stream = NativeTlsFtpStream::connect_timeout(addr, io_timeout)?;
    stream.get_ref().set_read_timeout(Some(io_timeout))?;
    stream.get_ref().set_write_timeout(Some(io_timeout))?;

    if let Some(options) = tls {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(!options.reject_unauthorized)
            .danger_accept_invalid_hostnames(!options.reject_unauthorized)
            .build()
            .map_err(|e| TransportError::Protocol(format!("TLS setup failed: {}", e)))?;
        stream = stream.into_secure(NativeTlsConnector::from(connector), &endpoint.host)?;
        debug!("Control channel secured for {}", endpoint.host);
    }

    debug!("USER {} / PASS ******", credentials.username);
    stream.login(&credentials.username, &credentials.password)?;
    stream.transfer_type(FileType::Binary)?;
    Ok(stream)
}

#[async_trait]
impl Transport for FtpTransport {
    async fn connect(&mut self, endpoint: &Endpoint, credentials: &Credentials) -> Result<(), TransportError> {
        let endpoint = endpoint.clone();
        let credentials = credentials.clone();
        let tls = self.tls;
        let io_timeout = self.io_timeout;

        let stream = tokio::task::spawn_blocking(move || open_stream(&endpoint, &credentials, tls, io_timeout))
            .await
            .map_err(|e| TransportError::Protocol(format!("connect task failed: {}", e)))??;

        self.stream = Some(Arc::new(Mutex::new(stream)));
        Ok(())
    }

    async fn get(&mut self, remote: &str) -> Result<Vec<u8>, TransportError> {
        let remote = remote.to_string();
        self.blocking(move |ftp| match ftp.retr_as_buffer(&remote) {
            Ok(buffer) => Ok(buffer.into_inner()),
            Err(e) if reply_code(&e) == Some(FILE_UNAVAILABLE) => Err(TransportError::NotFound(remote)),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn put_bytes(&mut self, data: Vec<u8>, remote: &str) -> Result<(), TransportError> {
        let remote = remote.to_string();
        self.blocking(move |ftp| {
            ftp.put_file(&remote, &mut Cursor::new(data))?;
            Ok(())
        })
        .await
    }

    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.blocking(move |ftp| {
            let mut source = std::fs::File::open(&local)?;
            let bytes = ftp.put_file(&remote, &mut source)?;
            debug!("Wrote {} bytes to {}", bytes, remote);
            Ok(())
        })
        .await
    }

    async fn mkdir(&mut self, remote: &str) -> Result<(), TransportError> {
        let remote = remote.to_string();
        self.blocking(move |ftp| match ftp.mkdir(&remote) {
            Ok(()) => Ok(()),
            // MKD on an existing directory fails; CWD tells whether it is there
            Err(e) => match ftp.cwd(&remote) {
                Ok(()) => Ok(()),
                Err(_) => Err(e.into()),
            },
        })
        .await
    }

    async fn delete(&mut self, remote: &str) -> Result<(), TransportError> {
        let remote = remote.to_string();
        self.blocking(move |ftp| Ok(ftp.rm(&remote)?)).await
    }

    async fn rmdir(&mut self, remote: &str) -> Result<(), TransportError> {
        let remote = remote.to_string();
        self.blocking(move |ftp| Ok(ftp.rmdir(&remote)?)).await
    }

    async fn logout(&mut self) -> Result<(), TransportError> {
        self.blocking(|ftp| Ok(ftp.quit()?)).await
    }

    fn destroy(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_connection_errors_keep_their_io_kind() {
        let reset = TransportError::from(FtpError::ConnectionError(io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(reset.is_transient());

        let broken = TransportError::from(FtpError::ConnectionError(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(broken.is_connection_lost());

        let tls = TransportError::from(FtpError::SecureError("handshake failed".into()));
        assert!(matches!(tls, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_operations_without_connection_fail() {
        let mut transport = FtpTransport::new(Some(FtpsOptions { reject_unauthorized: true }), Duration::from_secs(1));
        let err = transport.delete("/var/www/old.html").await.unwrap_err();
        assert!(err.is_connection_lost());
    }
}
