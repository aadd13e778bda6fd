//! Configuration management for site deployment.
//!
//! Loads configuration from a TOML file; `SITE_DEPLOY_PASSWORD` overrides
//! the configured password.

use crate::manifest::scan::ScanOptions;
use crate::manifest::DEFAULT_MANIFEST_FILE;
use crate::secrets::{self, SecretStore};
use crate::session::ftp::{FtpTransport, FtpsOptions};
use crate::session::sftp::SftpTransport;
use crate::session::{Credentials, Endpoint, SessionOptions, Transport};
use crate::transfer::RetryPolicy;
use crate::utils::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PASSWORD_ENV: &str = "SITE_DEPLOY_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub site: SiteConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Display name; its slug keys the secret store when there is no uuid
    pub name: String,

    #[serde(default)]
    pub uuid: Option<String>,

    /// Rendered site tree to publish
    pub output_dir: PathBuf,
}

/// Wire protocol spoken to the remote host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Sftp,
    Ftp,
    /// FTP with the control channel upgraded through `AUTH TLS`
    Ftps,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Sftp => 22,
            Protocol::Ftp | Protocol::Ftps => 21,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub protocol: Protocol,

    pub host: String,

    /// Defaults to the protocol's well-known port
    #[serde(default)]
    pub port: Option<u16>,

    /// FTPS only: refuse untrusted server certificates
    #[serde(default = "default_reject_unauthorized")]
    pub reject_unauthorized: bool,

    pub username: String,

    /// Plain password, or the `"<service> <account>"` secret store placeholder
    #[serde(default)]
    pub password: String,

    /// Remote directory the site is deployed into
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Consecutive connection resets tolerated while connecting
    #[serde(default = "default_max_connection_resets")]
    pub max_connection_resets: u32,

    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_secret_service")]
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_reject_unauthorized() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_test_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_connection_resets() -> u32 {
    5
}

fn default_manifest_file() -> String {
    DEFAULT_MANIFEST_FILE.to_string()
}

fn default_secret_service() -> String {
    "site-deploy".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            test_timeout_secs: default_test_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_connection_resets: default_max_connection_resets(),
            manifest_file: default_manifest_file(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            service: default_secret_service(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DeployError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml(&content)?;
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            config.remote.password = password;
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DeployError::Config(e.to_string()))
    }

    /// Reject configurations that cannot possibly connect.
    pub fn validate(&self) -> Result<()> {
        if self.remote.host.trim().is_empty() {
            return Err(DeployError::Config("remote.host is empty".into()));
        }
        if self.remote.port == Some(0) {
            return Err(DeployError::Config("remote.port must be non-zero".into()));
        }
        if self.remote.username.trim().is_empty() {
            return Err(DeployError::Config("remote.username is empty".into()));
        }
        if self.remote.path.trim().is_empty() {
            return Err(DeployError::Config("remote.path is empty".into()));
        }
        if self.deploy.manifest_file.contains('/') {
            return Err(DeployError::Config("deploy.manifest_file must be a bare file name".into()));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.remote.host.clone(),
            port: self.remote.port.unwrap_or_else(|| self.remote.protocol.default_port()),
            root: self.remote.path.clone(),
        }
    }

    /// Credentials with the password resolved through `store` when it is a placeholder.
    pub fn credentials(&self, store: &dyn SecretStore) -> Result<Credentials> {
        let account = secrets::account_for(&self.site.name, self.site.uuid.as_deref());
        let password = secrets::resolve_password(&self.remote.password, &self.secrets.service, &account, store)?;
        Ok(Credentials {
            username: self.remote.username.clone(),
            password,
        })
    }

    /// Validated endpoint and resolved credentials, ready to connect with.
    pub fn target(&self, store: &dyn SecretStore) -> Result<(Endpoint, Credentials)> {
        self.validate()?;
        Ok((self.endpoint(), self.credentials(store)?))
    }

    /// Transport for the configured protocol; `io_timeout` bounds each socket operation.
    pub fn transport(&self, io_timeout: Duration) -> Box<dyn Transport> {
        match self.remote.protocol {
            Protocol::Sftp => Box::new(SftpTransport::new(io_timeout)),
            Protocol::Ftp => Box::new(FtpTransport::new(None, io_timeout)),
            Protocol::Ftps => Box::new(FtpTransport::new(
                Some(FtpsOptions {
                    reject_unauthorized: self.remote.reject_unauthorized,
                }),
                io_timeout,
            )),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy.connect_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy.test_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.deploy.max_retries,
            backoff: Duration::from_millis(self.deploy.retry_backoff_ms),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_resets: self.deploy.max_connection_resets,
            manifest_file: self.deploy.manifest_file.clone(),
            ..SessionOptions::default()
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            manifest_file: self.deploy.manifest_file.clone(),
            ..ScanOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [site]
        name = "My Blog"
        output_dir = "/home/me/blog/output"

        [remote]
        host = "example.com"
        username = "deploy"
        password = "hunter2"
        path = "/var/www/html"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml(MINIMAL).unwrap();

        assert_eq!(config.remote.protocol, Protocol::Sftp);
        assert_eq!(config.endpoint().port, 22);
        assert!(config.remote.reject_unauthorized);
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
        assert_eq!(config.test_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.session_options().max_resets, 5);
        assert_eq!(config.deploy.manifest_file, DEFAULT_MANIFEST_FILE);
        assert_eq!(config.secrets.service, "site-deploy");
        assert_eq!(config.log.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let content = format!(
            "{}\n[deploy]\nmax_retries = 2\nretry_backoff_ms = 100\nmanifest_file = \"site.json\"\n",
            MINIMAL
        );
        let config = Config::from_toml(&content).unwrap();

        assert_eq!(config.retry_policy().max_retries, 2);
        assert_eq!(config.retry_policy().backoff, Duration::from_millis(100));
        assert_eq!(config.scan_options().manifest_file, "site.json");
        assert_eq!(config.deploy.connect_timeout_secs, 20);
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.remote.host = " ".into();
        assert!(matches!(config.validate(), Err(DeployError::Config(_))));
    }

    #[test]
    fn test_missing_section_is_config_error() {
        assert!(matches!(
            Config::from_toml("[site]\nname = \"x\"\noutput_dir = \"/tmp\"\n"),
            Err(DeployError::Config(_))
        ));
    }

    #[test]
    fn test_unreadable_file_is_config_error() {
        let err = Config::from_file(Path::new("/nonexistent/site-deploy.toml")).unwrap_err();
        assert_eq!(err.failure_kind(), crate::utils::FailureKind::Precondition);
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let path = temp_dir.path().join("deploy.toml");
        std::fs::write(&path, MINIMAL)?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.endpoint().root, "/var/www/html");
        Ok(())
    }
    #[test]
    fn test_ftps_protocol_and_port() {
        let content = MINIMAL.replace(
            "host = \"example.com\"",
            "protocol = \"ftps\"\nreject_unauthorized = false\nhost = \"example.com\"",
        );
        let config = Config::from_toml(&content).unwrap();

        assert_eq!(config.remote.protocol, Protocol::Ftps);
        assert!(!config.remote.reject_unauthorized);
        assert_eq!(config.endpoint().port, 21);

        let content = content.replace("host = \"example.com\"", "host = \"example.com\"\nport = 2121");
        assert_eq!(Config::from_toml(&content).unwrap().endpoint().port, 2121);
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let content = MINIMAL.replace("host = \"example.com\"", "protocol = \"gopher\"\nhost = \"example.com\"");
        assert!(matches!(Config::from_toml(&content), Err(DeployError::Config(_))));
    }

    struct EmptyStore;

    impl SecretStore for EmptyStore {
        fn get_secret(&self, _service: &str, _account: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn test_target_failures_are_preconditions() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.remote.password = "site-deploy my-blog".into();
        let err = config.target(&EmptyStore).unwrap_err();
        assert!(matches!(err, DeployError::Secret(_)));
        assert_eq!(err.failure_kind(), crate::utils::FailureKind::Precondition);

        config.remote.host = String::new();
        let err = config.target(&EmptyStore).unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
        assert_eq!(err.failure_kind(), crate::utils::FailureKind::Precondition);
    }

    #[test]
    fn test_target_resolves_plain_password() {
        let config = Config::from_toml(MINIMAL).unwrap();
        let (endpoint, credentials) = config.target(&EmptyStore).unwrap();
        assert_eq!(endpoint.host, "example.com");
        assert_eq!(credentials.password, "hunter2");
    }
}
