//! Site Deploy Library
//!
//! Incremental static site deployment: diffs the rendered site against the
//! manifest of the previous deployment and replays only the changes over
//! SFTP, one operation at a time.

pub mod config;
pub mod executor;
pub mod manifest;
pub mod secrets;
pub mod session;
pub mod shutdown;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{run_deployment, test_connectivity, DeployJob};
pub use transfer::{DeployEvent, TerminalEvent};
pub use utils::errors::{DeployError, FailureKind};
pub type Result<T> = std::result::Result<T, DeployError>;
