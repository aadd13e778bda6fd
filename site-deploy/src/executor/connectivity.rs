//! Connectivity test: proves the target accepts writes without deploying.
//!
//! Writes one canary file to the remote root and deletes it again. The
//! manifest is never read or written.

use crate::manifest::remote_join;
use crate::session::{ConnectionSession, Credentials, Endpoint, SessionOptions, Transport};
use crate::transfer::TerminalEvent;
use crate::utils::{DeployError, FailureKind, Result};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

pub const CANARY_CONTENT: &str = "It is a test file. You can remove it.";

pub fn canary_name() -> String {
    format!("site-deploy-test-{}.txt", Uuid::new_v4())
}

/// Run the connectivity test and report its single terminal event.
pub async fn test_connectivity<T: Transport>(
    endpoint: &Endpoint,
    credentials: &Credentials,
    transport: T,
    timeout: Duration,
) -> TerminalEvent {
    let mut session = ConnectionSession::new(transport, SessionOptions::default());
    let result = run(&mut session, endpoint, credentials, timeout).await;
    session.close().await;

    match result {
        Ok(()) => {
            info!("Connectivity test against {} passed", endpoint.host);
            TerminalEvent::Success {
                issues: false,
                details: None,
            }
        }
        Err(e) => {
            error!("Connectivity test against {} failed: {}", endpoint.host, e);
            TerminalEvent::Error {
                kind: failure_kind(&e),
                details: e.to_string(),
            }
        }
    }
}

/// The test only tells "cannot connect" from "cannot write".
fn failure_kind(error: &DeployError) -> FailureKind {
    match error.failure_kind() {
        FailureKind::ConnectionTimeout | FailureKind::ConnectionLost => FailureKind::CannotConnect,
        kind => kind,
    }
}

async fn run<T: Transport>(
    session: &mut ConnectionSession<T>,
    endpoint: &Endpoint,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<()> {
    if endpoint.root.trim().is_empty() {
        return Err(DeployError::Precondition("remote root is not set".into()));
    }

    session.connect(endpoint, credentials, timeout).await?;

    let canary = remote_join(&endpoint.root, &canary_name());
    session
        .put_bytes(CANARY_CONTENT.as_bytes().to_vec(), &canary)
        .await
        .map_err(|e| DeployError::CannotWrite(format!("upload of {} failed: {}", canary, e)))?;
    session
        .delete_file(&canary)
        .await
        .map_err(|e| DeployError::CannotWrite(format!("removal of {} failed: {}", canary, e)))?;

    Ok(())
}
