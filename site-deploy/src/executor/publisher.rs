//! Manifest publisher: the last step of a deployment.
//!
//! The remote manifest is what the next run diffs against, so it is only
//! written once the queue has drained, and a run whose publish fails is a
//! failed run.

use crate::session::{ConnectionSession, Transport};
use crate::transfer::orchestrator::RetryPolicy;
use crate::transfer::{EventSink, ProgressReporter};
use crate::utils::{DeployError, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct ManifestPublisher {
    local_manifest: PathBuf,
    policy: RetryPolicy,
}

impl ManifestPublisher {
    pub fn new(local_manifest: &Path, policy: RetryPolicy) -> Self {
        Self {
            local_manifest: local_manifest.to_path_buf(),
            policy,
        }
    }

    /// Upload the local manifest, reporting 99 before and 100 after.
    pub async fn publish<T: Transport>(
        &self,
        session: &mut ConnectionSession<T>,
        reporter: &mut ProgressReporter,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        events.emit(reporter.publishing());

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(DeployError::Cancelled);
            }

            attempt += 1;
            match session.put_manifest(&self.local_manifest).await {
                Ok(()) => break,
                Err(e) if e.is_operation_failure() && attempt <= self.policy.max_retries => {
                    warn!(
                        "Manifest upload failed ({}/{} retries), retrying in {:?}: {}",
                        attempt, self.policy.max_retries, self.policy.backoff, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.policy.backoff) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Err(e) => {
                    error!("Manifest upload failed after {} attempts: {}", attempt, e);
                    return Err(DeployError::ManifestPublish(e.to_string()));
                }
            }
        }

        info!("Published manifest {}", self.local_manifest.display());
        events.emit(reporter.published());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::memory::MemoryTransport;
    use crate::session::{Credentials, Endpoint, SessionOptions, DEPLOY_CONNECT_TIMEOUT};
    use crate::transfer::DeployEvent;
    use crate::utils::FailureKind;
    use std::time::Duration;
    use tempfile::TempDir;

    const REMOTE_MANIFEST: &str = "/srv/site/files.manifest.json";

    async fn connected(remote: &MemoryTransport) -> ConnectionSession<MemoryTransport> {
        let mut session = ConnectionSession::new(remote.clone(), SessionOptions::default());
        let endpoint = Endpoint {
            host: "example.com".into(),
            port: 22,
            root: "/srv/site".into(),
        };
        let credentials = Credentials {
            username: "deploy".into(),
            password: "secret".into(),
        };
        session.connect(&endpoint, &credentials, DEPLOY_CONNECT_TIMEOUT).await.unwrap();
        session
    }

    fn local_manifest(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("files.manifest.json");
        std::fs::write(&path, br#"{"version":1,"entries":[]}"#).unwrap();
        path
    }

    fn progress_values(rx: &mut tokio::sync::mpsc::UnboundedReceiver<DeployEvent>) -> Vec<u8> {
        let mut values = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DeployEvent::Progress { progress, .. } = event {
                values.push(progress);
            }
        }
        values
    }

    #[tokio::test]
    async fn test_publish_uploads_manifest() {
        let dir = TempDir::new().unwrap();
        let path = local_manifest(&dir);
        let remote = MemoryTransport::with_root("/srv/site");
        let mut session = connected(&remote).await;
        let (events, mut rx) = EventSink::channel();
        let mut reporter = ProgressReporter::new();

        ManifestPublisher::new(&path, RetryPolicy::default())
            .publish(&mut session, &mut reporter, &events, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(remote.file(REMOTE_MANIFEST), Some(std::fs::read(&path).unwrap()));
        assert_eq!(progress_values(&mut rx), vec![99, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_transient_failure() {
        let dir = TempDir::new().unwrap();
        let path = local_manifest(&dir);
        let remote = MemoryTransport::with_root("/srv/site");
        remote.fail(REMOTE_MANIFEST, 2);
        let mut session = connected(&remote).await;
        let mut reporter = ProgressReporter::new();

        ManifestPublisher::new(&path, RetryPolicy::default())
            .publish(&mut session, &mut reporter, &EventSink::disabled(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(remote.attempts(REMOTE_MANIFEST), 3);
        assert_eq!(reporter.percent(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_never_reaches_100() {
        let dir = TempDir::new().unwrap();
        let path = local_manifest(&dir);
        let remote = MemoryTransport::with_root("/srv/site");
        remote.fail_always(REMOTE_MANIFEST);
        let mut session = connected(&remote).await;
        let (events, mut rx) = EventSink::channel();
        let mut reporter = ProgressReporter::new();
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(100),
        };

        let err = ManifestPublisher::new(&path, policy)
            .publish(&mut session, &mut reporter, &events, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.failure_kind(), FailureKind::ManifestPublish);
        assert_eq!(remote.attempts(REMOTE_MANIFEST), 3);
        assert_eq!(progress_values(&mut rx), vec![99]);
        assert!(remote.file(REMOTE_MANIFEST).is_none());
    }
}
