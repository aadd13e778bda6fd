//! Deployment executor: runs one deployment from precondition checks to
//! the published manifest.
//!
//! Flow:
//! - check preconditions (nothing touches the transport before this passes)
//! - load or produce the local manifest
//! - connect, download and parse the remote manifest
//! - diff, drain the queue, publish the local manifest
//!
//! Every outcome, including failures, ends as a single [`TerminalEvent`].

pub mod connectivity;
pub mod publisher;

pub use connectivity::test_connectivity;
pub use publisher::ManifestPublisher;

use crate::config::Config;
use crate::manifest::scan::{self, ScanOptions};
use crate::manifest::Manifest;
use crate::session::{ConnectionSession, Credentials, Endpoint, SessionError, SessionOptions, Transport, TransportError};
use crate::sync;
use crate::transfer::orchestrator::RetryPolicy;
use crate::transfer::progress::format_duration;
use crate::transfer::{DeployEvent, DeploySummary, EventSink, ProgressReporter, TerminalEvent, TransferOrchestrator};
use crate::utils::{DeployError, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything one deployment run needs.
#[derive(Debug, Clone)]
pub struct DeployJob {
    /// Rendered site tree
    pub local_root: PathBuf,
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    pub policy: RetryPolicy,
    pub session: SessionOptions,
    pub connect_timeout: Duration,
    /// Ignore an existing local manifest and scan the tree again
    pub rescan: bool,
    pub scan: ScanOptions,
}

impl DeployJob {
    pub fn from_config(config: &Config, credentials: Credentials, rescan: bool) -> Self {
        Self {
            local_root: config.site.output_dir.clone(),
            endpoint: config.endpoint(),
            credentials,
            policy: config.retry_policy(),
            session: config.session_options(),
            connect_timeout: config.connect_timeout(),
            rescan,
            scan: config.scan_options(),
        }
    }
}

/// Run one deployment and report its outcome.
///
/// Progress events go to `events` as they happen; the terminal event is
/// both emitted and returned.
pub async fn run_deployment<T: Transport>(
    job: DeployJob,
    transport: T,
    events: EventSink,
    cancel: CancellationToken,
) -> TerminalEvent {
    let started = Instant::now();
    let mut reporter = ProgressReporter::new();
    let mut session = ConnectionSession::new(transport, job.session.clone());

    let result = deploy(&job, &mut session, &mut reporter, &events, &cancel).await;
    session.close().await;

    let terminal = match result {
        Ok(summary) => {
            info!(
                "Deployment finished in {} ({} operations, {} failed)",
                format_duration(started.elapsed()),
                summary.total_operations,
                summary.failed_paths.len()
            );
            TerminalEvent::Success {
                issues: !summary.failed_paths.is_empty(),
                details: Some(summary),
            }
        }
        Err(e) => {
            error!("Deployment failed after {}: {}", format_duration(started.elapsed()), e);
            TerminalEvent::from(&e)
        }
    };

    events.emit(DeployEvent::Finished(terminal.clone()));
    terminal
}

async fn deploy<T: Transport>(
    job: &DeployJob,
    session: &mut ConnectionSession<T>,
    reporter: &mut ProgressReporter,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<DeploySummary> {
    events.emit(reporter.initializing());
    check_preconditions(job)?;

    let local = scan::load_or_scan(&job.local_root, &job.scan, job.rescan)?;
    let local_manifest = scan::manifest_path(&job.local_root, &job.scan);
    info!(
        "Local manifest: {} entries ({} files)",
        local.len(),
        local.file_count()
    );

    if cancel.is_cancelled() {
        return Err(DeployError::Cancelled);
    }

    events.emit(DeployEvent::ConnectionInProgress);
    session.connect(&job.endpoint, &job.credentials, job.connect_timeout).await?;
    events.emit(DeployEvent::ConnectionSuccess);
    events.emit(reporter.connected());

    let remote = load_remote_manifest(session).await?;
    let queue = sync::diff(&local, remote.as_ref());
    events.emit(reporter.planned(queue.len()));

    let summary = TransferOrchestrator::new(session, queue, &job.local_root)
        .with_policy(job.policy)
        .with_events(events.clone())
        .with_cancel(cancel.clone())
        .run(reporter)
        .await?;

    ManifestPublisher::new(&local_manifest, job.policy)
        .publish(session, reporter, events, cancel)
        .await?;

    Ok(summary)
}

fn check_preconditions(job: &DeployJob) -> Result<()> {
    if !job.local_root.is_dir() {
        return Err(DeployError::Precondition(format!(
            "local output directory {} does not exist",
            job.local_root.display()
        )));
    }
    if job.endpoint.host.trim().is_empty() {
        return Err(DeployError::Precondition("remote host is not set".into()));
    }
    if job.endpoint.root.trim().is_empty() {
        return Err(DeployError::Precondition("remote root is not set".into()));
    }
    Ok(())
}

/// The manifest of the previous deployment, or `None` for a full upload.
///
/// Missing and unreadable manifests both mean "nothing known about the
/// remote"; only a lost connection is fatal.
async fn load_remote_manifest<T: Transport>(session: &mut ConnectionSession<T>) -> Result<Option<Manifest>> {
    let bytes = match session.fetch_manifest().await {
        Ok(bytes) => bytes,
        Err(SessionError::Transport(TransportError::NotFound(path))) => {
            info!("No remote manifest at {}, uploading everything", path);
            return Ok(None);
        }
        Err(e) if e.is_connection_lost() => return Err(e.into()),
        Err(e) => {
            warn!("Cannot download remote manifest, uploading everything: {}", e);
            return Ok(None);
        }
    };

    match Manifest::from_slice(&bytes) {
        Ok(manifest) => {
            info!("Remote manifest: {} entries", manifest.len());
            Ok(Some(manifest))
        }
        Err(e) => {
            warn!("Remote manifest is corrupt, uploading everything: {}", e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use crate::session::memory::{ConnectBehavior, MemoryTransport};
    use crate::session::DEPLOY_CONNECT_TIMEOUT;
    use crate::utils::FailureKind;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    const ROOT: &str = "/srv/site";
    const REMOTE_MANIFEST: &str = "/srv/site/files.manifest.json";

    fn job(local_root: &std::path::Path) -> DeployJob {
        DeployJob {
            local_root: local_root.to_path_buf(),
            endpoint: Endpoint {
                host: "example.com".into(),
                port: 22,
                root: ROOT.into(),
            },
            credentials: Credentials {
                username: "deploy".into(),
                password: "secret".into(),
            },
            policy: RetryPolicy::default(),
            session: SessionOptions::default(),
            connect_timeout: DEPLOY_CONNECT_TIMEOUT,
            rescan: true,
            scan: ScanOptions::default(),
        }
    }

    /// `index.html` (A) and `img/logo.png` (B).
    fn local_site() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("index.html"), b"A").unwrap();
        fs::write(dir.path().join("img/logo.png"), b"B").unwrap();
        dir
    }

    fn fingerprint(content: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        format!("{:x}", Sha256::digest(content))
    }

    /// Remote holding `index.html` (A) and `old.html` (C) from an earlier run.
    fn previous_deployment() -> MemoryTransport {
        let remote = MemoryTransport::with_root(ROOT);
        remote.add_file("/srv/site/index.html", "A");
        remote.add_file("/srv/site/old.html", "C");
        let manifest = Manifest::new(vec![
            ManifestEntry::file("index.html", fingerprint(b"A")),
            ManifestEntry::file("old.html", fingerprint(b"C")),
        ])
        .unwrap();
        remote.add_file(REMOTE_MANIFEST, manifest.to_json().unwrap());
        remote
    }

    fn drain(rx: &mut UnboundedReceiver<DeployEvent>) -> Vec<DeployEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn progress_values(events: &[DeployEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                DeployEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    fn summary(event: &TerminalEvent) -> &DeploySummary {
        match event {
            TerminalEvent::Success { details: Some(summary), .. } => summary,
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incremental_deployment() {
        let site = local_site();
        let remote = previous_deployment();
        let (events, mut rx) = EventSink::channel();

        let terminal = run_deployment(job(site.path()), remote.clone(), events, CancellationToken::new()).await;

        assert_eq!(terminal, TerminalEvent::Success {
            issues: false,
            details: Some(DeploySummary {
                uploaded_files: 1,
                created_directories: 1,
                deleted_files: 1,
                removed_directories: 0,
                total_operations: 3,
                failed_paths: vec![],
            }),
        });
        assert_eq!(
            remote.log(),
            vec![
                "get /srv/site/files.manifest.json",
                "mkdir /srv/site/img",
                "put /srv/site/img/logo.png",
                "delete /srv/site/old.html",
                "put /srv/site/files.manifest.json",
            ]
        );
        assert_eq!(remote.file("/srv/site/img/logo.png"), Some(b"B".to_vec()));
        assert!(remote.file("/srv/site/old.html").is_none());

        let published = Manifest::from_slice(&remote.file(REMOTE_MANIFEST).unwrap()).unwrap();
        assert_eq!(published.entries().len(), 3);
        assert!(!remote.is_connected());
        assert_eq!(remote.logouts(), 1);

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&DeployEvent::Finished(terminal)));
    }

    #[tokio::test]
    async fn test_event_sequence_and_monotonic_progress() {
        let site = local_site();
        let remote = previous_deployment();
        let (events, mut rx) = EventSink::channel();

        run_deployment(job(site.path()), remote, events, CancellationToken::new()).await;

        let events = drain(&mut rx);
        assert_eq!(events[0], DeployEvent::Progress { progress: 6, operations: None });
        assert_eq!(events[1], DeployEvent::ConnectionInProgress);
        assert_eq!(events[2], DeployEvent::ConnectionSuccess);

        let values = progress_values(&events);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values.first(), Some(&6));
        assert_eq!(values.last(), Some(&100));
        assert!(values.contains(&7));
        assert!(values.contains(&8));
        assert!(values.contains(&99));
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let site = local_site();
        let remote = previous_deployment();

        run_deployment(job(site.path()), remote.clone(), EventSink::disabled(), CancellationToken::new()).await;
        let mut second = job(site.path());
        second.rescan = false;
        let terminal = run_deployment(second, remote.clone(), EventSink::disabled(), CancellationToken::new()).await;

        assert_eq!(summary(&terminal).total_operations, 0);
        assert_eq!(remote.attempts("/srv/site/img/logo.png"), 1);
    }

    #[tokio::test]
    async fn test_corrupt_remote_manifest_uploads_everything() {
        let site = local_site();
        let remote = MemoryTransport::with_root(ROOT);
        remote.add_file(REMOTE_MANIFEST, "{not json");

        let terminal = run_deployment(job(site.path()), remote.clone(), EventSink::disabled(), CancellationToken::new()).await;

        let summary = summary(&terminal);
        assert_eq!(summary.uploaded_files, 2);
        assert_eq!(summary.created_directories, 1);
        assert_eq!(summary.deleted_files + summary.removed_directories, 0);
        assert!(Manifest::from_slice(&remote.file(REMOTE_MANIFEST).unwrap()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_fails_run() {
        let site = local_site();
        let remote = MemoryTransport::with_root(ROOT);
        remote.fail_always(REMOTE_MANIFEST);
        let (events, mut rx) = EventSink::channel();

        let terminal = run_deployment(job(site.path()), remote.clone(), events, CancellationToken::new()).await;

        assert!(matches!(terminal, TerminalEvent::Error { kind: FailureKind::ManifestPublish, .. }));
        assert_eq!(remote.file("/srv/site/index.html"), Some(b"A".to_vec()));
        let values = progress_values(&drain(&mut rx));
        assert!(!values.contains(&100));
        assert_eq!(values.last(), Some(&99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_error_reports_issues() {
        let site = local_site();
        let remote = MemoryTransport::with_root(ROOT);
        remote.fail_always("/srv/site/index.html");

        let terminal = run_deployment(job(site.path()), remote.clone(), EventSink::disabled(), CancellationToken::new()).await;

        match &terminal {
            TerminalEvent::Success { issues, details: Some(summary) } => {
                assert!(*issues);
                assert_eq!(summary.failed_paths, vec!["index.html".to_string()]);
                assert_eq!(summary.uploaded_files, 1);
            }
            other => panic!("expected success with issues, got {:?}", other),
        }
        assert_eq!(remote.attempts("/srv/site/index.html"), 6);
        assert!(remote.file(REMOTE_MANIFEST).is_some());
    }

    #[tokio::test]
    async fn test_missing_local_root_never_connects() {
        let site = TempDir::new().unwrap();
        let remote = MemoryTransport::with_root(ROOT);
        let (events, mut rx) = EventSink::channel();

        let terminal = run_deployment(
            job(&site.path().join("missing")),
            remote.clone(),
            events,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(terminal, TerminalEvent::Error { kind: FailureKind::Precondition, .. }));
        assert_eq!(remote.connects(), 0);
        assert!(remote.log().is_empty());
        assert!(!drain(&mut rx).contains(&DeployEvent::ConnectionInProgress));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let site = local_site();
        let remote = MemoryTransport::with_root(ROOT);
        remote.script_connect(vec![ConnectBehavior::Hang]);

        let terminal = run_deployment(job(site.path()), remote.clone(), EventSink::disabled(), CancellationToken::new()).await;

        assert!(matches!(terminal, TerminalEvent::Error { kind: FailureKind::ConnectionTimeout, .. }));
        assert!(remote.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_storm_cannot_connect() {
        let site = local_site();
        let remote = MemoryTransport::with_root(ROOT);
        remote.script_connect(vec![ConnectBehavior::Reset; 6]);

        let terminal = run_deployment(job(site.path()), remote.clone(), EventSink::disabled(), CancellationToken::new()).await;

        assert!(matches!(terminal, TerminalEvent::Error { kind: FailureKind::CannotConnect, .. }));
        assert_eq!(remote.connects(), 6);
    }

    #[tokio::test]
    async fn test_connection_lost_mid_run() {
        let site = local_site();
        let remote = MemoryTransport::with_root(ROOT);
        remote.disconnect_after(2);

        let terminal = run_deployment(job(site.path()), remote.clone(), EventSink::disabled(), CancellationToken::new()).await;

        assert!(matches!(terminal, TerminalEvent::Error { kind: FailureKind::ConnectionLost, .. }));
        assert!(remote.file(REMOTE_MANIFEST).is_none());
    }

    #[tokio::test]
    async fn test_reset_mid_run_aborts_without_retrying() {
        let site = local_site();
        let remote = MemoryTransport::with_root(ROOT);
        remote.reset_on("/srv/site/img");
        let (events, mut rx) = EventSink::channel();

        let terminal = run_deployment(job(site.path()), remote.clone(), events, CancellationToken::new()).await;

        assert!(matches!(terminal, TerminalEvent::Error { kind: FailureKind::ConnectionLost, .. }));
        assert_eq!(remote.attempts("/srv/site/img"), 1);
        assert_eq!(remote.attempts("/srv/site/index.html"), 0);
        assert!(remote.file(REMOTE_MANIFEST).is_none());
        assert!(!progress_values(&drain(&mut rx)).contains(&99));
    }

    #[tokio::test]
    async fn test_runs_through_boxed_transport() {
        let site = local_site();
        let remote = previous_deployment();
        let transport: Box<dyn Transport> = Box::new(remote.clone());

        let terminal = run_deployment(job(site.path()), transport, EventSink::disabled(), CancellationToken::new()).await;

        assert_eq!(summary(&terminal).total_operations, 3);
        assert_eq!(remote.logouts(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let site = local_site();
        let remote = MemoryTransport::with_root(ROOT);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let terminal = run_deployment(job(site.path()), remote.clone(), EventSink::disabled(), cancel).await;

        assert!(matches!(terminal, TerminalEvent::Error { kind: FailureKind::Cancelled, .. }));
        assert_eq!(remote.connects(), 0);
    }
}
