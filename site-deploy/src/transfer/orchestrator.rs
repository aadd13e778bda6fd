//! Transfer orchestrator: drains the operation queue strictly one
//! operation at a time with a flat per-operation retry policy.
//!
//! A failing operation is retried after a fixed pause; once its budget is
//! spent it is recorded as a hard error and the queue moves on, so one bad
//! path cannot block the rest of the deployment. Losing the connection
//! aborts the run.

use super::events::{DeploySummary, EventSink};
use super::progress::ProgressReporter;
use crate::session::{ConnectionSession, SessionError, SessionState, Transport, TransportError};
use crate::sync::{DeployOperation, OperationKind};
use crate::utils::{DeployError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Flat retry policy: fixed pause, fixed budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Queue position and error bookkeeping for one run.
#[derive(Debug)]
pub struct TransferState {
    queue: Vec<DeployOperation>,
    cursor: usize,
    /// queue index -> failed attempts of that operation
    soft_error_counts: HashMap<usize, u32>,
    hard_errors: Vec<String>,
}

impl TransferState {
    pub fn new(queue: Vec<DeployOperation>) -> Self {
        Self {
            queue,
            cursor: 0,
            soft_error_counts: HashMap::new(),
            hard_errors: Vec::new(),
        }
    }

    pub fn current(&self) -> Option<&DeployOperation> {
        self.queue.get(self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> usize {
        self.queue.len()
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.queue.len()
    }

    pub fn hard_errors(&self) -> &[String] {
        &self.hard_errors
    }

    fn advance(&mut self) {
        self.cursor += 1;
    }

    /// Count a failure of the operation under the cursor; returns its failures so far.
    fn record_soft_error(&mut self) -> u32 {
        let count = self.soft_error_counts.entry(self.cursor).or_insert(0);
        *count += 1;
        *count
    }

    /// Give up on the operation under the cursor.
    fn mark_hard_error(&mut self) {
        if let Some(op) = self.queue.get(self.cursor) {
            self.hard_errors.push(op.key().to_string());
        }
    }
}

pub struct TransferOrchestrator<'a, T> {
    session: &'a mut ConnectionSession<T>,
    state: TransferState,
    local_root: PathBuf,
    policy: RetryPolicy,
    events: EventSink,
    cancel: CancellationToken,
}

impl<'a, T: Transport> TransferOrchestrator<'a, T> {
    pub fn new(session: &'a mut ConnectionSession<T>, queue: Vec<DeployOperation>, local_root: &Path) -> Self {
        Self {
            session,
            state: TransferState::new(queue),
            local_root: local_root.to_path_buf(),
            policy: RetryPolicy::default(),
            events: EventSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute the whole queue. Hard errors end up in the summary; only a
    /// lost connection or cancellation returns `Err`.
    pub async fn run(mut self, reporter: &mut ProgressReporter) -> Result<DeploySummary> {
        let remote_root = self
            .session
            .remote_root()
            .map(str::to_string)
            .ok_or(SessionError::InvalidState {
                expected: SessionState::Ready,
                actual: self.session.state(),
            })?;

        let mut summary = DeploySummary {
            total_operations: self.state.total(),
            ..Default::default()
        };

        info!("Executing {} operations", self.state.total());

        while let Some(op) = self.state.current().cloned() {
            if self.cancel.is_cancelled() {
                warn!(
                    "Deployment cancelled at operation {}/{}",
                    self.state.cursor(),
                    self.state.total()
                );
                return Err(DeployError::Cancelled);
            }

            let remote = op.remote_path(&remote_root);
            match self.execute(&op, &remote).await {
                Ok(()) => {
                    info!("{} -> {}", op, remote);
                    record(&mut summary, op.kind);
                    self.state.advance();
                }
                Err(e) if e.is_operation_failure() => {
                    let failures = self.state.record_soft_error();
                    if failures <= self.policy.max_retries {
                        warn!(
                            "{} failed ({}/{} retries), retrying in {:?}: {}",
                            op, failures, self.policy.max_retries, self.policy.backoff, e
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(self.policy.backoff) => {}
                            _ = self.cancel.cancelled() => {}
                        }
                        continue;
                    }

                    error!("{} failed after {} attempts, skipping: {}", op, failures, e);
                    self.state.mark_hard_error();
                    self.state.advance();
                }
                Err(e) => {
                    error!("Aborting transfer at {}: {}", op, e);
                    return Err(e.into());
                }
            }

            self.events.emit(reporter.operation_finished(self.state.cursor()));
        }

        summary.failed_paths = self.state.hard_errors().to_vec();
        info!(
            "Transfer finished: {} uploaded, {} dirs created, {} deleted, {} dirs removed, {} failed",
            summary.uploaded_files,
            summary.created_directories,
            summary.deleted_files,
            summary.removed_directories,
            summary.failed_paths.len()
        );
        Ok(summary)
    }

    async fn execute(&mut self, op: &DeployOperation, remote: &str) -> std::result::Result<(), SessionError> {
        let result = match op.kind {
            OperationKind::Mkdir => self.session.make_directory(remote).await,
            OperationKind::Upload => match op.local_path(&self.local_root) {
                Some(local) => self.session.put_file(&local, remote).await,
                None => Ok(()),
            },
            OperationKind::DeleteFile => self.session.delete_file(remote).await,
            OperationKind::Rmdir => self.session.remove_directory(remote).await,
        };

        match result {
            // a removal whose target is already gone has nothing left to do
            Err(SessionError::Transport(TransportError::NotFound(path))) if !op.kind.is_creation() => {
                debug!("{} already gone on the remote", path);
                Ok(())
            }
            other => other,
        }
    }
}

fn record(summary: &mut DeploySummary, kind: OperationKind) {
    match kind {
        OperationKind::Mkdir => summary.created_directories += 1,
        OperationKind::Upload => summary.uploaded_files += 1,
        OperationKind::DeleteFile => summary.deleted_files += 1,
        OperationKind::Rmdir => summary.removed_directories += 1,
    }
}
