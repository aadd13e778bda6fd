//! Events streamed to the observer (GUI or parent process).

use crate::utils::{DeployError, FailureKind};
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::mpsc;

/// Per-run counts reported on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySummary {
    pub uploaded_files: usize,
    pub created_directories: usize,
    pub deleted_files: usize,
    pub removed_directories: usize,
    pub total_operations: usize,
    /// Keys of operations that exhausted their retries
    pub failed_paths: Vec<String>,
}

/// Final outcome of a deployment or connectivity test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalEvent {
    Success {
        issues: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<DeploySummary>,
    },
    Error {
        kind: FailureKind,
        details: String,
    },
}

impl TerminalEvent {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalEvent::Success { .. })
    }
}

impl From<&DeployError> for TerminalEvent {
    fn from(error: &DeployError) -> Self {
        TerminalEvent::Error {
            kind: error.failure_kind(),
            details: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DeployEvent {
    Progress {
        progress: u8,
        /// `[completed, total]`, or `false` outside the transfer phase
        #[serde(serialize_with = "operations_or_false")]
        operations: Option<(usize, usize)>,
    },
    ConnectionInProgress,
    ConnectionSuccess,
    Finished(TerminalEvent),
}

fn operations_or_false<S: Serializer>(value: &Option<(usize, usize)>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(pair) => pair.serialize(serializer),
        None => serializer.serialize_bool(false),
    }
}

/// Sending half handed to the engine. Emitting never fails; a dropped
/// observer just stops receiving.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<DeployEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeployEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink nobody listens to.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: DeployEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_wire_format() {
        let idle = DeployEvent::Progress { progress: 7, operations: None };
        assert_eq!(
            serde_json::to_value(&idle).unwrap(),
            serde_json::json!({"event": "progress", "progress": 7, "operations": false})
        );

        let busy = DeployEvent::Progress { progress: 50, operations: Some((3, 10)) };
        assert_eq!(
            serde_json::to_value(&busy).unwrap(),
            serde_json::json!({"event": "progress", "progress": 50, "operations": [3, 10]})
        );
    }

    #[test]
    fn test_terminal_wire_format() {
        let failed = DeployEvent::Finished(TerminalEvent::Error {
            kind: FailureKind::CannotConnect,
            details: "refused".into(),
        });
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["event"], "finished");
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "cannot-connect");
    }

    #[test]
    fn test_error_becomes_terminal_event() {
        let event = TerminalEvent::from(&DeployError::Secret("no secret stored".into()));
        assert_eq!(
            event,
            TerminalEvent::Error {
                kind: FailureKind::Precondition,
                details: "Secret store error: no secret stored".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_sink_survives_dropped_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(DeployEvent::ConnectionSuccess);
        EventSink::disabled().emit(DeployEvent::ConnectionInProgress);
    }
}
