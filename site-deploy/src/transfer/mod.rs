//! Queue execution and progress reporting.

pub mod events;
pub mod orchestrator;
pub mod progress;

pub use events::{DeployEvent, DeploySummary, EventSink, TerminalEvent};
pub use orchestrator::{RetryPolicy, TransferOrchestrator, TransferState};
pub use progress::ProgressReporter;
