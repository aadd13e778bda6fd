//! Deployment planning: operation types and the manifest diff engine.

pub mod diff;
pub mod operation;

pub use diff::diff;
pub use operation::{DeployOperation, OperationKind};
