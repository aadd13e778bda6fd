//! Units of work executed against the remote store.

use crate::manifest::remote_join;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Mkdir,
    Upload,
    DeleteFile,
    Rmdir,
}

impl OperationKind {
    /// True for operations that create or replace remote content.
    pub fn is_creation(self) -> bool {
        matches!(self, OperationKind::Mkdir | OperationKind::Upload)
    }

    fn label(self) -> &'static str {
        match self {
            OperationKind::Mkdir => "mkdir",
            OperationKind::Upload => "upload",
            OperationKind::DeleteFile => "delete-file",
            OperationKind::Rmdir => "rmdir",
        }
    }
}

/// One queued operation; `path` is site-relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOperation {
    pub kind: OperationKind,
    pub path: String,
}

impl DeployOperation {
    pub fn mkdir(path: impl Into<String>) -> Self {
        Self { kind: OperationKind::Mkdir, path: path.into() }
    }

    pub fn upload(path: impl Into<String>) -> Self {
        Self { kind: OperationKind::Upload, path: path.into() }
    }

    pub fn delete_file(path: impl Into<String>) -> Self {
        Self { kind: OperationKind::DeleteFile, path: path.into() }
    }

    pub fn rmdir(path: impl Into<String>) -> Self {
        Self { kind: OperationKind::Rmdir, path: path.into() }
    }

    pub fn key(&self) -> &str {
        &self.path
    }

    /// Local file an upload reads from.
    pub fn local_path(&self, local_root: &Path) -> Option<PathBuf> {
        (self.kind == OperationKind::Upload).then(|| local_root.join(&self.path))
    }

    pub fn remote_path(&self, remote_root: &str) -> String {
        remote_join(remote_root, &self.path)
    }
}

impl fmt::Display for DeployOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.label(), self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let upload = DeployOperation::upload("img/logo.png");
        assert_eq!(
            upload.local_path(Path::new("/site/output")),
            Some(PathBuf::from("/site/output/img/logo.png"))
        );
        assert_eq!(upload.remote_path("/var/www"), "/var/www/img/logo.png");

        let delete = DeployOperation::delete_file("old.html");
        assert_eq!(delete.local_path(Path::new("/site/output")), None);
        assert_eq!(delete.to_string(), "delete-file old.html");
    }
}
