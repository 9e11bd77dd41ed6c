pub mod entry;
pub mod writer;

pub use entry::{AuditEntry, AuditStatus};
pub use writer::{AuditLogWriter, AuditSettings};

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit log I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AuditError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        "AUDIT_IO_ERROR"
    }
}
