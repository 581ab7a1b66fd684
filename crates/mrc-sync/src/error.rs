use std::time::Duration;

use mrc_adapters::TableError;
use mrc_core::KeyBuildError;
use mrc_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure is handled by the entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or unparsable mandatory fields; the row is logged and skipped.
    Validation,
    /// Identity could not be resolved; the row is inserted as new.
    Resolution,
    /// A table, store or lock failed; the current unit of work is abandoned.
    Infrastructure,
    /// Bad manual input; reported back to the caller only.
    UserInput,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Key(#[from] KeyBuildError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("master lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("could not resolve identity: {0}")]
    Unresolved(String),
    #[error("{0}")]
    InvalidInput(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Key(_) => ErrorKind::Validation,
            SyncError::Unresolved(_) => ErrorKind::Resolution,
            SyncError::InvalidInput(_) => ErrorKind::UserInput,
            SyncError::Storage(_) | SyncError::Table(_) | SyncError::LockTimeout(_) => {
                ErrorKind::Infrastructure
            }
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use mrc_core::DateField;

    #[test]
    fn errors_map_onto_the_handling_taxonomy() {
        assert_eq!(
            SyncError::from(KeyBuildError::Missing(DateField::Dob)).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SyncError::from(TableError::SourceNotFound("x".into())).kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(
            SyncError::LockTimeout(Duration::from_secs(1)).kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(SyncError::Unresolved("orphan".into()).kind(), ErrorKind::Resolution);
        assert_eq!(SyncError::InvalidInput("dob".into()).kind(), ErrorKind::UserInput);
    }
}
