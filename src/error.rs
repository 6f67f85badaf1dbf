//! Error types shared across the lab core.

use crate::vfs::VfsError;
use thiserror::Error;

/// Errors surfaced by the session controller and its collaborators.
///
/// `NotFound`, `Denied` and `Malformed` never escape the terminal: the
/// interpreter renders them as text. They do reach callers of the
/// controller's non-terminal API (exercise selection, editor file access).
#[derive(Error, Debug)]
pub enum LabError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Denied(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// Operation is not valid in the current lifecycle state.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VfsError> for LabError {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::NotFound(_) => LabError::NotFound(err.to_string()),
            _ => LabError::Malformed(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LabError>;
