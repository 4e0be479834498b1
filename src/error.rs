use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Structural problems in a delta stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    #[error("malformed delta: {0}")]
    Format(String),
    #[error("delta truncated at byte {offset} while reading {field}")]
    Truncated { offset: usize, field: &'static str },
}

impl DeltaError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        DeltaError::Format(msg.into())
    }
}

/// Why a launched process failed an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    #[error("could not be launched: {0}")]
    Launch(String),
    #[error("exited with rollback-triggering code {0}")]
    ExitCode(i32),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error("installed file '{path}' does not match the update base: expected checksum {expected:08x}, got {actual:08x}")]
    SourceMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("reconstructed '{path}' failed verification: expected checksum {expected:08x}, got {actual:08x}")]
    TargetMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("{op} '{}': {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("process '{path}' {failure}")]
    ProcessExecution {
        path: String,
        failure: ExecutionFailure,
    },

    #[error("component registration for '{path}' failed: {reason}")]
    Registration { path: String, reason: String },

    #[error("payload '{reference}' for '{path}' is missing from the package")]
    MissingPayload { path: String, reference: String },

    #[error("invalid action '{path}': {reason}")]
    InvalidAction { path: String, reason: String },

    #[error("update cancelled")]
    Cancelled,

    #[error("rollback failed after: {original}; {} undo step(s) failed, first: {}", failures.len(), first_failure(failures))]
    RollbackFailure {
        original: Box<UpdateError>,
        failures: Vec<UpdateError>,
    },
}

fn first_failure(failures: &[UpdateError]) -> String {
    failures
        .first()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl UpdateError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        UpdateError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// True for `FormatError`/`TruncatedInputError` from the delta decoder.
    pub fn is_delta(&self) -> bool {
        matches!(self, UpdateError::Delta(_))
    }

    pub fn is_rollback_failure(&self) -> bool {
        matches!(self, UpdateError::RollbackFailure { .. })
    }
}
