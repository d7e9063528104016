//! Error taxonomy for episode logging.
//!
//! Only [`LogError::Config`] and [`LogError::Storage`] are meant to abort a
//! run. Serialization and backend failures are recovered close to where they
//! happen and surface as a single warning; this type still carries them so the
//! recovery sites can report what went wrong.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    /// Invalid or contradictory logging options, detected at setup.
    #[error("invalid logging configuration: {0}")]
    Config(String),

    /// A single record field could not be represented in JSON.
    #[error("cannot serialize field `{field}`: {reason}")]
    Serialization { field: String, reason: String },

    /// A metrics backend failed to initialise or to accept data.
    #[error("metrics backend `{backend}` unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Writing to the episode log failed. Fatal for the owning logger.
    #[error("episode log {} failed: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Vector-shaped fields disagree in length, or scalar and vector modes
    /// were mixed within one episode.
    #[error("invalid episode record: {0}")]
    InvalidRecord(String),

    /// A persisted log could not be read back for analysis.
    #[error("cannot load log {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },
}

impl LogError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn backend(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must stop the logger that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Storage { .. })
    }
}

pub type Result<T> = std::result::Result<T, LogError>;
