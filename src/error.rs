//! Unified error types for the sync engine
//!
//! All fallible operations in the crate return [`MailError`]. API failures
//! carry the server's error code so callers can decide which ones are
//! recoverable; cancellation is modelled as an error internally but is never
//! surfaced as one by the orchestrator.

use thiserror::Error;
use tracing::{error, warn};

/// Server-side error codes the sync engine reacts to.
pub mod error_code {
    /// The folder was deleted server-side while we were syncing it.
    /// This is the one API error a refresh swallows silently.
    pub const FOLDER_DOES_NOT_EXIST: &str = "folder__not_exists";
}

/// Error type for all sync engine operations.
#[derive(Debug, Clone, Error)]
pub enum MailError {
    #[error("API error ({code}): {message}")]
    Api { code: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The in-flight refresh was superseded by a newer one. Not a failure;
    /// the orchestrator converts this into a silent non-result.
    #[error("refresh cancelled")]
    Cancelled,
}

impl MailError {
    /// Build an API error from a server error code.
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        MailError::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Known-recoverable API errors are swallowed by the refresh loop
    /// instead of being reported and surfaced.
    pub fn is_recoverable_api_error(&self) -> bool {
        matches!(self, MailError::Api { code, .. } if code == error_code::FOLDER_DOES_NOT_EXIST)
    }
}

impl From<rusqlite::Error> for MailError {
    fn from(err: rusqlite::Error) -> Self {
        MailError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for MailError {
    fn from(err: r2d2::Error) -> Self {
        MailError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for MailError {
    fn from(err: serde_json::Error) -> Self {
        MailError::Parse(err.to_string())
    }
}

/// Result type alias using MailError
pub type Result<T> = std::result::Result<T, MailError>;

/// External error-tracking collaborator.
///
/// Failures that abort a refresh go through [`ErrorReporter::report`];
/// data-consistency anomalies that do not abort anything (a message believed
/// new already existing locally, orphan rows left behind by a partial sync)
/// go through [`ErrorReporter::anomaly`].
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &MailError);

    fn anomaly(&self, message: &str);
}

/// Default reporter backed by `tracing`.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, err: &MailError) {
        error!("sync failure: {err}");
    }

    fn anomaly(&self, message: &str) {
        warn!("sync anomaly: {message}");
    }
}
