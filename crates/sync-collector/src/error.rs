//! Error types for the Collector subsystem

use shared_types::{Did, Sindex};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur in the Collector subsystem
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Unknown store: {0}")]
    UnknownStore(Sindex),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Collector actor is no longer running")]
    ActorUnavailable,
}

/// Errors from the key-value layer underneath the filter tables
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Corrupted row {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

/// Retry classification of a download error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Do not retry against this device until it announces a new filter.
    Permanent,
    /// Retry after backing off.
    Transient,
}

/// Error reported by the download engine for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<DownloadError>,
    },
}

impl DownloadError {
    pub fn permanent(reason: impl Into<String>) -> Self {
        DownloadError::Permanent(reason.into())
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        DownloadError::Transient(reason.into())
    }

    /// Wrap this error with additional context. Severity is preserved.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        DownloadError::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Severity of the innermost error.
    pub fn severity(&self) -> Severity {
        match self {
            DownloadError::Permanent(_) => Severity::Permanent,
            DownloadError::Transient(_) => Severity::Transient,
            DownloadError::Wrapped { source, .. } => source.severity(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.severity() == Severity::Permanent
    }
}

/// How a download request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadFailure {
    /// Failure not attributable to a particular device.
    General(DownloadError),
    /// One error per device that was tried.
    PerDevice(HashMap<Did, DownloadError>),
}

/// Result of a collector operation
pub type CollectorResult<T> = Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_unwraps_nested_wrappers() {
        let err = DownloadError::permanent("no such object")
            .wrap("remote call failed")
            .wrap("device attempt failed");

        assert_eq!(err.severity(), Severity::Permanent);
        assert!(err.is_permanent());
    }

    #[test]
    fn test_transient_stays_transient_when_wrapped() {
        let err = DownloadError::transient("timeout").wrap("rpc");
        assert_eq!(err.severity(), Severity::Transient);
        assert_eq!(err.to_string(), "rpc: transient: timeout");
    }

    #[test]
    fn test_storage_error_converts_into_collector_error() {
        let err: CollectorError = StorageError::Io("disk gone".into()).into();
        assert!(matches!(err, CollectorError::Storage(StorageError::Io(_))));
    }
}
