//! Error types for the offline layer

use thiserror::Error;

/// Result type alias for offline layer operations
pub type OfflineResult<T> = Result<T, OfflineError>;

/// Main error type for the offline layer
///
/// A cache miss is deliberately absent: lookups return `Option` and a miss
/// is just the next branch of a strategy.
#[derive(Error, Debug)]
pub enum OfflineError {
    /// The durable store or cache storage could not be opened or written.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A fetch rejected or the connection layer timed out.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// A single queued record could not be delivered.
    #[error("Sync drain failure for record {id}: {reason}")]
    SyncDrainFailure { id: i64, reason: String },

    /// A precache manifest entry could not be fetched.
    #[error("Install aborted while precaching {url}: {reason}")]
    InstallAbort { url: String, reason: String },

    /// A record does not fit the store it was written to.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl OfflineError {
    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkFailure(msg.into())
    }

    /// Create a new install abort
    pub fn install_abort(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InstallAbort {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a new invalid record error
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error should be swallowed with a log line instead of
    /// being propagated.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            OfflineError::StorageUnavailable(_) | OfflineError::SyncDrainFailure { .. }
        )
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            OfflineError::StorageUnavailable(_) => "storage_unavailable",
            OfflineError::NetworkFailure(_) => "network_failure",
            OfflineError::SyncDrainFailure { .. } => "sync_drain_failure",
            OfflineError::InstallAbort { .. } => "install_abort",
            OfflineError::InvalidRecord(_) => "invalid_record",
            OfflineError::Config(_) => "config",
            OfflineError::Io(_) => "io",
            OfflineError::Json(_) => "json",
            OfflineError::Url(_) => "url",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(OfflineError::storage("quota").category(), "storage_unavailable");
        assert_eq!(OfflineError::network("refused").category(), "network_failure");
        assert_eq!(
            OfflineError::install_abort("/app.js", "404").category(),
            "install_abort"
        );
    }

    #[test]
    fn test_degradable() {
        assert!(OfflineError::storage("disabled").is_degradable());
        assert!(OfflineError::SyncDrainFailure {
            id: 3,
            reason: "500".to_string()
        }
        .is_degradable());
        assert!(!OfflineError::network("offline").is_degradable());
        assert!(!OfflineError::install_abort("/", "offline").is_degradable());
    }

    #[test]
    fn test_display() {
        let err = OfflineError::install_abort("https://app.test/app.js", "status 404");
        assert_eq!(
            err.to_string(),
            "Install aborted while precaching https://app.test/app.js: status 404"
        );
    }
}
