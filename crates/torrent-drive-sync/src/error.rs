//! Error types for the sync library.

use thiserror::Error;

/// Failure categories reported by the publish (cloud upload) side.
///
/// The coordinator uses the kind to decide whether a failed publish
/// attempt is worth retrying: transient transport problems and rate
/// limits are, credential and quota problems are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorKind {
    /// Invalid or expired credentials (HTTP 401, auth-flavored 403).
    Auth,
    /// Storage quota exhausted on the remote drive.
    Quota,
    /// Request was throttled by the API.
    RateLimited,
    /// Transport failure or server-side error.
    Network,
}

impl PublishErrorKind {
    /// Whether a publish attempt that failed with this kind may succeed
    /// if repeated.
    pub fn is_retryable(self) -> bool {
        matches!(self, PublishErrorKind::RateLimited | PublishErrorKind::Network)
    }
}

impl std::fmt::Display for PublishErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PublishErrorKind::Auth => "auth",
            PublishErrorKind::Quota => "quota",
            PublishErrorKind::RateLimited => "rate-limited",
            PublishErrorKind::Network => "network",
        };
        f.write_str(s)
    }
}

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, invalid CLI input).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Torrent engine error during the acquire phase.
    #[error("Acquire failed for {source_name}: {message}")]
    Acquire { source_name: String, message: String },

    /// Cloud storage error during the publish phase.
    #[error("Publish failed ({kind}): {message}")]
    Publish {
        kind: PublishErrorKind,
        message: String,
    },

    /// The durable session record exists but cannot be read.
    #[error("Session file is corrupt: {0}. Run `clear` to discard it and start fresh.")]
    SessionCorrupt(String),

    /// Another invocation holds the session lock.
    #[error("Session is locked by another invocation: {0}")]
    SessionLocked(String),

    /// One or more items ended the run in the Failed phase.
    #[error("{0} item(s) failed")]
    ItemsFailed(usize),

    /// The run was cancelled (SIGINT, SIGTERM).
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SyncError {
    /// Create an Acquire error for a given torrent source.
    pub fn acquire(source: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Acquire {
            source_name: source.into(),
            message: message.into(),
        }
    }

    /// Create a Publish error of the given kind.
    pub fn publish(kind: PublishErrorKind, message: impl Into<String>) -> Self {
        SyncError::Publish {
            kind,
            message: message.into(),
        }
    }

    /// Whether another attempt at the same phase may succeed.
    ///
    /// Acquire failures are always retryable (peers come and go); publish
    /// failures defer to their kind; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Acquire { .. } => true,
            SyncError::Publish { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) => 1,
            SyncError::SessionCorrupt(_) => 2,
            SyncError::SessionLocked(_) => 3,
            SyncError::ItemsFailed(_) => 4,
            SyncError::Acquire { .. } => 5,
            SyncError::Publish { .. } => 6,
            SyncError::Io(_) | SyncError::Json(_) => 7,
            SyncError::Cancelled => 130,
        }
    }

    /// Format error with full details including the error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\n\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_retryable() {
        let err = SyncError::acquire("magnet:?xt=...", "no peers");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_publish_retryable_by_kind() {
        assert!(SyncError::publish(PublishErrorKind::Network, "timeout").is_retryable());
        assert!(SyncError::publish(PublishErrorKind::RateLimited, "429").is_retryable());
        assert!(!SyncError::publish(PublishErrorKind::Auth, "401").is_retryable());
        assert!(!SyncError::publish(PublishErrorKind::Quota, "full").is_retryable());
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            SyncError::Config("x".into()),
            SyncError::SessionCorrupt("x".into()),
            SyncError::SessionLocked("x".into()),
            SyncError::ItemsFailed(1),
            SyncError::acquire("s", "m"),
            SyncError::publish(PublishErrorKind::Network, "m"),
            SyncError::Cancelled,
        ];
        let mut codes: Vec<u8> = errors.iter().map(|e| e.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_format_detailed_starts_with_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = SyncError::Io(io);
        assert!(err.format_detailed().starts_with("Error: IO error"));
    }
}
