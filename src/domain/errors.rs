//! Error types for the relay domain.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while coordinating a session.
///
/// The enum is serializable so the daemon can return it unchanged over RPC.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RelayError {
    /// No session was ever created with this id.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    /// The session exists but its TTL has elapsed.
    #[error("session expired: {session_id}")]
    SessionExpired { session_id: String },
    /// A guest action was attempted while the host had the session locked.
    #[error("session {session_id} is locked by the receiver")]
    SessionAlreadyLocked { session_id: String },
    /// Storing or recording an upload failed.
    #[error("upload failed: {reason}")]
    UploadFailed { reason: String },
    /// Subscribe or publish transport failure.
    #[error("channel unavailable: {message}")]
    ChannelUnavailable { message: String },
    /// The file is above the inline preview threshold.
    #[error("file of {size} bytes exceeds the {limit} byte preview limit")]
    PreviewTooLarge { size: u64, limit: u64 },
    /// A session with this id already exists; the caller must pick a new id.
    #[error("session id already in use: {session_id}")]
    IdCollision { session_id: String },
    /// A subscriber fell behind and missed events on a topic.
    #[error("subscriber lagged on {topic}, {skipped} events skipped")]
    SubscriberLagged { topic: String, skipped: u64 },
    /// No file record with this id in the session.
    #[error("file not found: {file_id}")]
    FileNotFound { file_id: String },
    /// A signed link was malformed, tampered with, or past its expiry.
    #[error("link rejected: {message}")]
    LinkRejected { message: String },
    /// Caller supplied malformed input.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    /// Backing store failure.
    #[error("storage failure: {message}")]
    Storage { message: String },
    /// The session owner stopped before answering.
    #[error("session actor unavailable: {message}")]
    ActorUnavailable { message: String },
}

impl RelayError {
    /// Lifecycle errors end the device's participation; the session cannot recover.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayError::SessionNotFound { .. } | RelayError::SessionExpired { .. }
        )
    }

    /// Only transport failures are retried, and only by the transport layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::ChannelUnavailable { .. })
    }

    pub fn channel(message: impl Into<String>) -> Self {
        RelayError::ChannelUnavailable {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        RelayError::Storage {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        RelayError::InvalidInput {
            message: message.into(),
        }
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(RelayError::SessionExpired {
            session_id: "abc".into()
        }
        .is_terminal());
        assert!(RelayError::SessionNotFound {
            session_id: "abc".into()
        }
        .is_terminal());
        assert!(!RelayError::SessionAlreadyLocked {
            session_id: "abc".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_only_channel_errors_retry() {
        assert!(RelayError::channel("reset").is_retryable());
        assert!(!RelayError::UploadFailed {
            reason: "disk full".into()
        }
        .is_retryable());
        assert!(!RelayError::IdCollision {
            session_id: "abc".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_display() {
        let err = RelayError::PreviewTooLarge {
            size: 60,
            limit: 50,
        };
        assert_eq!(
            err.to_string(),
            "file of 60 bytes exceeds the 50 byte preview limit"
        );
    }
}
