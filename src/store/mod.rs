//! Interfaces to the stores that sit outside the coordination core.
//!
//! - **BlobStore**: durable bytes of uploaded files plus time-limited signed links
//! - **RecordStore**: file and message rows, queried for catch-up
//!
//! `LocalBlobStore` and `MemoryRecordStore` are the implementations the daemon
//! ships with.

pub mod local;
pub mod memory;

pub use local::LocalBlobStore;
pub use memory::MemoryRecordStore;

use crate::domain::{
    FileRecord, MessageRecord, RelayResult, SessionId, TimestampUtc, UploadId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A time-limited URL for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLink {
    pub url: String,
    pub path: String,
    pub expires_at: TimestampUtc,
}

/// Durable object storage for uploaded bytes.
#[async_trait]
pub trait BlobStore: std::fmt::Debug + Send + Sync {
    async fn put(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> RelayResult<()>;

    async fn read(&self, path: &str) -> RelayResult<Vec<u8>>;

    /// Removes an object. Removing a missing object is not an error.
    async fn delete(&self, path: &str) -> RelayResult<()>;

    /// Removes every object under `sessions/{session_id}/`.
    async fn delete_session(&self, session_id: &SessionId) -> RelayResult<()>;

    /// Issues a link valid for `ttl`. Links are never cached.
    fn sign(&self, path: &str, ttl: Duration) -> RelayResult<SignedLink>;

    /// Resolves a link issued by `sign`, failing once it has expired.
    async fn redeem(&self, url: &str) -> RelayResult<Vec<u8>>;
}

/// Append-only rows for files and messages.
#[async_trait]
pub trait RecordStore: std::fmt::Debug + Send + Sync {
    async fn insert_file(&self, record: FileRecord) -> RelayResult<()>;

    async fn insert_message(&self, record: MessageRecord) -> RelayResult<()>;

    /// Files of a session in insertion order.
    async fn list_files(&self, session_id: &SessionId) -> RelayResult<Vec<FileRecord>>;

    /// Messages of a session in insertion order.
    async fn list_messages(&self, session_id: &SessionId) -> RelayResult<Vec<MessageRecord>>;

    async fn find_file(&self, session_id: &SessionId, file_id: Uuid) -> RelayResult<FileRecord>;

    /// Drops every row of a session.
    async fn forget_session(&self, session_id: &SessionId) -> RelayResult<()>;
}

/// Storage path of an upload: `sessions/{session_id}/{upload_id}-{file_name}`.
///
/// Path separators are removed from the file name so an upload can never
/// escape its session directory.
pub fn storage_path(session_id: &SessionId, upload_id: &UploadId, file_name: &str) -> String {
    format!(
        "sessions/{}/{}-{}",
        session_id,
        upload_id,
        sanitize_file_name(file_name)
    )
}

/// Strips separators and control characters from a client supplied file name.
pub fn sanitize_file_name(file_name: &str) -> String {
    let cleaned: String = file_name
        .chars()
        .filter(|c| *c != '/' && *c != '\\' && !c.is_control())
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_path_convention() {
        let session = SessionId::parse("abc1234567").unwrap();
        let upload = UploadId::parse("up1234567").unwrap();
        assert_eq!(
            storage_path(&session, &upload, "photo.jpg"),
            "sessions/abc1234567/up1234567-photo.jpg"
        );
    }

    #[test]
    fn test_storage_path_strips_separators() {
        let session = SessionId::parse("abc1234567").unwrap();
        let upload = UploadId::parse("up1234567").unwrap();
        assert_eq!(
            storage_path(&session, &upload, "../../etc/passwd"),
            "sessions/abc1234567/up1234567-....etcpasswd"
        );
        assert_eq!(
            storage_path(&session, &upload, "dir\\name.txt"),
            "sessions/abc1234567/up1234567-dirname.txt"
        );
    }

    #[test]
    fn test_empty_file_name_gets_placeholder() {
        assert_eq!(sanitize_file_name("//"), "file");
    }
}
