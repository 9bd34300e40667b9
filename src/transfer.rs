//! Uploads, quick messages and signed download access.
//!
//! Uploads never hold a session-wide lock: the blob is written first and only
//! the final record append goes through the session actor, which re-checks
//! the lock flag and expiry at that point.

use crate::domain::{
    FileRecord, MessageKind, MessageRecord, RelayError, RelayResult, SessionId, SharedClock,
    UploadId, UploadProgressEvent,
};
use crate::session::{SessionHandle, SessionRegistry};
use crate::store::{storage_path, BlobStore, RecordStore, SignedLink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Limits applied by the transfer service.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub preview_max_bytes: u64,
    pub download_link_ttl: Duration,
    pub preview_link_ttl: Duration,
    /// Blob writes slower than this fail the upload.
    pub upload_watchdog: Option<Duration>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            preview_max_bytes: 50 * 1024 * 1024,
            download_link_ttl: Duration::from_secs(60),
            preview_link_ttl: Duration::from_secs(300),
            upload_watchdog: None,
        }
    }
}

/// Persisted state for a device that joined late.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUp {
    pub files: Vec<FileRecord>,
    pub messages: Vec<MessageRecord>,
}

/// A file and its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedFile {
    pub record: FileRecord,
    pub bytes: Vec<u8>,
}

pub struct TransferService {
    registry: Arc<SessionRegistry>,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    clock: SharedClock,
    settings: TransferSettings,
}

impl TransferService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        clock: SharedClock,
        settings: TransferSettings,
    ) -> Self {
        Self {
            registry,
            blobs,
            records,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Handle of an active, unlocked session.
    async fn writable(&self, session_id: &SessionId) -> RelayResult<SessionHandle> {
        let handle = self.registry.handle(session_id).await?;
        handle.validate().await?.check_unlocked()?;
        Ok(handle)
    }

    /// Stores a file and announces it to the session.
    ///
    /// Lifecycle and lock errors are returned before anything is written.
    /// Once the upload has started, any failure is published as a terminal
    /// `error` progress event and returned as `UploadFailed`.
    pub async fn upload(
        &self,
        session_id: &SessionId,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> RelayResult<FileRecord> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(RelayError::invalid("file name must not be empty"));
        }
        let handle = self.writable(session_id).await?;

        let upload_id = UploadId::generate();
        let path = storage_path(session_id, &upload_id, file_name);
        let size = bytes.len() as u64;
        tracing::info!(session = %session_id, upload = %upload_id, file = file_name, size, "upload started");

        self.progress(&handle, UploadProgressEvent::uploading(upload_id.clone(), file_name, 0))
            .await;

        let record = FileRecord {
            id: Uuid::new_v4(),
            session_id: session_id.clone(),
            name: file_name.to_string(),
            size,
            content_type: content_type.to_string(),
            storage_path: path.clone(),
            created_at: self.clock.now(),
        };

        let stored = self.store_blob(&path, content_type, bytes).await;
        let appended = match stored {
            Ok(()) => handle.append_file(record.clone()).await,
            Err(e) => Err(e),
        };

        match appended {
            Ok(()) => {
                self.progress(&handle, UploadProgressEvent::completed(upload_id.clone(), file_name))
                    .await;
                tracing::info!(session = %session_id, upload = %upload_id, "upload completed");
                Ok(record)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(session = %session_id, upload = %upload_id, error = %reason, "upload failed");
                if let Err(cleanup) = self.blobs.delete(&path).await {
                    tracing::warn!(path = %path, error = %cleanup, "orphan blob left behind");
                }
                self.progress(
                    &handle,
                    UploadProgressEvent::failed(upload_id, file_name, reason.clone()),
                )
                .await;
                Err(RelayError::UploadFailed { reason })
            }
        }
    }

    async fn store_blob(&self, path: &str, content_type: &str, bytes: Vec<u8>) -> RelayResult<()> {
        let put = self.blobs.put(path, content_type, bytes);
        match self.settings.upload_watchdog {
            Some(limit) => match tokio::time::timeout(limit, put).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::storage(format!(
                    "timed out after {}s",
                    limit.as_secs_f32()
                ))),
            },
            None => put.await,
        }
    }

    /// Best effort; progress is never the source of truth for completion.
    async fn progress(&self, handle: &SessionHandle, event: UploadProgressEvent) {
        if let Err(e) = handle.publish_progress(event).await {
            tracing::debug!(session = %handle.id(), error = %e, "progress not published");
        }
    }

    /// Posts a quick text or link message.
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> RelayResult<MessageRecord> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RelayError::invalid("message must not be empty"));
        }
        let handle = self.writable(session_id).await?;

        let record = MessageRecord {
            id: Uuid::new_v4(),
            session_id: session_id.clone(),
            content: content.to_string(),
            kind: MessageKind::classify(content),
            created_at: self.clock.now(),
        };
        handle.append_message(record.clone()).await?;
        Ok(record)
    }

    async fn find_file(&self, session_id: &SessionId, file_id: Uuid) -> RelayResult<FileRecord> {
        self.registry.validate(session_id).await?;
        self.records.find_file(session_id, file_id).await
    }

    /// Short-lived download link. Requested on demand, never cached.
    pub async fn download_link(&self, session_id: &SessionId, file_id: Uuid) -> RelayResult<SignedLink> {
        let record = self.find_file(session_id, file_id).await?;
        self.blobs
            .sign(&record.storage_path, self.settings.download_link_ttl)
    }

    /// Preview link, refused for files above the preview threshold before
    /// any link is issued.
    pub async fn preview_link(&self, session_id: &SessionId, file_id: Uuid) -> RelayResult<SignedLink> {
        let record = self.find_file(session_id, file_id).await?;
        if record.size > self.settings.preview_max_bytes {
            return Err(RelayError::PreviewTooLarge {
                size: record.size,
                limit: self.settings.preview_max_bytes,
            });
        }
        self.blobs
            .sign(&record.storage_path, self.settings.preview_link_ttl)
    }

    /// Downloads a file through a freshly signed link.
    pub async fn fetch(&self, session_id: &SessionId, file_id: Uuid) -> RelayResult<FetchedFile> {
        let record = self.find_file(session_id, file_id).await?;
        let link = self
            .blobs
            .sign(&record.storage_path, self.settings.download_link_ttl)?;
        let bytes = self.blobs.redeem(&link.url).await?;
        Ok(FetchedFile { record, bytes })
    }

    /// Persisted files and messages of a session, oldest first.
    pub async fn catch_up(&self, session_id: &SessionId) -> RelayResult<CatchUp> {
        self.registry.validate(session_id).await?;
        Ok(CatchUp {
            files: self.records.list_files(session_id).await?,
            messages: self.records.list_messages(session_id).await?,
        })
    }
}

#[cfg(test)]
#[path = "tests/transfer_tests.rs"]
mod tests;
