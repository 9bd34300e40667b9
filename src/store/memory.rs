//! In-process record store.

use crate::domain::{FileRecord, MessageRecord, RelayError, RelayResult, SessionId};
use crate::store::RecordStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct SessionRows {
    files: Vec<FileRecord>,
    messages: Vec<MessageRecord>,
}

/// Per-session append-only vectors behind a single async lock.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: RwLock<HashMap<SessionId, SessionRows>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert_file(&self, record: FileRecord) -> RelayResult<()> {
        let mut rows = self.rows.write().await;
        let session = rows.entry(record.session_id.clone()).or_default();
        if session.files.iter().any(|f| f.id == record.id) {
            return Err(RelayError::storage(format!(
                "file record {} already exists",
                record.id
            )));
        }
        session.files.push(record);
        Ok(())
    }

    async fn insert_message(&self, record: MessageRecord) -> RelayResult<()> {
        let mut rows = self.rows.write().await;
        rows.entry(record.session_id.clone())
            .or_default()
            .messages
            .push(record);
        Ok(())
    }

    async fn list_files(&self, session_id: &SessionId) -> RelayResult<Vec<FileRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(session_id)
            .map(|s| s.files.clone())
            .unwrap_or_default())
    }

    async fn list_messages(&self, session_id: &SessionId) -> RelayResult<Vec<MessageRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default())
    }

    async fn find_file(&self, session_id: &SessionId, file_id: Uuid) -> RelayResult<FileRecord> {
        let rows = self.rows.read().await;
        rows.get(session_id)
            .and_then(|s| s.files.iter().find(|f| f.id == file_id))
            .cloned()
            .ok_or_else(|| RelayError::FileNotFound {
                file_id: file_id.to_string(),
            })
    }

    async fn forget_session(&self, session_id: &SessionId) -> RelayResult<()> {
        self.rows.write().await.remove(session_id);
        Ok(())
    }
}
