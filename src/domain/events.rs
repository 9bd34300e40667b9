//! Records and events exchanged between the devices of a session.
//!
//! `SessionEvent` is the closed set of everything a subscriber can receive.
//! Adding a kind is a compile-time-visible change for every consumer.

use crate::domain::types::{
    DeviceType, MessageKind, SessionId, TimestampUtc, UploadId, UploadStatus, UserId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A file that finished uploading. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub storage_path: String,
    pub created_at: TimestampUtc,
}

/// A quick text or link message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: TimestampUtc,
}

/// Ephemeral progress tick for one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgressEvent {
    pub upload_id: UploadId,
    pub file_name: String,
    /// Percentage in `0..=100`.
    pub progress: u8,
    pub status: UploadStatus,
    pub error: Option<String>,
}

impl UploadProgressEvent {
    pub fn uploading(upload_id: UploadId, file_name: impl Into<String>, progress: u8) -> Self {
        Self {
            upload_id,
            file_name: file_name.into(),
            progress: progress.min(100),
            status: UploadStatus::Uploading,
            error: None,
        }
    }

    pub fn completed(upload_id: UploadId, file_name: impl Into<String>) -> Self {
        Self {
            upload_id,
            file_name: file_name.into(),
            progress: 100,
            status: UploadStatus::Completed,
            error: None,
        }
    }

    pub fn failed(upload_id: UploadId, file_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            upload_id,
            file_name: file_name.into(),
            progress: 0,
            status: UploadStatus::Error,
            error: Some(reason.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Live membership information for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub device_type: DeviceType,
    pub display_name: String,
    pub joined_at: TimestampUtc,
    pub last_seen: TimestampUtc,
}

impl PresenceEntry {
    pub fn new(
        user_id: UserId,
        device_type: DeviceType,
        display_name: impl Into<String>,
        now: TimestampUtc,
    ) -> Self {
        Self {
            user_id,
            device_type,
            display_name: display_name.into(),
            joined_at: now,
            last_seen: now,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.device_type == DeviceType::Guest
    }
}

/// Full presence snapshot, sent after every join or leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSync {
    pub session_id: SessionId,
    pub entries: Vec<PresenceEntry>,
}

impl PresenceSync {
    pub fn guest_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_guest()).count()
    }
}

/// What changed on the session-state topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChange {
    Locked,
    Unlocked,
    /// A guest appeared on an unlocked session; the host should approve or ignore.
    ApprovalRequested(PresenceEntry),
    /// The pending approval went away without a lock change.
    ApprovalDismissed,
}

/// Event on the session-state topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStateEvent {
    pub session_id: SessionId,
    pub locked: bool,
    pub change: StateChange,
    pub at: TimestampUtc,
}

/// Logical broadcast streams scoped to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Files,
    Messages,
    SessionState,
    Presence,
    Progress,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Files,
        Topic::Messages,
        Topic::SessionState,
        Topic::Presence,
        Topic::Progress,
    ];

    /// Persisted topics can be recovered by re-querying the record store.
    pub fn is_persisted(self) -> bool {
        matches!(self, Topic::Files | Topic::Messages)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Topic::Files => "files",
            Topic::Messages => "messages",
            Topic::SessionState => "session-state",
            Topic::Presence => "presence",
            Topic::Progress => "progress",
        };
        write!(f, "{}", name)
    }
}

/// Everything a subscriber can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    File(FileRecord),
    Message(MessageRecord),
    Progress(UploadProgressEvent),
    Presence(PresenceSync),
    State(SessionStateEvent),
}

impl SessionEvent {
    pub fn topic(&self) -> Topic {
        match self {
            SessionEvent::File(_) => Topic::Files,
            SessionEvent::Message(_) => Topic::Messages,
            SessionEvent::Progress(_) => Topic::Progress,
            SessionEvent::Presence(_) => Topic::Presence,
            SessionEvent::State(_) => Topic::SessionState,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_event_topics() {
        let upload = UploadId::generate();
        let event = SessionEvent::Progress(UploadProgressEvent::uploading(upload, "a.txt", 10));
        assert_eq!(event.topic(), Topic::Progress);
        assert!(!Topic::Progress.is_persisted());
        assert!(Topic::Files.is_persisted());
    }

    #[test]
    fn test_progress_constructors() {
        let id = UploadId::generate();
        assert_eq!(UploadProgressEvent::uploading(id.clone(), "a", 250).progress, 100);
        let done = UploadProgressEvent::completed(id.clone(), "a");
        assert!(done.is_terminal());
        let failed = UploadProgressEvent::failed(id, "a", "disk full");
        assert!(failed.is_terminal());
        assert_eq!(failed.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_guest_count() {
        let now = Utc::now();
        let sync = PresenceSync {
            session_id: SessionId::parse("abc1234567").unwrap(),
            entries: vec![
                PresenceEntry::new(UserId::from("host1"), DeviceType::Host, "Desktop", now),
                PresenceEntry::new(UserId::from("g1"), DeviceType::Guest, "Phone", now),
                PresenceEntry::new(UserId::from("g2"), DeviceType::Guest, "Tablet", now),
            ],
        };
        assert_eq!(sync.guest_count(), 2);
    }

    #[test]
    fn test_progress_json_schema() {
        let event = UploadProgressEvent::uploading(UploadId::parse("up1234567").unwrap(), "a.txt", 55);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["upload_id"], "up1234567");
        assert_eq!(json["file_name"], "a.txt");
        assert_eq!(json["progress"], 55);
        assert_eq!(json["status"], "uploading");
        assert!(json["error"].is_null());
    }
}
