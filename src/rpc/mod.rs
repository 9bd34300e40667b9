//! tarpc services between the relay daemon and its devices.
//!
//! - **RelayService** (device -> daemon): session lifecycle, transfers, status
//! - **DeviceCallback** (daemon -> device): identification and event push over
//!   the subscriber port

pub mod client;
pub mod server;

use crate::domain::{
    FileRecord, MessageRecord, PresenceEntry, RelayResult, SessionEvent, SessionId, UserId,
};
use crate::session::{Session, SessionSnapshot};
use crate::store::SignedLink;
use crate::transfer::{CatchUp, FetchedFile};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use client::{RelayClient, RemoteSubscription};
pub use server::{run_daemon, RelayServer, RunningServer};

/// Contents of `relay.port`, written by the daemon on start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFileContent {
    pub port: u16,
    pub subscriber_port: u16,
}

/// A freshly created session and the link to share it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTicket {
    pub session: Session,
    pub share_url: String,
}

/// Who is on the other end of a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHello {
    pub session_id: SessionId,
    pub entry: PresenceEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    pub git_sha: String,
    pub build_timestamp: u64,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_sha: crate::BUILD_SHA.to_string(),
            build_timestamp: crate::BUILD_TIMESTAMP,
        }
    }
}

/// Service exposed by the relay daemon to devices.
#[tarpc::service]
pub trait RelayService {
    /// Creates a session under a fresh id.
    async fn create_session() -> RelayResult<SessionTicket>;

    /// Fails with `SessionExpired` once the TTL has elapsed.
    async fn validate(session_id: SessionId) -> RelayResult<Session>;

    async fn set_locked(session_id: SessionId, locked: bool) -> RelayResult<Session>;

    async fn snapshot(session_id: SessionId) -> RelayResult<SessionSnapshot>;

    /// Accepts the pending guest and locks the session.
    async fn approve(session_id: SessionId) -> RelayResult<Session>;

    async fn ignore(session_id: SessionId) -> RelayResult<Session>;

    async fn send_message(session_id: SessionId, content: String) -> RelayResult<MessageRecord>;

    async fn upload(
        session_id: SessionId,
        file_name: String,
        content_type: String,
        bytes: Vec<u8>,
    ) -> RelayResult<FileRecord>;

    /// Files and messages persisted so far.
    async fn catch_up(session_id: SessionId) -> RelayResult<CatchUp>;

    async fn download_link(session_id: SessionId, file_id: Uuid) -> RelayResult<SignedLink>;

    async fn preview_link(session_id: SessionId, file_id: Uuid) -> RelayResult<SignedLink>;

    async fn fetch(session_id: SessionId, file_id: Uuid) -> RelayResult<FetchedFile>;

    /// Refreshes a device's presence. Returns false if it is not joined.
    async fn heartbeat(session_id: SessionId, user_id: UserId) -> RelayResult<bool>;

    async fn build_info() -> BuildInfo;
}

/// Callback service run by subscribing devices; the daemon calls into it.
#[tarpc::service]
pub trait DeviceCallback {
    /// Session and identity to join with. Called once per connection.
    async fn identify() -> DeviceHello;

    /// One event from any topic of the session.
    async fn deliver(event: SessionEvent);

    /// Events on `topic` were skipped; persisted topics can be re-queried.
    async fn lagged(topic: String, skipped: u64);

    async fn ping() -> bool;
}

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod tests;
