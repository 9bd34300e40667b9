//! Session registry: id -> session actor.
//!
//! The registry lock only guards the id map. It is held to make `create`
//! atomic (two creates of one id never both succeed) and released before any
//! call into a session actor, so sessions never contend with each other.

use crate::broker::Subscription;
use crate::domain::{
    FileRecord, MessageRecord, PresenceEntry, RelayError, RelayResult, SessionId, SharedClock,
    UploadProgressEvent, UserId,
};
use crate::presence::ConnectionId;
use crate::session::actor::{SessionActor, SessionActorArgs, SessionMessage, SessionSnapshot};
use crate::session::record::{Session, DEFAULT_SESSION_TTL_SECS};
use crate::store::RecordStore;
use ractor::{Actor, ActorRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};

/// Tunables applied to every session the registry creates.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub ttl: chrono::Duration,
    pub topic_capacity: usize,
    pub progress_retention: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::seconds(DEFAULT_SESSION_TTL_SECS as i64),
            topic_capacity: 256,
            progress_retention: crate::progress::DEFAULT_PROGRESS_LINGER,
        }
    }
}

/// Cheap, cloneable address of one session actor.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    actor: ActorRef<SessionMessage>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    fn unavailable(&self) -> RelayError {
        RelayError::ActorUnavailable {
            message: format!("session {} is not running", self.id),
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> RelayResult<T> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .send_message(build(tx))
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn record(&self) -> RelayResult<Session> {
        self.call(SessionMessage::Record).await
    }

    pub async fn validate(&self) -> RelayResult<Session> {
        self.call(SessionMessage::Validate).await?
    }

    pub async fn set_locked(&self, locked: bool) -> RelayResult<Session> {
        self.call(|reply| SessionMessage::SetLocked { locked, reply })
            .await?
    }

    /// Joins presence and subscribes. The returned id must be passed back
    /// to `leave`.
    pub async fn connect(
        &self,
        entry: PresenceEntry,
    ) -> RelayResult<(ConnectionId, Subscription)> {
        self.call(|reply| SessionMessage::Connect { entry, reply })
            .await?
    }

    pub async fn subscribe(&self) -> RelayResult<Subscription> {
        self.call(SessionMessage::Subscribe).await?
    }

    /// Non-blocking; safe to call from `Drop`. Ignored if the device has
    /// reconnected since `connection` was handed out.
    pub fn leave(&self, user_id: UserId, connection: ConnectionId) {
        if self
            .actor
            .send_message(SessionMessage::Leave {
                user_id,
                connection,
            })
            .is_err()
        {
            tracing::debug!(session = %self.id, "leave after session actor stopped");
        }
    }

    pub async fn touch(&self, user_id: UserId) -> RelayResult<bool> {
        self.call(|reply| SessionMessage::Touch { user_id, reply })
            .await?
    }

    pub async fn expire_idle(&self, timeout: chrono::Duration) -> RelayResult<Vec<PresenceEntry>> {
        self.call(|reply| SessionMessage::ExpireIdle { timeout, reply })
            .await
    }

    pub async fn snapshot(&self) -> RelayResult<SessionSnapshot> {
        self.call(SessionMessage::Snapshot).await?
    }

    pub async fn approve(&self) -> RelayResult<Session> {
        self.call(SessionMessage::Approve).await?
    }

    pub async fn ignore(&self) -> RelayResult<Session> {
        self.call(SessionMessage::Ignore).await?
    }

    pub async fn append_file(&self, record: FileRecord) -> RelayResult<()> {
        self.call(|reply| SessionMessage::AppendFile { record, reply })
            .await?
    }

    pub async fn append_message(&self, record: MessageRecord) -> RelayResult<()> {
        self.call(|reply| SessionMessage::AppendMessage { record, reply })
            .await?
    }

    pub async fn publish_progress(&self, event: UploadProgressEvent) -> RelayResult<usize> {
        self.call(|reply| SessionMessage::PublishProgress { event, reply })
            .await?
    }

    fn stop(&self, reason: &str) {
        self.actor.stop(Some(reason.to_string()));
    }
}

enum Slot {
    Live(SessionHandle),
    /// Actor stopped after expiry; the record is kept so lookups keep
    /// answering `SessionExpired` instead of `SessionNotFound`.
    Expired(Session),
}

/// Owns session identity and the actor of every live session.
pub struct SessionRegistry {
    settings: RegistrySettings,
    clock: SharedClock,
    records: Arc<dyn RecordStore>,
    sessions: RwLock<HashMap<SessionId, Slot>>,
}

impl SessionRegistry {
    pub fn new(settings: RegistrySettings, clock: SharedClock, records: Arc<dyn RecordStore>) -> Self {
        Self {
            settings,
            clock,
            records,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Creates a session under `id`. Fails with `IdCollision` if the id was
    /// ever used; callers retry with a fresh id.
    pub async fn create(&self, id: SessionId) -> RelayResult<Session> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            tracing::warn!(session = %id, "session id collision");
            return Err(RelayError::IdCollision {
                session_id: id.to_string(),
            });
        }

        let session = Session::new(id.clone(), self.clock.now(), self.settings.ttl);
        let args = SessionActorArgs {
            session: session.clone(),
            clock: self.clock.clone(),
            records: self.records.clone(),
            topic_capacity: self.settings.topic_capacity,
            progress_retention: self.settings.progress_retention,
        };
        let (actor, _handle) = SessionActor::spawn(None, SessionActor, args)
            .await
            .map_err(|e| RelayError::ActorUnavailable {
                message: format!("failed to start session {}: {}", id, e),
            })?;

        sessions.insert(id.clone(), Slot::Live(SessionHandle { id, actor }));
        tracing::info!(session = %session.id, expires_at = %session.expires_at, "session created");
        Ok(session)
    }

    /// Handle of a live session.
    pub async fn handle(&self, id: &SessionId) -> RelayResult<SessionHandle> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(Slot::Live(handle)) => Ok(handle.clone()),
            Some(Slot::Expired(session)) => Err(RelayError::SessionExpired {
                session_id: session.id.to_string(),
            }),
            None => Err(RelayError::SessionNotFound {
                session_id: id.to_string(),
            }),
        }
    }

    /// Stored record, expired or not.
    pub async fn record(&self, id: &SessionId) -> RelayResult<Session> {
        let handle = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(Slot::Live(handle)) => handle.clone(),
                Some(Slot::Expired(session)) => return Ok(session.clone()),
                None => {
                    return Err(RelayError::SessionNotFound {
                        session_id: id.to_string(),
                    })
                }
            }
        };
        handle.record().await
    }

    /// `SessionExpired` whenever now is past `expires_at`.
    pub async fn validate(&self, id: &SessionId) -> RelayResult<Session> {
        self.handle(id).await?.validate().await
    }

    pub async fn set_locked(&self, id: &SessionId, locked: bool) -> RelayResult<Session> {
        self.handle(id).await?.set_locked(locked).await
    }

    /// Handles of every live session.
    pub async fn live_handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .await
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(handle) => Some(handle.clone()),
                Slot::Expired(_) => None,
            })
            .collect()
    }

    pub async fn live_count(&self) -> usize {
        self.live_handles().await.len()
    }

    /// Stops the actors of expired sessions and returns their ids. The
    /// tombstone keeps answering `validate` and `record` afterwards.
    ///
    /// Expiry itself is computed on every call; this only frees resources.
    pub async fn reap_expired(&self) -> Vec<SessionId> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        for handle in self.live_handles().await {
            match handle.record().await {
                Ok(session) if session.is_expired(now) => expired.push((handle, session)),
                Ok(_) => {}
                Err(e) => tracing::warn!(session = %handle.id(), error = %e, "reap skipped"),
            }
        }

        let mut sessions = self.sessions.write().await;
        for (handle, session) in &expired {
            handle.stop("session expired");
            sessions.insert(handle.id().clone(), Slot::Expired(session.clone()));
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired sessions reaped");
        }
        expired
            .into_iter()
            .map(|(handle, _)| handle.id().clone())
            .collect()
    }

    /// Stops every session actor.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.read().await;
        for slot in sessions.values() {
            if let Slot::Live(handle) = slot {
                handle.stop("registry shutdown");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
