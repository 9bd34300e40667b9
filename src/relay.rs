//! Relay engine: the single entry point the daemon and tests drive.
//!
//! Bundles the session registry, the stores, the transfer service and the
//! clock behind one value that is cheap to share behind an `Arc`.

use crate::broker::Subscription;
use crate::config::RelayConfig;
use crate::domain::{
    share_url, system_clock, DeviceType, PresenceEntry, RelayError, RelayResult, SessionEvent,
    SessionId, SharedClock, UploadProgressEvent, UserId,
};
use crate::presence::ConnectionId;
use crate::session::{Session, SessionHandle, SessionRegistry, SessionSnapshot};
use crate::store::{BlobStore, LocalBlobStore, MemoryRecordStore, RecordStore};
use crate::transfer::{TransferService, TransferSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Fresh ids tried by `open_session` before giving up.
pub const OPEN_SESSION_ATTEMPTS: u32 = 5;

/// How often the daemon reaps expired sessions and idle devices.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

pub struct Relay {
    config: RelayConfig,
    clock: SharedClock,
    registry: Arc<SessionRegistry>,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    transfer: TransferService,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        clock: SharedClock,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.registry_settings(),
            clock.clone(),
            records.clone(),
        ));
        let transfer = TransferService::new(
            registry.clone(),
            blobs.clone(),
            records.clone(),
            clock.clone(),
            TransferSettings {
                preview_max_bytes: config.preview_max_bytes,
                download_link_ttl: config.download_link_ttl(),
                preview_link_ttl: config.preview_link_ttl(),
                upload_watchdog: config.upload_watchdog(),
            },
        );
        Self {
            config,
            clock,
            registry,
            blobs,
            records,
            transfer,
        }
    }

    /// Relay with blobs on disk under `blobs_root`, in-memory records and
    /// the system clock.
    pub fn local(config: RelayConfig, blobs_root: impl Into<PathBuf>) -> Self {
        let clock = system_clock();
        let blobs = Arc::new(LocalBlobStore::new(
            blobs_root,
            &config.public_base_url,
            clock.clone(),
        ));
        Self::new(config, clock, blobs, Arc::new(MemoryRecordStore::new()))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn transfer(&self) -> &TransferService {
        &self.transfer
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub async fn create_session(&self, id: SessionId) -> RelayResult<Session> {
        self.registry.create(id).await
    }

    /// Creates a session under a freshly generated id.
    pub async fn open_session(&self) -> RelayResult<Session> {
        self.open_session_with(SessionId::generate).await
    }

    async fn open_session_with(
        &self,
        mut next_id: impl FnMut() -> SessionId,
    ) -> RelayResult<Session> {
        let mut last = None;
        for attempt in 1..=OPEN_SESSION_ATTEMPTS {
            match self.registry.create(next_id()).await {
                Ok(session) => return Ok(session),
                Err(e @ RelayError::IdCollision { .. }) => {
                    tracing::debug!(attempt, "session id taken, generating another");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| RelayError::invalid("no session id attempted")))
    }

    pub async fn validate(&self, id: &SessionId) -> RelayResult<Session> {
        self.registry.validate(id).await
    }

    pub async fn set_locked(&self, id: &SessionId, locked: bool) -> RelayResult<Session> {
        self.registry.set_locked(id, locked).await
    }

    pub async fn snapshot(&self, id: &SessionId) -> RelayResult<SessionSnapshot> {
        self.registry.handle(id).await?.snapshot().await
    }

    /// Joins a new device to the session and subscribes it to every topic.
    pub async fn connect(
        &self,
        id: &SessionId,
        device_type: DeviceType,
        display_name: &str,
    ) -> RelayResult<DeviceConnection> {
        let entry = PresenceEntry::new(
            UserId::generate(),
            device_type,
            display_name,
            self.clock.now(),
        );
        self.connect_as(id, entry).await
    }

    /// Joins with a caller-chosen identity. Reconnecting under the same user
    /// id replaces the previous entry.
    pub async fn connect_as(
        &self,
        id: &SessionId,
        entry: PresenceEntry,
    ) -> RelayResult<DeviceConnection> {
        let handle = self.registry.handle(id).await?;
        let (connection, subscription) = handle.connect(entry.clone()).await?;
        Ok(DeviceConnection {
            handle,
            entry,
            connection,
            subscription,
        })
    }

    pub async fn approve(&self, id: &SessionId) -> RelayResult<Session> {
        self.registry.handle(id).await?.approve().await
    }

    pub async fn ignore(&self, id: &SessionId) -> RelayResult<Session> {
        self.registry.handle(id).await?.ignore().await
    }

    pub async fn publish_progress(
        &self,
        id: &SessionId,
        event: UploadProgressEvent,
    ) -> RelayResult<usize> {
        self.registry.handle(id).await?.publish_progress(event).await
    }

    /// Removes devices idle past `presence_idle_timeout_secs`. Returns how
    /// many were removed; does nothing when the timeout is off.
    pub async fn sweep_idle_presence(&self) -> usize {
        let Some(timeout) = self.config.presence_idle_timeout() else {
            return 0;
        };
        let mut removed = 0;
        for handle in self.registry.live_handles().await {
            match handle.expire_idle(timeout).await {
                Ok(gone) => removed += gone.len(),
                Err(e) => tracing::debug!(session = %handle.id(), error = %e, "idle sweep skipped"),
            }
        }
        removed
    }

    /// Stops expired sessions and drops their file and message rows and
    /// stored blobs. Returns how many sessions were reaped.
    pub async fn reap_expired(&self) -> usize {
        let reaped = self.registry.reap_expired().await;
        for id in &reaped {
            if let Err(e) = self.records.forget_session(id).await {
                tracing::warn!(session = %id, error = %e, "records not reclaimed");
            }
            if let Err(e) = self.blobs.delete_session(id).await {
                tracing::warn!(session = %id, error = %e, "blobs not reclaimed");
            }
        }
        reaped.len()
    }

    /// Periodic reaping and idle sweeping until the returned task is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let reaped = relay.reap_expired().await;
                let idle = relay.sweep_idle_presence().await;
                if reaped > 0 || idle > 0 {
                    let live = relay.registry.live_count().await;
                    tracing::debug!(reaped, idle, live, "maintenance pass");
                }
            }
        })
    }

    /// Link encoded in the session's QR code.
    pub fn share_url(&self, id: &SessionId) -> String {
        share_url(&self.config.public_base_url, id)
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

/// A device joined to a session. Dropping it leaves the session.
#[derive(Debug)]
pub struct DeviceConnection {
    handle: SessionHandle,
    entry: PresenceEntry,
    connection: ConnectionId,
    subscription: Subscription,
}

impl DeviceConnection {
    pub fn session_id(&self) -> &SessionId {
        self.handle.id()
    }

    pub fn user_id(&self) -> &UserId {
        &self.entry.user_id
    }

    pub fn entry(&self) -> &PresenceEntry {
        &self.entry
    }

    pub async fn recv(&mut self) -> RelayResult<SessionEvent> {
        self.subscription.recv().await
    }

    /// Queued events and lag notices, see `Subscription::drain`.
    pub fn drain(&mut self) -> Vec<RelayResult<SessionEvent>> {
        self.subscription.drain()
    }

    /// Refreshes `last_seen` so the idle sweep keeps the device.
    pub async fn heartbeat(&self) -> RelayResult<bool> {
        self.handle.touch(self.entry.user_id.clone()).await
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.handle
            .leave(self.entry.user_id.clone(), self.connection);
    }
}

/// Human-readable size: `0 Bytes`, `1.5 KB`, `20 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{:.2}", value);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}
