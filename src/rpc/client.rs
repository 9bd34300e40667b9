//! RPC client for the relay daemon.
//!
//! `RelayClient` wraps the generated tarpc client with typed methods that
//! flatten transport failures into `ChannelUnavailable`. `RemoteSubscription`
//! runs the device side of the subscriber port.

use crate::domain::{
    FileRecord, MessageRecord, PresenceEntry, RelayError, RelayResult, SessionEvent, SessionId,
    UserId,
};
use crate::relay_paths;
use crate::retry::{transport_error, Backoff};
use crate::rpc::server::read_port_file;
use crate::rpc::{
    BuildInfo, DeviceCallback, DeviceHello, PortFileContent, RelayServiceClient, SessionTicket,
};
use crate::session::{Session, SessionSnapshot};
use crate::store::SignedLink;
use crate::transfer::{CatchUp, FetchedFile};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::path::Path;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tarpc::{client, context};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Largest frame the client accepts, matching the daemon default.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Typed client for `RelayService`.
#[derive(Clone)]
pub struct RelayClient {
    client: RelayServiceClient,
    ports: PortFileContent,
    host: String,
}

impl RelayClient {
    /// Connects to a daemon at `host` using the given ports.
    pub async fn connect(host: &str, ports: PortFileContent) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        let addr = format!("{}:{}", host, ports.port);
        let mut connect = tcp::connect(&addr, Bincode::default);
        connect.config_mut().max_frame_length(MAX_FRAME_BYTES);
        let transport = connect
            .await
            .with_context(|| format!("Failed to connect to relay daemon at {}", addr))?;
        let client = RelayServiceClient::new(client::Config::default(), transport).spawn();
        Ok(Self {
            client,
            ports,
            host: host.to_string(),
        })
    }

    /// Reads the port file on every attempt, so a daemon that is still
    /// starting up is picked up once it has written it.
    pub async fn connect_with_retry(port_path: &Path, backoff: &Backoff) -> Result<Self> {
        let mut attempt = 1;
        loop {
            let result = match read_port_file(port_path) {
                Ok(ports) => Self::connect("127.0.0.1", ports).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(client) => return Ok(client),
                Err(e) if attempt < backoff.max_attempts => {
                    tracing::debug!(attempt, error = %e, "daemon connect failed, retrying");
                    tokio::time::sleep(backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).context(format!(
                        "Failed to connect after {} attempts",
                        backoff.max_attempts
                    ))
                }
            }
        }
    }

    /// Connects to the daemon recorded under the relay home.
    pub async fn connect_default(backoff: &Backoff) -> Result<Self> {
        let port_path = relay_paths::port_file_path()?;
        Self::connect_with_retry(&port_path, backoff).await
    }

    pub fn ports(&self) -> &PortFileContent {
        &self.ports
    }

    pub async fn create_session(&self) -> RelayResult<SessionTicket> {
        self.client
            .create_session(context::current())
            .await
            .map_err(transport_error)?
    }

    pub async fn validate(&self, session_id: &SessionId) -> RelayResult<Session> {
        self.client
            .validate(context::current(), session_id.clone())
            .await
            .map_err(transport_error)?
    }

    pub async fn set_locked(&self, session_id: &SessionId, locked: bool) -> RelayResult<Session> {
        self.client
            .set_locked(context::current(), session_id.clone(), locked)
            .await
            .map_err(transport_error)?
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> RelayResult<SessionSnapshot> {
        self.client
            .snapshot(context::current(), session_id.clone())
            .await
            .map_err(transport_error)?
    }

    pub async fn approve(&self, session_id: &SessionId) -> RelayResult<Session> {
        self.client
            .approve(context::current(), session_id.clone())
            .await
            .map_err(transport_error)?
    }

    pub async fn ignore(&self, session_id: &SessionId) -> RelayResult<Session> {
        self.client
            .ignore(context::current(), session_id.clone())
            .await
            .map_err(transport_error)?
    }

    /// Refuses locally when the session is locked, before sending anything.
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> RelayResult<MessageRecord> {
        self.validate(session_id).await?.check_unlocked()?;
        self.client
            .send_message(context::current(), session_id.clone(), content.to_string())
            .await
            .map_err(transport_error)?
    }

    /// Refuses locally when the session is locked, before sending any bytes.
    pub async fn upload(
        &self,
        session_id: &SessionId,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> RelayResult<FileRecord> {
        self.validate(session_id).await?.check_unlocked()?;
        self.client
            .upload(
                context::current(),
                session_id.clone(),
                file_name.to_string(),
                content_type.to_string(),
                bytes,
            )
            .await
            .map_err(transport_error)?
    }

    pub async fn catch_up(&self, session_id: &SessionId) -> RelayResult<CatchUp> {
        self.client
            .catch_up(context::current(), session_id.clone())
            .await
            .map_err(transport_error)?
    }

    pub async fn download_link(&self, session_id: &SessionId, file_id: Uuid) -> RelayResult<SignedLink> {
        self.client
            .download_link(context::current(), session_id.clone(), file_id)
            .await
            .map_err(transport_error)?
    }

    pub async fn preview_link(&self, session_id: &SessionId, file_id: Uuid) -> RelayResult<SignedLink> {
        self.client
            .preview_link(context::current(), session_id.clone(), file_id)
            .await
            .map_err(transport_error)?
    }

    pub async fn fetch(&self, session_id: &SessionId, file_id: Uuid) -> RelayResult<FetchedFile> {
        self.client
            .fetch(context::current(), session_id.clone(), file_id)
            .await
            .map_err(transport_error)?
    }

    pub async fn heartbeat(&self, session_id: &SessionId, user_id: &UserId) -> RelayResult<bool> {
        self.client
            .heartbeat(context::current(), session_id.clone(), user_id.clone())
            .await
            .map_err(transport_error)?
    }

    pub async fn build_info(&self) -> RelayResult<BuildInfo> {
        self.client
            .build_info(context::current())
            .await
            .map_err(transport_error)
    }

    /// Joins the session as `entry` over the subscriber port.
    pub async fn subscribe(
        &self,
        session_id: &SessionId,
        entry: PresenceEntry,
    ) -> Result<RemoteSubscription> {
        RemoteSubscription::connect(&self.host, self.ports.subscriber_port, session_id, entry).await
    }
}

/// Callback handler that answers `identify` and forwards pushes to a channel.
#[derive(Clone)]
struct DeviceHandler {
    hello: DeviceHello,
    tx: mpsc::UnboundedSender<RelayResult<SessionEvent>>,
}

impl DeviceCallback for DeviceHandler {
    async fn identify(self, _: context::Context) -> DeviceHello {
        self.hello
    }

    async fn deliver(self, _: context::Context, event: SessionEvent) {
        let _ = self.tx.send(Ok(event));
    }

    async fn lagged(self, _: context::Context, topic: String, skipped: u64) {
        let _ = self
            .tx
            .send(Err(RelayError::SubscriberLagged { topic, skipped }));
    }

    async fn ping(self, _: context::Context) -> bool {
        !self.tx.is_closed()
    }
}

/// A device joined to a session through the daemon.
///
/// Architecture:
/// 1. The device connects to the subscriber port
/// 2. It runs a `DeviceCallback` server on that connection
/// 3. The daemon calls `identify`, joins the device, then calls `deliver`
///    for every event
///
/// Dropping the subscription closes the connection, which the daemon treats
/// as a presence leave.
pub struct RemoteSubscription {
    user_id: UserId,
    rx: mpsc::UnboundedReceiver<RelayResult<SessionEvent>>,
    server_task: tokio::task::JoinHandle<()>,
}

impl RemoteSubscription {
    pub async fn connect(
        host: &str,
        subscriber_port: u16,
        session_id: &SessionId,
        entry: PresenceEntry,
    ) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        let addr = format!("{}:{}", host, subscriber_port);
        let mut connect = tcp::connect(&addr, Bincode::default);
        connect.config_mut().max_frame_length(MAX_FRAME_BYTES);
        let transport = connect
            .await
            .with_context(|| format!("Failed to connect to subscriber port {}", addr))?;

        let user_id = entry.user_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = DeviceHandler {
            hello: DeviceHello {
                session_id: session_id.clone(),
                entry,
            },
            tx,
        };

        let server_task = tokio::spawn(async move {
            let channel = server::BaseChannel::with_defaults(transport);
            channel
                .execute(handler.serve())
                .for_each(|response| async {
                    tokio::spawn(response);
                })
                .await;
            tracing::debug!("callback server ended");
        });

        Ok(Self {
            user_id,
            rx,
            server_task,
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Next pushed event. `ChannelUnavailable` once the daemon hung up.
    pub async fn recv(&mut self) -> RelayResult<SessionEvent> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(RelayError::channel("subscription closed by the daemon")),
        }
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
