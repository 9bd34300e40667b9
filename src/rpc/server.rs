//! RPC server for the relay daemon.
//!
//! Two TCP listeners, both on the configured bind address:
//! - the main port serves `RelayService` requests
//! - the subscriber port accepts device connections; the daemon becomes the
//!   tarpc *client* on those and pushes session events through `DeviceCallback`

use crate::config::RelayConfig;
use crate::domain::{
    FileRecord, MessageRecord, RelayError, RelayResult, SessionId, UserId,
};
use crate::relay::{Relay, MAINTENANCE_INTERVAL};
use crate::relay_paths;
use crate::retry::{transport_error, Backoff};
use crate::rpc::{
    BuildInfo, DeviceCallbackClient, PortFileContent, RelayService, SessionTicket,
};
use crate::session::{Session, SessionSnapshot};
use crate::store::SignedLink;
use crate::transfer::{CatchUp, FetchedFile};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tarpc::{client, context};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How often an idle subscriber connection is pinged.
pub const SUBSCRIBER_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Server implementation for `RelayService`. One clone per connection.
#[derive(Clone)]
pub struct RelayServer {
    relay: Arc<Relay>,
}

impl RelayServer {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

impl RelayService for RelayServer {
    async fn create_session(self, _: context::Context) -> RelayResult<SessionTicket> {
        let session = self.relay.open_session().await?;
        let share_url = self.relay.share_url(&session.id);
        Ok(SessionTicket { session, share_url })
    }

    async fn validate(self, _: context::Context, session_id: SessionId) -> RelayResult<Session> {
        self.relay.validate(&session_id).await
    }

    async fn set_locked(
        self,
        _: context::Context,
        session_id: SessionId,
        locked: bool,
    ) -> RelayResult<Session> {
        self.relay.set_locked(&session_id, locked).await
    }

    async fn snapshot(
        self,
        _: context::Context,
        session_id: SessionId,
    ) -> RelayResult<SessionSnapshot> {
        self.relay.snapshot(&session_id).await
    }

    async fn approve(self, _: context::Context, session_id: SessionId) -> RelayResult<Session> {
        self.relay.approve(&session_id).await
    }

    async fn ignore(self, _: context::Context, session_id: SessionId) -> RelayResult<Session> {
        self.relay.ignore(&session_id).await
    }

    async fn send_message(
        self,
        _: context::Context,
        session_id: SessionId,
        content: String,
    ) -> RelayResult<MessageRecord> {
        self.relay
            .transfer()
            .send_message(&session_id, &content)
            .await
    }

    async fn upload(
        self,
        _: context::Context,
        session_id: SessionId,
        file_name: String,
        content_type: String,
        bytes: Vec<u8>,
    ) -> RelayResult<FileRecord> {
        self.relay
            .transfer()
            .upload(&session_id, &file_name, &content_type, bytes)
            .await
    }

    async fn catch_up(self, _: context::Context, session_id: SessionId) -> RelayResult<CatchUp> {
        self.relay.transfer().catch_up(&session_id).await
    }

    async fn download_link(
        self,
        _: context::Context,
        session_id: SessionId,
        file_id: Uuid,
    ) -> RelayResult<SignedLink> {
        self.relay
            .transfer()
            .download_link(&session_id, file_id)
            .await
    }

    async fn preview_link(
        self,
        _: context::Context,
        session_id: SessionId,
        file_id: Uuid,
    ) -> RelayResult<SignedLink> {
        self.relay
            .transfer()
            .preview_link(&session_id, file_id)
            .await
    }

    async fn fetch(
        self,
        _: context::Context,
        session_id: SessionId,
        file_id: Uuid,
    ) -> RelayResult<FetchedFile> {
        self.relay.transfer().fetch(&session_id, file_id).await
    }

    async fn heartbeat(
        self,
        _: context::Context,
        session_id: SessionId,
        user_id: UserId,
    ) -> RelayResult<bool> {
        self.relay
            .registry()
            .handle(&session_id)
            .await?
            .touch(user_id)
            .await
    }

    async fn build_info(self, _: context::Context) -> BuildInfo {
        BuildInfo::current()
    }
}

/// Identifies a subscribing device, joins it to its session and pushes
/// every event until the device or the session goes away.
///
/// Returning drops the connection, which leaves presence.
async fn serve_device(
    relay: Arc<Relay>,
    device: DeviceCallbackClient,
    backoff: Backoff,
) -> RelayResult<()> {
    let hello = backoff
        .retry("identify", || {
            let device = device.clone();
            async move {
                device
                    .identify(context::current())
                    .await
                    .map_err(transport_error)
            }
        })
        .await?;

    let mut connection = relay.connect_as(&hello.session_id, hello.entry).await?;
    tracing::info!(
        session = %hello.session_id,
        user = %connection.user_id(),
        "subscriber attached"
    );

    let mut ping = tokio::time::interval(SUBSCRIBER_PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            received = connection.recv() => match received {
                Ok(event) => {
                    backoff
                        .retry("deliver", || {
                            let device = device.clone();
                            let event = event.clone();
                            async move {
                                device
                                    .deliver(context::current(), event)
                                    .await
                                    .map_err(transport_error)
                            }
                        })
                        .await?;
                }
                Err(RelayError::SubscriberLagged { topic, skipped }) => {
                    backoff
                        .retry("lagged", || {
                            let device = device.clone();
                            let topic = topic.clone();
                            async move {
                                device
                                    .lagged(context::current(), topic, skipped)
                                    .await
                                    .map_err(transport_error)
                            }
                        })
                        .await?;
                }
                Err(e) => return Err(e),
            },
            _ = ping.tick() => {
                let alive = backoff
                    .retry("ping", || {
                        let device = device.clone();
                        async move { device.ping(context::current()).await.map_err(transport_error) }
                    })
                    .await?;
                if !alive {
                    return Err(RelayError::channel("device reported unhealthy"));
                }
                connection.heartbeat().await?;
            }
        }
    }
}

/// The daemon's listeners, running in background tasks.
pub struct RunningServer {
    pub port: u16,
    pub subscriber_port: u16,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Binds both listeners per `relay.config().server` and starts serving.
    /// Port 0 picks a free port; the chosen ports are on the returned value.
    pub async fn start(relay: Arc<Relay>) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        let server_config = relay.config().server.clone();
        let backoff = Backoff::from(&relay.config().retry);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let addr = format!("{}:{}", server_config.bind_addr, server_config.port);
        let mut listener = tcp::listen(&addr, Bincode::default)
            .await
            .with_context(|| format!("Failed to bind RPC listener on {}", addr))?;
        listener
            .config_mut()
            .max_frame_length(server_config.max_frame_bytes);
        let port = listener.local_addr().port();

        let sub_addr = format!(
            "{}:{}",
            server_config.bind_addr, server_config.subscriber_port
        );
        let mut sub_listener = tcp::listen(&sub_addr, Bincode::default)
            .await
            .with_context(|| format!("Failed to bind subscriber listener on {}", sub_addr))?;
        sub_listener
            .config_mut()
            .max_frame_length(server_config.max_frame_bytes);
        let subscriber_port = sub_listener.local_addr().port();

        let main_task = {
            let relay = relay.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                tracing::info!(port, "RPC server listening");
                loop {
                    tokio::select! {
                        Some(result) = listener.next() => {
                            match result {
                                Ok(transport) => {
                                    let server = RelayServer::new(relay.clone());
                                    let channel = server::BaseChannel::with_defaults(transport);
                                    tokio::spawn(async move {
                                        channel.execute(server.serve()).for_each(|response| async {
                                            tokio::spawn(response);
                                        }).await;
                                    });
                                }
                                Err(e) => tracing::warn!(error = %e, "accept error"),
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        };

        let subscriber_task = {
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                tracing::info!(port = subscriber_port, "subscriber listener ready");
                loop {
                    tokio::select! {
                        Some(result) = sub_listener.next() => {
                            match result {
                                Ok(transport) => {
                                    let device = DeviceCallbackClient::new(
                                        client::Config::default(),
                                        transport,
                                    ).spawn();
                                    let relay = relay.clone();
                                    tokio::spawn(async move {
                                        match serve_device(relay, device, backoff).await {
                                            Err(e) if e.is_retryable() => {
                                                tracing::warn!(error = %e, "subscriber dropped")
                                            }
                                            Err(e) => tracing::info!(error = %e, "subscriber detached"),
                                            Ok(()) => {}
                                        }
                                    });
                                }
                                Err(e) => tracing::warn!(error = %e, "subscriber accept error"),
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        };

        Ok(Self {
            port,
            subscriber_port,
            shutdown_tx,
            tasks: vec![main_task, subscriber_task],
        })
    }

    pub fn port_file(&self) -> PortFileContent {
        PortFileContent {
            port: self.port,
            subscriber_port: self.subscriber_port,
        }
    }

    /// Stops accepting connections. Open connections finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for both listener loops to end.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "listener task failed");
            }
        }
    }
}

pub fn write_port_file(path: &Path, content: &PortFileContent) -> Result<()> {
    let json = serde_json::to_string(content).context("Failed to serialize port file")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write port file: {}", path.display()))
}

pub fn read_port_file(path: &Path) -> Result<PortFileContent> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Relay daemon not running (no {})", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid port file: {}", path.display()))
}

/// Runs the daemon until Ctrl-C: listeners, port file, and the periodic
/// reaping of expired sessions and idle devices.
pub async fn run_daemon(config: RelayConfig) -> Result<()> {
    let blobs_dir = relay_paths::blobs_dir()?;
    let relay = Arc::new(Relay::local(config, blobs_dir));
    let server = RunningServer::start(relay.clone()).await?;

    let port_path = relay_paths::port_file_path()?;
    write_port_file(&port_path, &server.port_file())?;
    tracing::info!(
        port = server.port,
        subscriber_port = server.subscriber_port,
        "relay daemon started"
    );

    let maintenance = relay.spawn_maintenance(MAINTENANCE_INTERVAL);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    server.shutdown();
    maintenance.abort();
    server.join().await;
    relay.shutdown().await;

    if let Err(e) = std::fs::remove_file(&port_path) {
        tracing::debug!(error = %e, "port file already gone");
    }
    Ok(())
}
