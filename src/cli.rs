//! Command-line interface: the daemon entry point and a thin device client.

use crate::config::RelayConfig;
use crate::domain::{
    Clock, DeviceType, PresenceEntry, RelayError, SessionEvent, SessionId, StateChange,
    SystemClock, UserId,
};
use crate::history::TransferHistory;
use crate::logging;
use crate::progress::ProgressView;
use crate::relay::format_size;
use crate::relay_paths;
use crate::retry::Backoff;
use crate::rpc::{self, RelayClient, RemoteSubscription};
use crate::store::sanitize_file_name;
use crate::transfer::CatchUp;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "printf-relay")]
#[command(about = "Pair devices with a short-lived session and move files between them")]
#[command(version)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Config file (defaults to ~/.printf-relay/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the relay daemon in the foreground
    Serve,
    /// Create a session and print its share link
    NewSession,
    /// Show lock state, remaining time and connected devices
    Status { session_id: String },
    /// Stop accepting uploads and messages
    Lock { session_id: String },
    Unlock { session_id: String },
    /// Accept the pending guest and lock the session
    Approve { session_id: String },
    /// Dismiss the pending guest without locking
    Ignore { session_id: String },
    /// Send a quick text or link message
    Send {
        session_id: String,
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },
    /// Upload a file
    Upload { session_id: String, path: PathBuf },
    /// List the files of a session
    Files { session_id: String },
    /// Join the session and print its events until Ctrl-C
    Watch {
        session_id: String,
        /// Display name (defaults to the hostname)
        #[arg(long)]
        name: Option<String>,
        /// Join as the receiving host instead of a guest
        #[arg(long)]
        host: bool,
    },
    /// Download a file and record it in the local history
    Download {
        session_id: String,
        file_id: Uuid,
        /// Output path (defaults to the original file name)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show or clear the local download history
    History {
        #[command(subcommand)]
        action: Option<HistoryAction>,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    List,
    Clear,
}

fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::load(path),
        None => RelayConfig::load_or_default(&relay_paths::config_path()?),
    }
}

fn parse_session(id: &str) -> Result<SessionId> {
    SessionId::parse(id).with_context(|| format!("Invalid session id: {}", id))
}

/// Content type from the file extension; unknown extensions are opaque bytes.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("md") | Some("log") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("heic") => "image/heic",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

/// One line per event for `watch`.
pub fn describe_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::File(file) => format!(
            "file     {} ({}) id={}",
            file.name,
            format_size(file.size),
            file.id
        ),
        SessionEvent::Message(message) => format!("message  {}", message.content),
        SessionEvent::Progress(p) => match &p.error {
            Some(reason) => format!("upload   {} failed: {}", p.file_name, reason),
            None => format!("upload   {} {}%", p.file_name, p.progress),
        },
        SessionEvent::Presence(sync) => {
            let names: Vec<String> = sync
                .entries
                .iter()
                .map(|e| format!("{} ({})", e.display_name, e.device_type))
                .collect();
            format!("devices  {}", names.join(", "))
        }
        SessionEvent::State(state) => match &state.change {
            StateChange::Locked => "session  locked".to_string(),
            StateChange::Unlocked => "session  unlocked".to_string(),
            StateChange::ApprovalRequested(device) => format!(
                "approval {} wants to send files; run `printf-relay approve {}`",
                device.display_name, state.session_id
            ),
            StateChange::ApprovalDismissed => "approval dismissed".to_string(),
        },
    }
}

fn default_device_name() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "device".to_string())
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    logging::init_logging(&config.logging)?;

    match cli.command {
        Command::Serve => {
            logging::log_startup("daemon");
            rpc::run_daemon(config).await
        }
        Command::History { action } => run_history(&config, action.unwrap_or(HistoryAction::List)),
        command => {
            let backoff = Backoff::from(&config.retry);
            let client = RelayClient::connect_default(&backoff).await?;
            run_client_command(&client, &config, command).await
        }
    }
}

async fn run_client_command(client: &RelayClient, config: &RelayConfig, command: Command) -> Result<()> {
    match command {
        Command::Serve | Command::History { .. } => {
            anyhow::bail!("{:?} does not go through the daemon", command)
        }
        Command::NewSession => {
            let ticket = client.create_session().await?;
            println!("Session:  {}", ticket.session.id);
            println!("Share:    {}", ticket.share_url);
            println!("Expires:  {}", ticket.session.expires_at.format("%H:%M:%S UTC"));
        }
        Command::Status { session_id } => {
            let id = parse_session(&session_id)?;
            let snapshot = client.snapshot(&id).await?;
            let remaining = snapshot.session.remaining(SystemClock.now());
            println!("Session:  {}", snapshot.session.id);
            println!(
                "State:    {}",
                if snapshot.session.locked { "locked" } else { "open" }
            );
            println!(
                "Expires:  in {}m{:02}s",
                remaining.num_minutes(),
                remaining.num_seconds() % 60
            );
            println!("Devices:  {}", snapshot.presence.len());
            for entry in &snapshot.presence {
                println!("  {} ({}) {}", entry.display_name, entry.device_type, entry.user_id);
            }
            if let Some(device) = snapshot.approval.pending() {
                println!("Pending:  {} awaiting approval", device.display_name);
            }
        }
        Command::Lock { session_id } => {
            client.set_locked(&parse_session(&session_id)?, true).await?;
            println!("Locked {}", session_id);
        }
        Command::Unlock { session_id } => {
            client.set_locked(&parse_session(&session_id)?, false).await?;
            println!("Unlocked {}", session_id);
        }
        Command::Approve { session_id } => {
            client.approve(&parse_session(&session_id)?).await?;
            println!("Approved; {} is now locked", session_id);
        }
        Command::Ignore { session_id } => {
            client.ignore(&parse_session(&session_id)?).await?;
            println!("Ignored the pending request");
        }
        Command::Send { session_id, text } => {
            let message = client
                .send_message(&parse_session(&session_id)?, &text.join(" "))
                .await?;
            println!("Sent {:?} message", message.kind);
        }
        Command::Upload { session_id, path } => {
            let id = parse_session(&session_id)?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("Not a file path: {}", path.display()))?
                .to_string();
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let record = client
                .upload(&id, &file_name, content_type_for(&path), bytes)
                .await?;
            println!(
                "Uploaded {} ({}) id={}",
                record.name,
                format_size(record.size),
                record.id
            );
        }
        Command::Files { session_id } => {
            let catch_up = client.catch_up(&parse_session(&session_id)?).await?;
            if catch_up.files.is_empty() {
                println!("No files yet");
            }
            for file in &catch_up.files {
                println!("{}  {}  {}", file.id, format_size(file.size), file.name);
            }
        }
        Command::Watch {
            session_id,
            name,
            host,
        } => {
            let id = parse_session(&session_id)?;
            let device_type = if host { DeviceType::Host } else { DeviceType::Guest };
            let name = name.unwrap_or_else(default_device_name);
            watch(client, config, &id, device_type, &name).await?;
        }
        Command::Download {
            session_id,
            file_id,
            out,
        } => {
            let fetched = client.fetch(&parse_session(&session_id)?, file_id).await?;
            let out = out.unwrap_or_else(|| PathBuf::from(sanitize_file_name(&fetched.record.name)));
            tokio::fs::write(&out, &fetched.bytes)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;

            let history_path = relay_paths::history_path()?;
            TransferHistory::update(&history_path, config.history_capacity, |history| {
                history.record(fetched.record.clone(), SystemClock.now())
            })?;
            println!(
                "Saved {} ({}) to {}",
                fetched.record.name,
                format_size(fetched.record.size),
                out.display()
            );
        }
    }
    Ok(())
}

fn run_history(config: &RelayConfig, action: HistoryAction) -> Result<()> {
    let path = relay_paths::history_path()?;
    match action {
        HistoryAction::List => {
            let history = TransferHistory::load(&path, config.history_capacity)?;
            if history.is_empty() {
                println!("No downloads yet");
            }
            for entry in history.entries() {
                println!(
                    "{}  {}  {}",
                    entry.downloaded_at.format("%Y-%m-%d %H:%M"),
                    format_size(entry.file.size),
                    entry.file.name
                );
            }
        }
        HistoryAction::Clear => {
            TransferHistory::update(&path, config.history_capacity, |history| history.clear())?;
            println!("History cleared");
        }
    }
    Ok(())
}

/// What `watch` prints. Persisted records are shown once each, whether they
/// arrive live or through a catch-up; progress goes through a lingering view.
struct WatchScreen {
    progress: ProgressView,
    seen: HashSet<Uuid>,
}

impl WatchScreen {
    fn new(linger: std::time::Duration) -> Self {
        Self {
            progress: ProgressView::new(linger),
            seen: HashSet::new(),
        }
    }

    fn catch_up(&mut self, catch_up: CatchUp) -> Vec<String> {
        let files = catch_up.files.into_iter().map(SessionEvent::File);
        let messages = catch_up.messages.into_iter().map(SessionEvent::Message);
        files
            .chain(messages)
            .filter_map(|event| self.record(event))
            .collect()
    }

    fn record(&mut self, event: SessionEvent) -> Option<String> {
        let id = match &event {
            SessionEvent::File(file) => file.id,
            SessionEvent::Message(message) => message.id,
            _ => return Some(describe_event(&event)),
        };
        self.seen.insert(id).then(|| describe_event(&event))
    }

    fn event(&mut self, event: SessionEvent, now: Instant) -> Vec<String> {
        match event {
            SessionEvent::Progress(tick) => {
                self.progress.apply(tick, now);
                self.progress
                    .visible(now)
                    .into_iter()
                    .map(|visible| describe_event(&SessionEvent::Progress(visible)))
                    .collect()
            }
            other => self.record(other).into_iter().collect(),
        }
    }

    /// Drops finished uploads whose linger elapsed.
    fn expire(&mut self, now: Instant) -> Vec<String> {
        self.progress
            .prune(now)
            .into_iter()
            .map(|gone| format!("upload   {} cleared", gone.file_name))
            .collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.progress.next_deadline()
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

async fn watch(
    client: &RelayClient,
    config: &RelayConfig,
    session_id: &SessionId,
    device_type: DeviceType,
    name: &str,
) -> Result<()> {
    // Subscribe before reading the store so nothing lands in between
    let entry = PresenceEntry::new(UserId::generate(), device_type, name, SystemClock.now());
    let mut subscription: RemoteSubscription = client.subscribe(session_id, entry).await?;
    let mut screen = WatchScreen::new(config.progress_linger());
    print_lines(screen.catch_up(client.catch_up(session_id).await?));

    loop {
        let deadline = screen.next_deadline();
        tokio::select! {
            received = subscription.recv() => match received {
                Ok(event) => print_lines(screen.event(event, Instant::now())),
                Err(RelayError::SubscriberLagged { topic, skipped }) => {
                    eprintln!("missed {} {} events, re-reading the session", skipped, topic);
                    print_lines(screen.catch_up(client.catch_up(session_id).await?));
                }
                Err(e) => return Err(e).context("Subscription ended"),
            },
            _ = sleep_until_deadline(deadline) => print_lines(screen.expire(Instant::now())),
            _ = tokio::signal::ctrl_c() => {
                println!("Leaving {}", session_id);
                return Ok(());
            }
        }
    }
}
