//! Session owner actor.
//!
//! One `SessionActor` runs per live session and is the only place its lock
//! flag, presence set and approval state are mutated. Messages are handled
//! one at a time, so joins, leaves, lock changes and record appends of a
//! session are applied in a single total order without any shared lock.

use crate::approval::{ApprovalSignal, ApprovalState, ApprovalWorkflow};
use crate::broker::{EventBroker, Subscription};
use crate::domain::{
    FileRecord, MessageRecord, PresenceEntry, RelayError, RelayResult, SessionEvent, SessionId,
    SessionStateEvent, SharedClock, StateChange, UploadProgressEvent, UserId,
};
use crate::presence::{ConnectionId, JoinOutcome, PresenceTracker};
use crate::progress::ProgressRelay;
use crate::session::record::Session;
use crate::store::RecordStore;
use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages that can be sent to a session actor.
pub enum SessionMessage {
    /// Current record, expired or not.
    Record(oneshot::Sender<Session>),
    /// Record if the session is still active.
    Validate(oneshot::Sender<RelayResult<Session>>),
    /// Last writer wins.
    SetLocked {
        locked: bool,
        reply: oneshot::Sender<RelayResult<Session>>,
    },
    /// Subscribe to every topic, then join presence.
    Connect {
        entry: PresenceEntry,
        reply: oneshot::Sender<RelayResult<(ConnectionId, Subscription)>>,
    },
    /// Subscribe without joining presence.
    Subscribe(oneshot::Sender<RelayResult<Subscription>>),
    /// Fire and forget; sent when a connection goes away.
    Leave {
        user_id: UserId,
        connection: ConnectionId,
    },
    Touch {
        user_id: UserId,
        reply: oneshot::Sender<RelayResult<bool>>,
    },
    ExpireIdle {
        timeout: chrono::Duration,
        reply: oneshot::Sender<Vec<PresenceEntry>>,
    },
    Snapshot(oneshot::Sender<RelayResult<SessionSnapshot>>),
    Approve(oneshot::Sender<RelayResult<Session>>),
    Ignore(oneshot::Sender<RelayResult<Session>>),
    AppendFile {
        record: FileRecord,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    AppendMessage {
        record: MessageRecord,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    /// Returns how many subscribers the tick reached.
    PublishProgress {
        event: UploadProgressEvent,
        reply: oneshot::Sender<RelayResult<usize>>,
    },
}

/// Point-in-time view of a session for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub presence: Vec<PresenceEntry>,
    pub approval: ApprovalState,
}

/// Arguments for spawning a session actor.
#[derive(Debug, Clone)]
pub struct SessionActorArgs {
    pub session: Session,
    pub clock: SharedClock,
    pub records: Arc<dyn RecordStore>,
    /// Per-topic broadcast buffer.
    pub topic_capacity: usize,
    /// How long finished uploads are remembered by the progress relay.
    pub progress_retention: Duration,
}

/// State maintained by the session actor.
pub struct SessionActorState {
    session: Session,
    clock: SharedClock,
    records: Arc<dyn RecordStore>,
    presence: PresenceTracker,
    approval: ApprovalWorkflow,
    broker: EventBroker,
    progress: ProgressRelay,
}

impl SessionActorState {
    fn check_active(&mut self) -> RelayResult<()> {
        let now = self.clock.now();
        self.session.check_active(now)
    }

    fn publish_state(&self, change: StateChange) {
        self.broker.publish(SessionEvent::State(SessionStateEvent {
            session_id: self.session.id.clone(),
            locked: self.session.locked,
            change,
            at: self.clock.now(),
        }));
    }

    fn publish_approval(&self, signal: Option<ApprovalSignal>) {
        match signal {
            Some(ApprovalSignal::Requested(device)) => {
                tracing::info!(
                    session = %self.session.id,
                    device = %device.user_id,
                    "approval requested"
                );
                self.publish_state(StateChange::ApprovalRequested(device));
            }
            Some(ApprovalSignal::Dismissed) => {
                self.publish_state(StateChange::ApprovalDismissed);
            }
            None => {}
        }
    }

    /// Broadcasts the full presence snapshot and feeds it to the approval edge.
    fn presence_changed(&mut self) {
        let sync = self.presence.sync(&self.session.id);
        let signal = self.approval.observe(&sync.entries, self.session.locked);
        self.broker.publish(SessionEvent::Presence(sync));
        self.publish_approval(signal);
    }

    fn set_locked(&mut self, locked: bool) -> RelayResult<Session> {
        self.check_active()?;
        if locked {
            let signal = self.approval.on_manual_lock();
            self.publish_approval(signal);
        }
        self.session.locked = locked;
        tracing::info!(session = %self.session.id, locked, "lock changed");
        self.publish_state(if locked {
            StateChange::Locked
        } else {
            StateChange::Unlocked
        });
        Ok(self.session.clone())
    }

    fn connect(&mut self, entry: PresenceEntry) -> RelayResult<(ConnectionId, Subscription)> {
        self.check_active()?;
        let subscription = self.broker.subscribe_all();
        let user_id = entry.user_id.clone();
        let device_type = entry.device_type;
        let (outcome, connection) = self.presence.join(entry);
        match outcome {
            JoinOutcome::Joined => {
                tracing::info!(session = %self.session.id, user = %user_id, %device_type, %connection, "device joined")
            }
            JoinOutcome::Rejoined => {
                tracing::debug!(session = %self.session.id, user = %user_id, %connection, "device rejoined")
            }
        }
        self.presence_changed();
        Ok((connection, subscription))
    }

    fn leave(&mut self, user_id: &UserId, connection: ConnectionId) {
        if self.presence.leave(user_id, connection).is_some() {
            tracing::info!(session = %self.session.id, user = %user_id, "device left");
            self.presence_changed();
        }
    }

    fn approve(&mut self) -> RelayResult<Session> {
        self.check_active()?;
        let device = self.approval.approve()?;
        self.session.locked = true;
        tracing::info!(session = %self.session.id, device = %device.user_id, "approved and locked");
        self.publish_state(StateChange::Locked);
        Ok(self.session.clone())
    }

    fn ignore(&mut self) -> RelayResult<Session> {
        self.check_active()?;
        let device = self.approval.ignore()?;
        tracing::info!(session = %self.session.id, device = %device.user_id, "approval ignored");
        self.publish_state(StateChange::ApprovalDismissed);
        Ok(self.session.clone())
    }

    fn check_writable(&mut self, session_id: &SessionId) -> RelayResult<()> {
        if session_id != &self.session.id {
            return Err(RelayError::invalid(format!(
                "record belongs to session {}, not {}",
                session_id, self.session.id
            )));
        }
        self.check_active()?;
        self.session.check_unlocked()
    }

    async fn append_file(&mut self, record: FileRecord) -> RelayResult<()> {
        self.check_writable(&record.session_id)?;
        self.records.insert_file(record.clone()).await?;
        tracing::info!(session = %self.session.id, file = %record.name, size = record.size, "file recorded");
        self.broker.publish(SessionEvent::File(record));
        Ok(())
    }

    async fn append_message(&mut self, record: MessageRecord) -> RelayResult<()> {
        self.check_writable(&record.session_id)?;
        self.records.insert_message(record.clone()).await?;
        self.broker.publish(SessionEvent::Message(record));
        Ok(())
    }

    fn publish_progress(&mut self, event: UploadProgressEvent) -> RelayResult<usize> {
        self.check_active()?;
        match self.progress.sanitize(event, tokio::time::Instant::now()) {
            Some(event) => Ok(self.broker.publish(SessionEvent::Progress(event))),
            None => Ok(0),
        }
    }

    fn snapshot(&mut self) -> RelayResult<SessionSnapshot> {
        self.check_active()?;
        Ok(SessionSnapshot {
            session: self.session.clone(),
            presence: self.presence.snapshot(),
            approval: self.approval.state().clone(),
        })
    }
}

fn reply<T>(tx: oneshot::Sender<T>, value: T) {
    if tx.send(value).is_err() {
        tracing::debug!("Session reply channel closed");
    }
}

/// The session actor.
pub struct SessionActor;

#[async_trait]
impl Actor for SessionActor {
    type Msg = SessionMessage;
    type State = SessionActorState;
    type Arguments = SessionActorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(session = %args.session.id, "session actor started");
        Ok(SessionActorState {
            broker: EventBroker::new(args.session.id.clone(), args.topic_capacity),
            session: args.session,
            clock: args.clock,
            records: args.records,
            presence: PresenceTracker::new(),
            approval: ApprovalWorkflow::new(),
            progress: ProgressRelay::new(args.progress_retention),
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::debug!(session = %state.session.id, "session actor stopped");
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SessionMessage::Record(tx) => {
                let now = state.clock.now();
                state.session.mark_expired(now);
                reply(tx, state.session.clone());
            }
            SessionMessage::Validate(tx) => {
                let result = state.check_active().map(|_| state.session.clone());
                reply(tx, result);
            }
            SessionMessage::SetLocked { locked, reply: tx } => {
                reply(tx, state.set_locked(locked));
            }
            SessionMessage::Connect { entry, reply: tx } => {
                reply(tx, state.connect(entry));
            }
            SessionMessage::Subscribe(tx) => {
                let result = state.check_active().map(|_| state.broker.subscribe_all());
                reply(tx, result);
            }
            SessionMessage::Leave {
                user_id,
                connection,
            } => state.leave(&user_id, connection),
            SessionMessage::Touch { user_id, reply: tx } => {
                let now = state.clock.now();
                let result = state
                    .check_active()
                    .map(|_| state.presence.touch(&user_id, now));
                reply(tx, result);
            }
            SessionMessage::ExpireIdle { timeout, reply: tx } => {
                let removed = state.presence.expire_idle(state.clock.now(), timeout);
                if !removed.is_empty() {
                    tracing::info!(
                        session = %state.session.id,
                        count = removed.len(),
                        "idle devices removed"
                    );
                    state.presence_changed();
                }
                reply(tx, removed);
            }
            SessionMessage::Snapshot(tx) => reply(tx, state.snapshot()),
            SessionMessage::Approve(tx) => reply(tx, state.approve()),
            SessionMessage::Ignore(tx) => reply(tx, state.ignore()),
            SessionMessage::AppendFile { record, reply: tx } => {
                let result = state.append_file(record).await;
                reply(tx, result);
            }
            SessionMessage::AppendMessage { record, reply: tx } => {
                let result = state.append_message(record).await;
                reply(tx, result);
            }
            SessionMessage::PublishProgress { event, reply: tx } => {
                reply(tx, state.publish_progress(event));
            }
        }

        Ok(())
    }
}
