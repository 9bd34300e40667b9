//! Per-session pub/sub fanout.
//!
//! Each topic is a `tokio::sync::broadcast` channel: every receiver that exists
//! when an event is sent gets it, in send order. Publishing never waits on a
//! receiver. A receiver that falls more than `capacity` events behind loses
//! the oldest ones and is told how many it skipped.

use crate::domain::{RelayError, RelayResult, SessionEvent, SessionId, Topic};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Topic channels of one session.
#[derive(Debug)]
pub struct EventBroker {
    session_id: SessionId,
    files: broadcast::Sender<SessionEvent>,
    messages: broadcast::Sender<SessionEvent>,
    state: broadcast::Sender<SessionEvent>,
    presence: broadcast::Sender<SessionEvent>,
    progress: broadcast::Sender<SessionEvent>,
}

impl EventBroker {
    pub fn new(session_id: SessionId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            session_id,
            files: broadcast::channel(capacity).0,
            messages: broadcast::channel(capacity).0,
            state: broadcast::channel(capacity).0,
            presence: broadcast::channel(capacity).0,
            progress: broadcast::channel(capacity).0,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<SessionEvent> {
        match topic {
            Topic::Files => &self.files,
            Topic::Messages => &self.messages,
            Topic::SessionState => &self.state,
            Topic::Presence => &self.presence,
            Topic::Progress => &self.progress,
        }
    }

    /// Fans an event out on its topic. Returns how many receivers it reached.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let topic = event.topic();
        match self.sender(topic).send(event) {
            Ok(count) => {
                tracing::debug!(session = %self.session_id, %topic, receivers = count, "published");
                count
            }
            Err(_) => {
                tracing::trace!(session = %self.session_id, %topic, "published with no subscribers");
                0
            }
        }
    }

    /// Receiver for a single topic. Only events sent after this call are seen.
    pub fn subscribe(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            rx: self.sender(topic).subscribe(),
        }
    }

    /// Receivers for every topic of the session.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            session_id: self.session_id.clone(),
            files: self.subscribe(Topic::Files),
            messages: self.subscribe(Topic::Messages),
            state: self.subscribe(Topic::SessionState),
            presence: self.subscribe(Topic::Presence),
            progress: self.subscribe(Topic::Progress),
        }
    }
}

/// Receiving end of one topic.
#[derive(Debug)]
pub struct TopicReceiver {
    topic: Topic,
    rx: broadcast::Receiver<SessionEvent>,
}

impl TopicReceiver {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Waits for the next event.
    ///
    /// Returns `SubscriberLagged` once after events were dropped for this
    /// receiver; the following call resumes with the oldest retained event.
    pub async fn recv(&mut self) -> RelayResult<SessionEvent> {
        match self.rx.recv().await {
            Ok(event) => Ok(event),
            Err(RecvError::Lagged(skipped)) => Err(self.lagged(skipped)),
            Err(RecvError::Closed) => Err(RelayError::channel(format!(
                "{} topic closed",
                self.topic
            ))),
        }
    }

    /// Non-blocking receive. `Ok(None)` means nothing is queued.
    pub fn try_recv(&mut self) -> RelayResult<Option<SessionEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Lagged(skipped)) => Err(self.lagged(skipped)),
            Err(TryRecvError::Closed) => Err(RelayError::channel(format!(
                "{} topic closed",
                self.topic
            ))),
        }
    }

    fn lagged(&self, skipped: u64) -> RelayError {
        tracing::warn!(topic = %self.topic, skipped, "subscriber lagged");
        RelayError::SubscriberLagged {
            topic: self.topic.to_string(),
            skipped,
        }
    }
}

/// Receivers for all topics of one session.
///
/// Order is preserved within a topic; interleaving across topics is arbitrary.
#[derive(Debug)]
pub struct Subscription {
    session_id: SessionId,
    files: TopicReceiver,
    messages: TopicReceiver,
    state: TopicReceiver,
    presence: TopicReceiver,
    progress: TopicReceiver,
}

impl Subscription {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Waits for the next event on any topic.
    pub async fn recv(&mut self) -> RelayResult<SessionEvent> {
        tokio::select! {
            result = self.files.recv() => result,
            result = self.messages.recv() => result,
            result = self.state.recv() => result,
            result = self.presence.recv() => result,
            result = self.progress.recv() => result,
        }
    }

    /// Drains whatever is queued right now, topic by topic.
    ///
    /// A lag notice is returned in place of the skipped events and draining
    /// of that topic continues after it, so nothing already queued is lost.
    pub fn drain(&mut self) -> Vec<RelayResult<SessionEvent>> {
        let mut drained = Vec::new();
        for receiver in [
            &mut self.files,
            &mut self.messages,
            &mut self.state,
            &mut self.presence,
            &mut self.progress,
        ] {
            loop {
                match receiver.try_recv() {
                    Ok(Some(event)) => drained.push(Ok(event)),
                    Ok(None) => break,
                    Err(e @ RelayError::SubscriberLagged { .. }) => drained.push(Err(e)),
                    Err(e) => {
                        drained.push(Err(e));
                        break;
                    }
                }
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageKind, MessageRecord, UploadId, UploadProgressEvent};
    use chrono::Utc;
    use uuid::Uuid;

    fn session() -> SessionId {
        SessionId::parse("abc1234567").unwrap()
    }

    fn message(content: &str) -> SessionEvent {
        SessionEvent::Message(MessageRecord {
            id: Uuid::new_v4(),
            session_id: session(),
            content: content.to_string(),
            kind: MessageKind::classify(content),
            created_at: Utc::now(),
        })
    }

    fn content(event: &SessionEvent) -> &str {
        match event {
            SessionEvent::Message(m) => &m.content,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delivery_in_publish_order() {
        let broker = EventBroker::new(session(), 16);
        let mut a = broker.subscribe(Topic::Messages);
        let mut b = broker.subscribe(Topic::Messages);

        broker.publish(message("A"));
        broker.publish(message("B"));

        for rx in [&mut a, &mut b] {
            assert_eq!(content(&rx.recv().await.unwrap()), "A");
            assert_eq!(content(&rx.recv().await.unwrap()), "B");
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let broker = EventBroker::new(session(), 16);
        let mut early = broker.subscribe(Topic::Messages);
        broker.publish(message("before"));
        let mut late = broker.subscribe(Topic::Messages);
        broker.publish(message("after"));

        assert_eq!(content(&early.recv().await.unwrap()), "before");
        assert_eq!(content(&late.recv().await.unwrap()), "after");
        assert!(late.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broker = EventBroker::new(session(), 4);
        assert_eq!(broker.publish(message("nobody")), 0);
    }

    #[test]
    fn test_topics_are_independent() {
        let broker = EventBroker::new(session(), 4);
        let mut files = broker.subscribe(Topic::Files);
        broker.publish(message("text"));
        assert!(files.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_slow_subscriber_is_told_it_lagged() {
        let broker = EventBroker::new(session(), 2);
        let mut slow = broker.subscribe(Topic::Messages);
        for i in 0..5 {
            broker.publish(message(&i.to_string()));
        }

        match slow.try_recv() {
            Err(RelayError::SubscriberLagged { topic, skipped }) => {
                assert_eq!(topic, "messages");
                assert_eq!(skipped, 3);
            }
            other => panic!("expected lag, got {:?}", other),
        }
        // Resumes with the oldest retained events
        assert_eq!(content(&slow.try_recv().unwrap().unwrap()), "3");
        assert_eq!(content(&slow.try_recv().unwrap().unwrap()), "4");
    }

    #[tokio::test]
    async fn test_subscription_spans_topics() {
        let broker = EventBroker::new(session(), 8);
        let mut sub = broker.subscribe_all();

        broker.publish(message("hello"));
        broker.publish(SessionEvent::Progress(UploadProgressEvent::uploading(
            UploadId::generate(),
            "a.bin",
            10,
        )));

        let events: Vec<SessionEvent> = sub.drain().into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.topic() == Topic::Messages));
        assert!(events.iter().any(|e| e.topic() == Topic::Progress));
    }

    #[test]
    fn test_drain_keeps_events_queued_before_a_lagged_topic() {
        let broker = EventBroker::new(session(), 2);
        let mut sub = broker.subscribe_all();

        broker.publish(message("keep me"));
        let upload = UploadId::generate();
        for progress in [10, 20, 30, 40, 50] {
            broker.publish(SessionEvent::Progress(UploadProgressEvent::uploading(
                upload.clone(),
                "a.bin",
                progress,
            )));
        }

        let drained = sub.drain();
        let messages: Vec<&str> = drained
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .filter(|e| e.topic() == Topic::Messages)
            .map(content)
            .collect();
        assert_eq!(messages, vec!["keep me"]);
        assert!(drained.iter().any(|r| matches!(
            r,
            Err(RelayError::SubscriberLagged { skipped: 3, .. })
        )));
        // The retained progress ticks follow the lag notice
        let ticks = drained
            .iter()
            .filter(|r| matches!(r, Ok(SessionEvent::Progress(_))))
            .count();
        assert_eq!(ticks, 2);
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn test_closed_broker_reports_channel_unavailable() {
        let broker = EventBroker::new(session(), 8);
        let mut rx = broker.subscribe(Topic::Files);
        drop(broker);
        assert!(matches!(
            rx.recv().await,
            Err(RelayError::ChannelUnavailable { .. })
        ));
    }
}
