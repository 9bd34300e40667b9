//! Tests for the session registry and session actor.

use super::*;
use crate::approval::ApprovalState;
use crate::domain::{
    DeviceType, ManualClock, MessageKind, SessionEvent, SessionStatus, StateChange, Topic,
    UploadId,
};
use crate::store::MemoryRecordStore;
use chrono::Utc;
use uuid::Uuid;

struct Fixture {
    registry: Arc<SessionRegistry>,
    clock: ManualClock,
    records: Arc<MemoryRecordStore>,
}

fn fixture() -> Fixture {
    let clock = ManualClock::new(Utc::now());
    let records = Arc::new(MemoryRecordStore::new());
    let registry = Arc::new(SessionRegistry::new(
        RegistrySettings::default(),
        Arc::new(clock.clone()),
        records.clone(),
    ));
    Fixture {
        registry,
        clock,
        records,
    }
}

fn sid(s: &str) -> SessionId {
    SessionId::parse(s).expect("valid id")
}

fn guest(id: &str, clock: &ManualClock) -> PresenceEntry {
    use crate::domain::Clock;
    PresenceEntry::new(UserId::from(id), DeviceType::Guest, "Mobile Device", clock.now())
}

fn host(id: &str, clock: &ManualClock) -> PresenceEntry {
    use crate::domain::Clock;
    PresenceEntry::new(UserId::from(id), DeviceType::Host, "Desktop", clock.now())
}

fn file_record(session: &SessionId) -> FileRecord {
    FileRecord {
        id: Uuid::new_v4(),
        session_id: session.clone(),
        name: "a.txt".to_string(),
        size: 3,
        content_type: "text/plain".to_string(),
        storage_path: format!("sessions/{}/up1234567-a.txt", session),
        created_at: Utc::now(),
    }
}

async fn next_event(sub: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("event timeout")
        .expect("event")
}

async fn next_state(sub: &mut Subscription) -> StateChange {
    loop {
        if let SessionEvent::State(state) = next_event(sub).await {
            return state.change;
        }
    }
}

#[tokio::test]
async fn test_validate_expiry_boundary() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");

    f.clock
        .advance(chrono::Duration::minutes(14) + chrono::Duration::seconds(59));
    assert!(f.registry.validate(&id).await.is_ok());

    f.clock.advance(chrono::Duration::seconds(2));
    assert!(matches!(
        f.registry.validate(&id).await,
        Err(RelayError::SessionExpired { .. })
    ));

    // Mutations are refused too
    assert!(matches!(
        f.registry.set_locked(&id, true).await,
        Err(RelayError::SessionExpired { .. })
    ));
}

#[tokio::test]
async fn test_unknown_session_not_found() {
    let f = fixture();
    assert!(matches!(
        f.registry.validate(&sid("nosuchthing")).await,
        Err(RelayError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_duplicate_create_collides() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("first create");
    assert!(matches!(
        f.registry.create(id).await,
        Err(RelayError::IdCollision { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_creates_exactly_one_wins() {
    let f = fixture();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = f.registry.clone();
        tasks.push(tokio::spawn(async move {
            registry.create(sid("race123456")).await
        }));
    }

    let mut ok = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(_) => ok += 1,
            Err(RelayError::IdCollision { .. }) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(f.registry.live_count().await, 1);
}

#[tokio::test]
async fn test_lock_changes_are_broadcast() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");
    let mut sub = handle.subscribe().await.expect("subscribe");

    f.registry.set_locked(&id, true).await.expect("lock");
    let session = f.registry.set_locked(&id, false).await.expect("unlock");
    assert!(!session.locked);

    assert_eq!(next_state(&mut sub).await, StateChange::Locked);
    assert_eq!(next_state(&mut sub).await, StateChange::Unlocked);
}

#[tokio::test]
async fn test_guest_join_requests_approval_and_approve_locks() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");

    let (_, mut host_sub) = handle.connect(host("host1", &f.clock)).await.expect("host");
    handle.connect(guest("g1", &f.clock)).await.expect("g1");
    handle.connect(guest("g2", &f.clock)).await.expect("g2");

    match next_state(&mut host_sub).await {
        StateChange::ApprovalRequested(device) => assert_eq!(device.user_id, UserId::from("g1")),
        other => panic!("expected approval request, got {:?}", other),
    }

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.presence.len(), 3);
    assert!(matches!(snapshot.approval, ApprovalState::PendingApproval(_)));

    let session = handle.approve().await.expect("approve");
    assert!(session.locked);
    assert_eq!(next_state(&mut host_sub).await, StateChange::Locked);
    assert_eq!(
        handle.snapshot().await.expect("snapshot").approval,
        ApprovalState::LockedByApproval
    );
}

#[tokio::test]
async fn test_dropped_guest_dismisses_request() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");

    let (_, mut host_sub) = handle.connect(host("host1", &f.clock)).await.expect("host");
    let (g1, _) = handle.connect(guest("g1", &f.clock)).await.expect("g1");
    handle.leave(UserId::from("g1"), g1);

    assert!(matches!(
        next_state(&mut host_sub).await,
        StateChange::ApprovalRequested(_)
    ));
    assert_eq!(next_state(&mut host_sub).await, StateChange::ApprovalDismissed);

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.presence.len(), 1);
    assert_eq!(snapshot.approval, ApprovalState::Idle);
}

#[tokio::test]
async fn test_presence_sync_after_each_change() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");
    let mut sub = handle.subscribe().await.expect("subscribe");

    let (g1, _) = handle.connect(guest("g1", &f.clock)).await.expect("join");
    handle.leave(UserId::from("g1"), g1);

    let mut syncs = Vec::new();
    while syncs.len() < 2 {
        if let SessionEvent::Presence(sync) = next_event(&mut sub).await {
            syncs.push(sync.entries.len());
        }
    }
    assert_eq!(syncs, vec![1, 0]);
}

#[tokio::test]
async fn test_leave_from_replaced_connection_keeps_presence() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");

    let (old, _old_sub) = handle.connect(guest("g1", &f.clock)).await.expect("first");
    let (current, _sub) = handle.connect(guest("g1", &f.clock)).await.expect("reconnect");
    assert_ne!(old, current);

    handle.leave(UserId::from("g1"), old);
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.presence.len(), 1);
    assert!(matches!(snapshot.approval, ApprovalState::PendingApproval(_)));

    handle.leave(UserId::from("g1"), current);
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(snapshot.presence.is_empty());
    assert_eq!(snapshot.approval, ApprovalState::Idle);
}

#[tokio::test]
async fn test_append_refused_while_locked() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");

    f.registry.set_locked(&id, true).await.expect("lock");
    assert!(matches!(
        handle.append_file(file_record(&id)).await,
        Err(RelayError::SessionAlreadyLocked { .. })
    ));
    assert!(f.records.list_files(&id).await.unwrap().is_empty());

    f.registry.set_locked(&id, false).await.expect("unlock");
    let mut sub = handle.subscribe().await.expect("subscribe");
    handle.append_file(file_record(&id)).await.expect("append");
    assert_eq!(next_event(&mut sub).await.topic(), Topic::Files);
    assert_eq!(f.records.list_files(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_append_message_fans_out() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");
    let mut sub = handle.subscribe().await.expect("subscribe");

    handle
        .append_message(MessageRecord {
            id: Uuid::new_v4(),
            session_id: id.clone(),
            content: "https://example.com".to_string(),
            kind: MessageKind::Url,
            created_at: Utc::now(),
        })
        .await
        .expect("append");

    match next_event(&mut sub).await {
        SessionEvent::Message(m) => assert_eq!(m.kind, MessageKind::Url),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_record_for_other_session_rejected() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");
    assert!(matches!(
        handle.append_file(file_record(&sid("other12345"))).await,
        Err(RelayError::InvalidInput { .. })
    ));
}

#[tokio::test]
async fn test_progress_regression_clamped() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");
    let mut sub = handle.subscribe().await.expect("subscribe");

    let upload = UploadId::generate();
    handle
        .publish_progress(UploadProgressEvent::uploading(upload.clone(), "a", 60))
        .await
        .expect("tick");
    handle
        .publish_progress(UploadProgressEvent::uploading(upload, "a", 30))
        .await
        .expect("tick");

    let mut seen = Vec::new();
    while seen.len() < 2 {
        if let SessionEvent::Progress(p) = next_event(&mut sub).await {
            seen.push(p.progress);
        }
    }
    assert_eq!(seen, vec![60, 60]);
}

#[tokio::test]
async fn test_expire_idle_presence() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    let handle = f.registry.handle(&id).await.expect("handle");
    handle.connect(guest("g1", &f.clock)).await.expect("g1");
    handle.connect(guest("g2", &f.clock)).await.expect("g2");

    f.clock.advance(chrono::Duration::seconds(40));
    assert!(handle.touch(UserId::from("g2")).await.expect("touch"));
    f.clock.advance(chrono::Duration::seconds(40));

    let removed = handle
        .expire_idle(chrono::Duration::seconds(60))
        .await
        .expect("expire");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].user_id, UserId::from("g1"));
}

#[tokio::test]
async fn test_record_marks_status_once_ttl_elapsed() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    assert_eq!(
        f.registry.record(&id).await.expect("record").status,
        SessionStatus::Active
    );

    f.clock.advance(chrono::Duration::minutes(16));
    assert_eq!(
        f.registry.record(&id).await.expect("record").status,
        SessionStatus::Expired
    );
    assert_eq!(f.registry.live_count().await, 1);
}

#[tokio::test]
async fn test_reap_keeps_expired_answer() {
    let f = fixture();
    let id = sid("abc1234567");
    f.registry.create(id.clone()).await.expect("create");
    f.registry.create(sid("fresh12345")).await.expect("create");

    f.clock.advance(chrono::Duration::minutes(16));
    f.registry.create(sid("late123456")).await.expect("create");

    assert_eq!(f.registry.reap_expired().await.len(), 2);
    assert_eq!(f.registry.live_count().await, 1);
    assert!(matches!(
        f.registry.validate(&id).await,
        Err(RelayError::SessionExpired { .. })
    ));
    assert_eq!(
        f.registry.record(&id).await.expect("record").status,
        SessionStatus::Expired
    );
    // Reaped ids stay taken
    assert!(matches!(
        f.registry.create(id).await,
        Err(RelayError::IdCollision { .. })
    ));
}
