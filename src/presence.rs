//! Live device membership for one session.
//!
//! The tracker is owned by the session actor, so every join and leave of a
//! session is applied in a single order. Entries live only as long as the
//! device's connection; nothing here is persisted.

use crate::domain::{PresenceEntry, PresenceSync, SessionId, TimestampUtc, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifies one live connection of a device. A device that reconnects
/// under the same `user_id` gets a new id, so a late leave from the old
/// connection can be told apart from a leave of the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a join added a device or refreshed one already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Rejoined,
}

#[derive(Debug, Clone)]
struct Member {
    entry: PresenceEntry,
    connection: ConnectionId,
}

/// Per-session set of connected devices keyed by `user_id`.
#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    entries: BTreeMap<UserId, Member>,
    next_connection: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or refreshes a device and hands out the id of its new
    /// connection. A rejoin keeps the original `joined_at` and takes over
    /// the entry from the previous connection.
    pub fn join(&mut self, entry: PresenceEntry) -> (JoinOutcome, ConnectionId) {
        self.next_connection += 1;
        let connection = ConnectionId(self.next_connection);
        match self.entries.get_mut(&entry.user_id) {
            Some(existing) => {
                let joined_at = existing.entry.joined_at;
                existing.entry = entry;
                existing.entry.joined_at = joined_at;
                existing.connection = connection;
                (JoinOutcome::Rejoined, connection)
            }
            None => {
                self.entries
                    .insert(entry.user_id.clone(), Member { entry, connection });
                (JoinOutcome::Joined, connection)
            }
        }
    }

    /// Removes a device if `connection` is still the one holding its entry.
    /// A leave from a superseded connection is ignored.
    pub fn leave(&mut self, user_id: &UserId, connection: ConnectionId) -> Option<PresenceEntry> {
        match self.entries.get(user_id) {
            Some(member) if member.connection == connection => {
                self.entries.remove(user_id).map(|m| m.entry)
            }
            Some(_) => {
                tracing::debug!(user = %user_id, %connection, "ignoring leave from a replaced connection");
                None
            }
            None => None,
        }
    }

    /// Updates `last_seen` for a device. Returns false if it is not present.
    pub fn touch(&mut self, user_id: &UserId, now: TimestampUtc) -> bool {
        match self.entries.get_mut(user_id) {
            Some(member) => {
                member.entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Drops every device not seen within `timeout` of `now`.
    pub fn expire_idle(
        &mut self,
        now: TimestampUtc,
        timeout: chrono::Duration,
    ) -> Vec<PresenceEntry> {
        let stale: Vec<UserId> = self
            .entries
            .values()
            .filter(|m| now - m.entry.last_seen > timeout)
            .map(|m| m.entry.user_id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|m| m.entry)
            .collect()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.entries.contains_key(user_id)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&PresenceEntry> {
        self.entries.get(user_id).map(|m| &m.entry)
    }

    /// Current entries, ordered by join time.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> =
            self.entries.values().map(|m| m.entry.clone()).collect();
        entries.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        entries
    }

    /// Full-state sync payload for subscribers.
    pub fn sync(&self, session_id: &SessionId) -> PresenceSync {
        PresenceSync {
            session_id: session_id.clone(),
            entries: self.snapshot(),
        }
    }

    pub fn guest_count(&self) -> usize {
        self.entries.values().filter(|m| m.entry.is_guest()).count()
    }

    pub fn host_count(&self) -> usize {
        self.entries.len() - self.guest_count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceType;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn guest(id: &str, now: TimestampUtc) -> PresenceEntry {
        PresenceEntry::new(UserId::from(id), DeviceType::Guest, "Mobile Device", now)
    }

    #[test]
    fn test_join_and_leave() {
        let now = Utc::now();
        let mut tracker = PresenceTracker::new();
        let (outcome, g1) = tracker.join(guest("g1", now));
        assert_eq!(outcome, JoinOutcome::Joined);
        assert_eq!(tracker.join(guest("g2", now)).0, JoinOutcome::Joined);
        assert_eq!(tracker.guest_count(), 2);

        assert!(tracker.leave(&UserId::from("g1"), g1).is_some());
        assert!(tracker.leave(&UserId::from("g1"), g1).is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_leave_from_replaced_connection_is_ignored() {
        let now = Utc::now();
        let mut tracker = PresenceTracker::new();
        let (_, old) = tracker.join(guest("g1", now));
        let (outcome, current) = tracker.join(guest("g1", now));
        assert_eq!(outcome, JoinOutcome::Rejoined);
        assert_ne!(old, current);

        assert!(tracker.leave(&UserId::from("g1"), old).is_none());
        assert!(tracker.contains(&UserId::from("g1")));
        assert_eq!(tracker.guest_count(), 1);

        assert!(tracker.leave(&UserId::from("g1"), current).is_some());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_rejoin_keeps_joined_at() {
        let start = Utc::now();
        let mut tracker = PresenceTracker::new();
        tracker.join(guest("g1", start));

        let later = start + chrono::Duration::seconds(30);
        let mut again = guest("g1", later);
        again.display_name = "Renamed".to_string();
        assert_eq!(tracker.join(again).0, JoinOutcome::Rejoined);

        let entry = tracker.get(&UserId::from("g1")).unwrap();
        assert_eq!(entry.joined_at, start);
        assert_eq!(entry.last_seen, later);
        assert_eq!(entry.display_name, "Renamed");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_host_and_guest_counts() {
        let now = Utc::now();
        let mut tracker = PresenceTracker::new();
        tracker.join(PresenceEntry::new(
            UserId::from("h1"),
            DeviceType::Host,
            "Desktop",
            now,
        ));
        tracker.join(guest("g1", now));
        assert_eq!(tracker.host_count(), 1);
        assert_eq!(tracker.guest_count(), 1);
    }

    #[test]
    fn test_expire_idle() {
        let start = Utc::now();
        let mut tracker = PresenceTracker::new();
        tracker.join(guest("g1", start));
        tracker.join(guest("g2", start));
        tracker.touch(&UserId::from("g2"), start + chrono::Duration::seconds(50));

        let removed = tracker.expire_idle(
            start + chrono::Duration::seconds(61),
            chrono::Duration::seconds(60),
        );
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].user_id, UserId::from("g1"));
        assert!(tracker.contains(&UserId::from("g2")));
    }

    #[test]
    fn test_snapshot_ordered_by_join_time() {
        let start = Utc::now();
        let mut tracker = PresenceTracker::new();
        tracker.join(guest("zz", start));
        tracker.join(guest("aa", start + chrono::Duration::seconds(1)));
        let ids: Vec<String> = tracker
            .snapshot()
            .into_iter()
            .map(|e| e.user_id.to_string())
            .collect();
        assert_eq!(ids, vec!["zz", "aa"]);
    }

    proptest! {
        #[test]
        fn prop_snapshot_matches_last_event(ops in proptest::collection::vec((0u8..6, any::<bool>()), 0..60)) {
            let now = Utc::now();
            let mut tracker = PresenceTracker::new();
            let mut model = BTreeSet::new();
            let mut connections = std::collections::HashMap::new();

            for (user, is_join) in ops {
                let id = format!("u{}", user);
                if is_join {
                    let (_, connection) = tracker.join(guest(&id, now));
                    connections.insert(id.clone(), connection);
                    model.insert(id);
                } else {
                    if let Some(connection) = connections.get(&id) {
                        tracker.leave(&UserId::from(id.as_str()), *connection);
                    }
                    model.remove(&id);
                }
            }

            let actual: BTreeSet<String> = tracker
                .snapshot()
                .into_iter()
                .map(|e| e.user_id.to_string())
                .collect();
            prop_assert_eq!(actual, model);
        }
    }
}
