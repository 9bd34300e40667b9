//! Session record and its expiry rules.

use crate::domain::{RelayError, RelayResult, SessionId, SessionStatus, TimestampUtc};
use serde::{Deserialize, Serialize};

/// Default session lifetime in seconds. Not renewable.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 15 * 60;

/// A short-lived pairing context addressed by its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: TimestampUtc,
    pub expires_at: TimestampUtc,
    pub locked: bool,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(id: SessionId, now: TimestampUtc, ttl: chrono::Duration) -> Self {
        Self {
            id,
            created_at: now,
            expires_at: now + ttl,
            locked: false,
            status: SessionStatus::Active,
        }
    }

    /// Expired strictly after `expires_at`, whatever the stored status says.
    pub fn is_expired(&self, now: TimestampUtc) -> bool {
        self.status == SessionStatus::Expired || now > self.expires_at
    }

    /// Sets the status to `Expired` once the TTL has elapsed. Returns
    /// whether the session is expired.
    pub fn mark_expired(&mut self, now: TimestampUtc) -> bool {
        if !self.is_expired(now) {
            return false;
        }
        if self.status != SessionStatus::Expired {
            tracing::info!(session = %self.id, "session expired");
            self.status = SessionStatus::Expired;
        }
        true
    }

    /// Fails with `SessionExpired` once the TTL has elapsed, recording the
    /// status change on the way.
    pub fn check_active(&mut self, now: TimestampUtc) -> RelayResult<()> {
        if self.mark_expired(now) {
            return Err(RelayError::SessionExpired {
                session_id: self.id.to_string(),
            });
        }
        Ok(())
    }

    /// Guest writes are refused while the host holds the lock.
    pub fn check_unlocked(&self) -> RelayResult<()> {
        if self.locked {
            return Err(RelayError::SessionAlreadyLocked {
                session_id: self.id.to_string(),
            });
        }
        Ok(())
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: TimestampUtc) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session() -> (Session, TimestampUtc) {
        let t = Utc::now();
        (
            Session::new(
                SessionId::parse("abc1234567").unwrap(),
                t,
                chrono::Duration::minutes(15),
            ),
            t,
        )
    }

    #[test]
    fn test_expiry_boundary() {
        let (mut s, t) = session();
        assert!(s
            .check_active(t + chrono::Duration::minutes(14) + chrono::Duration::seconds(59))
            .is_ok());
        assert!(s.check_active(t + chrono::Duration::minutes(15)).is_ok());
        assert!(matches!(
            s.check_active(t + chrono::Duration::minutes(15) + chrono::Duration::seconds(1)),
            Err(RelayError::SessionExpired { .. })
        ));
        assert_eq!(s.status, SessionStatus::Expired);
    }

    #[test]
    fn test_mark_expired_sets_status_only_after_ttl() {
        let (mut s, t) = session();
        assert!(!s.mark_expired(t + chrono::Duration::minutes(15)));
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.mark_expired(t + chrono::Duration::minutes(16)));
        assert_eq!(s.status, SessionStatus::Expired);
        assert!(s.mark_expired(t));
    }

    #[test]
    fn test_expired_status_sticks() {
        let (mut s, t) = session();
        s.status = SessionStatus::Expired;
        assert!(s.check_active(t).is_err());
    }

    #[test]
    fn test_lock_check_and_remaining() {
        let (mut s, t) = session();
        assert!(s.check_unlocked().is_ok());
        s.locked = true;
        assert!(matches!(
            s.check_unlocked(),
            Err(RelayError::SessionAlreadyLocked { .. })
        ));
        assert_eq!(s.remaining(t), chrono::Duration::minutes(15));
        assert_eq!(
            s.remaining(t + chrono::Duration::hours(1)),
            chrono::Duration::zero()
        );
    }
}
