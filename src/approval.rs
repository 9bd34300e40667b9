//! Approval handshake that gates locking when a guest device shows up.
//!
//! The rising edge is derived from the cardinality of consecutive presence
//! snapshots, never from a counter mutated elsewhere. The workflow is owned
//! by the session actor, which feeds it snapshots in the order they occur.

use crate::domain::{PresenceEntry, RelayError, RelayResult};
use serde::{Deserialize, Serialize};

/// Where a session is in the approval handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApprovalState {
    #[default]
    Idle,
    /// Waiting for the host to approve or ignore this device.
    PendingApproval(PresenceEntry),
    /// The host approved and the session was locked. Terminal.
    LockedByApproval,
}

impl ApprovalState {
    /// The device awaiting a decision, if any.
    pub fn pending(&self) -> Option<&PresenceEntry> {
        match self {
            ApprovalState::PendingApproval(device) => Some(device),
            _ => None,
        }
    }
}

/// Notification produced by a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalSignal {
    Requested(PresenceEntry),
    Dismissed,
}

/// Per-session approval state machine.
#[derive(Debug, Clone, Default)]
pub struct ApprovalWorkflow {
    state: ApprovalState,
    previous_guest_count: usize,
}

impl ApprovalWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ApprovalState {
        &self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, ApprovalState::PendingApproval(_))
    }

    /// Feeds the latest presence snapshot.
    ///
    /// Fires `Requested` only on a 0 -> n guest transition of an unlocked
    /// session while idle. A pending request whose guests all left is
    /// dismissed, so the next 0 -> 1 transition can fire again.
    pub fn observe(&mut self, snapshot: &[PresenceEntry], locked: bool) -> Option<ApprovalSignal> {
        let guest_count = snapshot.iter().filter(|e| e.is_guest()).count();
        let rising = self.previous_guest_count == 0 && guest_count > 0;
        self.previous_guest_count = guest_count;

        let idle = self.state == ApprovalState::Idle;

        if idle && rising && !locked {
            let device = snapshot
                .iter()
                .filter(|e| e.is_guest())
                .max_by_key(|e| e.joined_at)
                .cloned()?;
            self.state = ApprovalState::PendingApproval(device.clone());
            Some(ApprovalSignal::Requested(device))
        } else if self.is_pending() && guest_count == 0 {
            self.state = ApprovalState::Idle;
            Some(ApprovalSignal::Dismissed)
        } else {
            None
        }
    }

    /// Host approved the pending device. The caller must lock the session.
    pub fn approve(&mut self) -> RelayResult<PresenceEntry> {
        match std::mem::take(&mut self.state) {
            ApprovalState::PendingApproval(device) => {
                self.state = ApprovalState::LockedByApproval;
                Ok(device)
            }
            other => {
                self.state = other;
                Err(RelayError::invalid("no approval is pending"))
            }
        }
    }

    /// Host ignored the pending device. The lock flag is left alone.
    pub fn ignore(&mut self) -> RelayResult<PresenceEntry> {
        match std::mem::take(&mut self.state) {
            ApprovalState::PendingApproval(device) => Ok(device),
            other => {
                self.state = other;
                Err(RelayError::invalid("no approval is pending"))
            }
        }
    }

    /// A manual lock makes a pending request moot.
    pub fn on_manual_lock(&mut self) -> Option<ApprovalSignal> {
        if self.is_pending() {
            self.state = ApprovalState::Idle;
            Some(ApprovalSignal::Dismissed)
        } else {
            None
        }
    }
}
