//! Ephemeral upload progress.
//!
//! Progress ticks are never persisted. The relay side (`ProgressRelay`) keeps
//! each upload's progress non-decreasing before it is broadcast; the consumer
//! side (`ProgressView`) keeps the latest event per upload and lets terminal
//! entries linger for a fixed delay before removing them.

use crate::domain::{UploadId, UploadProgressEvent, UploadStatus};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// How long a terminal entry stays visible.
pub const DEFAULT_PROGRESS_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct LastTick {
    progress: u8,
    status: UploadStatus,
    terminal_at: Option<Instant>,
}

/// Relay-side sanity check for one session's progress stream.
#[derive(Debug)]
pub struct ProgressRelay {
    retention: Duration,
    last: HashMap<UploadId, LastTick>,
}

impl ProgressRelay {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            last: HashMap::new(),
        }
    }

    /// Returns the event to broadcast, or `None` if it must be dropped.
    ///
    /// A regressive tick is clamped to the last seen progress. Anything sent
    /// after a terminal status for the same upload is dropped.
    pub fn sanitize(
        &mut self,
        mut event: UploadProgressEvent,
        now: Instant,
    ) -> Option<UploadProgressEvent> {
        self.forget_finished(now);

        let previous = self.last.get(&event.upload_id).copied();
        if let Some(prev) = previous {
            if prev.status.is_terminal() {
                tracing::warn!(upload = %event.upload_id, "dropping progress after terminal status");
                return None;
            }
            if event.progress < prev.progress {
                tracing::warn!(
                    upload = %event.upload_id,
                    from = prev.progress,
                    to = event.progress,
                    "clamping regressive progress"
                );
                event.progress = prev.progress;
            }
        }

        event.progress = event.progress.min(100);
        if event.status == UploadStatus::Completed {
            event.progress = 100;
        }

        let terminal_at = event.status.is_terminal().then_some(now);
        self.last.insert(
            event.upload_id.clone(),
            LastTick {
                progress: event.progress,
                status: event.status,
                terminal_at,
            },
        );
        Some(event)
    }

    /// Number of uploads currently tracked.
    pub fn tracked(&self) -> usize {
        self.last.len()
    }

    fn forget_finished(&mut self, now: Instant) {
        let retention = self.retention;
        self.last.retain(|_, tick| match tick.terminal_at {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    event: UploadProgressEvent,
    seq: u64,
    remove_at: Option<Instant>,
}

/// Consumer working set: latest event per upload.
#[derive(Debug)]
pub struct ProgressView {
    linger: Duration,
    next_seq: u64,
    entries: HashMap<UploadId, Tracked>,
}

impl ProgressView {
    pub fn new(linger: Duration) -> Self {
        Self {
            linger,
            next_seq: 0,
            entries: HashMap::new(),
        }
    }

    /// Applies an event. A terminal event schedules removal `linger` from `now`.
    pub fn apply(&mut self, event: UploadProgressEvent, now: Instant) {
        if let Some(existing) = self.entries.get(&event.upload_id) {
            if existing.event.is_terminal() {
                return;
            }
        }

        let remove_at = event.is_terminal().then(|| now + self.linger);
        let seq = match self.entries.get(&event.upload_id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.entries.insert(
            event.upload_id.clone(),
            Tracked {
                event,
                seq,
                remove_at,
            },
        );
    }

    /// Removes entries whose linger elapsed. Returns the removed events,
    /// oldest upload first.
    pub fn prune(&mut self, now: Instant) -> Vec<UploadProgressEvent> {
        let expired: Vec<UploadId> = self
            .entries
            .iter()
            .filter(|(_, t)| t.remove_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed: Vec<Tracked> = expired
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect();
        removed.sort_by_key(|t| t.seq);
        removed.into_iter().map(|t| t.event).collect()
    }

    /// Visible entries, oldest upload first.
    pub fn visible(&mut self, now: Instant) -> Vec<UploadProgressEvent> {
        self.prune(now);
        let mut tracked: Vec<&Tracked> = self.entries.values().collect();
        tracked.sort_by_key(|t| t.seq);
        tracked.into_iter().map(|t| t.event.clone()).collect()
    }

    /// Earliest pending removal, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|t| t.remove_at).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ProgressView {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_LINGER)
    }
}
