//! A surface's local copy of the authoritative thresholds
//!
//! The analysis process owns the thresholds and tags every broadcast with its
//! session and a revision. A surface either only writes (its local value is
//! the one it last sent) or also reads, in which case it keeps its own
//! not-yet-acknowledged edits as an overlay on top of the last confirmed
//! broadcast. A broadcast therefore never clobbers an edit that the analysis
//! process has not seen yet, and an edit never hides a newer revision once it
//! is acknowledged.
//!
//! Commands are fire-and-forget, so an edit may never be acknowledged. Such an
//! edit leaves the overlay after [`PENDING_TIMEOUT`], and edits sent to a
//! previous run of the analysis process leave it as soon as a new run is seen.

use crate::domain::protocol::{RequestTag, SurfaceId, ThresholdBroadcast};
use crate::domain::thresholds::{self, ThresholdSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How long an unacknowledged edit stays in the overlay
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(5);

/// How a surface participates in threshold sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Publishes edits and ignores broadcasts
    WriteOnly,
    /// Publishes edits and reconciles with broadcasts
    #[default]
    ReadReconcile,
}

/// An edit that has been sent but not yet acknowledged
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PendingEdit {
    Replace(ThresholdSet),
    Shift(f32),
}

impl PendingEdit {
    fn apply_to(&self, base: ThresholdSet) -> thresholds::Result<ThresholdSet> {
        match self {
            PendingEdit::Replace(next) => Ok(*next),
            PendingEdit::Shift(delta) => base.shifted(*delta),
        }
    }
}

/// Outcome of reconciling one broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A newer revision or session replaced the confirmed value
    Applied,
    /// Same revision; only acknowledgements were processed
    Acknowledged,
    /// Older than the confirmed revision and dropped
    Stale,
    /// Not relevant to this replica
    Ignored,
}

#[derive(Debug, Clone)]
struct Pending {
    request: u64,
    edit: PendingEdit,
    /// Session the replica had confirmed when the edit was sent
    session: Option<u64>,
    sent: Instant,
}

#[derive(Debug, Clone)]
pub struct ThresholdReplica {
    origin: SurfaceId,
    mode: SyncMode,
    confirmed: ThresholdSet,
    /// `(session, revision)` of the confirmed value
    position: Option<(u64, u64)>,
    pending: VecDeque<Pending>,
    pending_timeout: Duration,
    next_request: u64,
}

impl ThresholdReplica {
    pub fn new(origin: SurfaceId, mode: SyncMode, seed: ThresholdSet) -> Self {
        Self {
            origin,
            mode,
            confirmed: seed,
            position: None,
            pending: VecDeque::new(),
            pending_timeout: PENDING_TIMEOUT,
            next_request: 1,
        }
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn origin(&self) -> &SurfaceId {
        &self.origin
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Last value confirmed by a broadcast (or written, for write-only replicas)
    pub fn confirmed(&self) -> ThresholdSet {
        self.confirmed
    }

    pub fn session(&self) -> Option<u64> {
        self.position.map(|(session, _)| session)
    }

    pub fn revision(&self) -> Option<u64> {
        self.position.map(|(_, revision)| revision)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Value shown to the operator: the confirmed value with pending edits on top
    pub fn displayed(&self) -> ThresholdSet {
        self.pending.iter().fold(self.confirmed, |current, pending| {
            pending.edit.apply_to(current).unwrap_or(current)
        })
    }

    /// Record a local edit before it is sent
    ///
    /// Returns the tag to attach to the outgoing message when the replica waits
    /// for an acknowledgement. Write-only replicas apply the edit directly.
    pub fn record_local(
        &mut self,
        edit: PendingEdit,
        now: Instant,
    ) -> thresholds::Result<Option<RequestTag>> {
        match self.mode {
            SyncMode::WriteOnly => {
                self.confirmed = edit.apply_to(self.confirmed)?;
                Ok(None)
            }
            SyncMode::ReadReconcile => {
                edit.apply_to(self.displayed())?;
                let request = self.next_request;
                self.next_request += 1;
                self.pending.push_back(Pending {
                    request,
                    edit,
                    session: self.session(),
                    sent: now,
                });
                Ok(Some(RequestTag {
                    origin: self.origin.clone(),
                    request,
                }))
            }
        }
    }

    /// Reconcile an authoritative broadcast received at `now`
    pub fn apply_broadcast(&mut self, broadcast: &ThresholdBroadcast, now: Instant) -> Reconciled {
        if self.mode == SyncMode::WriteOnly {
            return Reconciled::Ignored;
        }

        let position = (broadcast.session, broadcast.revision);
        let previous = self.position;
        let outcome = match previous {
            Some(current) if position < current => return Reconciled::Stale,
            Some(current) if position == current => Reconciled::Acknowledged,
            _ => {
                self.confirmed = broadcast.thresholds;
                self.position = Some(position);
                Reconciled::Applied
            }
        };

        let acknowledged = self.acknowledge(broadcast.ack.as_ref());
        let mut dropped = 0;
        if previous.map(|(session, _)| session) != Some(broadcast.session) {
            // Revision 0 means the session just started and saw none of our edits
            if previous.is_some() || broadcast.revision == 0 {
                dropped += self.drop_other_sessions(broadcast.session);
            }
        }
        dropped += self.expire(now);
        trace!(
            surface = %self.origin,
            session = broadcast.session,
            revision = broadcast.revision,
            acknowledged,
            dropped,
            pending = self.pending.len(),
            "Reconciled thresholds broadcast"
        );

        match outcome {
            Reconciled::Acknowledged if acknowledged == 0 && dropped == 0 => Reconciled::Ignored,
            other => other,
        }
    }

    /// Drop edits that have waited longer than the pending timeout
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.pending_timeout;
        let before = self.pending.len();
        self.pending
            .retain(|pending| now.saturating_duration_since(pending.sent) < timeout);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!(surface = %self.origin, expired, "Unacknowledged edits expired");
        }
        expired
    }

    fn drop_other_sessions(&mut self, session: u64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|pending| pending.session == Some(session));
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(
                surface = %self.origin,
                session,
                dropped,
                "Dropped edits sent before the current analysis session"
            );
        }
        dropped
    }

    /// Drop pending edits covered by `ack`; returns how many were dropped
    fn acknowledge(&mut self, ack: Option<&RequestTag>) -> usize {
        let Some(ack) = ack.filter(|ack| ack.origin == self.origin) else {
            return 0;
        };
        let before = self.pending.len();
        self.pending.retain(|pending| pending.request > ack.request);
        before - self.pending.len()
    }
}
