use std::{
    cmp,
    collections::HashSet,
    time::{Duration, Instant},
};

use derive_more::derive::IsVariant;
use serde::{Deserialize, Serialize};

use super::{log::LogEntry, ReplicaId};

/// A replica's status as visible on the wire and in `report()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Normal,
    ViewChange,
    DoViewChange,
    StartView,
    Recovery,
    Transitioning,
    Dead,
}

/// Internal status. Each variant carries the bookkeeping that exists only
/// while the replica is in it; the `tick` dispatcher matches exhaustively.
#[derive(Debug)]
pub(crate) enum Status<Op> {
    /// Constructed but not yet released by the ready signal.
    Transitioning,
    Normal(NormalState),
    /// Collecting StartViewChange acks, then waiting out DoViewChange.
    ViewChange(ViewChangeState<Op>),
    /// New primary with the adopted state, StartView broadcast pending.
    StartView,
    /// Behind the cluster; fetching state from a current replica.
    Recovery(RecoveryState),
    Dead,
}

impl<Op> Status<Op> {
    pub(crate) fn diagnostic(&self) -> ReplicaStatus {
        match self {
            Status::Transitioning => ReplicaStatus::Transitioning,
            Status::Normal(_) => ReplicaStatus::Normal,
            Status::ViewChange(vc) => match vc.phase {
                ViewChangePhase::StartViewChange => ReplicaStatus::ViewChange,
                ViewChangePhase::DoViewChange => ReplicaStatus::DoViewChange,
            },
            Status::StartView => ReplicaStatus::StartView,
            Status::Recovery(_) => ReplicaStatus::Recovery,
            Status::Dead => ReplicaStatus::Dead,
        }
    }
}

#[derive(Debug)]
pub(crate) struct NormalState {
    /// Last evidence of a live primary in this view (a valid Prepare or
    /// Commit); the single liveness signal for the election timer.
    pub(crate) last_heartbeat: Instant,
    /// Election timeout drawn for this stint in Normal status.
    pub(crate) election_timeout: Duration,
    /// When the primary last broadcast a Commit heartbeat.
    pub(crate) last_commit_broadcast: Instant,

    /// Primary bookkeeping: per-replica highest acknowledged op number.
    /// Backups append strictly in order, so a watermark of `n` covers every
    /// op up to `n`.
    acked_op: Vec<usize>,
}

impl NormalState {
    pub(crate) fn new(now: Instant, replica_count: usize, election_timeout: Duration) -> Self {
        Self {
            last_heartbeat: now,
            election_timeout,
            last_commit_broadcast: now,
            acked_op: vec![0; replica_count],
        }
    }

    pub(crate) fn record_ack(&mut self, replica_id: ReplicaId, op_number: usize) {
        self.acked_op[replica_id] = cmp::max(self.acked_op[replica_id], op_number);
    }

    pub(crate) fn acked(&self, replica_id: ReplicaId) -> usize {
        self.acked_op[replica_id]
    }

    /// Highest op number acknowledged by a quorum, with the primary's own
    /// log end standing in for its slot.
    pub(crate) fn quorum_op_number(&self, replica_id: ReplicaId, op_number: usize) -> usize {
        let mut watermarks = self.acked_op.clone();
        watermarks[replica_id] = op_number;
        watermarks.sort_unstable();
        watermarks[(watermarks.len() - 1) / 2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ViewChangePhase {
    StartViewChange,
    DoViewChange,
}

/// A log offered through DoViewChange. The winner is the one whose owner was
/// Normal in the latest view, ties broken by the longer log.
#[derive(Debug)]
pub(crate) struct LogCandidate<Op> {
    pub(crate) last_normal_view: usize,
    pub(crate) op_number: usize,
    pub(crate) log: Vec<LogEntry<Op>>,
    pub(crate) commit_number: usize,
}

impl<Op> LogCandidate<Op> {
    fn outranks(&self, other: &LogCandidate<Op>) -> bool {
        (self.last_normal_view, self.op_number) > (other.last_normal_view, other.op_number)
    }
}

#[derive(Debug)]
pub(crate) struct ViewChangeState<Op> {
    pub(crate) started_at: Instant,
    /// Restarting timeout: a round that stalls this long is abandoned for
    /// the next view.
    pub(crate) timeout: Duration,
    pub(crate) phase: ViewChangePhase,
    /// The StartViewChange broadcast goes out on the first tick after entry.
    pub(crate) blasted: bool,
    /// Whether this replica has passed its state to the new primary (or
    /// registered itself, if it is the new primary).
    pub(crate) sent_do_view_change: bool,

    start_view_change_acks: HashSet<ReplicaId>,
    do_view_change_from: HashSet<ReplicaId>,
    pub(crate) best: Option<LogCandidate<Op>>,
    pub(crate) max_commit_number: usize,
}

impl<Op> ViewChangeState<Op> {
    pub(crate) fn new(now: Instant, timeout: Duration, replica_id: ReplicaId) -> Self {
        Self {
            started_at: now,
            timeout,
            phase: ViewChangePhase::StartViewChange,
            blasted: false,
            sent_do_view_change: false,
            start_view_change_acks: HashSet::from([replica_id]),
            do_view_change_from: HashSet::new(),
            best: None,
            max_commit_number: 0,
        }
    }

    pub(crate) fn register_start_view_change_ack(&mut self, from: ReplicaId) {
        self.start_view_change_acks.insert(from);
    }

    pub(crate) fn start_view_change_ack_count(&self) -> usize {
        self.start_view_change_acks.len()
    }

    pub(crate) fn register_do_view_change(&mut self, from: ReplicaId, candidate: LogCandidate<Op>) {
        self.do_view_change_from.insert(from);
        self.max_commit_number = cmp::max(self.max_commit_number, candidate.commit_number);

        let replace = match &self.best {
            Some(best) => candidate.outranks(best),
            None => true,
        };
        if replace {
            self.best = Some(candidate);
        }
    }

    pub(crate) fn do_view_change_count(&self) -> usize {
        self.do_view_change_from.len()
    }
}

#[derive(Debug)]
pub(crate) struct RecoveryState {
    /// The view this replica is trying to catch up to.
    pub(crate) target_view: usize,
    pub(crate) last_request: Instant,
}

impl RecoveryState {
    pub(crate) fn new(now: Instant, target_view: usize) -> Self {
        Self {
            target_view,
            last_request: now,
        }
    }
}
