use std::{
    cmp::Ordering,
    time::{Duration, Instant},
};

use derive_more::derive::IsVariant;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    message::{
        ClientRequest, Commit, CommitOk, DoViewChange, DoViewChangeOk, Envelope, GetState, Hello,
        HelloOk, NewState, Prepare, PrepareOk, Protocol, StartView, StartViewChange,
        StartViewChangeOk, StartViewOk,
    },
    state_machine::StateMachine,
};

use super::{
    client_table::RequestDisposition,
    log::{CommitEntry, OpLog},
    status::{
        LogCandidate, NormalState, RecoveryState, ReplicaStatus, Status, ViewChangePhase,
        ViewChangeState,
    },
    ReplicaId,
};

/// Timing knobs. The defaults match a single-datacenter deployment; all of
/// them are tunable at construction.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Election timeout range; each stint draws uniformly from it.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Cadence at which the runtime is expected to call [`Replica::tick`].
    pub tick_interval: Duration,
    /// How often the primary broadcasts Commit heartbeats.
    pub heartbeat_interval: Duration,
    /// How long a recovering replica waits before re-requesting state.
    pub state_transfer_timeout: Duration,
    /// Seed for the election timeout jitter; mixed with the replica id.
    pub seed: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            tick_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(50),
            state_transfer_timeout: Duration::from_millis(500),
            seed: 0,
        }
    }
}

/// What the replica asks of its runtime. The core never performs IO itself;
/// every call returns the effects to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect<Op, R> {
    /// Hand the envelope to the transport. Delivery is best-effort; loss is
    /// recovered by the protocol, not by retries.
    Send(Envelope<Op>),
    /// Push the entry onto the application commit stream, in order.
    Commit(CommitEntry<Op, R>),
}

/// Outcome of a client submission.
#[derive(Debug, Clone, PartialEq, IsVariant)]
pub enum SubmitOutcome<R> {
    Accepted,
    /// This replica is not the primary; the client should retry there.
    NotPrimary { primary: ReplicaId },
    /// Not in Normal status (view change, recovery, dead).
    NotNormal,
    /// Older than, or equal to, a request still in flight.
    Stale,
    /// Duplicate of an executed request; carries the cached reply to resend.
    Duplicate(R),
}

/// Snapshot for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub id: ReplicaId,
    pub view_number: usize,
    pub is_primary: bool,
    pub status: ReplicaStatus,
}

/// A replica in the viewstamped replication protocol.
///
/// The replica is a deterministic state machine: the runtime feeds it
/// envelopes, submissions, and ticks (with the current time, so execution is
/// reproducible), and executes the returned effects. All state lives behind
/// one `&mut self`; whatever serializes access to it (a mutex, an actor
/// task, a simulator loop) is the per-replica mutual exclusion.
#[derive(Debug)]
pub struct Replica<Op, S, R> {
    id: ReplicaId,
    replica_count: usize,
    view_number: usize,
    /// View in which this replica was last in Normal status; decides whose
    /// log wins a view change.
    last_normal_view: usize,
    log: OpLog<Op, S, R>,
    status: Status<Op>,
    config: ReplicaConfig,
    rng: StdRng,
}

impl<Op, S, R> Replica<Op, S, R>
where
    Op: Clone + std::fmt::Debug,
    S: StateMachine<Op, R>,
    R: Clone + std::fmt::Debug,
{
    /// Creates a replica in Transitioning status; [`Replica::ready`]
    /// releases it into the protocol.
    pub fn new(replica_count: usize, id: ReplicaId, config: ReplicaConfig) -> Self {
        assert!(replica_count > 0 && id < replica_count);
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(id as u64));
        Replica {
            id,
            replica_count,
            view_number: 0,
            last_normal_view: 0,
            log: OpLog::new(id),
            status: Status::Transitioning,
            config,
            rng,
        }
    }

    /// The ready signal: enter Normal status in view 0, arm the election
    /// timer, and greet the peers.
    pub fn ready(&mut self, now: Instant) -> Vec<Effect<Op, R>> {
        if !matches!(self.status, Status::Transitioning) {
            return Vec::new();
        }
        let timeout = self.draw_election_timeout();
        self.status = Status::Normal(NormalState::new(now, self.replica_count, timeout));
        info!(replica = self.id, "replica ready");
        self.broadcast(Protocol::Hello(Hello {
            replica_id: self.id,
        }))
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn view_number(&self) -> usize {
        self.view_number
    }

    pub fn op_number(&self) -> usize {
        self.log.op_number()
    }

    pub fn commit_number(&self) -> usize {
        self.log.commit_number()
    }

    pub fn log(&self) -> &OpLog<Op, S, R> {
        &self.log
    }

    pub fn status(&self) -> ReplicaStatus {
        self.status.diagnostic()
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.status, Status::Normal(_) | Status::StartView)
            && self.primary_of(self.view_number) == self.id
    }

    pub fn report(&self) -> Report {
        Report {
            id: self.id,
            view_number: self.view_number,
            is_primary: self.is_primary(),
            status: self.status.diagnostic(),
        }
    }

    /// Permanently stop the replica. Every subsequent input is dropped; the
    /// runtime should close the commit stream.
    pub fn stop(&mut self) {
        info!(replica = self.id, "replica stopped");
        self.status = Status::Dead;
    }

    // --------------------------------------------------------------------------------------------
    // Client Interface
    // --------------------------------------------------------------------------------------------

    /// Submit a client request. Accepted only on the primary in Normal
    /// status, and only if the request is newer than anything the client
    /// table has seen from this client.
    pub fn submit(
        &mut self,
        request: ClientRequest<Op>,
        now: Instant,
    ) -> (SubmitOutcome<R>, Vec<Effect<Op, R>>) {
        if !matches!(self.status, Status::Normal(_)) {
            return (SubmitOutcome::NotNormal, Vec::new());
        }
        let primary = self.primary_of(self.view_number);
        if primary != self.id {
            return (SubmitOutcome::NotPrimary { primary }, Vec::new());
        }

        match self
            .log
            .client_table()
            .check(request.client_id, request.request_num)
        {
            RequestDisposition::Fresh => {}
            RequestDisposition::Executed(reply) => {
                let reply = reply.clone();
                debug!(
                    replica = self.id,
                    client = request.client_id,
                    request = request.request_num,
                    "duplicate of an executed request; resending cached reply"
                );
                return (SubmitOutcome::Duplicate(reply), Vec::new());
            }
            RequestDisposition::InFlight | RequestDisposition::Stale => {
                debug!(
                    replica = self.id,
                    client = request.client_id,
                    request = request.request_num,
                    "dropping stale request"
                );
                return (SubmitOutcome::Stale, Vec::new());
            }
        }

        let view_number = self.view_number;
        let commit_number = self.log.commit_number();
        let op_number = self.log.append(request.clone());
        debug!(
            replica = self.id,
            view = view_number,
            op = op_number,
            client = request.client_id,
            "accepted client request"
        );

        // A Prepare doubles as a heartbeat; push the next Commit broadcast out.
        if let Status::Normal(normal) = &mut self.status {
            normal.last_commit_broadcast = now;
        }

        let mut effects = self.broadcast(Protocol::Prepare(Prepare {
            view_number,
            op_number,
            commit_number,
            request,
        }));
        // A cluster of one reaches quorum on its own.
        effects.extend(self.advance_primary_commit());
        (SubmitOutcome::Accepted, effects)
    }

    // --------------------------------------------------------------------------------------------
    // Message Dispatch
    // --------------------------------------------------------------------------------------------

    /// Process an incoming envelope and return the effects to execute. Dead
    /// and not-yet-ready replicas swallow everything, like a dead process
    /// would.
    pub fn process(&mut self, envelope: Envelope<Op>, now: Instant) -> Vec<Effect<Op, R>> {
        if matches!(self.status, Status::Dead | Status::Transitioning) {
            return Vec::new();
        }

        let Envelope { from, to: _, message } = envelope;
        match message {
            Protocol::Prepare(msg) => self.handle_prepare(from, msg, now),
            Protocol::PrepareOk(msg) => self.handle_prepare_ok(from, msg),
            Protocol::Commit(msg) => self.handle_commit(from, msg, now),
            Protocol::StartViewChange(msg) => self.handle_start_view_change(from, msg, now),
            Protocol::StartViewChangeOk(msg) => self.handle_start_view_change_ok(from, msg, now),
            Protocol::DoViewChange(msg) => self.handle_do_view_change(from, msg, now),
            Protocol::StartView(msg) => self.handle_start_view(from, msg, now),
            Protocol::GetState(msg) => self.handle_get_state(from, msg),
            Protocol::NewState(msg) => self.handle_new_state(msg, now),
            Protocol::Hello(msg) => {
                debug!(replica = self.id, from = msg.replica_id, "greeted by peer");
                vec![self.send(
                    from,
                    Protocol::HelloOk(HelloOk {
                        replica_id: self.id,
                    }),
                )]
            }
            // Replies that carry no protocol obligation.
            Protocol::CommitOk(_)
            | Protocol::DoViewChangeOk(_)
            | Protocol::StartViewOk(_)
            | Protocol::HelloOk(_) => Vec::new(),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Normal Operation
    // --------------------------------------------------------------------------------------------

    fn handle_prepare(
        &mut self,
        from: ReplicaId,
        msg: Prepare<Op>,
        now: Instant,
    ) -> Vec<Effect<Op, R>> {
        if msg.view_number > self.view_number {
            warn!(
                replica = self.id,
                view = self.view_number,
                msg_view = msg.view_number,
                "prepare from a later view; starting state transfer"
            );
            let mut effects = self.init_state_transfer(now, msg.view_number);
            effects.push(self.prepare_reject(from));
            return effects;
        }
        if msg.view_number < self.view_number {
            return vec![self.prepare_reject(from)];
        }
        if !matches!(self.status, Status::Normal(_)) {
            // The log for this view arrives via StartView or NewState.
            return vec![self.prepare_reject(from)];
        }
        if msg.op_number > self.log.op_number() + 1 {
            warn!(
                replica = self.id,
                view = self.view_number,
                op = self.log.op_number(),
                msg_op = msg.op_number,
                "gap in prepares; starting state transfer"
            );
            let mut effects = self.init_state_transfer(now, self.view_number);
            effects.push(self.prepare_reject(from));
            return effects;
        }

        let Status::Normal(normal) = &mut self.status else {
            unreachable!()
        };
        normal.last_heartbeat = now;
        if msg.op_number == self.log.op_number() + 1 {
            self.log.append(msg.request);
        }
        // A re-offered prepare is acknowledged with the current watermark
        // rather than re-appended.
        let op_number = self.log.op_number();
        let mut effects = self.commit_effects(msg.commit_number);
        effects.push(self.send(
            from,
            Protocol::PrepareOk(PrepareOk {
                acked: true,
                view_number: self.view_number,
                op_number,
                replica_id: self.id,
                status: self.status.diagnostic(),
            }),
        ));
        effects
    }

    fn prepare_reject(&self, to: ReplicaId) -> Effect<Op, R> {
        self.send(
            to,
            Protocol::PrepareOk(PrepareOk {
                acked: false,
                view_number: self.view_number,
                op_number: self.log.op_number(),
                replica_id: self.id,
                status: self.status.diagnostic(),
            }),
        )
    }

    fn handle_prepare_ok(&mut self, from: ReplicaId, msg: PrepareOk) -> Vec<Effect<Op, R>> {
        if !msg.acked || msg.view_number != self.view_number || !self.is_primary() {
            return Vec::new();
        }
        let id = self.id;
        let op_number = self.log.op_number();

        let Status::Normal(normal) = &mut self.status else {
            return Vec::new();
        };
        normal.record_ack(from, msg.op_number);
        let target = normal.quorum_op_number(id, op_number);
        self.commit_effects(target)
    }

    fn handle_commit(&mut self, from: ReplicaId, msg: Commit, now: Instant) -> Vec<Effect<Op, R>> {
        if msg.view_number > self.view_number {
            warn!(
                replica = self.id,
                view = self.view_number,
                msg_view = msg.view_number,
                "commit from a later view; starting state transfer"
            );
            let mut effects = self.init_state_transfer(now, msg.view_number);
            effects.push(self.commit_reply(from, false));
            return effects;
        }
        if msg.view_number < self.view_number {
            return vec![self.commit_reply(from, false)];
        }
        if !matches!(self.status, Status::Normal(_)) {
            return vec![self.commit_reply(from, false)];
        }
        let Status::Normal(normal) = &mut self.status else {
            unreachable!()
        };
        normal.last_heartbeat = now;

        if msg.commit_number > self.log.op_number() {
            // The primary committed entries this replica never received.
            warn!(
                replica = self.id,
                view = self.view_number,
                op = self.log.op_number(),
                msg_commit = msg.commit_number,
                "missing committed entries; starting state transfer"
            );
            let mut effects = self.init_state_transfer(now, self.view_number);
            effects.push(self.commit_reply(from, false));
            return effects;
        }

        let mut effects = self.commit_effects(msg.commit_number);
        effects.push(self.commit_reply(from, true));
        effects
    }

    fn commit_reply(&self, to: ReplicaId, acked: bool) -> Effect<Op, R> {
        self.send(
            to,
            Protocol::CommitOk(CommitOk {
                acked,
                replica_id: self.id,
            }),
        )
    }

    /// Commit up to `target` and wrap the committed entries as effects.
    fn commit_effects(&mut self, target: usize) -> Vec<Effect<Op, R>> {
        self.log
            .execute_commits_up_to(target, self.view_number)
            .into_iter()
            .map(Effect::Commit)
            .collect()
    }

    /// A primary commits whatever a quorum of watermarks covers. Also the
    /// whole quorum path for a cluster of one.
    fn advance_primary_commit(&mut self) -> Vec<Effect<Op, R>> {
        let id = self.id;
        let op_number = self.log.op_number();
        let Status::Normal(normal) = &self.status else {
            return Vec::new();
        };
        let target = normal.quorum_op_number(id, op_number);
        self.commit_effects(target)
    }

    // --------------------------------------------------------------------------------------------
    // View Change
    // --------------------------------------------------------------------------------------------

    /// Move into a view change for `new_view`. If this replica is the new
    /// view's primary it registers its own log as the first candidate.
    fn initiate_view_change(&mut self, now: Instant, new_view: usize) -> Vec<Effect<Op, R>> {
        debug_assert!(new_view > self.view_number);
        if matches!(self.status, Status::Normal(_)) {
            self.last_normal_view = self.view_number;
        }
        self.view_number = new_view;
        info!(replica = self.id, view = new_view, "starting view change");

        let timeout = self.draw_election_timeout();
        let mut view_change = ViewChangeState::new(now, timeout, self.id);
        if self.primary_of(new_view) == self.id {
            view_change.register_do_view_change(self.id, self.candidate());
            view_change.sent_do_view_change = true;
        }
        self.status = Status::ViewChange(view_change);

        self.progress_view_change()
    }

    fn handle_start_view_change(
        &mut self,
        from: ReplicaId,
        msg: StartViewChange,
        now: Instant,
    ) -> Vec<Effect<Op, R>> {
        match msg.view_number.cmp(&self.view_number) {
            Ordering::Less => vec![self.start_view_change_reply(from, msg.view_number, false)],
            Ordering::Equal => vec![self.start_view_change_reply(from, msg.view_number, true)],
            Ordering::Greater => {
                let mut effects = self.initiate_view_change(now, msg.view_number);
                effects.push(self.start_view_change_reply(from, msg.view_number, true));
                effects
            }
        }
    }

    fn start_view_change_reply(&self, to: ReplicaId, view_number: usize, acked: bool) -> Effect<Op, R> {
        self.send(
            to,
            Protocol::StartViewChangeOk(StartViewChangeOk {
                acked,
                view_number,
                replica_id: self.id,
            }),
        )
    }

    fn handle_start_view_change_ok(
        &mut self,
        from: ReplicaId,
        msg: StartViewChangeOk,
        _now: Instant,
    ) -> Vec<Effect<Op, R>> {
        if !msg.acked || msg.view_number != self.view_number {
            return Vec::new();
        }
        {
            let Status::ViewChange(view_change) = &mut self.status else {
                return Vec::new();
            };
            if view_change.phase != ViewChangePhase::StartViewChange {
                return Vec::new();
            }
            view_change.register_start_view_change_ack(from);
        }
        self.progress_view_change()
    }

    fn handle_do_view_change(
        &mut self,
        from: ReplicaId,
        msg: DoViewChange<Op>,
        now: Instant,
    ) -> Vec<Effect<Op, R>> {
        let DoViewChange {
            view_number,
            last_normal_view,
            commit_number,
            op_number,
            log,
        } = msg;

        let mut effects = Vec::new();
        match view_number.cmp(&self.view_number) {
            Ordering::Less => {
                return vec![self.do_view_change_reply(from, view_number, false)];
            }
            Ordering::Greater => effects.extend(self.initiate_view_change(now, view_number)),
            Ordering::Equal => {}
        }

        let accepted = match &mut self.status {
            Status::ViewChange(view_change) => {
                view_change.register_do_view_change(
                    from,
                    LogCandidate {
                        last_normal_view,
                        op_number,
                        log,
                        commit_number,
                    },
                );
                true
            }
            // Already past the view change (e.g. duplicate after StartView).
            _ => false,
        };
        effects.push(self.do_view_change_reply(from, view_number, accepted));
        if accepted {
            effects.extend(self.progress_view_change());
        }
        effects
    }

    fn do_view_change_reply(&self, to: ReplicaId, view_number: usize, acked: bool) -> Effect<Op, R> {
        self.send(
            to,
            Protocol::DoViewChangeOk(DoViewChangeOk {
                acked,
                view_number,
                replica_id: self.id,
            }),
        )
    }

    /// Promote the view-change phase and, on the new primary, finish the
    /// view change once a quorum of logs is in.
    fn progress_view_change(&mut self) -> Vec<Effect<Op, R>> {
        let quorum = self.quorum();
        let aggregator = self.primary_of(self.view_number) == self.id;
        let complete = {
            let Status::ViewChange(view_change) = &mut self.status else {
                return Vec::new();
            };
            if view_change.phase == ViewChangePhase::StartViewChange
                && view_change.start_view_change_ack_count() >= quorum
            {
                debug!(
                    replica = self.id,
                    view = self.view_number,
                    "view change acknowledged by a quorum"
                );
                view_change.phase = ViewChangePhase::DoViewChange;
            }
            aggregator && view_change.do_view_change_count() >= quorum
        };

        if complete {
            self.complete_view_change()
        } else {
            Vec::new()
        }
    }

    /// Adopt the winning log and step into StartView status; the broadcast
    /// goes out on the next tick.
    fn complete_view_change(&mut self) -> Vec<Effect<Op, R>> {
        let Status::ViewChange(view_change) = std::mem::replace(&mut self.status, Status::StartView)
        else {
            unreachable!()
        };
        let candidate = view_change
            .best
            .expect("the new primary registers its own log as a candidate");

        self.log.adopt(candidate.log);
        let effects = self.commit_effects(view_change.max_commit_number);
        self.last_normal_view = self.view_number;
        info!(
            replica = self.id,
            view = self.view_number,
            op = self.log.op_number(),
            commit = self.log.commit_number(),
            "view change complete; taking over as primary"
        );
        effects
    }

    fn handle_start_view(
        &mut self,
        from: ReplicaId,
        msg: StartView<Op>,
        now: Instant,
    ) -> Vec<Effect<Op, R>> {
        let StartView {
            view_number,
            log,
            op_number: _,
            commit_number,
            primary_id,
        } = msg;

        let accept = view_number > self.view_number
            || (view_number == self.view_number && matches!(self.status, Status::ViewChange(_)));
        if !accept {
            return vec![self.start_view_reply(from, false)];
        }
        debug_assert_eq!(primary_id, self.primary_of(view_number));

        self.view_number = view_number;
        self.log.adopt(log);
        let mut effects = self.commit_effects(commit_number);
        self.last_normal_view = view_number;

        let timeout = self.draw_election_timeout();
        self.status = Status::Normal(NormalState::new(now, self.replica_count, timeout));
        info!(
            replica = self.id,
            view = view_number,
            primary = primary_id,
            op = self.log.op_number(),
            commit = self.log.commit_number(),
            "entering new view"
        );

        // Ack the tail the new primary has not yet committed.
        if self.log.has_uncommitted() {
            effects.push(self.send(
                primary_id,
                Protocol::PrepareOk(PrepareOk {
                    acked: true,
                    view_number,
                    op_number: self.log.op_number(),
                    replica_id: self.id,
                    status: self.status.diagnostic(),
                }),
            ));
        }
        effects.push(self.start_view_reply(from, true));
        effects
    }

    fn start_view_reply(&self, to: ReplicaId, acked: bool) -> Effect<Op, R> {
        self.send(
            to,
            Protocol::StartViewOk(StartViewOk {
                acked,
                replica_id: self.id,
            }),
        )
    }

    /// This replica's log as a view-change candidate.
    fn candidate(&self) -> LogCandidate<Op> {
        LogCandidate {
            last_normal_view: self.last_normal_view,
            op_number: self.log.op_number(),
            log: self.log.entries().to_vec(),
            commit_number: self.log.commit_number(),
        }
    }

    // --------------------------------------------------------------------------------------------
    // State Transfer
    // --------------------------------------------------------------------------------------------

    /// Enter Recovery status aimed at `target_view` and ask its primary for
    /// the log. No-op if already recovering towards that view or beyond.
    fn init_state_transfer(&mut self, now: Instant, target_view: usize) -> Vec<Effect<Op, R>> {
        if let Status::Recovery(recovery) = &mut self.status {
            if recovery.target_view >= target_view {
                return Vec::new();
            }
            recovery.target_view = target_view;
            recovery.last_request = now;
        } else {
            if matches!(self.status, Status::Normal(_)) {
                self.last_normal_view = self.view_number;
            }
            self.status = Status::Recovery(RecoveryState::new(now, target_view));
        }

        vec![self.send(
            self.primary_of(target_view),
            Protocol::GetState(GetState {
                view_number: target_view,
                op_number: self.log.commit_number(),
                replica_id: self.id,
            }),
        )]
    }

    fn handle_get_state(&mut self, from: ReplicaId, msg: GetState) -> Vec<Effect<Op, R>> {
        if !matches!(self.status, Status::Normal(_))
            || self.view_number < msg.view_number
            || self.log.op_number() < msg.op_number
        {
            // Nothing to serve; the requester will retry elsewhere.
            return Vec::new();
        }

        vec![self.send(
            from,
            Protocol::NewState(NewState {
                view_number: self.view_number,
                suffix: self.log.suffix_from(msg.op_number),
                op_number: self.log.op_number(),
                commit_number: self.log.commit_number(),
            }),
        )]
    }

    fn handle_new_state(&mut self, msg: NewState<Op>, now: Instant) -> Vec<Effect<Op, R>> {
        let NewState {
            view_number,
            suffix,
            op_number: _,
            commit_number,
        } = msg;

        let Status::Recovery(recovery) = &self.status else {
            return Vec::new();
        };
        if view_number < recovery.target_view {
            return Vec::new();
        }

        self.view_number = view_number;
        self.log.truncate_and_extend(suffix);
        let effects = self.commit_effects(commit_number);
        self.last_normal_view = view_number;

        let timeout = self.draw_election_timeout();
        self.status = Status::Normal(NormalState::new(now, self.replica_count, timeout));
        info!(
            replica = self.id,
            view = view_number,
            op = self.log.op_number(),
            commit = self.log.commit_number(),
            "state transfer complete"
        );
        effects
    }

    // --------------------------------------------------------------------------------------------
    // Ticks (Periodic Actions)
    // --------------------------------------------------------------------------------------------

    /// Drive the timers. The runtime calls this every
    /// [`ReplicaConfig::tick_interval`]; the current time comes from the
    /// caller so execution stays deterministic.
    pub fn tick(&mut self, now: Instant) -> Vec<Effect<Op, R>> {
        match &self.status {
            Status::Transitioning | Status::Dead => Vec::new(),
            Status::Normal(_) => self.tick_normal(now),
            Status::ViewChange(_) => self.tick_view_change(now),
            Status::StartView => self.tick_start_view(now),
            Status::Recovery(_) => self.tick_recovery(now),
        }
    }

    fn tick_normal(&mut self, now: Instant) -> Vec<Effect<Op, R>> {
        let is_primary = self.primary_of(self.view_number) == self.id;
        let heartbeat_interval = self.config.heartbeat_interval;
        let Status::Normal(normal) = &mut self.status else {
            unreachable!()
        };

        if is_primary {
            if now - normal.last_commit_broadcast < heartbeat_interval {
                return Vec::new();
            }
            normal.last_commit_broadcast = now;
            let watermarks: Vec<usize> = (0..self.replica_count)
                .map(|peer| normal.acked(peer))
                .collect();

            let commit_number = self.log.commit_number();
            let mut effects = self.broadcast(Protocol::Commit(Commit {
                view_number: self.view_number,
                commit_number,
            }));
            // Re-offer the uncommitted tail to peers whose acks have not
            // caught up; a lost prepare would otherwise stall the last ops
            // until the next client request.
            for peer in 0..self.replica_count {
                if peer == self.id {
                    continue;
                }
                let resend_from = watermarks[peer]
                    .max(commit_number)
                    .min(self.log.op_number());
                for entry in &self.log.entries()[resend_from..] {
                    effects.push(self.send(
                        peer,
                        Protocol::Prepare(Prepare {
                            view_number: self.view_number,
                            op_number: entry.op_number,
                            commit_number,
                            request: entry.request.clone(),
                        }),
                    ));
                }
            }
            return effects;
        }

        if now - normal.last_heartbeat >= normal.election_timeout {
            info!(
                replica = self.id,
                view = self.view_number,
                "no word from the primary; starting view change"
            );
            let new_view = self.view_number + 1;
            return self.initiate_view_change(now, new_view);
        }
        Vec::new()
    }

    fn tick_view_change(&mut self, now: Instant) -> Vec<Effect<Op, R>> {
        let view_number = self.view_number;
        let new_primary = self.primary_of(view_number);

        let Status::ViewChange(view_change) = &mut self.status else {
            unreachable!()
        };

        // A round that stalls (lost messages, dead prospective primary) is
        // abandoned for the next view.
        if now - view_change.started_at >= view_change.timeout {
            info!(
                replica = self.id,
                view = view_number + 1,
                "view change stalled; restarting"
            );
            return self.initiate_view_change(now, view_number + 1);
        }

        if !view_change.blasted {
            view_change.blasted = true;
            return self.broadcast(Protocol::StartViewChange(StartViewChange {
                view_number,
                replica_id: self.id,
            }));
        }

        if view_change.phase == ViewChangePhase::DoViewChange && !view_change.sent_do_view_change {
            view_change.sent_do_view_change = true;
            let candidate = self.candidate();
            debug!(
                replica = self.id,
                view = view_number,
                to = new_primary,
                "sending do-view-change"
            );
            return vec![self.send(
                new_primary,
                Protocol::DoViewChange(DoViewChange {
                    view_number,
                    last_normal_view: candidate.last_normal_view,
                    commit_number: candidate.commit_number,
                    op_number: candidate.op_number,
                    log: candidate.log,
                }),
            )];
        }
        Vec::new()
    }

    fn tick_start_view(&mut self, now: Instant) -> Vec<Effect<Op, R>> {
        let msg = Protocol::StartView(StartView {
            view_number: self.view_number,
            log: self.log.entries().to_vec(),
            op_number: self.log.op_number(),
            commit_number: self.log.commit_number(),
            primary_id: self.id,
        });
        let effects = self.broadcast(msg);

        let timeout = self.draw_election_timeout();
        self.status = Status::Normal(NormalState::new(now, self.replica_count, timeout));
        info!(
            replica = self.id,
            view = self.view_number,
            "view started; serving as primary"
        );
        effects
    }

    fn tick_recovery(&mut self, now: Instant) -> Vec<Effect<Op, R>> {
        let state_transfer_timeout = self.config.state_transfer_timeout;
        let Status::Recovery(recovery) = &mut self.status else {
            unreachable!()
        };
        if now - recovery.last_request < state_transfer_timeout {
            return Vec::new();
        }
        recovery.last_request = now;
        let target_view = recovery.target_view;

        // The primary did not answer; any current replica can serve us.
        self.broadcast(Protocol::GetState(GetState {
            view_number: target_view,
            op_number: self.log.commit_number(),
            replica_id: self.id,
        }))
    }

    // --------------------------------------------------------------------------------------------
    // Utility
    // --------------------------------------------------------------------------------------------

    fn primary_of(&self, view_number: usize) -> ReplicaId {
        view_number % self.replica_count
    }

    fn quorum(&self) -> usize {
        self.replica_count / 2 + 1
    }

    fn draw_election_timeout(&mut self) -> Duration {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        if max <= min {
            return self.config.election_timeout_min;
        }
        Duration::from_millis(self.rng.gen_range(min..max))
    }

    fn send(&self, to: ReplicaId, message: Protocol<Op>) -> Effect<Op, R> {
        Effect::Send(Envelope {
            from: self.id,
            to,
            message,
        })
    }

    /// Fan a message out to every peer, excluding this replica.
    fn broadcast(&self, message: Protocol<Op>) -> Vec<Effect<Op, R>> {
        (0..self.replica_count)
            .filter(|&replica_id| replica_id != self.id)
            .map(|replica_id| self.send(replica_id, message.clone()))
            .collect()
    }
}
