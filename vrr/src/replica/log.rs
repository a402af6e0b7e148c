use std::cmp;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{message::ClientRequest, state_machine::StateMachine};

use super::{client_table::ClientTable, ReplicaId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<Op> {
    /// 1-based; equals the entry's position in the log.
    pub op_number: usize,
    pub request: ClientRequest<Op>,
}

/// An operation delivered on the commit stream, in strictly increasing op
/// order, exactly once per replica. `commit_number` is the commit point after
/// this entry applied, i.e. the entry's own op number.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEntry<Op, R> {
    pub view_number: usize,
    pub op_number: usize,
    pub commit_number: usize,
    pub request: ClientRequest<Op>,
    pub reply: R,
}

/// The ordered operation log, the commit point, and the structures fed by
/// commit execution: the application state machine and the client table.
///
/// The full history is retained (compaction is out of scope), which is what
/// lets view changes and state transfer ship plain entry sequences.
#[derive(Debug)]
pub struct OpLog<Op, S, R> {
    entries: Vec<LogEntry<Op>>,
    commit_number: usize,
    client_table: ClientTable<R>,
    state_machine: S,
    replica_id: ReplicaId,
}

impl<Op, S, R> OpLog<Op, S, R>
where
    Op: Clone + std::fmt::Debug,
    S: StateMachine<Op, R>,
    R: Clone + std::fmt::Debug,
{
    pub fn new(replica_id: ReplicaId) -> Self {
        OpLog {
            entries: Vec::new(),
            commit_number: 0,
            client_table: ClientTable::new(),
            state_machine: S::new(),
            replica_id,
        }
    }

    /// Number of the last log entry; zero for an empty log.
    pub fn op_number(&self) -> usize {
        self.entries.len()
    }

    pub fn commit_number(&self) -> usize {
        self.commit_number
    }

    pub fn entries(&self) -> &[LogEntry<Op>] {
        &self.entries
    }

    pub fn client_table(&self) -> &ClientTable<R> {
        &self.client_table
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn has_uncommitted(&self) -> bool {
        self.op_number() > self.commit_number
    }

    /// Append a request, assigning it the next op number, and mark it in
    /// flight in the client table.
    pub fn append(&mut self, request: ClientRequest<Op>) -> usize {
        let op_number = self.op_number() + 1;
        self.client_table
            .begin(request.client_id, request.request_num);
        self.entries.push(LogEntry { op_number, request });
        op_number
    }

    /// Advance the commit point up to `target` (clamped to the log end),
    /// making the state-machine up-call for each newly committed entry and
    /// caching its reply. Returns the entries for the commit stream.
    pub fn execute_commits_up_to(
        &mut self,
        target: usize,
        view_number: usize,
    ) -> Vec<CommitEntry<Op, R>> {
        let target = cmp::min(target, self.op_number());
        if target <= self.commit_number {
            return Vec::new();
        }

        let mut committed = Vec::with_capacity(target - self.commit_number);
        while self.commit_number < target {
            let entry = &self.entries[self.commit_number];
            debug_assert_eq!(entry.op_number, self.commit_number + 1);

            let reply = self
                .state_machine
                .apply(&entry.request.operation, entry.op_number);
            self.client_table
                .complete(entry.request.client_id, entry.request.request_num, reply.clone());
            self.commit_number = entry.op_number;

            debug!(
                replica = self.replica_id,
                op = entry.op_number,
                client = entry.request.client_id,
                "operation committed"
            );
            committed.push(CommitEntry {
                view_number,
                op_number: entry.op_number,
                commit_number: self.commit_number,
                request: entry.request.clone(),
                reply,
            });
        }
        committed
    }

    /// Entries strictly after `op_number`, cloned in order.
    pub fn suffix_from(&self, op_number: usize) -> Vec<LogEntry<Op>> {
        self.entries
            .iter()
            .filter(|entry| entry.op_number > op_number)
            .cloned()
            .collect()
    }

    /// Replace the log wholesale with one adopted during a view change. The
    /// committed prefix must survive the adoption.
    pub fn adopt(&mut self, entries: Vec<LogEntry<Op>>) {
        assert!(
            entries.len() >= self.commit_number,
            "replica {} adopting a log of {} entries would truncate its commit point {}",
            self.replica_id,
            entries.len(),
            self.commit_number
        );

        self.entries = entries;
        self.rebuild_in_flight();
    }

    /// Drop the uncommitted tail and append a suffix fetched by state
    /// transfer. The suffix must continue the committed prefix seamlessly.
    pub fn truncate_and_extend(&mut self, suffix: Vec<LogEntry<Op>>) {
        self.entries.truncate(self.commit_number);
        for entry in suffix {
            debug_assert_eq!(entry.op_number, self.op_number() + 1);
            self.entries.push(entry);
        }
        self.rebuild_in_flight();
    }

    /// In-flight marks for requests dropped with an old tail must not linger,
    /// or their clients could never get a retry through.
    fn rebuild_in_flight(&mut self) {
        self.client_table.clear_in_flight();
        for entry in &self.entries[self.commit_number..] {
            self.client_table
                .begin(entry.request.client_id, entry.request.request_num);
        }
    }
}
