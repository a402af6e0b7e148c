use derive_more::derive::IsVariant;
use serde::{Deserialize, Serialize};

use crate::replica::{LogEntry, ReplicaId, ReplicaStatus};

/// A protocol message addressed from one replica to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<Op> {
    pub from: ReplicaId,
    pub to: ReplicaId,
    pub message: Protocol<Op>,
}

/// The peer-to-peer message vocabulary. Every request form has a reply form
/// carrying `acked`, so a sender can tell a semantic rejection apart from
/// transport loss.
#[derive(Debug, Clone, PartialEq, IsVariant, Serialize, Deserialize)]
pub enum Protocol<Op> {
    Prepare(Prepare<Op>),
    PrepareOk(PrepareOk),
    Commit(Commit),
    CommitOk(CommitOk),
    StartViewChange(StartViewChange),
    StartViewChangeOk(StartViewChangeOk),
    DoViewChange(DoViewChange<Op>),
    DoViewChangeOk(DoViewChangeOk),
    StartView(StartView<Op>),
    StartViewOk(StartViewOk),
    GetState(GetState),
    NewState(NewState<Op>),
    Hello(Hello),
    HelloOk(HelloOk),
}

/// An operation submitted by a client. `request_num` increases monotonically
/// per client and drives duplicate suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest<Op> {
    pub client_id: usize,
    pub request_num: usize,
    pub operation: Op,
}

// --------------------------------------------------------------------------------------------
// Normal Operation
// --------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prepare<Op> {
    pub view_number: usize,
    /// The number assigned to this operation; a backup accepts it only if it
    /// extends the backup's log by exactly one.
    pub op_number: usize,
    pub commit_number: usize,
    pub request: ClientRequest<Op>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareOk {
    pub acked: bool,
    pub view_number: usize,
    /// Highest op number in the responder's log. Backups append strictly in
    /// order, so this watermark acknowledges every smaller op as well.
    pub op_number: usize,
    pub replica_id: ReplicaId,
    /// Responder status, exposed for diagnostics; not load-bearing.
    pub status: ReplicaStatus,
}

/// Primary heartbeat, also propagating the commit point to backups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub view_number: usize,
    pub commit_number: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitOk {
    pub acked: bool,
    pub replica_id: ReplicaId,
}

// --------------------------------------------------------------------------------------------
// View Change
// --------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartViewChange {
    pub view_number: usize,
    pub replica_id: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartViewChangeOk {
    pub acked: bool,
    /// View the ack answers, so late acks from an abandoned round are
    /// discarded.
    pub view_number: usize,
    pub replica_id: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoViewChange<Op> {
    pub view_number: usize,
    /// View in which the sender was last in Normal status. The new primary
    /// adopts the log of the sender that was Normal most recently, breaking
    /// ties by log length.
    pub last_normal_view: usize,
    pub commit_number: usize,
    pub op_number: usize,
    pub log: Vec<LogEntry<Op>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoViewChangeOk {
    pub acked: bool,
    pub view_number: usize,
    pub replica_id: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartView<Op> {
    pub view_number: usize,
    pub log: Vec<LogEntry<Op>>,
    pub op_number: usize,
    pub commit_number: usize,
    pub primary_id: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartViewOk {
    pub acked: bool,
    pub replica_id: ReplicaId,
}

// --------------------------------------------------------------------------------------------
// State Transfer
// --------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetState {
    pub view_number: usize,
    /// Everything after this op number is wanted. The requester passes its
    /// commit number, since its uncommitted tail may belong to a dead view.
    pub op_number: usize,
    pub replica_id: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewState<Op> {
    pub view_number: usize,
    /// Log entries after the requested op number, in order.
    pub suffix: Vec<LogEntry<Op>>,
    pub op_number: usize,
    pub commit_number: usize,
}

// --------------------------------------------------------------------------------------------
// Diagnostics
// --------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub replica_id: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    pub replica_id: ReplicaId,
}
