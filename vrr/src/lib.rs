mod message;
mod replica;
mod state_machine;
#[cfg(test)]
mod tests;

pub use message::*;
pub use replica::{
    ClientTable, CommitEntry, Effect, LogEntry, OpLog, Replica, ReplicaConfig, ReplicaId,
    ReplicaStatus, Report, RequestDisposition, SubmitOutcome,
};
pub use state_machine::StateMachine;
