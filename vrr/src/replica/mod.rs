mod client_table;
mod core;
mod log;
mod status;

/// Replica identifiers are the indexes `0..N` into the fixed configuration.
pub type ReplicaId = usize;

pub use client_table::{ClientTable, RequestDisposition};
pub use log::{CommitEntry, LogEntry, OpLog};
pub use self::core::{Effect, Replica, ReplicaConfig, Report, SubmitOutcome};
pub use status::ReplicaStatus;
