use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vrr::StateMachine;

/// Operations the demo key-value service replicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOp {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvReply {
    Stored,
    Value(Option<String>),
    Deleted(bool),
}

/// The application state machine: a plain in-memory map, fed committed
/// operations in order by the replica.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: HashMap<String, String>,
}

impl StateMachine<KvOp, KvReply> for KvStore {
    fn new() -> Self {
        KvStore::default()
    }

    fn apply(&mut self, operation: &KvOp, op_number: usize) -> KvReply {
        debug!(op_number, ?operation, "applying operation");
        match operation {
            KvOp::Put { key, value } => {
                self.entries.insert(key.clone(), value.clone());
                KvReply::Stored
            }
            KvOp::Get { key } => KvReply::Value(self.entries.get(key).cloned()),
            KvOp::Delete { key } => KvReply::Deleted(self.entries.remove(key).is_some()),
        }
    }
}
