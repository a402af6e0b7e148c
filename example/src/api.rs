use serde::{Deserialize, Serialize};
use vrr::Envelope;

use crate::kv::{KvOp, KvReply};

/// Everything that travels over a TCP link in the demo: replica-to-replica
/// protocol traffic and the client request/reply exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Replica-to-replica protocol traffic.
    Peer(Envelope<KvOp>),
    /// A client request addressed to the receiving replica.
    Request {
        client_id: usize,
        request_num: usize,
        op: KvOp,
    },
    /// The server's answer to a client request.
    Reply(ClientReply),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientReply {
    /// The request committed (now or previously); carries the result.
    Done {
        request_num: usize,
        result: KvReply,
    },
    /// Accepted; the result follows on this connection once it commits.
    Pending { request_num: usize },
    /// This replica is not the primary; retry against the given one.
    Redirect { primary: usize },
    /// The replica cannot take requests right now (view change, recovery).
    Unavailable,
}
