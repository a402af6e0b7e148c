use std::{collections::HashMap, sync::Arc, time::Instant};

use bytes::Bytes;
use clap::Parser;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex, RwLock},
};
use tracing::{debug, error, info};
use tracing_subscriber::FmtSubscriber;
use vrr::{ClientRequest, CommitEntry, Effect, Envelope, Replica, ReplicaConfig, SubmitOutcome};
use vrr_example::{
    api::{ClientReply, Frame},
    connection::{serve_incoming, FrameHandler, PeerLink},
    kv::{KvOp, KvReply, KvStore},
};

type KvReplica = Replica<KvOp, KvStore, KvReply>;
type KvCommit = CommitEntry<KvOp, KvReply>;
type KvEffect = Effect<KvOp, KvReply>;

/// The commit stream is bounded; the consumer answers clients fast enough
/// that this never fills in practice.
const COMMIT_CHANNEL_CAPACITY: usize = 16;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// This replica's id, an index into --replicas.
    #[arg(long)]
    replica_id: usize,

    /// Addresses of every replica, ordered by id.
    #[arg(long, required = true)]
    replicas: Vec<String>,

    /// Seed for the election timeout jitter.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

struct Server {
    id: usize,
    replica: Mutex<KvReplica>,
    peers: RwLock<HashMap<usize, PeerLink>>,
    /// Reply channels of connected clients, keyed by client id.
    clients: RwLock<HashMap<usize, mpsc::Sender<Bytes>>>,
    commits: mpsc::Sender<KvCommit>,
}

impl Server {
    fn new(args: &Args, commits: mpsc::Sender<KvCommit>) -> Arc<Self> {
        let replica = Replica::new(
            args.replicas.len(),
            args.replica_id,
            ReplicaConfig {
                seed: args.seed,
                ..ReplicaConfig::default()
            },
        );
        Arc::new(Server {
            id: args.replica_id,
            replica: Mutex::new(replica),
            peers: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            commits,
        })
    }

    fn frame_handler(self: &Arc<Self>, reply_to: Option<mpsc::Sender<Bytes>>) -> FrameHandler {
        let server = Arc::clone(self);
        Arc::new(move |raw| {
            let server = Arc::clone(&server);
            let reply_to = reply_to.clone();
            Box::pin(async move {
                server.handle_frame(raw, reply_to).await;
            })
        })
    }

    async fn handle_frame(self: &Arc<Self>, raw: Vec<u8>, reply_to: Option<mpsc::Sender<Bytes>>) {
        let frame: Frame = match serde_json::from_slice(&raw) {
            Ok(frame) => frame,
            Err(error) => {
                error!(%error, "discarding undecodable frame");
                return;
            }
        };

        match frame {
            Frame::Peer(envelope) => {
                debug!(from = envelope.from, "received protocol message");
                let effects = {
                    let mut replica = self.replica.lock().await;
                    replica.process(envelope, Instant::now())
                };
                self.apply_effects(effects).await;
            }
            Frame::Request {
                client_id,
                request_num,
                op,
            } => {
                if let Some(reply_to) = reply_to {
                    self.clients.write().await.insert(client_id, reply_to);
                }
                self.handle_request(client_id, request_num, op).await;
            }
            Frame::Reply(_) => {}
        }
    }

    async fn handle_request(self: &Arc<Self>, client_id: usize, request_num: usize, op: KvOp) {
        let request = ClientRequest {
            client_id,
            request_num,
            operation: op,
        };
        let (outcome, effects) = {
            let mut replica = self.replica.lock().await;
            replica.submit(request, Instant::now())
        };
        self.apply_effects(effects).await;

        let reply = match outcome {
            SubmitOutcome::Accepted => ClientReply::Pending { request_num },
            SubmitOutcome::Duplicate(result) => ClientReply::Done {
                request_num,
                result,
            },
            SubmitOutcome::NotPrimary { primary } => ClientReply::Redirect { primary },
            // An in-flight duplicate will be answered when it commits.
            SubmitOutcome::Stale => ClientReply::Pending { request_num },
            SubmitOutcome::NotNormal => ClientReply::Unavailable,
        };
        self.reply_to_client(client_id, reply).await;
    }

    async fn reply_to_client(&self, client_id: usize, reply: ClientReply) {
        let frame = match serde_json::to_vec(&Frame::Reply(reply)) {
            Ok(frame) => frame,
            Err(error) => {
                error!(%error, "failed to encode reply");
                return;
            }
        };
        let clients = self.clients.read().await;
        if let Some(sender) = clients.get(&client_id) {
            if sender.send(Bytes::from(frame)).await.is_err() {
                debug!(client_id, "client connection gone");
            }
        } else {
            debug!(client_id, "no connection for client");
        }
    }

    async fn apply_effects(&self, effects: Vec<KvEffect>) {
        for effect in effects {
            match effect {
                Effect::Send(envelope) => self.send_envelope(envelope).await,
                Effect::Commit(entry) => {
                    if self.commits.send(entry).await.is_err() {
                        error!("commit stream closed");
                    }
                }
            }
        }
    }

    async fn send_envelope(&self, envelope: Envelope<KvOp>) {
        let to = envelope.to;
        let frame = match serde_json::to_vec(&Frame::Peer(envelope)) {
            Ok(frame) => frame,
            Err(error) => {
                error!(%error, "failed to encode protocol message");
                return;
            }
        };
        let peers = self.peers.read().await;
        match peers.get(&to) {
            Some(link) => link.send(Bytes::from(frame)),
            None => error!(to, "no link for replica"),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, address)) => {
                    info!(%address, "accepted connection");
                    // Clients get replies on their own connection; its
                    // sender is not known until serve_incoming returns, so
                    // the handler reads it through a shared slot. Peers
                    // never use it, their traffic answers over our own
                    // outbound links.
                    let slot = Arc::new(Mutex::new(None::<mpsc::Sender<Bytes>>));
                    let handler: FrameHandler = {
                        let server = Arc::clone(&self);
                        let slot = Arc::clone(&slot);
                        Arc::new(move |raw| {
                            let server = Arc::clone(&server);
                            let slot = Arc::clone(&slot);
                            Box::pin(async move {
                                let reply_to = slot.lock().await.clone();
                                server.handle_frame(raw, reply_to).await;
                            })
                        })
                    };
                    let sender = serve_incoming(stream, handler);
                    *slot.lock().await = Some(sender);
                }
                Err(error) => error!(%error, "accept failed"),
            }
        }
    }

    async fn run_ticker(self: Arc<Self>) {
        let tick_interval = {
            let replica = self.replica.lock().await;
            replica.config().tick_interval
        };
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            let effects = {
                let mut replica = self.replica.lock().await;
                replica.tick(Instant::now())
            };
            self.apply_effects(effects).await;
        }
    }
}

/// Answers clients as their operations come off the commit stream.
async fn consume_commits(server: Arc<Server>, mut commits: mpsc::Receiver<KvCommit>) {
    while let Some(entry) = commits.recv().await {
        info!(
            replica = server.id,
            op = entry.op_number,
            view = entry.view_number,
            client = entry.request.client_id,
            "operation committed"
        );
        server
            .reply_to_client(
                entry.request.client_id,
                ClientReply::Done {
                    request_num: entry.request.request_num,
                    result: entry.reply,
                },
            )
            .await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let own_address = args
        .replicas
        .get(args.replica_id)
        .ok_or("replica id out of range")?
        .clone();

    let (commit_tx, commit_rx) = mpsc::channel(COMMIT_CHANNEL_CAPACITY);
    let server = Server::new(&args, commit_tx);

    // Dial every peer; inbound links carry their traffic to us.
    let mut peers = HashMap::new();
    for (id, address) in args.replicas.iter().enumerate() {
        if id == args.replica_id {
            continue;
        }
        let handler = server.frame_handler(None);
        peers.insert(id, PeerLink::connect(address.clone(), handler));
    }
    *server.peers.write().await = peers;

    let listener = TcpListener::bind(&own_address).await?;
    info!(replica = args.replica_id, %own_address, "listening");

    tokio::spawn(Arc::clone(&server).accept_loop(listener));
    tokio::spawn(consume_commits(Arc::clone(&server), commit_rx));
    tokio::spawn(Arc::clone(&server).run_ticker());

    // Everything is wired; release the replica into the protocol.
    let effects = {
        let mut replica = server.replica.lock().await;
        replica.ready(Instant::now())
    };
    server.apply_effects(effects).await;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.replica.lock().await.stop();
    Ok(())
}
