use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;
use vrr_example::{
    api::{ClientReply, Frame},
    kv::KvOp,
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Unique client id; the cluster deduplicates per client.
    #[arg(long)]
    client_id: usize,

    /// Addresses of every replica, ordered by id.
    #[arg(long, required = true)]
    replicas: Vec<String>,
}

struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    replica_id: usize,
}

async fn connect(replicas: &[String], replica_id: usize) -> Option<Connection> {
    let address = &replicas[replica_id];
    match TcpStream::connect(address).await {
        Ok(stream) => {
            info!(replica_id, %address, "connected");
            Some(Connection {
                framed: Framed::new(stream, LengthDelimitedCodec::new()),
                replica_id,
            })
        }
        Err(error) => {
            warn!(replica_id, %address, %error, "connect failed");
            None
        }
    }
}

/// Send the request and wait for its Done reply, following redirects and
/// rotating through replicas on silence. Returns when the operation has
/// committed somewhere.
async fn execute(
    args: &Args,
    connection: &mut Option<Connection>,
    request_num: usize,
    op: KvOp,
) -> ClientReply {
    let frame = serde_json::to_vec(&Frame::Request {
        client_id: args.client_id,
        request_num,
        op,
    })
    .expect("request always encodes");

    enum Outcome {
        Done(ClientReply),
        Redirect(usize),
        Backoff,
        Disconnect,
    }

    let mut target = connection.as_ref().map(|c| c.replica_id).unwrap_or(0);
    loop {
        if connection.is_none() {
            match connect(&args.replicas, target).await {
                Some(conn) => *connection = Some(conn),
                None => {
                    target = (target + 1) % args.replicas.len();
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    continue;
                }
            }
        }

        let outcome = {
            let conn = connection.as_mut().expect("just connected");
            if conn.framed.send(Bytes::from(frame.clone())).await.is_err() {
                Outcome::Disconnect
            } else {
                // Read until Done, Redirect, or silence.
                loop {
                    match timeout(REPLY_TIMEOUT, conn.framed.next()).await {
                        Ok(Some(Ok(raw))) => match serde_json::from_slice::<Frame>(&raw) {
                            Ok(Frame::Reply(ClientReply::Done {
                                request_num: done_num,
                                result,
                            })) if done_num == request_num => {
                                break Outcome::Done(ClientReply::Done {
                                    request_num: done_num,
                                    result,
                                });
                            }
                            Ok(Frame::Reply(ClientReply::Redirect { primary })) => {
                                break Outcome::Redirect(primary);
                            }
                            Ok(Frame::Reply(ClientReply::Pending { .. })) => continue,
                            Ok(Frame::Reply(ClientReply::Unavailable)) => break Outcome::Backoff,
                            // Stale Done for an earlier request, or noise.
                            Ok(_) => continue,
                            Err(error) => {
                                warn!(%error, "undecodable reply");
                                continue;
                            }
                        },
                        Ok(_) => break Outcome::Disconnect,
                        Err(_) => {
                            warn!(target, "no reply; trying the next replica");
                            break Outcome::Disconnect;
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Done(reply) => return reply,
            Outcome::Redirect(primary) => {
                info!(primary, "redirected");
                target = primary;
                *connection = None;
            }
            Outcome::Backoff => tokio::time::sleep(Duration::from_millis(300)).await,
            Outcome::Disconnect => {
                *connection = None;
                target = (target + 1) % args.replicas.len();
            }
        }
    }
}

fn parse_command(line: &str) -> Option<KvOp> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "put" => {
            let key = parts.next()?.to_string();
            let value = parts.next()?.to_string();
            Some(KvOp::Put { key, value })
        }
        "get" => Some(KvOp::Get {
            key: parts.next()?.to_string(),
        }),
        "del" => Some(KvOp::Delete {
            key: parts.next()?.to_string(),
        }),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let mut connection: Option<Connection> = None;
    let mut request_num = 0usize;

    println!("commands: put <key> <value> | get <key> | del <key>");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(op) = parse_command(&line) else {
            println!("unrecognized command");
            continue;
        };
        request_num += 1;
        let reply = execute(&args, &mut connection, request_num, op).await;
        if let ClientReply::Done { result, .. } = reply {
            println!("=> {:?}", result);
        }
    }
    Ok(())
}
