//! Length-delimited TCP links. Outbound peer links reconnect on their own;
//! inbound connections are served until they close. Frames that cannot be
//! delivered are dropped, which the replication protocol tolerates as
//! message loss.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

/// Callback invoked with every inbound frame.
pub type FrameHandler =
    Arc<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const OUTBOX_CAPACITY: usize = 256;

/// An outbound, automatically reconnecting link to a peer address.
#[derive(Clone)]
pub struct PeerLink {
    outbox: mpsc::Sender<Bytes>,
}

impl PeerLink {
    pub fn connect(address: String, handler: FrameHandler) -> Self {
        let (outbox, pending) = mpsc::channel(OUTBOX_CAPACITY);
        tokio::spawn(run_peer_link(address, pending, handler));
        PeerLink { outbox }
    }

    /// Queue a frame for delivery; dropped if the link is down or saturated.
    pub fn send(&self, frame: Bytes) {
        if self.outbox.try_send(frame).is_err() {
            debug!("link unavailable; dropping frame");
        }
    }
}

async fn run_peer_link(address: String, mut pending: mpsc::Receiver<Bytes>, handler: FrameHandler) {
    loop {
        let stream = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(error) => {
                debug!(%address, %error, "peer unreachable; retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                // Whatever queued up while the peer was down is stale.
                while pending.try_recv().is_ok() {}
                continue;
            }
        };
        if let Err(error) = stream.set_nodelay(true) {
            warn!(%error, "failed to set TCP_NODELAY");
        }
        debug!(%address, "connected to peer");

        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        loop {
            tokio::select! {
                frame = pending.recv() => {
                    let Some(frame) = frame else { return };
                    if let Err(error) = framed.send(frame).await {
                        warn!(%address, %error, "send failed; reconnecting");
                        break;
                    }
                }
                frame = framed.next() => {
                    match frame {
                        Some(Ok(bytes)) => handler(bytes.to_vec()).await,
                        Some(Err(error)) => {
                            warn!(%address, %error, "read failed; reconnecting");
                            break;
                        }
                        None => {
                            debug!(%address, "peer closed the connection");
                            break;
                        }
                    }
                }
            }
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

/// Serve an accepted connection, feeding inbound frames to the handler.
/// The returned sender writes frames back on the same stream, which is how
/// clients without a listening socket get their replies.
pub fn serve_incoming(stream: TcpStream, handler: FrameHandler) -> mpsc::Sender<Bytes> {
    let (outbox, mut pending) = mpsc::channel::<Bytes>(OUTBOX_CAPACITY);
    tokio::spawn(async move {
        if let Err(error) = stream.set_nodelay(true) {
            warn!(%error, "failed to set TCP_NODELAY");
        }
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        loop {
            tokio::select! {
                frame = pending.recv() => {
                    let Some(frame) = frame else { return };
                    if framed.send(frame).await.is_err() {
                        return;
                    }
                }
                frame = framed.next() => {
                    match frame {
                        Some(Ok(bytes)) => handler(bytes.to_vec()).await,
                        _ => return,
                    }
                }
            }
        }
    });
    outbox
}
