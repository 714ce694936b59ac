//! TCP transport — listener, dialer and per-connection tasks.
//!
//! None of these tasks touch node state. Everything they observe (accepted
//! sockets, established dials, decoded envelopes, closed connections) is
//! reported to the node actor as a [`TransportEvent`], in the order it
//! happened on each connection.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::EnvelopeCodec;
use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::Envelope;
use crate::peer::{Outbound, PeerLink};
use crate::state::{CloseReason, Dial};

/// How long a turned-away connection is drained before it is dropped.
const REJECT_LINGER: Duration = Duration::from_secs(2);

/// An event from the transport layer.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// The listener accepted a connection.
    Inbound { stream: TcpStream, addr: SocketAddr },
    /// An outbound dial completed.
    Connected {
        peer_id: PeerId,
        remote_addr: SocketAddr,
    },
    /// An envelope was decoded from a peer's stream.
    Envelope { peer_id: PeerId, envelope: Envelope },
    /// A connection ended.
    Closed { peer_id: PeerId, reason: CloseReason },
}

/// Bind the node's TCP listener.
pub(crate) async fn bind(host: &str, port: u16) -> Result<TcpListener, NetworkError> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(addr = %listener.local_addr()?, "Listening for peers");
    Ok(listener)
}

/// Run the accept loop until shutdown or until the node stops listening
/// for events. Accept errors are logged; the loop keeps going.
pub(crate) fn spawn_listener(
    listener: TcpListener,
    event_tx: mpsc::Sender<TransportEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!(%addr, "Failed to set TCP_NODELAY: {e}");
                            }
                            if event_tx.send(TransportEvent::Inbound { stream, addr }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("TCP accept failed: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Listener shutting down");
                    break;
                }
            }
        }
    });
}

/// Dial an outgoing peer. On success the actor hears `Connected` before any
/// envelope from the new connection.
pub(crate) fn spawn_dial(dial: Dial, timeout: Duration, event_tx: mpsc::Sender<TransportEvent>) {
    tokio::spawn(async move {
        let Dial {
            peer_id,
            hostname,
            port,
            link,
        } = dial;
        let cancel = link.cancel.clone();

        let connect = tokio::time::timeout(timeout, TcpStream::connect((hostname.as_str(), port)));
        let result = tokio::select! {
            result = connect => result,
            _ = cancel.cancelled() => {
                debug!(peer = %peer_id, "Dial abandoned");
                return;
            }
        };

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(peer = %peer_id, "Connect to {hostname}:{port} failed: {e}");
                let reason = CloseReason::Error(e.to_string());
                let _ = event_tx.send(TransportEvent::Closed { peer_id, reason }).await;
                return;
            }
            Err(_) => {
                let reason = CloseReason::Error(NetworkError::Timeout(timeout).to_string());
                let _ = event_tx.send(TransportEvent::Closed { peer_id, reason }).await;
                return;
            }
        };

        let remote_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let reason = CloseReason::Error(e.to_string());
                let _ = event_tx.send(TransportEvent::Closed { peer_id, reason }).await;
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%remote_addr, "Failed to set TCP_NODELAY: {e}");
        }

        let connected = TransportEvent::Connected {
            peer_id: peer_id.clone(),
            remote_addr,
        };
        if event_tx.send(connected).await.is_ok() {
            spawn_connection(peer_id, stream, link, event_tx);
        }
    });
}

/// Start the reader and writer tasks for an admitted connection.
pub(crate) fn spawn_connection(
    peer_id: PeerId,
    stream: TcpStream,
    link: PeerLink,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let PeerLink { outbox, cancel } = link;
    tokio::spawn(read_loop(
        peer_id.clone(),
        read_half,
        cancel.clone(),
        event_tx.clone(),
    ));
    tokio::spawn(write_loop(peer_id, write_half, outbox, cancel, event_tx));
}

/// Flush whatever was queued for a turned-away connection, then close it.
/// Anything the remote sends is discarded until it hangs up, so the socket
/// is not reset while our last frames are still in flight.
pub(crate) fn spawn_rejected(
    peer_id: PeerId,
    stream: TcpStream,
    link: PeerLink,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let (mut read_half, write_half) = stream.into_split();
    let PeerLink { outbox, cancel } = link;
    tokio::spawn(async move {
        write_loop(peer_id, write_half, outbox, cancel, event_tx).await;
        let mut discard = tokio::io::sink();
        let drain = tokio::io::copy(&mut read_half, &mut discard);
        let _ = tokio::time::timeout(REJECT_LINGER, drain).await;
    });
}

async fn read_loop(
    peer_id: PeerId,
    read_half: OwnedReadHalf,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let mut frames = FramedRead::new(read_half, EnvelopeCodec::new());
    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = cancel.cancelled() => return,
        };

        let event = match frame {
            Some(Ok(envelope)) => TransportEvent::Envelope {
                peer_id: peer_id.clone(),
                envelope,
            },
            Some(Err(NetworkError::ProtocolViolation(msg))) => {
                warn!(peer = %peer_id, "Protocol violation: {msg}");
                TransportEvent::Closed {
                    peer_id: peer_id.clone(),
                    reason: CloseReason::ProtocolViolation(msg),
                }
            }
            Some(Err(e)) => {
                debug!(peer = %peer_id, "Read error: {e}");
                TransportEvent::Closed {
                    peer_id: peer_id.clone(),
                    reason: CloseReason::Error(e.to_string()),
                }
            }
            None => {
                debug!(peer = %peer_id, "Remote closed the connection");
                TransportEvent::Closed {
                    peer_id: peer_id.clone(),
                    reason: CloseReason::End,
                }
            }
        };

        let last = matches!(event, TransportEvent::Closed { .. });
        if event_tx.send(event).await.is_err() || last {
            return;
        }
    }
}

async fn write_loop(
    peer_id: PeerId,
    write_half: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let mut sink = FramedWrite::new(write_half, EnvelopeCodec::new());
    loop {
        let next = tokio::select! {
            next = outbox.recv() => next,
            _ = cancel.cancelled() => return,
        };

        match next {
            Some(Outbound::Frame(envelope)) => {
                if let Err(e) = sink.send(envelope).await {
                    debug!(peer = %peer_id, "Write error: {e}");
                    let reason = CloseReason::Error(e.to_string());
                    let _ = event_tx.send(TransportEvent::Closed { peer_id, reason }).await;
                    return;
                }
            }
            Some(Outbound::Close) | None => {
                if let Err(e) = SinkExt::<Envelope>::close(&mut sink).await {
                    debug!(peer = %peer_id, "Error closing connection: {e}");
                }
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
