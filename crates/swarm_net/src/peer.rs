//! Peer connections — per-connection state and the receive pipeline.
//!
//! A [`Peer`] never owns its socket directly. The transport layer runs a
//! reader and a writer task per connection; the peer keeps the writer's
//! outbox and a cancellation token, so it can be cloned freely and dropped
//! from the node's peer set without touching I/O.

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::discovery::format_host;
use crate::error::NetworkError;
use crate::events::{AppMessage, NodeEvent};
use crate::identity::PeerId;
use crate::message::{ControlCommand, Envelope, HOSTS_REPLY, PORT_REPLY};
use crate::state::NodeState;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Outbound dial in progress.
    Connecting,
    /// Connection established; envelopes flow both ways.
    Open,
    /// Connection gone. Terminal.
    Closed,
}

/// Instruction for a peer's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Envelope),
    /// Flush what is queued, then shut the connection down.
    Close,
}

/// The transport-side half of a peer: what its reader/writer tasks consume.
pub(crate) struct PeerLink {
    pub outbox: mpsc::Receiver<Outbound>,
    pub cancel: CancellationToken,
}

/// Snapshot of a peer for events and queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub direction: Direction,
    pub state: PeerState,
    /// Remote socket address, once connected.
    pub remote_addr: Option<SocketAddr>,
    /// Normalised remote hostname.
    pub hostname: Option<String>,
    /// The remote's listening port, once known.
    pub port: Option<u16>,
    /// `hostname:port` used to recognise this peer in `connect`.
    pub host: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// One live connection to another node.
#[derive(Debug, Clone)]
pub struct Peer {
    id: PeerId,
    direction: Direction,
    state: PeerState,
    remote_addr: Option<SocketAddr>,
    dialed_host: Option<String>,
    port: Option<u16>,
    ending: bool,
    connected_at: Option<DateTime<Utc>>,
    outbox: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl Peer {
    fn with_link(direction: Direction, state: PeerState, capacity: usize) -> (Self, PeerLink) {
        let (outbox_tx, outbox_rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let peer = Self {
            id: PeerId::generate(),
            direction,
            state,
            remote_addr: None,
            dialed_host: None,
            port: None,
            ending: false,
            connected_at: None,
            outbox: outbox_tx,
            cancel: cancel.clone(),
        };
        let link = PeerLink {
            outbox: outbox_rx,
            cancel,
        };
        (peer, link)
    }

    /// A peer we are about to dial at `hostname:port`. At most `capacity`
    /// frames wait in its outbox.
    pub(crate) fn outgoing(hostname: &str, port: u16, capacity: usize) -> (Self, PeerLink) {
        let (mut peer, link) =
            Self::with_link(Direction::Outgoing, PeerState::Connecting, capacity);
        peer.dialed_host = Some(format_host(hostname, port));
        peer.port = Some(port);
        (peer, link)
    }

    /// A peer for a connection the listener just accepted.
    pub(crate) fn incoming(remote_addr: SocketAddr, capacity: usize) -> (Self, PeerLink) {
        let (mut peer, link) = Self::with_link(Direction::Incoming, PeerState::Open, capacity);
        peer.remote_addr = Some(remote_addr);
        peer.connected_at = Some(Utc::now());
        (peer, link)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_ending(&self) -> bool {
        self.ending
    }

    pub(crate) fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub(crate) fn mark_open(&mut self, remote_addr: SocketAddr) {
        self.state = PeerState::Open;
        self.remote_addr = Some(remote_addr);
        self.connected_at = Some(Utc::now());
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = PeerState::Closed;
        self.cancel.cancel();
    }

    /// Remote hostname, with loopback reported as `localhost`.
    pub fn hostname(&self) -> Option<String> {
        self.remote_addr.map(|addr| normalize_hostname(addr.ip()))
    }

    /// `hostname:port` of the remote's listener. Falls back to the dialled
    /// host while an outbound connection is still being established.
    pub fn host(&self) -> Option<String> {
        match (self.hostname(), self.port) {
            (Some(hostname), Some(port)) => Some(format_host(&hostname, port)),
            _ => self.dialed_host.clone(),
        }
    }

    /// Whether this peer is the connection to `host`.
    pub fn matches_host(&self, host: &str) -> bool {
        self.dialed_host.as_deref() == Some(host) || self.host().as_deref() == Some(host)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            direction: self.direction,
            state: self.state,
            remote_addr: self.remote_addr,
            hostname: self.hostname(),
            port: self.port,
            host: self.host(),
            connected_at: self.connected_at,
        }
    }

    /// Queue an envelope on the connection. Fails once the writer is gone
    /// or has fallen a full outbox behind.
    pub fn write(&self, envelope: Envelope) -> Result<(), NetworkError> {
        self.outbox
            .try_send(Outbound::Frame(envelope))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    NetworkError::Transport(format!("Outbox for peer {} is full", self.id))
                }
                TrySendError::Closed(_) => {
                    NetworkError::Transport(format!("Writer for peer {} is closed", self.id))
                }
            })
    }

    /// Stop accepting sends and close the connection after queued frames
    /// are flushed. A writer with no room left is cancelled outright.
    pub(crate) fn end(&mut self) {
        self.ending = true;
        if let Err(TrySendError::Full(_)) = self.outbox.try_send(Outbound::Close) {
            self.cancel.cancel();
        }
    }

    /// Build an envelope through the owning node and write it.
    pub fn send(
        &self,
        node: &mut NodeState,
        command: &str,
        payload: serde_json::Value,
        broadcast: bool,
    ) {
        if self.ending {
            return;
        }
        let envelope = node.create_message(command, payload, broadcast);
        node.write(self, envelope);
    }

    /// Process one envelope read from this connection.
    ///
    /// Envelopes this node originated or already processed are dropped
    /// before anything else happens, which is what stops a flood from
    /// circulating forever.
    pub fn receive(&self, node: &mut NodeState, envelope: Envelope) -> Result<(), NetworkError> {
        if envelope.command.is_empty() {
            return Err(NetworkError::ProtocolViolation(
                "Message missing command".to_string(),
            ));
        }

        let is_original_sender = envelope.sender == *node.id();
        let already_received = node.ledger().contains(&envelope.id);
        if is_original_sender || already_received {
            trace!(peer = %self.id, id = %envelope.id, "Dropping seen envelope");
            return Ok(());
        }
        node.ledger_mut().mark(&envelope.id);

        if envelope.broadcast {
            node.broadcast_message(&envelope);
        }

        match envelope.control() {
            Some(ControlCommand::PortRequest) => {
                if let Some(port) = node.port() {
                    self.send(node, PORT_REPLY, serde_json::json!(port), false);
                }
            }
            Some(ControlCommand::PortReply) => {
                let port = parse_port(&envelope.payload)?;
                node.set_peer_port(&self.id, port);
                match self.hostname() {
                    Some(hostname) => {
                        node.add_seed_hosts([format_host(&hostname, port)]);
                    }
                    None => warn!(peer = %self.id, "port! from a peer without remote address"),
                }
            }
            Some(ControlCommand::HostsRequest) => {
                if !node.seed_hosts().is_empty() {
                    let hosts = serde_json::json!(node.seed_hosts().as_slice());
                    self.send(node, HOSTS_REPLY, hosts, false);
                }
            }
            Some(ControlCommand::HostsReply) => {
                let hosts = parse_hosts(&envelope.payload)?;
                node.add_seed_hosts(hosts);
            }
            None => {
                node.diagnostic(&format!(
                    "[p2p] receive: {} {}",
                    envelope.command, envelope.payload
                ));
                debug!(
                    peer = %self.id,
                    command = %envelope.command,
                    hops = ?envelope.hops,
                    "Application message received"
                );
                let peer = node
                    .peer(&self.id)
                    .map(Peer::info)
                    .unwrap_or_else(|| self.info());
                node.emit(NodeEvent::Message(AppMessage {
                    id: envelope.id,
                    command: envelope.command,
                    payload: envelope.payload,
                    peer,
                    hops: envelope.hops,
                    sender: envelope.sender,
                    received_at: Utc::now(),
                }));
            }
        }
        Ok(())
    }
}

/// `127.0.0.1` and its IPv4-mapped IPv6 form become `localhost`.
pub fn normalize_hostname(ip: IpAddr) -> String {
    let loopback = match ip {
        IpAddr::V4(v4) => v4 == std::net::Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.to_ipv4_mapped() == Some(std::net::Ipv4Addr::LOCALHOST),
    };
    if loopback {
        "localhost".to_string()
    } else {
        ip.to_string()
    }
}

fn parse_port(payload: &serde_json::Value) -> Result<u16, NetworkError> {
    let port = match payload {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    port.and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| NetworkError::ProtocolViolation(format!("Invalid port payload: {payload}")))
}

fn parse_hosts(payload: &serde_json::Value) -> Result<Vec<String>, NetworkError> {
    let list = payload.as_array().ok_or_else(|| {
        NetworkError::ProtocolViolation(format!("Invalid hosts payload: {payload}"))
    })?;
    Ok(list
        .iter()
        .filter_map(|host| host.as_str().map(str::to_string))
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_loopback_normalizes_to_localhost() {
        assert_eq!(normalize_hostname("127.0.0.1".parse().unwrap()), "localhost");
        let mapped = IpAddr::V6(std::net::Ipv4Addr::LOCALHOST.to_ipv6_mapped());
        assert_eq!(normalize_hostname(mapped), "localhost");
        assert_eq!(normalize_hostname(IpAddr::V6(Ipv6Addr::LOCALHOST)), "::1");
        assert_eq!(normalize_hostname("10.0.0.7".parse().unwrap()), "10.0.0.7");
    }

    #[test]
    fn test_outgoing_peer_host_before_and_after_connect() {
        let (mut peer, _link) = Peer::outgoing("localhost", 9000, 8);
        assert_eq!(peer.state(), PeerState::Connecting);
        assert_eq!(peer.host().as_deref(), Some("localhost:9000"));

        peer.mark_open("127.0.0.1:9000".parse().unwrap());
        assert_eq!(peer.state(), PeerState::Open);
        assert_eq!(peer.hostname().as_deref(), Some("localhost"));
        assert!(peer.matches_host("localhost:9000"));
    }

    #[test]
    fn test_incoming_peer_host_known_after_port() {
        let (mut peer, _link) = Peer::incoming("127.0.0.1:53211".parse().unwrap(), 8);
        assert!(peer.host().is_none());
        assert!(!peer.matches_host("localhost:53211"));

        peer.set_port(7000);
        assert_eq!(peer.host().as_deref(), Some("localhost:7000"));
    }

    #[test]
    fn test_write_fails_after_writer_dropped() {
        let (peer, link) = Peer::incoming("127.0.0.1:1".parse().unwrap(), 8);
        drop(link);
        let env = Envelope::new(
            crate::identity::NodeId::from("n"),
            "chat",
            serde_json::json!({}),
            false,
        );
        assert!(matches!(peer.write(env), Err(NetworkError::Transport(_))));
    }

    #[test]
    fn test_write_fails_when_outbox_full() {
        let (mut peer, mut link) = Peer::incoming("127.0.0.1:1".parse().unwrap(), 1);
        let env = Envelope::new(
            crate::identity::NodeId::from("n"),
            "chat",
            serde_json::json!({}),
            false,
        );
        assert!(peer.write(env.clone()).is_ok());
        match peer.write(env) {
            Err(NetworkError::Transport(msg)) => assert!(msg.contains("full")),
            other => panic!("expected a full outbox, got {other:?}"),
        }

        // No room for the close marker: the writer is cancelled instead.
        peer.end();
        assert!(peer.is_ending());
        assert!(link.cancel.is_cancelled());
        assert!(matches!(link.outbox.try_recv(), Ok(Outbound::Frame(_))));
    }

    #[test]
    fn test_parse_port_payloads() {
        assert_eq!(parse_port(&serde_json::json!(8080)).unwrap(), 8080);
        assert_eq!(parse_port(&serde_json::json!("8080")).unwrap(), 8080);
        assert!(parse_port(&serde_json::json!(70000)).is_err());
        assert!(parse_port(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_hosts_skips_non_strings() {
        let hosts = parse_hosts(&serde_json::json!(["a:1", 5, "b:2"])).unwrap();
        assert_eq!(hosts, vec!["a:1".to_string(), "b:2".to_string()]);
        assert!(parse_hosts(&serde_json::json!("a:1")).is_err());
    }
}
