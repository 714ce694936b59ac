//! Node state — the single-writer core of a swarm node.
//!
//! [`NodeState`] owns the peer set, the seed hosts and the seen ledger. It
//! makes every protocol decision synchronously and hands anything that needs
//! I/O (dialling, spawning connection tasks) back to the caller as a value.
//! The node actor is the only thing that ever holds it, so none of this
//! needs locking.

use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::discovery::{SeedHosts, format_host, split_host};
use crate::events::{DiagnosticSink, NodeEvent};
use crate::identity::{NodeId, PeerId};
use crate::ledger::SeenLedger;
use crate::message::{Envelope, HOSTS_REPLY, HOSTS_REQUEST, PORT_REQUEST};
use crate::peer::{Direction, Peer, PeerInfo, PeerLink};

/// An outbound connection the transport layer should open.
pub(crate) struct Dial {
    pub peer_id: PeerId,
    pub hostname: String,
    pub port: u16,
    pub link: PeerLink,
}

/// Result of [`NodeState::connect`].
pub(crate) enum ConnectOutcome {
    /// The host is this node's own advertised host.
    SelfConnection,
    /// A peer for the host exists; `hosts?` was sent on it instead.
    AlreadyConnected(PeerId),
    /// A new outgoing peer was added and must be dialled.
    Dial(Dial),
}

/// Result of [`NodeState::admit_inbound`].
pub(crate) enum Admission {
    /// The peer joined the peer set.
    Accepted { peer_id: PeerId, link: PeerLink },
    /// The node is full; `hosts!` was queued followed by a close.
    Rejected { peer_id: PeerId, link: PeerLink },
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// The remote closed the stream.
    End,
    /// Dial failure, I/O error or timeout.
    Error(String),
    /// The remote broke the wire protocol.
    ProtocolViolation(String),
}

pub struct NodeState {
    id: NodeId,
    host: String,
    port: Option<u16>,
    min_peers: usize,
    max_peers: usize,
    outbox_capacity: usize,
    peers: Vec<Peer>,
    seed_hosts: SeedHosts,
    ledger: SeenLedger,
    events: broadcast::Sender<NodeEvent>,
    diagnostics: Option<DiagnosticSink>,
}

impl NodeState {
    /// Build the state for a node listening on `port` (`None` while the
    /// listener has not resolved its port).
    pub fn new(
        config: &NetworkConfig,
        port: Option<u16>,
        events: broadcast::Sender<NodeEvent>,
        diagnostics: Option<DiagnosticSink>,
    ) -> Self {
        let host = format_host(&config.hostname, port.unwrap_or(config.port));
        Self {
            id: NodeId::generate(),
            host,
            port,
            min_peers: config.min_peers,
            max_peers: config.max_peers,
            outbox_capacity: config.outbox_capacity,
            peers: Vec::new(),
            seed_hosts: config.seed_hosts.iter().cloned().collect(),
            ledger: SeenLedger::from_capacity(config.ledger_capacity),
            events,
            diagnostics,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Advertised `hostname:port`.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id() == peer_id)
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers.iter().map(Peer::info).collect()
    }

    pub fn seed_hosts(&self) -> &SeedHosts {
        &self.seed_hosts
    }

    pub fn ledger(&self) -> &SeenLedger {
        &self.ledger
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut SeenLedger {
        &mut self.ledger
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn diagnostic(&self, line: &str) {
        if let Some(sink) = &self.diagnostics {
            sink(line);
        }
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// New envelope from this node with a fresh id.
    pub fn create_message(
        &self,
        command: &str,
        payload: serde_json::Value,
        broadcast: bool,
    ) -> Envelope {
        Envelope::new(self.id.clone(), command, payload, broadcast)
    }

    /// Originate a broadcast and flood it to every peer.
    pub fn broadcast(&mut self, command: &str, payload: serde_json::Value) -> Envelope {
        self.diagnostic(&format!("[p2p] broadcast: {command} {payload}"));
        debug!(command, peers = self.peers.len(), "Broadcasting");
        let envelope = self.create_message(command, payload, true);
        self.broadcast_message(&envelope);
        envelope
    }

    /// Relay `envelope` to every peer with its hop count advanced by one.
    /// Peers whose writer is gone are dropped; the rest still get it.
    pub fn broadcast_message(&mut self, envelope: &Envelope) {
        let relayed = envelope.relayed();
        let mut failed = Vec::new();

        for peer in &self.peers {
            if let Err(e) = peer.write(relayed.clone()) {
                warn!(peer = %peer.id(), "Relay write failed, dropping peer: {e}");
                failed.push((peer.id().clone(), e.to_string()));
            }
        }

        for (peer_id, error) in failed {
            self.close_peer(&peer_id, CloseReason::Error(error));
        }
    }

    /// Write to a single peer, dropping it if the write fails.
    pub(crate) fn write(&mut self, peer: &Peer, envelope: Envelope) {
        if let Err(e) = peer.write(envelope) {
            warn!(peer = %peer.id(), "Write failed, dropping peer: {e}");
            self.close_peer(peer.id(), CloseReason::Error(e.to_string()));
        }
    }

    fn send_to(&mut self, peer_id: &PeerId, command: &str, payload: serde_json::Value) {
        if let Some(peer) = self.peer(peer_id).cloned() {
            peer.send(self, command, payload, false);
        }
    }

    /// Run an envelope read from `peer_id` through the receive pipeline.
    /// A protocol violation closes that peer only.
    pub(crate) fn handle_envelope(&mut self, peer_id: &PeerId, envelope: Envelope) {
        let Some(peer) = self.peer(peer_id).cloned() else {
            debug!(peer = %peer_id, "Envelope from a removed peer ignored");
            return;
        };
        if let Err(e) = peer.receive(self, envelope) {
            warn!(peer = %peer_id, "Closing peer: {e}");
            self.close_peer(peer_id, CloseReason::ProtocolViolation(e.to_string()));
        }
    }

    // -----------------------------------------------------------------------
    // Peer set
    // -----------------------------------------------------------------------

    /// Outbound connection to `hostname:port`, unless that is ourselves or
    /// a peer for it already exists.
    pub(crate) fn connect(&mut self, hostname: &str, port: u16) -> ConnectOutcome {
        let host = format_host(hostname, port);
        if host == self.host {
            debug!(%host, "Skipping connect to self");
            return ConnectOutcome::SelfConnection;
        }

        if let Some(existing) = self.peers.iter().find(|p| p.matches_host(&host)) {
            let peer_id = existing.id().clone();
            debug!(%host, peer = %peer_id, "Already connected, asking for hosts");
            self.send_to(&peer_id, HOSTS_REQUEST, serde_json::json!({}));
            return ConnectOutcome::AlreadyConnected(peer_id);
        }

        let (peer, link) = Peer::outgoing(hostname, port, self.outbox_capacity);
        let peer_id = peer.id().clone();
        info!(%host, peer = %peer_id, "Connecting");
        self.peers.push(peer);
        ConnectOutcome::Dial(Dial {
            peer_id,
            hostname: hostname.to_string(),
            port,
            link,
        })
    }

    /// An outbound dial succeeded.
    pub(crate) fn on_connected(&mut self, peer_id: &PeerId, remote_addr: SocketAddr) {
        let Some(peer) = self.peers.iter_mut().find(|p| p.id() == peer_id) else {
            return;
        };
        peer.mark_open(remote_addr);
        let peer = peer.clone();
        info!(peer = %peer_id, %remote_addr, "Outgoing connection established");
        peer.send(self, HOSTS_REQUEST, serde_json::json!({}), false);
        self.emit(NodeEvent::NewOutgoingConnection { peer: peer.info() });
    }

    /// Decide whether an accepted connection may join the peer set.
    pub(crate) fn admit_inbound(&mut self, remote_addr: SocketAddr) -> Admission {
        let (mut peer, link) = Peer::incoming(remote_addr, self.outbox_capacity);
        let peer_id = peer.id().clone();

        if self.peers.len() >= self.max_peers {
            info!(%remote_addr, max_peers = self.max_peers, "At capacity, turning peer away");
            let hosts = serde_json::json!(self.seed_hosts.as_slice());
            peer.send(self, HOSTS_REPLY, hosts, false);
            peer.end();
            return Admission::Rejected { peer_id, link };
        }

        debug!(%remote_addr, peer = %peer_id, "Accepted incoming connection");
        peer.send(self, PORT_REQUEST, serde_json::json!({}), false);
        peer.send(self, HOSTS_REQUEST, serde_json::json!({}), false);
        self.peers.push(peer);
        Admission::Accepted { peer_id, link }
    }

    /// Remove a peer by id. Removing an absent peer does nothing.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<Peer> {
        let index = self.peers.iter().position(|p| p.id() == peer_id)?;
        let mut peer = self.peers.remove(index);
        peer.mark_closed();
        Some(peer)
    }

    /// Remove a peer because its connection ended and tell subscribers.
    pub(crate) fn close_peer(&mut self, peer_id: &PeerId, reason: CloseReason) {
        let Some(peer) = self.remove_peer(peer_id) else {
            return;
        };
        let info = peer.info();
        match (&reason, peer.direction()) {
            (CloseReason::End, Direction::Outgoing) => {
                info!(peer = %peer_id, host = ?info.host, "Outgoing connection closed by remote");
                self.emit(NodeEvent::LostOutgoingConnection { peer: info });
            }
            _ => {
                info!(peer = %peer_id, host = ?info.host, ?reason, "Connection lost");
                self.emit(NodeEvent::LostConnection { peer: info });
            }
        }
    }

    /// Drop every peer, as on shutdown.
    pub(crate) fn clear_peers(&mut self) {
        for mut peer in self.peers.drain(..) {
            peer.mark_closed();
        }
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    pub fn add_seed_hosts<I, S>(&mut self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added = self.seed_hosts.extend(hosts);
        if added > 0 {
            debug!(added, total = self.seed_hosts.len(), "Seed hosts updated");
        }
    }

    pub fn remove_seed_host(&mut self, host: &str) {
        if host.is_empty() {
            return;
        }
        self.seed_hosts.remove(host);
    }

    pub(crate) fn set_peer_port(&mut self, peer_id: &PeerId, port: u16) {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.id() == peer_id) {
            peer.set_port(port);
        }
    }

    /// One maintenance round: while under `min_peers`, dial a random seed.
    pub(crate) fn join_network(&mut self) -> Option<ConnectOutcome> {
        if self.seed_hosts.is_empty() || self.peers.len() >= self.min_peers || self.port.is_none() {
            return None;
        }
        let host = self.seed_hosts.choose_random()?.to_string();
        match split_host(&host) {
            Ok((hostname, port)) => Some(self.connect(&hostname, port)),
            Err(e) => {
                warn!("Skipping seed host: {e}");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
