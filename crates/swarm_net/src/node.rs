//! SwarmNode — top-level handle for the networking layer.
//!
//! [`SwarmNode::spawn`] binds the listener and starts one actor task that
//! owns the node's [`NodeState`]. Everything that changes that state
//! (handle calls, socket events, the join-network tick) is funnelled through
//! the actor and handled one item at a time:
//! - Handle commands (broadcast, connect, seed-host edits, queries)
//! - Transport events (accepted sockets, dials, envelopes, closes)
//! - The periodic join-network round

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::events::{DiagnosticSink, NodeEvent};
use crate::identity::NodeId;
use crate::message::Envelope;
use crate::peer::PeerInfo;
use crate::state::{Admission, ConnectOutcome, NodeState};
use crate::transport::{self, TransportEvent};

/// Requests from handles to the node actor.
enum NodeCommand {
    Broadcast {
        command: String,
        payload: serde_json::Value,
    },
    Connect {
        hostname: String,
        port: u16,
    },
    AddSeedHosts(Vec<String>),
    RemoveSeedHost(String),
    JoinNetwork,
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    SeedHosts(oneshot::Sender<Vec<String>>),
}

/// Handle to a running node. Cheap to clone; the node stops when
/// [`shutdown`](SwarmNode::shutdown) is called or every handle is dropped.
#[derive(Clone)]
pub struct SwarmNode {
    id: NodeId,
    host: String,
    port: u16,
    commands: mpsc::Sender<NodeCommand>,
    events: broadcast::Sender<NodeEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SwarmNode {
    /// Bind the listener and start the node.
    pub async fn spawn(config: NetworkConfig) -> Result<Self, NetworkError> {
        Self::start(config, None).await
    }

    /// Like [`spawn`](Self::spawn), reporting broadcast and receive activity
    /// to `sink`.
    pub async fn spawn_with_diagnostics(
        config: NetworkConfig,
        sink: DiagnosticSink,
    ) -> Result<Self, NetworkError> {
        Self::start(config, Some(sink)).await
    }

    async fn start(
        config: NetworkConfig,
        diagnostics: Option<DiagnosticSink>,
    ) -> Result<Self, NetworkError> {
        let listener = transport::bind(&config.bind_host, config.port).await?;
        let port = listener.local_addr()?.port();

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = NodeState::new(&config, Some(port), events.clone(), diagnostics);
        let id = state.id().clone();
        let host = state.host().to_string();

        let (shutdown_tx, _) = broadcast::channel(8);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);

        transport::spawn_listener(listener, event_tx.clone(), shutdown_tx.subscribe());

        let actor = NodeActor {
            state,
            event_tx,
            discovery_interval: config.discovery_interval,
            connection_timeout: config.connection_timeout,
        };
        tokio::spawn(actor.run(command_rx, event_rx, shutdown_tx.subscribe()));

        info!(node = %id, %host, "Swarm node started");
        Ok(Self {
            id,
            host,
            port,
            commands: command_tx,
            events,
            shutdown_tx,
        })
    }

    /// This node's identifier.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Advertised `hostname:port`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Subscribe to lifecycle and application events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Build an envelope stamped with this node's id. No side effects.
    pub fn create_message(
        &self,
        command: &str,
        payload: serde_json::Value,
        broadcast: bool,
    ) -> Envelope {
        Envelope::new(self.id.clone(), command, payload, broadcast)
    }

    /// Flood an application message to the whole network.
    pub async fn broadcast(
        &self,
        command: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), NetworkError> {
        self.send_command(NodeCommand::Broadcast {
            command: command.into(),
            payload,
        })
        .await
    }

    /// Open a connection to `hostname:port` unless one exists already.
    pub async fn connect(&self, hostname: impl Into<String>, port: u16) -> Result<(), NetworkError> {
        self.send_command(NodeCommand::Connect {
            hostname: hostname.into(),
            port,
        })
        .await
    }

    pub async fn add_seed_hosts(&self, hosts: Vec<String>) -> Result<(), NetworkError> {
        self.send_command(NodeCommand::AddSeedHosts(hosts)).await
    }

    pub async fn remove_seed_host(&self, host: impl Into<String>) -> Result<(), NetworkError> {
        self.send_command(NodeCommand::RemoveSeedHost(host.into()))
            .await
    }

    /// Run a join-network round now instead of waiting for the timer.
    pub async fn join_network(&self) -> Result<(), NetworkError> {
        self.send_command(NodeCommand::JoinNetwork).await
    }

    /// Snapshot of the current peer set.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(NodeCommand::Peers(tx)).await?;
        rx.await.map_err(|_| NetworkError::NotRunning)
    }

    /// Snapshot of the seed-host set.
    pub async fn seed_hosts(&self) -> Result<Vec<String>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send_command(NodeCommand::SeedHosts(tx)).await?;
        rx.await.map_err(|_| NetworkError::NotRunning)
    }

    /// Stop the listener, close every connection and end the actor.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn send_command(&self, command: NodeCommand) -> Result<(), NetworkError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::NotRunning)
    }
}

/// Owner of the node state. Runs until shutdown or until every handle is
/// dropped.
struct NodeActor {
    state: NodeState,
    event_tx: mpsc::Sender<TransportEvent>,
    discovery_interval: Duration,
    connection_timeout: Duration,
}

impl NodeActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<NodeCommand>,
        mut event_rx: mpsc::Receiver<TransportEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let period = self.discovery_interval.max(Duration::from_millis(1));
        let mut discovery = tokio::time::interval_at(Instant::now() + period, period);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All node handles dropped");
                        break;
                    }
                },

                Some(event) = event_rx.recv() => self.handle_transport(event),

                _ = discovery.tick() => {
                    if let Some(outcome) = self.state.join_network() {
                        self.apply(outcome);
                    }
                }

                _ = shutdown.recv() => {
                    debug!("Node actor shutting down");
                    break;
                }
            }
        }

        self.state.clear_peers();
        info!(node = %self.state.id(), "Swarm node stopped");
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Broadcast { command, payload } => {
                self.state.broadcast(&command, payload);
            }
            NodeCommand::Connect { hostname, port } => {
                let outcome = self.state.connect(&hostname, port);
                self.apply(outcome);
            }
            NodeCommand::AddSeedHosts(hosts) => self.state.add_seed_hosts(hosts),
            NodeCommand::RemoveSeedHost(host) => self.state.remove_seed_host(&host),
            NodeCommand::JoinNetwork => {
                if let Some(outcome) = self.state.join_network() {
                    self.apply(outcome);
                }
            }
            NodeCommand::Peers(reply) => {
                let _ = reply.send(self.state.peer_infos());
            }
            NodeCommand::SeedHosts(reply) => {
                let _ = reply.send(self.state.seed_hosts().to_vec());
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Inbound { stream, addr } => match self.state.admit_inbound(addr) {
                Admission::Accepted { peer_id, link } => {
                    transport::spawn_connection(peer_id, stream, link, self.event_tx.clone());
                }
                Admission::Rejected { peer_id, link } => {
                    transport::spawn_rejected(peer_id, stream, link, self.event_tx.clone());
                }
            },
            TransportEvent::Connected {
                peer_id,
                remote_addr,
            } => self.state.on_connected(&peer_id, remote_addr),
            TransportEvent::Envelope { peer_id, envelope } => {
                self.state.handle_envelope(&peer_id, envelope);
            }
            TransportEvent::Closed { peer_id, reason } => self.state.close_peer(&peer_id, reason),
        }
    }

    fn apply(&mut self, outcome: ConnectOutcome) {
        if let ConnectOutcome::Dial(dial) = outcome {
            transport::spawn_dial(dial, self.connection_timeout, self.event_tx.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            bind_host: "127.0.0.1".to_string(),
            discovery_interval: Duration::from_millis(50),
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_resolves_port_and_host() {
        let node = SwarmNode::spawn(local_config()).await.unwrap();
        assert_ne!(node.port(), 0);
        assert_eq!(node.host(), format!("localhost:{}", node.port()));
        assert!(node.peers().await.unwrap().is_empty());
        node.shutdown();
    }

    #[tokio::test]
    async fn test_create_message_uses_node_id() {
        let node = SwarmNode::spawn(local_config()).await.unwrap();
        let env = node.create_message("chat", serde_json::json!("hi"), true);
        assert_eq!(&env.sender, node.id());
        assert!(env.broadcast);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_seed_host_commands() {
        let mut config = local_config();
        config.seed_hosts = vec!["localhost:1".to_string()];
        let node = SwarmNode::spawn(config).await.unwrap();

        node.add_seed_hosts(vec!["localhost:2".to_string(), "localhost:1".to_string()])
            .await
            .unwrap();
        node.remove_seed_host("localhost:1").await.unwrap();
        assert_eq!(node.seed_hosts().await.unwrap(), vec!["localhost:2".to_string()]);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let node = SwarmNode::spawn(local_config()).await.unwrap();
        node.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        match node.broadcast("chat", serde_json::json!({})).await {
            Err(NetworkError::NotRunning) => {}
            other => panic!("Expected NotRunning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = SwarmNode::spawn(local_config()).await.unwrap();
        let mut config = local_config();
        config.port = first.port();
        assert!(matches!(
            SwarmNode::spawn(config).await,
            Err(NetworkError::Io(_))
        ));
        first.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_self_opens_nothing() {
        let node = SwarmNode::spawn(local_config()).await.unwrap();
        node.connect("localhost", node.port()).await.unwrap();
        assert!(node.peers().await.unwrap().is_empty());
        node.shutdown();
    }

    #[tokio::test]
    async fn test_failed_dial_emits_lost_connection() {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let node = SwarmNode::spawn(local_config()).await.unwrap();
        let mut events = node.subscribe();
        node.connect("127.0.0.1", dead_port).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "lostConnection");
        assert!(node.peers().await.unwrap().is_empty());
        node.shutdown();
    }
}
