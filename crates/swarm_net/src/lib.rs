//! Swarm Net — a self-organizing peer-to-peer flooding network.
//!
//! Every node is both a server and a client. Nodes find each other through
//! seed hosts, gossip the hosts they know about, and flood application
//! messages across the whole mesh with duplicate suppression.
//!
//! # Architecture
//!
//! - **Transport**: plain TCP, one connection per peer, newline-delimited
//!   JSON frames (see [`codec`]).
//! - **Discovery**: seed-host gossip (`hosts?` / `hosts!`) plus a periodic
//!   join-network round that dials random seeds while under `min_peers`.
//! - **Flooding**: broadcast envelopes are relayed to every peer once, with
//!   a hop counter and a seen-ledger of message ids.
//! - **Events**: connection lifecycle and application messages are
//!   published on a broadcast channel (see [`NodeEvent`]).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use swarm_net::{NetworkConfig, SwarmNode};
//!
//! # async fn example() -> Result<(), swarm_net::NetworkError> {
//! let mut config = NetworkConfig::default();
//! config.seed_hosts = vec!["localhost:4000".to_string()];
//!
//! let node = SwarmNode::spawn(config).await?;
//! let mut events = node.subscribe();
//! node.broadcast("chat", serde_json::json!({ "text": "hello" })).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.name());
//! }
//! node.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod message;
pub mod node;
pub mod peer;
pub mod state;
mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use codec::EnvelopeCodec;
pub use config::NetworkConfig;
pub use error::NetworkError;
pub use events::{AppMessage, DiagnosticSink, NodeEvent};
pub use identity::{NodeId, PeerId};
pub use message::{ControlCommand, Envelope};
pub use node::SwarmNode;
pub use peer::{Direction, PeerInfo, PeerState};
