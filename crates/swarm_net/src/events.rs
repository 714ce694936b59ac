//! Events published by a node to the embedding application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::peer::PeerInfo;

/// An application-level message received from a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMessage {
    /// Message id.
    pub id: String,
    /// Application command.
    pub command: String,
    pub payload: serde_json::Value,
    /// Connection the message arrived on.
    pub peer: PeerInfo,
    /// Relay count as received; `None` for direct sends.
    pub hops: Option<u32>,
    /// Node that created the message.
    pub sender: NodeId,
    pub received_at: DateTime<Utc>,
}

/// Lifecycle and application events emitted by a node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// An outbound connection was established.
    NewOutgoingConnection { peer: PeerInfo },
    /// An outbound connection was closed by the remote.
    LostOutgoingConnection { peer: PeerInfo },
    /// A connection failed, errored, or was dropped for misbehaving.
    LostConnection { peer: PeerInfo },
    /// An application command arrived.
    Message(AppMessage),
}

impl NodeEvent {
    /// Name of the event. Application messages are named after their command.
    pub fn name(&self) -> &str {
        match self {
            Self::NewOutgoingConnection { .. } => "newOutgoingConnection",
            Self::LostOutgoingConnection { .. } => "lostOutgoingConnection",
            Self::LostConnection { .. } => "lostConnection",
            Self::Message(message) => &message.command,
        }
    }

    /// The peer the event concerns.
    pub fn peer(&self) -> &PeerInfo {
        match self {
            Self::NewOutgoingConnection { peer }
            | Self::LostOutgoingConnection { peer }
            | Self::LostConnection { peer } => peer,
            Self::Message(message) => &message.peer,
        }
    }
}

/// Receives free-form diagnostic lines about broadcast and receive activity.
pub type DiagnosticSink = std::sync::Arc<dyn Fn(&str) + Send + Sync>;
