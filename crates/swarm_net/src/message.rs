//! Network message protocol — envelopes and the reserved control commands.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Request for the remote's listening port.
pub const PORT_REQUEST: &str = "port?";
/// Reply carrying the sender's listening port.
pub const PORT_REPLY: &str = "port!";
/// Request for the remote's seed-host list.
pub const HOSTS_REQUEST: &str = "hosts?";
/// Reply carrying a list of `hostname:port` strings.
pub const HOSTS_REPLY: &str = "hosts!";

/// The four reserved discovery commands. Every other command string is
/// application-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    PortRequest,
    PortReply,
    HostsRequest,
    HostsReply,
}

impl ControlCommand {
    /// Parse a command string, returning `None` for application commands.
    pub fn parse(command: &str) -> Option<Self> {
        match command {
            PORT_REQUEST => Some(Self::PortRequest),
            PORT_REPLY => Some(Self::PortReply),
            HOSTS_REQUEST => Some(Self::HostsRequest),
            HOSTS_REPLY => Some(Self::HostsReply),
            _ => None,
        }
    }

    /// The wire name of this command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortRequest => PORT_REQUEST,
            Self::PortReply => PORT_REPLY,
            Self::HostsRequest => HOSTS_REQUEST,
            Self::HostsReply => HOSTS_REPLY,
        }
    }
}

/// A network message envelope.
///
/// `sender` is the node that created the message; relaying nodes leave it
/// alone and only bump `hops`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message identifier (UUID v4), fresh for every send.
    pub id: String,
    /// Originating node.
    pub sender: NodeId,
    /// Command name. Missing on the wire decodes as empty, which the
    /// receive pipeline rejects.
    #[serde(default)]
    pub command: String,
    /// Payload, interpreted according to `command`.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Whether receivers should flood this envelope onward.
    #[serde(default)]
    pub broadcast: bool,
    /// Number of relays so far. Absent on freshly created envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops: Option<u32>,
}

impl Envelope {
    /// Create a new envelope with a fresh id.
    pub fn new(
        sender: NodeId,
        command: impl Into<String>,
        payload: serde_json::Value,
        broadcast: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            command: command.into(),
            payload,
            broadcast,
            hops: None,
        }
    }

    /// Copy of this envelope with the hop count advanced by one. The count
    /// comes off the wire, so it saturates at `u32::MAX`.
    pub fn relayed(&self) -> Self {
        Self {
            hops: Some(self.hops.unwrap_or(0).saturating_add(1)),
            ..self.clone()
        }
    }

    /// The control command carried, if any.
    pub fn control(&self) -> Option<ControlCommand> {
        ControlCommand::parse(&self.command)
    }

    /// Serialize the envelope to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
