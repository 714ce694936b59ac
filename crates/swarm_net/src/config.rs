//! Network configuration for a swarm node.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::NetworkError;

/// Configuration for the swarm networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface the TCP listener binds to.
    pub bind_host: String,

    /// Hostname advertised in this node's `host` string. Only used for the
    /// self-connection check, so it should match what peers gossip about us.
    pub hostname: String,

    /// Listen port. `0` picks an ephemeral port when the listener binds.
    pub port: u16,

    /// Bootstrap `hostname:port` list.
    pub seed_hosts: Vec<String>,

    /// Below this many peers the node keeps dialling seed hosts.
    pub min_peers: usize,

    /// Inbound connections beyond this many peers are turned away.
    pub max_peers: usize,

    /// Interval of the join-network maintenance tick.
    #[serde(with = "duration_ms_serde")]
    pub discovery_interval: Duration,

    /// Timeout for establishing an outbound connection.
    #[serde(with = "duration_ms_serde")]
    pub connection_timeout: Duration,

    /// Maximum number of message ids remembered for deduplication.
    /// `None` keeps every id for the lifetime of the node.
    pub ledger_capacity: Option<usize>,

    /// Buffer size of the event channel handed to subscribers.
    pub event_capacity: usize,

    /// Frames that may wait for one peer's writer. A peer that falls this
    /// far behind is dropped.
    pub outbox_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            hostname: "localhost".to_string(),
            port: 0,
            seed_hosts: Vec::new(),
            min_peers: 3,
            max_peers: 10,
            discovery_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(10),
            ledger_capacity: None,
            event_capacity: 256,
            outbox_capacity: 1024,
        }
    }
}

impl NetworkConfig {
    /// Write the config as pretty JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Read a config file. Keys missing from the file take their defaults.
    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// [`load`](Self::load), falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(NetworkError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), "Ignoring config file: {e}");
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
