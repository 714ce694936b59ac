//! Seed-host bookkeeping for gossip-based peer discovery.
//!
//! Nodes exchange their seed lists through `hosts?` / `hosts!` and learn
//! each other's listening ports through `port?` / `port!`. The resulting set
//! is what `join_network` samples from when the node is under its peer
//! target.

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Insertion-ordered set of `hostname:port` strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeedHosts {
    hosts: Vec<String>,
}

impl SeedHosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `hosts` into the set. Returns how many were new.
    pub fn extend<I, S>(&mut self, hosts: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for host in hosts {
            let host = host.into();
            if host.is_empty() || self.hosts.contains(&host) {
                continue;
            }
            self.hosts.push(host);
            added += 1;
        }
        added
    }

    /// Remove a single host. Unknown hosts are ignored.
    pub fn remove(&mut self, host: &str) -> bool {
        match self.hosts.iter().position(|h| h == host) {
            Some(index) => {
                self.hosts.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }

    /// Pick one host uniformly at random.
    pub fn choose_random(&self) -> Option<&str> {
        self.hosts.choose(&mut rand::rng()).map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.hosts
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.hosts.clone()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for SeedHosts {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

/// Join a hostname and port into the host-string form used on the wire.
pub fn format_host(hostname: &str, port: u16) -> String {
    format!("{hostname}:{port}")
}

/// Split `hostname:port` at the last colon.
pub fn split_host(host: &str) -> Result<(String, u16), NetworkError> {
    let (hostname, port) = host
        .rsplit_once(':')
        .ok_or_else(|| NetworkError::InvalidHost(host.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| NetworkError::InvalidHost(host.to_string()))?;
    Ok((hostname.to_string(), port))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_extend_is_set_union() {
        let mut seeds = SeedHosts::from_iter(["localhost:1", "localhost:2"]);
        let added = seeds.extend(["localhost:2", "localhost:3", "localhost:3"]);
        assert_eq!(added, 1);
        assert_eq!(seeds.as_slice(), ["localhost:1", "localhost:2", "localhost:3"]);
    }

    #[test]
    fn test_remove_single_entry() {
        let mut seeds = SeedHosts::from_iter(["a:1", "b:2", "c:3"]);
        assert!(seeds.remove("b:2"));
        assert!(!seeds.remove("b:2"));
        assert!(!seeds.remove(""));
        assert_eq!(seeds.as_slice(), ["a:1", "c:3"]);
    }

    #[test]
    fn test_choose_random_covers_all_hosts() {
        let seeds = SeedHosts::from_iter(["a:1", "b:2", "c:3"]);
        let mut seen = HashSet::new();
        for _ in 0..500 {
            seen.insert(seeds.choose_random().unwrap().to_string());
        }
        assert_eq!(seen.len(), 3);
        assert!(SeedHosts::new().choose_random().is_none());
    }

    #[test]
    fn test_split_host_uses_last_colon() {
        assert_eq!(split_host("localhost:9000").unwrap(), ("localhost".to_string(), 9000));
        assert_eq!(split_host("::1:9000").unwrap(), ("::1".to_string(), 9000));
        assert!(matches!(split_host("nohost"), Err(NetworkError::InvalidHost(_))));
        assert!(matches!(split_host("host:port"), Err(NetworkError::InvalidHost(_))));
    }

    #[test]
    fn test_seed_hosts_serialize_as_list() {
        let seeds = SeedHosts::from_iter(["a:1"]);
        assert_eq!(serde_json::to_value(&seeds).unwrap(), serde_json::json!(["a:1"]));
    }
}
