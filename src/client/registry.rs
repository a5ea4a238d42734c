use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::{DirectoryEntry, SessionKey};

/// A peer as last reported by the directory.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    ip: IpAddr,
    key_port: u16,
    session_key: Option<SessionKey>,
}

impl PeerEntry {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn key_port(&self) -> u16 {
        self.key_port
    }

    /// The peer session key of the latest rendezvous with this peer.
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }
}

/// The client's snapshot of the directory.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole snapshot. Peer session keys learned from earlier
    /// rendezvous are discarded along with the old entries.
    pub fn refresh(&mut self, entries: Vec<DirectoryEntry>) {
        self.peers = entries
            .into_iter()
            .map(|entry| {
                (
                    entry.name,
                    PeerEntry {
                        ip: entry.ip,
                        key_port: entry.key_port,
                        session_key: None,
                    },
                )
            })
            .collect();
    }

    pub fn get(&self, name: &str) -> Option<&PeerEntry> {
        self.peers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    /// Records the peer session key for `name`. Names missing from the
    /// snapshot are ignored.
    pub fn remember_key(&mut self, name: &str, key: SessionKey) {
        if let Some(entry) = self.peers.get_mut(name) {
            entry.session_key = Some(key);
        }
    }

    pub fn session_key(&self, name: &str) -> Option<&SessionKey> {
        self.peers.get(name)?.session_key()
    }

    /// Every known name except `me`, in sorted order.
    pub fn names_except(&self, me: &str) -> Vec<String> {
        self.peers
            .keys()
            .filter(|name| name.as_str() != me)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, key_port: u16) -> DirectoryEntry {
        DirectoryEntry {
            name: name.to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            key_port,
        }
    }

    #[test]
    fn test_names_exclude_self() {
        let mut peers = PeerRegistry::new();
        peers.refresh(vec![entry("carol", 3), entry("alice", 1), entry("bob", 2)]);

        assert_eq!(peers.len(), 3);
        assert_eq!(peers.names_except("alice"), vec!["bob", "carol"]);
        assert_eq!(peers.get("bob").unwrap().key_port(), 2);
    }

    #[test]
    fn test_refresh_discards_learned_keys() {
        let mut peers = PeerRegistry::new();
        peers.refresh(vec![entry("bob", 2)]);
        peers.remember_key("bob", SessionKey::random().unwrap());
        assert!(peers.session_key("bob").is_some());

        peers.refresh(vec![entry("bob", 2)]);
        assert!(peers.session_key("bob").is_none());
    }

    #[test]
    fn test_remember_key_ignores_unknown_names() {
        let mut peers = PeerRegistry::new();
        peers.remember_key("mallory", SessionKey::random().unwrap());
        assert!(peers.is_empty());
        assert!(!peers.contains("mallory"));
    }
}
