//! Consistent-hash ring over the static peer set.
//!
//! Each peer is projected onto the ring as a set of virtual nodes so
//! ownership spreads evenly and barely moves when the peer set changes.
//! Peers are hashed by identity (their URL), so every node of the
//! cluster builds the same ring regardless of peer ordering.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Virtual nodes projected per peer.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Maps cache keys to their owning peer.
pub struct PeerRing {
    /// Peer identities, `http://host:port`
    peers: Vec<String>,

    /// Ring position to peer index
    ring: BTreeMap<u64, usize>,

    /// Index of the local node within `peers`
    self_index: usize,
}

impl PeerRing {
    /// Build a ring from the peer set.
    ///
    /// `self_url` is added to the set if absent, so an empty peer list
    /// yields a single-node ring that owns every key.
    pub fn new(self_url: &str, peers: &[String], virtual_nodes: usize) -> Self {
        let mut all: Vec<String> = peers
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect();
        let self_index = match all.iter().position(|p| p == self_url) {
            Some(index) => index,
            None => {
                all.push(self_url.to_string());
                all.len() - 1
            }
        };

        // At least one virtual node per peer keeps the ring non-empty.
        let virtual_nodes = virtual_nodes.max(1);
        let mut ring = BTreeMap::new();
        for (index, peer) in all.iter().enumerate() {
            for node in 0..virtual_nodes {
                ring.insert(hash_of(&format!("{}#{}", peer, node)), index);
            }
        }

        Self {
            peers: all,
            ring,
            self_index,
        }
    }

    /// The peer owning `key`.
    pub fn owner(&self, key: &str) -> &str {
        &self.peers[self.owner_index(key)]
    }

    /// Whether the local node owns `key`.
    pub fn is_local(&self, key: &str) -> bool {
        self.owner_index(key) == self.self_index
    }

    fn owner_index(&self, key: &str) -> usize {
        let hash = hash_of(key);
        // First virtual node at or after the key's position, wrapping
        // around to the ring start.
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, index)| *index)
            .expect("ring is never empty")
    }
}

fn hash_of(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_node_owns_everything() {
        let ring = PeerRing::new("http://127.0.0.1:8080", &[], DEFAULT_VIRTUAL_NODES);
        assert!(ring.is_local("read_likes"));
        assert!(ring.is_local("write_likes"));
        assert_eq!(ring.owner("read_likes"), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_ownership_is_deterministic() {
        let peers = vec![
            "http://a:8080".to_string(),
            "http://b:8080".to_string(),
            "http://c:8080".to_string(),
        ];
        let ring = PeerRing::new("http://a:8080", &peers, DEFAULT_VIRTUAL_NODES);
        let owner = ring.owner("read_likes").to_string();
        for _ in 0..10 {
            assert_eq!(ring.owner("read_likes"), owner);
        }
    }

    #[test]
    fn test_rings_agree_across_nodes() {
        let peers = vec![
            "http://a:8080".to_string(),
            "http://b:8080".to_string(),
            "http://c:8080".to_string(),
        ];
        let mut reordered = peers.clone();
        reordered.rotate_left(1);

        let on_a = PeerRing::new("http://a:8080", &peers, DEFAULT_VIRTUAL_NODES);
        let on_b = PeerRing::new("http://b:8080", &reordered, DEFAULT_VIRTUAL_NODES);

        for key in ["read_likes", "write_likes", "shadow", "migrate_users"] {
            assert_eq!(on_a.owner(key), on_b.owner(key));
        }
    }

    #[test]
    fn test_keys_spread_across_peers() {
        let peers: Vec<String> = (0..4).map(|i| format!("http://peer{}:8080", i)).collect();
        let ring = PeerRing::new("http://peer0:8080", &peers, DEFAULT_VIRTUAL_NODES);

        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(ring.owner(&format!("fanout_{}", i)).to_string());
        }
        assert!(seen.len() > 1, "all keys landed on one peer");
    }
}
