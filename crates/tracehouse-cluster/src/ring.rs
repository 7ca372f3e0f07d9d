//! Consistent hash ring
//!
//! Every endpoint is placed on a 64-bit ring at `virtual_nodes` points. A key
//! maps to the first point clockwise from its own hash, wrapping at the top:
//!
//! ```text
//!        0 ──── a#3 ──── b#0 ──── a#1 ──── b#2 ──── u64::MAX
//!                  ▲
//!             hash("svc-1") lands here, owned by b
//! ```
//!
//! Adding or removing one endpoint only moves the keys that fall between its
//! points and their predecessors.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::membership::RemoteAddress;

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: BTreeMap<u64, usize>,
}

impl HashRing {
    /// Place every endpoint at `virtual_nodes` points. Values are indexes
    /// into `endpoints`.
    pub fn build(endpoints: &[RemoteAddress], virtual_nodes: usize) -> Self {
        let mut points = BTreeMap::new();
        for (index, endpoint) in endpoints.iter().enumerate() {
            for vnode in 0..virtual_nodes.max(1) {
                points.insert(hash_key(&format!("{endpoint}#{vnode}")), index);
            }
        }
        Self { points }
    }

    /// Index of the endpoint owning `key`, or `None` on an empty ring.
    pub fn locate(&self, key: &str) -> Option<usize> {
        let hash = hash_key(key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, index)| *index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// First 8 bytes of the SHA-256 digest, big-endian.
pub fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(ports: &[u16]) -> Vec<RemoteAddress> {
        ports.iter().map(|p| RemoteAddress::new("10.0.0.1", *p)).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::build(&[], 16);
        assert!(ring.is_empty());
        assert_eq!(ring.locate("svc"), None);
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_key("service-a"), hash_key("service-a"));
        assert_ne!(hash_key("service-a"), hash_key("service-b"));
    }

    #[test]
    fn test_same_membership_same_owner() {
        let endpoints = addrs(&[1, 2, 3]);
        let first = HashRing::build(&endpoints, 64);
        let second = HashRing::build(&endpoints, 64);

        for i in 0..500 {
            let key = format!("service-{i}");
            assert_eq!(first.locate(&key), second.locate(&key));
        }
    }

    #[test]
    fn test_adding_endpoint_moves_few_keys() {
        let before = addrs(&[1, 2, 3]);
        let mut after = before.clone();
        after.push(RemoteAddress::new("10.0.0.1", 4));

        let old = HashRing::build(&before, 100);
        let new = HashRing::build(&after, 100);

        let mut moved = 0;
        for i in 0..1000 {
            let key = format!("service-{i}");
            let (Some(a), Some(b)) = (old.locate(&key), new.locate(&key)) else {
                panic!("ring should not be empty");
            };
            if before[a] != after[b] {
                moved += 1;
                // Keys only ever move onto the new endpoint
                assert_eq!(b, 3);
            }
        }
        // Roughly a quarter should move; allow a wide margin
        assert!(moved > 100 && moved < 450, "moved {moved} of 1000");
    }
}
