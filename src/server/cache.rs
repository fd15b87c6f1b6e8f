//! Per-identifier cache of emitted response datagrams.
//!
//! The responder retains the exact bytes it sent for a short window so
//! NACK/ACK retransmits are bit-identical to the originals: same tag,
//! same nonce. Entries refresh on re-emission and age out on the sweep.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::chunk::ChunkPlan;

/// One cached response, addressable by head index and body sequence.
pub struct CachedResponse {
    /// Head datagrams indexed by head-chunk index.
    pub head: Vec<Vec<u8>>,
    /// Body datagrams indexed by sequence (parity last, if any).
    pub body: Vec<Vec<u8>>,
    /// Peer the response was sent to; retransmits go nowhere else.
    pub peer: SocketAddr,
    expires_at_ms: u64,
}

impl CachedResponse {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }
}

/// Identifier-keyed response cache with TTL age-out.
pub struct ResponseCache {
    ttl_ms: u64,
    entries: HashMap<u64, CachedResponse>,
}

impl ResponseCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: HashMap::new(),
        }
    }

    /// Store the unique datagrams of a freshly chunked response.
    pub fn insert(&mut self, identifier: u64, plan: ChunkPlan, peer: SocketAddr, now_ms: u64) {
        self.entries.insert(
            identifier,
            CachedResponse {
                head: plan.head,
                body: plan.body,
                peer,
                expires_at_ms: now_ms.saturating_add(self.ttl_ms),
            },
        );
    }

    /// Look up a live entry, refreshing its retention window.
    pub fn touch(&mut self, identifier: u64, now_ms: u64) -> Option<&CachedResponse> {
        let expired = self.entries.get(&identifier)?.is_expired(now_ms);
        if expired {
            self.entries.remove(&identifier);
            return None;
        }
        let ttl_ms = self.ttl_ms;
        let entry = self.entries.get_mut(&identifier).expect("presence checked");
        entry.expires_at_ms = now_ms.saturating_add(ttl_ms);
        Some(&*entry)
    }

    pub fn contains(&self, identifier: u64, now_ms: u64) -> bool {
        self.entries
            .get(&identifier)
            .map(|e| !e.is_expired(now_ms))
            .unwrap_or(false)
    }

    pub fn remove(&mut self, identifier: u64) {
        self.entries.remove(&identifier);
    }

    /// Drop entries past their retention window.
    pub fn sweep(&mut self, now_ms: u64) {
        self.entries.retain(|_, entry| !entry.is_expired(now_ms));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_response, ChunkOptions};
    use crate::wire::PskKey;

    fn plan() -> ChunkPlan {
        chunk_response(
            200,
            &[],
            &[7u8; 3000],
            1,
            0,
            &ChunkOptions::default(),
            &PskKey::new(b"k"),
        )
        .unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn test_insert_touch_and_expiry() {
        let mut cache = ResponseCache::new(5_000);
        cache.insert(1, plan(), peer(), 1_000);
        assert!(cache.contains(1, 1_000));
        assert!(cache.touch(1, 4_000).is_some());
        // Touch refreshed the window past the original expiry.
        assert!(cache.touch(1, 8_000).is_some());
        assert!(cache.touch(1, 20_000).is_none());
        assert!(!cache.contains(1, 20_000));
    }

    #[test]
    fn test_sweep_evicts_expired_entries() {
        let mut cache = ResponseCache::new(5_000);
        cache.insert(1, plan(), peer(), 1_000);
        cache.insert(2, plan(), peer(), 9_000);
        cache.sweep(7_000);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(2, 7_000));
    }

    #[test]
    fn test_remove_discards_entry() {
        let mut cache = ResponseCache::new(5_000);
        cache.insert(1, plan(), peer(), 1_000);
        cache.remove(1);
        assert!(cache.is_empty());
    }
}
