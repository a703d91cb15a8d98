use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::endpoint::Endpoint;

/// Endpoints at which peers were recently seen by rendezvous peers, keyed by peer id hash. Entries
///  expire after a fixed time to live.
pub struct ReachabilityCache {
    ttl: Duration,
    entries: FxHashMap<u16, (Vec<Endpoint>, Instant)>,
}

impl ReachabilityCache {
    pub fn new(ttl: Duration) -> ReachabilityCache {
        ReachabilityCache {
            ttl,
            entries: FxHashMap::default(),
        }
    }

    /// adds endpoints for a peer, refreshing the expiry of the whole entry
    pub fn insert(&mut self, peerid_hash: u16, endpoints: &[Endpoint], now: Instant) {
        let expires = now + self.ttl;

        let (known, expiry) = self.entries.entry(peerid_hash)
            .or_insert_with(|| (Vec::new(), expires));
        if *expiry <= now {
            known.clear();
        }
        for endpoint in endpoints {
            if !known.contains(endpoint) {
                known.push(*endpoint);
            }
        }
        *expiry = expires;
        trace!("peer {:04x} reachable at {:?}", peerid_hash, known);
    }

    pub fn get(&self, peerid_hash: u16, now: Instant) -> Vec<Endpoint> {
        match self.entries.get(&peerid_hash) {
            Some((endpoints, expiry)) if *expiry > now => endpoints.clone(),
            _ => Vec::new(),
        }
    }

    pub fn purge_expired(&mut self, now: Instant) {
        self.entries.retain(|_, (_, expiry)| *expiry > now);
    }
}
