//! Peer record and peer map (§3 "Peer record"): created on first
//! heartbeat from a foreign node, mutated on each heartbeat, evicted
//! after the liveness timeout.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 5_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub node_id: String,
    pub ip: Ipv4Addr,
    pub sync_port: u16,
    pub is_self: bool,
    pub is_master: bool,
    pub last_seen_ms: u64,
    pub is_syncing: bool,
    pub sync_progress: f32,
    pub sync_filename: Option<String>,
}

impl Peer {
    pub fn new_self(node_id: String, ip: Ipv4Addr, sync_port: u16) -> Self {
        Self {
            node_id,
            ip,
            sync_port,
            is_self: true,
            is_master: false,
            last_seen_ms: now_ms(),
            is_syncing: false,
            sync_progress: 0.0,
            sync_filename: None,
        }
    }
}

/// Heartbeat facts upserted into a peer record on each received frame.
#[derive(Debug, Clone)]
pub struct HeartbeatInfo {
    pub node_id: String,
    pub ip: Ipv4Addr,
    pub sync_port: u16,
    pub is_master: bool,
    pub is_syncing: bool,
    pub sync_progress: f32,
    pub sync_filename: Option<String>,
}

/// Mutex-protected peer map, one lock for the whole collection (spec §5
/// "no nested locking; holders never perform IO while holding a lock").
#[derive(Debug, Default)]
pub struct PeerMap {
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_self(&self, peer: Peer) {
        self.peers.lock().unwrap().insert(peer.node_id.clone(), peer);
    }

    /// Upsert from a received heartbeat. Caller is responsible for the
    /// sender_id == self loopback check before calling this (spec §4.5).
    pub fn upsert_heartbeat(&self, info: HeartbeatInfo) {
        let mut peers = self.peers.lock().unwrap();
        let entry = peers.entry(info.node_id.clone()).or_insert_with(|| Peer {
            node_id: info.node_id.clone(),
            ip: info.ip,
            sync_port: info.sync_port,
            is_self: false,
            is_master: false,
            last_seen_ms: 0,
            is_syncing: false,
            sync_progress: 0.0,
            sync_filename: None,
        });
        entry.ip = info.ip;
        entry.sync_port = info.sync_port;
        entry.is_master = info.is_master;
        entry.is_syncing = info.is_syncing;
        entry.sync_progress = info.sync_progress;
        entry.sync_filename = info.sync_filename;
        entry.last_seen_ms = now_ms();
    }

    /// Evict peers unseen for more than `timeout_ms`. Returns the evicted
    /// node IDs, so callers can clear any per-peer convergence state.
    pub fn evict_stale(&self, timeout_ms: u64) -> Vec<String> {
        let now = now_ms();
        let mut peers = self.peers.lock().unwrap();
        let stale: Vec<String> = peers
            .values()
            .filter(|p| !p.is_self && now.saturating_sub(p.last_seen_ms) > timeout_ms)
            .map(|p| p.node_id.clone())
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }

    /// Snapshot of all known peers, taken under the lock and released
    /// immediately (spec §5: "sync engine sees a consistent snapshot ...
    /// captured under the state mutex").
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    pub fn snapshot_foreign(&self) -> Vec<Peer> {
        self.snapshot().into_iter().filter(|p| !p.is_self).collect()
    }

    pub fn get(&self, node_id: &str) -> Option<Peer> {
        self.peers.lock().unwrap().get(node_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hb(id: &str) -> HeartbeatInfo {
        HeartbeatInfo {
            node_id: id.to_string(),
            ip: Ipv4Addr::new(192, 168, 1, 10),
            sync_port: 40000,
            is_master: false,
            is_syncing: false,
            sync_progress: 0.0,
            sync_filename: None,
        }
    }

    #[test]
    fn first_heartbeat_creates_record() {
        let map = PeerMap::new();
        map.upsert_heartbeat(hb("BBBBBBBB"));
        let peer = map.get("BBBBBBBB").unwrap();
        assert!(!peer.is_self);
        assert!(peer.last_seen_ms > 0);
    }

    #[test]
    fn repeated_heartbeat_updates_not_duplicates() {
        let map = PeerMap::new();
        map.upsert_heartbeat(hb("BBBBBBBB"));
        map.upsert_heartbeat(hb("BBBBBBBB"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn stale_peer_evicted_self_never_evicted() {
        let map = PeerMap::new();
        map.insert_self(Peer::new_self(
            "AAAAAAAA".to_string(),
            Ipv4Addr::LOCALHOST,
            1,
        ));
        let mut info = hb("BBBBBBBB");
        info.node_id = "BBBBBBBB".to_string();
        map.upsert_heartbeat(info);

        // Force staleness by reaching directly into the map.
        {
            let mut peers = map.peers.lock().unwrap();
            peers.get_mut("BBBBBBBB").unwrap().last_seen_ms = 0;
        }

        let evicted = map.evict_stale(DEFAULT_LIVENESS_TIMEOUT_MS);
        assert_eq!(evicted, vec!["BBBBBBBB".to_string()]);
        assert!(map.get("AAAAAAAA").is_some());
        assert!(map.get("BBBBBBBB").is_none());
    }
}
