//! Transport session cache (C8): `peer_key -> ephemeral session address`,
//! reused across requests until a `PING` fails to draw a `PONG` inside
//! the liveness window.
//!
//! Structurally modeled on `sync_session.rs`'s plain record-with-explicit-
//! timestamps shape, adapted from playback-session liveness to
//! transport-session liveness.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long the client waits for a `PONG` before discarding a cached
/// session and re-handshaking (spec §4.8).
pub const SESSION_PING_TIMEOUT: Duration = Duration::from_millis(200);

/// Server-side per-session inactivity timeout (spec §4.8).
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct CachedSession {
    pub addr: SocketAddr,
    pub established_at: Instant,
}

/// `peer_key -> session_addr`. One mutex, no nested locking (spec §5).
#[derive(Debug, Default)]
pub struct SessionCache {
    sessions: Mutex<HashMap<String, CachedSession>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_key: &str) -> Option<CachedSession> {
        self.sessions.lock().unwrap().get(peer_key).copied()
    }

    pub fn insert(&self, peer_key: &str, addr: SocketAddr) {
        self.sessions.lock().unwrap().insert(
            peer_key.to_string(),
            CachedSession {
                addr,
                established_at: Instant::now(),
            },
        );
    }

    pub fn discard(&self, peer_key: &str) {
        self.sessions.lock().unwrap().remove(peer_key);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
