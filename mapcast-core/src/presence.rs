//! Presence service (C5): periodic UDP broadcast heartbeat, plus a
//! concurrent receive loop that maintains the live peer map.
//!
//! Socket setup (bind-for-broadcast with `SO_BROADCAST`, a separate
//! `SO_REUSEADDR` receive socket) is grounded on
//! `93e2c7cc_Dr1mH4X-RustSyncCV-Client_.../lan-discovery.rs`
//! (other_examples) — the teacher's networking stack is entirely
//! HTTP/Axum and has no UDP broadcast idiom to draw from.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use crate::content::safe_resolve;
use crate::context::NodeContext;
use crate::document::MappingDocument;
use crate::hash::HashCache;
use crate::peer::{HeartbeatInfo, PeerMap, DEFAULT_LIVENESS_TIMEOUT_MS};
use crate::shutdown::ShutdownHandle;
use crate::wire::{
    self, EndpointBody, FileChunkBody, FileEndBody, FileOfferBody, FileReceiver, HeartbeatBody,
    Message, PointEditBody,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const RECV_BUF_SIZE: usize = 2048;

/// Chunk payload size for a pushed `FILE_CHUNK`, comfortably under a LAN
/// MTU once the frame header and chunk header are added (spec §4.6).
const FILE_PUSH_CHUNK_SIZE: usize = 1024;

/// Shared status this node advertises in its own heartbeats.
#[derive(Debug, Clone, Default)]
pub struct SelfSyncStatus {
    pub is_syncing: bool,
    pub progress: f32,
    pub filename: Option<String>,
}

fn bind_broadcast_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    UdpSocket::from_std(socket.into())
}

fn bind_receive_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    UdpSocket::from_std(socket.into())
}

/// Presence service: owns the broadcast-send and receive tasks, plus
/// liveness eviction.
///
/// This is also where C6 (the control-plane messenger) demultiplexes,
/// since spec §6 puts heartbeat/announce/point-edit/snapshot/file-push
/// frames on the same well-known UDP port — one receive loop, one socket,
/// one decode-then-dispatch switch (spec §4.6).
pub struct PresenceService {
    ctx: Arc<NodeContext>,
    peers: Arc<PeerMap>,
    status: Arc<std::sync::Mutex<SelfSyncStatus>>,
    document: Arc<std::sync::Mutex<MappingDocument>>,
    file_receiver: Arc<FileReceiver>,
    hasher: Arc<HashCache>,
    recv_socket: Arc<UdpSocket>,
    send_socket: Arc<UdpSocket>,
    liveness_timeout_ms: u64,
}

impl PresenceService {
    pub fn bind(
        ctx: Arc<NodeContext>,
        peers: Arc<PeerMap>,
        document: Arc<std::sync::Mutex<MappingDocument>>,
        file_receiver: Arc<FileReceiver>,
        hasher: Arc<HashCache>,
    ) -> crate::error::Result<Self> {
        let recv_socket = bind_receive_socket(ctx.presence_port).map_err(|e| {
            crate::error::MapcastError::BindFailed {
                port: ctx.presence_port,
                source: e,
            }
        })?;
        let send_socket = bind_broadcast_socket()?;

        Ok(Self {
            ctx,
            peers,
            status: Arc::new(std::sync::Mutex::new(SelfSyncStatus::default())),
            document,
            file_receiver,
            hasher,
            recv_socket: Arc::new(recv_socket),
            send_socket: Arc::new(send_socket),
            liveness_timeout_ms: DEFAULT_LIVENESS_TIMEOUT_MS,
        })
    }

    /// Override the liveness timeout used by [`Self::evict_stale`] (default
    /// 5s, spec §4.5). The binary crate threads its
    /// `Config::liveness_timeout` through here; tests use the 5s default.
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn set_sync_status(&self, status: SelfSyncStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn heartbeat_message(&self) -> Message {
        let status = self.status.lock().unwrap().clone();
        Message::Heartbeat(HeartbeatBody {
            is_master: self.ctx.role.is_master(),
            sync_ip: self.ctx.preferred_ip,
            sync_port: self.ctx.transport_port,
            is_syncing: status.is_syncing,
            sync_progress: status.progress,
            sync_filename: status.filename,
        })
    }

    /// Broadcast one `ANNOUNCE` so peers learn our sync endpoint without
    /// waiting a full heartbeat interval (spec §4.5 bootstrap handshake).
    pub async fn announce(&self) {
        let msg = Message::Announce(EndpointBody {
            ip: self.ctx.preferred_ip,
            port: self.ctx.transport_port,
        });
        let bytes = wire::encode(&self.ctx.node_id, &msg);
        let dest = SocketAddr::from((self.ctx.broadcast_ip, self.ctx.presence_port));
        if let Err(e) = self.send_socket.send_to(&bytes, dest).await {
            warn!("presence: failed to send ANNOUNCE: {}", e);
        }
    }

    /// Broadcast a `POINT_EDIT` delta. No-op (and logged) if this node is
    /// not currently `master` — role enforcement is local to the sender
    /// as well as the receiver (spec §4.6).
    pub async fn send_point_edit(&self, body: PointEditBody) {
        if !self.ctx.role.is_master() {
            debug!("presence: dropping POINT_EDIT send, not master");
            return;
        }
        let bytes = wire::encode(&self.ctx.node_id, &Message::PointEdit(body));
        let dest = SocketAddr::from((self.ctx.broadcast_ip, self.ctx.presence_port));
        if let Err(e) = self.send_socket.send_to(&bytes, dest).await {
            warn!("presence: POINT_EDIT send failed: {}", e);
        }
    }

    /// Broadcast a full `STRUCTURE_SNAPSHOT`. Every mouse release
    /// triggers one of these, superseding any point-edit deltas lost in
    /// transit (spec §4.6 self-healing).
    pub async fn send_structure_snapshot(&self, document_bytes: Vec<u8>) {
        if !self.ctx.role.is_master() {
            debug!("presence: dropping STRUCTURE_SNAPSHOT send, not master");
            return;
        }
        let bytes = wire::encode(&self.ctx.node_id, &Message::StructureSnapshot(document_bytes));
        let dest = SocketAddr::from((self.ctx.broadcast_ip, self.ctx.presence_port));
        if let Err(e) = self.send_socket.send_to(&bytes, dest).await {
            warn!("presence: STRUCTURE_SNAPSHOT send failed: {}", e);
        }
    }

    /// Best-effort push of a changed media file: broadcast `FILE_OFFER`,
    /// then the file in `FILE_PUSH_CHUNK_SIZE` chunks, then `FILE_END`
    /// (spec §4.6). This is the low-latency complement to C7/C8's
    /// periodic LIST/GET/PUT reconciliation, not a replacement for it —
    /// a dropped push is silently repaired by the next convergence cycle.
    /// No-op (and logged) if this node is not currently `master`, same
    /// role gating as `send_point_edit`/`send_structure_snapshot`.
    pub async fn push_file(&self, rel_path: &str) {
        if !self.ctx.role.is_master() {
            debug!("presence: dropping file push, not master");
            return;
        }
        let Some(path) = safe_resolve(&self.ctx.videos_root(), rel_path) else {
            warn!("presence: refusing to push path-escaping {:?}", rel_path);
            return;
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("presence: file push of {} aborted, read failed: {}", rel_path, e);
                return;
            }
        };
        let digest = match self.hasher.digest(&path) {
            Ok(digest) => digest,
            Err(e) => {
                debug!("presence: file push of {} aborted, hash failed: {}", rel_path, e);
                return;
            }
        };

        let dest = SocketAddr::from((self.ctx.broadcast_ip, self.ctx.presence_port));
        let offer = Message::FileOffer(FileOfferBody {
            total_size: bytes.len() as u64,
            digest,
            name: rel_path.to_string(),
        });
        if let Err(e) = self
            .send_socket
            .send_to(&wire::encode(&self.ctx.node_id, &offer), dest)
            .await
        {
            warn!("presence: FILE_OFFER send failed: {}", e);
            return;
        }

        for (i, chunk) in bytes.chunks(FILE_PUSH_CHUNK_SIZE).enumerate() {
            let body = Message::FileChunk(FileChunkBody {
                offset: (i * FILE_PUSH_CHUNK_SIZE) as u64,
                payload: chunk.to_vec(),
            });
            if let Err(e) = self
                .send_socket
                .send_to(&wire::encode(&self.ctx.node_id, &body), dest)
                .await
            {
                warn!("presence: FILE_CHUNK send failed for {}: {}", rel_path, e);
                return;
            }
        }

        let end = Message::FileEnd(FileEndBody {
            name: rel_path.to_string(),
        });
        if let Err(e) = self
            .send_socket
            .send_to(&wire::encode(&self.ctx.node_id, &end), dest)
            .await
        {
            warn!("presence: FILE_END send failed for {}: {}", rel_path, e);
        }
    }

    /// Run the periodic broadcast-send loop until shutdown.
    pub async fn run_send_loop(&self, shutdown: ShutdownHandle) {
        let dest = SocketAddr::from((self.ctx.broadcast_ip, self.ctx.presence_port));
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    let bytes = wire::encode(&self.ctx.node_id, &self.heartbeat_message());
                    if let Err(e) = self.send_socket.send_to(&bytes, dest).await {
                        warn!("presence: heartbeat send failed: {}", e);
                    }
                }
            }
        }
        debug!("presence send loop stopped");
    }

    /// Run the receive loop: upserts the peer map from inbound heartbeats
    /// and replies to `ANNOUNCE` with `ANNOUNCE_REPLY`, until shutdown.
    pub async fn run_recv_loop(&self, shutdown: ShutdownHandle) {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                result = self.recv_socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, from)) => self.handle_datagram(&buf[..n], from).await,
                        Err(e) => {
                            error!("presence: recv failed: {}", e);
                        }
                    }
                }
            }
        }
        debug!("presence recv loop stopped");
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let frame = match wire::decode(bytes) {
            Ok(Some(f)) => f,
            Ok(None) => return, // bad magic, ignore
            Err(e) => {
                debug!("presence: malformed frame from {}: {}", from, e);
                return;
            }
        };

        if wire::is_loopback(&self.ctx.node_id, &frame) {
            return;
        }

        let SocketAddr::V4(from_v4) = from else {
            return;
        };

        match frame.message {
            Message::Heartbeat(body) => {
                self.peers.upsert_heartbeat(HeartbeatInfo {
                    node_id: frame.sender_id,
                    ip: *from_v4.ip(),
                    sync_port: body.sync_port,
                    is_master: body.is_master,
                    is_syncing: body.is_syncing,
                    sync_progress: body.sync_progress,
                    sync_filename: body.sync_filename,
                });
            }
            Message::Announce(endpoint) => {
                self.peers.upsert_heartbeat(HeartbeatInfo {
                    node_id: frame.sender_id.clone(),
                    ip: endpoint.ip,
                    sync_port: endpoint.port,
                    is_master: false,
                    is_syncing: false,
                    sync_progress: 0.0,
                    sync_filename: None,
                });
                let reply = Message::AnnounceReply(EndpointBody {
                    ip: self.ctx.preferred_ip,
                    port: self.ctx.transport_port,
                });
                let bytes = wire::encode(&self.ctx.node_id, &reply);
                if let Err(e) = self.send_socket.send_to(&bytes, from).await {
                    warn!("presence: failed to send ANNOUNCE_REPLY: {}", e);
                }
            }
            Message::AnnounceReply(endpoint) => {
                self.peers.upsert_heartbeat(HeartbeatInfo {
                    node_id: frame.sender_id,
                    ip: endpoint.ip,
                    sync_port: endpoint.port,
                    is_master: false,
                    is_syncing: false,
                    sync_progress: 0.0,
                    sync_filename: None,
                });
            }
            Message::PointEdit(edit) => {
                // Peers apply; a master ignores edits it receives (it is
                // authoritative and never accepts foreign deltas) (spec
                // §4.6, §3 "Role assignment is local").
                if self.ctx.role.is_master() {
                    return;
                }
                self.document.lock().unwrap().apply_point_edit(
                    &frame.sender_id,
                    edit.surface_index as usize,
                    edit.mode,
                    edit.point_index as usize,
                    edit.nx,
                    edit.ny,
                );
            }
            Message::StructureSnapshot(bytes) => {
                if self.ctx.role.is_master() {
                    return;
                }
                match MappingDocument::deserialize(&bytes) {
                    Ok(snapshot) => self.document.lock().unwrap().apply_snapshot(snapshot),
                    Err(e) => {
                        // Retain the prior document on a parse failure
                        // (spec §7 "JSON parse error on STRUCTURE_SNAPSHOT").
                        warn!("presence: malformed STRUCTURE_SNAPSHOT from {}: {}", frame.sender_id, e);
                    }
                }
            }
            Message::FileOffer(offer) => {
                self.file_receiver.handle_offer(&frame.sender_id, &offer, &self.hasher);
            }
            Message::FileChunk(chunk) => {
                self.file_receiver.handle_chunk(&frame.sender_id, &chunk);
            }
            Message::FileEnd(end) => {
                if let Err(e) = self.file_receiver.handle_end(&frame.sender_id, &end, &self.hasher) {
                    warn!("presence: committing pushed file from {} failed: {}", frame.sender_id, e);
                }
            }
            other @ (Message::ScriptReload(_) | Message::ScriptCall(_)) => {
                debug!("presence: ignoring renderer/scripting frame {:?}", other);
            }
        }
    }

    /// One liveness-decay tick: evict peers unseen for longer than the
    /// timeout. Call this on the same ~1s cadence as the heartbeat send
    /// loop (spec §4.5).
    pub fn evict_stale(&self) -> Vec<String> {
        self.peers.evict_stale(self.liveness_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RoleState;
    use crate::peer::Peer;

    fn ctx(node_id: &str, port: u16) -> Arc<NodeContext> {
        Arc::new(NodeContext {
            node_id: node_id.to_string(),
            preferred_ip: Ipv4Addr::LOCALHOST,
            broadcast_ip: Ipv4Addr::new(127, 255, 255, 255),
            project_root: std::env::temp_dir(),
            presence_port: port,
            transport_port: 0,
            role: RoleState::default(),
        })
    }

    fn test_collaborators() -> (Arc<std::sync::Mutex<MappingDocument>>, Arc<FileReceiver>, Arc<HashCache>) {
        (
            Arc::new(std::sync::Mutex::new(MappingDocument::new())),
            Arc::new(FileReceiver::new(std::env::temp_dir())),
            Arc::new(HashCache::new()),
        )
    }

    #[tokio::test]
    async fn two_node_discovery_sees_each_other() {
        let port_a = portpicker_like_port();
        let (doc_a, fr_a, hasher_a) = test_collaborators();
        let peers_a = Arc::new(PeerMap::new());
        let svc_a =
            PresenceService::bind(ctx("AAAAAAAA", port_a), peers_a.clone(), doc_a, fr_a, hasher_a)
                .unwrap();

        let (doc_b, fr_b, hasher_b) = test_collaborators();
        let peers_b = Arc::new(PeerMap::new());
        let svc_b =
            PresenceService::bind(ctx("BBBBBBBB", port_a), peers_b.clone(), doc_b, fr_b, hasher_b)
                .unwrap();

        svc_a.announce().await;
        svc_b.announce().await;

        // Drain a few datagrams manually instead of spawning full loops,
        // keeping the test deterministic and fast.
        for _ in 0..4 {
            let mut buf = vec![0u8; RECV_BUF_SIZE];
            if let Ok(Ok((n, from))) = tokio::time::timeout(
                Duration::from_millis(200),
                svc_a.recv_socket.recv_from(&mut buf),
            )
            .await
            {
                svc_a.handle_datagram(&buf[..n], from).await;
            }
            if let Ok(Ok((n, from))) = tokio::time::timeout(
                Duration::from_millis(200),
                svc_b.recv_socket.recv_from(&mut buf),
            )
            .await
            {
                svc_b.handle_datagram(&buf[..n], from).await;
            }
        }

        assert!(peers_a.get("BBBBBBBB").is_some());
        assert!(peers_b.get("AAAAAAAA").is_some());
    }

    fn portpicker_like_port() -> u16 {
        // Bind to an ephemeral port, read it back, then drop — gives a
        // free port both sides in this test can share without a fixed
        // constant colliding with a real mapcast process on the host.
        let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        s.local_addr().unwrap().port()
    }

    fn sample_point_edit() -> PointEditBody {
        PointEditBody {
            surface_index: 0,
            mode: crate::document::GridKind::Output,
            point_index: 0,
            nx: 0.42,
            ny: 0.84,
        }
    }

    fn seeded_document(owner: &str) -> Arc<std::sync::Mutex<MappingDocument>> {
        let mut doc = MappingDocument::new();
        let surface = crate::document::Surface::new_placeholder("S1", 2, 2);
        doc.peers.insert(
            owner.to_string(),
            crate::document::PeerSurfaces {
                surfaces: vec![surface],
            },
        );
        Arc::new(std::sync::Mutex::new(doc))
    }

    #[tokio::test]
    async fn peer_applies_received_point_edit_to_document() {
        let document = seeded_document("MASTERID");
        let file_receiver = Arc::new(FileReceiver::new(std::env::temp_dir()));
        let hasher = Arc::new(HashCache::new());
        let svc = PresenceService::bind(
            ctx("PEERAAAA", 0),
            Arc::new(PeerMap::new()),
            document.clone(),
            file_receiver,
            hasher,
        )
        .unwrap();
        // A peer (default role) applies edits it receives.
        assert!(!svc.ctx.role.is_master());

        let bytes = wire::encode("MASTERID", &Message::PointEdit(sample_point_edit()));
        svc.handle_datagram(&bytes, "127.0.0.1:9".parse().unwrap())
            .await;

        let point = document.lock().unwrap().peers["MASTERID"].surfaces[0].output_grid[0];
        assert_eq!(point, crate::document::Point::new(0.42, 0.84));
    }

    #[tokio::test]
    async fn master_ignores_received_point_edit() {
        let document = seeded_document("MASTERID");
        let before = document.lock().unwrap().clone();
        let file_receiver = Arc::new(FileReceiver::new(std::env::temp_dir()));
        let hasher = Arc::new(HashCache::new());
        let svc = PresenceService::bind(
            ctx("PEERAAAA", 0),
            Arc::new(PeerMap::new()),
            document.clone(),
            file_receiver,
            hasher,
        )
        .unwrap();
        svc.ctx.role.set(crate::context::Role::Master);

        let bytes = wire::encode("MASTERID", &Message::PointEdit(sample_point_edit()));
        svc.handle_datagram(&bytes, "127.0.0.1:9".parse().unwrap())
            .await;

        assert_eq!(*document.lock().unwrap(), before);
    }

    #[tokio::test]
    async fn peer_applies_received_structure_snapshot_to_document() {
        let document = Arc::new(std::sync::Mutex::new(MappingDocument::new()));
        let master_snapshot = seeded_document("MASTERID").lock().unwrap().clone();
        let file_receiver = Arc::new(FileReceiver::new(std::env::temp_dir()));
        let hasher = Arc::new(HashCache::new());
        let svc = PresenceService::bind(
            ctx("PEERAAAA", 0),
            Arc::new(PeerMap::new()),
            document.clone(),
            file_receiver,
            hasher,
        )
        .unwrap();

        let wire_bytes = master_snapshot.serialize().unwrap();
        let bytes = wire::encode("MASTERID", &Message::StructureSnapshot(wire_bytes));
        svc.handle_datagram(&bytes, "127.0.0.1:9".parse().unwrap())
            .await;

        assert_eq!(
            document.lock().unwrap().serialize().unwrap(),
            master_snapshot.serialize().unwrap()
        );
    }

    #[tokio::test]
    async fn master_ignores_received_structure_snapshot() {
        let document = Arc::new(std::sync::Mutex::new(MappingDocument::new()));
        let before = document.lock().unwrap().clone();
        let master_snapshot = seeded_document("MASTERID").lock().unwrap().clone();
        let file_receiver = Arc::new(FileReceiver::new(std::env::temp_dir()));
        let hasher = Arc::new(HashCache::new());
        let svc = PresenceService::bind(
            ctx("PEERAAAA", 0),
            Arc::new(PeerMap::new()),
            document.clone(),
            file_receiver,
            hasher,
        )
        .unwrap();
        svc.ctx.role.set(crate::context::Role::Master);

        let wire_bytes = master_snapshot.serialize().unwrap();
        let bytes = wire::encode("MASTERID", &Message::StructureSnapshot(wire_bytes));
        svc.handle_datagram(&bytes, "127.0.0.1:9".parse().unwrap())
            .await;

        assert_eq!(*document.lock().unwrap(), before);
    }

    #[tokio::test]
    async fn send_point_edit_is_a_noop_when_not_master() {
        let (document, file_receiver, hasher) = test_collaborators();
        let svc = PresenceService::bind(
            ctx("PEERAAAA", 0),
            Arc::new(PeerMap::new()),
            document,
            file_receiver,
            hasher,
        )
        .unwrap();
        assert!(!svc.ctx.role.is_master());
        // No panic, no send attempted; role gate short-circuits before the
        // broadcast socket is touched.
        svc.send_point_edit(sample_point_edit()).await;
    }

    #[tokio::test]
    async fn push_file_is_a_noop_when_not_master() {
        let (document, file_receiver, hasher) = test_collaborators();
        let svc = PresenceService::bind(
            ctx("PEERAAAA", 0),
            Arc::new(PeerMap::new()),
            document,
            file_receiver,
            hasher,
        )
        .unwrap();
        assert!(!svc.ctx.role.is_master());
        // No panic, no read/send attempted; role gate short-circuits
        // before the (nonexistent) file is even looked up.
        svc.push_file("clip.mp4").await;
    }

    #[tokio::test]
    async fn push_file_delivers_offer_chunk_end_to_a_peer() {
        use tempfile::tempdir;

        let master_dir = tempdir().unwrap();
        std::fs::create_dir_all(master_dir.path().join("synced/videos")).unwrap();
        let content = vec![7u8; FILE_PUSH_CHUNK_SIZE * 2 + 13]; // spans 3 chunks
        std::fs::write(master_dir.path().join("synced/videos/clip.mp4"), &content).unwrap();

        let port = portpicker_like_port();
        let master_ctx = Arc::new(NodeContext {
            node_id: "MASTERID".to_string(),
            preferred_ip: Ipv4Addr::LOCALHOST,
            broadcast_ip: Ipv4Addr::new(127, 255, 255, 255),
            project_root: master_dir.path().to_path_buf(),
            presence_port: port,
            transport_port: 0,
            role: RoleState::default(),
        });
        master_ctx.role.set(crate::context::Role::Master);
        let (master_doc, master_fr, master_hasher) = test_collaborators();
        let master_svc = PresenceService::bind(
            master_ctx,
            Arc::new(PeerMap::new()),
            master_doc,
            master_fr,
            master_hasher,
        )
        .unwrap();

        let peer_dir = tempdir().unwrap();
        let peer_file_receiver = Arc::new(FileReceiver::new(peer_dir.path().to_path_buf()));
        let peer_hasher = Arc::new(HashCache::new());
        let peer_svc = PresenceService::bind(
            ctx("PEERAAAA", port),
            Arc::new(PeerMap::new()),
            Arc::new(std::sync::Mutex::new(MappingDocument::new())),
            peer_file_receiver,
            peer_hasher,
        )
        .unwrap();

        master_svc.push_file("clip.mp4").await;

        // Drain OFFER, CHUNK x3, END off the peer's socket.
        for _ in 0..5 {
            let mut buf = vec![0u8; 4096];
            let (n, from) = tokio::time::timeout(
                Duration::from_millis(500),
                peer_svc.recv_socket.recv_from(&mut buf),
            )
            .await
            .unwrap()
            .unwrap();
            peer_svc.handle_datagram(&buf[..n], from).await;
        }

        assert_eq!(std::fs::read(peer_dir.path().join("clip.mp4")).unwrap(), content);
    }

    #[tokio::test]
    async fn with_liveness_timeout_overrides_default() {
        let (document, file_receiver, hasher) = test_collaborators();
        let svc = PresenceService::bind(ctx("AAAAAAAA", 0), Arc::new(PeerMap::new()), document, file_receiver, hasher)
            .unwrap()
            .with_liveness_timeout(Duration::from_millis(250));
        assert_eq!(svc.liveness_timeout_ms, 250);
    }

    #[test]
    fn evicts_only_stale_foreign_peers() {
        let peers = Arc::new(PeerMap::new());
        peers.insert_self(Peer::new_self("AAAAAAAA".into(), Ipv4Addr::LOCALHOST, 1));
        peers.upsert_heartbeat(HeartbeatInfo {
            node_id: "BBBBBBBB".into(),
            ip: Ipv4Addr::LOCALHOST,
            sync_port: 2,
            is_master: false,
            is_syncing: false,
            sync_progress: 0.0,
            sync_filename: None,
        });
        let evicted = peers.evict_stale(DEFAULT_LIVENESS_TIMEOUT_MS);
        assert!(evicted.is_empty(), "freshly-seen peer should not be evicted yet");
    }
}
