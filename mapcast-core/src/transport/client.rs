//! Bulk-transport client (C8): `HELLO`/session-reuse handshake plus the
//! four operations the sync engine drives (`LIST`, `GET`, `PUT`,
//! `DELETE`).

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::content::ContentSet;
use crate::error::{MapcastError, Result};
use crate::session::{SessionCache, SESSION_PING_TIMEOUT};

use super::wire::{self, Cmd, Command, Status};

/// Client side of the bulk-transport session protocol. One instance is
/// shared across all peers; sessions are keyed by `peer_key` (the peer's
/// node ID).
#[derive(Debug, Default)]
pub struct TransportClient {
    sessions: SessionCache,
}

impl TransportClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reuse) a session to `peer_addr` and return a connected
    /// stream to it.
    async fn session_stream(&self, peer_key: &str, hello_addr: SocketAddr) -> Result<TcpStream> {
        if let Some(cached) = self.sessions.get(peer_key) {
            match self.try_reuse(cached.addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(
                        "transport: session with {} stale ({}), re-handshaking",
                        peer_key, e
                    );
                    self.sessions.discard(peer_key);
                }
            }
        }

        let session_addr = self.handshake(hello_addr).await?;
        self.sessions.insert(peer_key, session_addr);
        TcpStream::connect(session_addr)
            .await
            .map_err(MapcastError::Io)
    }

    /// `PING` a cached session and confirm `PONG` within the liveness
    /// window before reusing it (spec §4.8 "Session reuse").
    async fn try_reuse(&self, session_addr: SocketAddr) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(session_addr).await?;
        wire::write_command(&mut stream, &Command::bare(Cmd::Ping)).await?;
        let status = tokio::time::timeout(SESSION_PING_TIMEOUT, wire::read_status(&mut stream))
            .await
            .map_err(|_| MapcastError::HandshakeFailed("PING timed out".into()))??;
        if status != Status::Pong {
            return Err(MapcastError::HandshakeFailed(
                "PING did not elicit PONG".into(),
            ));
        }
        Ok(stream)
    }

    /// `HELLO` the well-known port and return the ephemeral session
    /// address the server handed back in `WELCOME`.
    async fn handshake(&self, hello_addr: SocketAddr) -> Result<SocketAddr> {
        let mut stream = TcpStream::connect(hello_addr).await?;
        wire::write_command(&mut stream, &Command::bare(Cmd::Hello)).await?;
        let status = wire::read_status(&mut stream).await?;
        if status != Status::Welcome {
            return Err(MapcastError::HandshakeFailed(format!(
                "expected WELCOME, got {status:?}"
            )));
        }
        let port = wire::read_port(&mut stream).await?;
        let ip = match hello_addr {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => Ipv4Addr::LOCALHOST,
        };
        Ok(SocketAddr::from((ip, port)))
    }

    pub async fn list(&self, peer_key: &str, hello_addr: SocketAddr) -> Result<ContentSet> {
        let mut stream = self.session_stream(peer_key, hello_addr).await?;
        wire::write_command(&mut stream, &Command::bare(Cmd::List)).await?;
        expect_ok(&mut stream).await?;
        let bytes = wire::read_sized_payload(&mut stream).await?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(ContentSet::from_list_text(&text))
    }

    pub async fn get(&self, peer_key: &str, hello_addr: SocketAddr, rel_path: &str) -> Result<Vec<u8>> {
        let mut stream = self.session_stream(peer_key, hello_addr).await?;
        wire::write_command(&mut stream, &Command::new(Cmd::Get, rel_path.as_bytes().to_vec()))
            .await?;
        expect_ok(&mut stream).await?;
        wire::read_sized_payload(&mut stream).await
    }

    pub async fn put(
        &self,
        peer_key: &str,
        hello_addr: SocketAddr,
        rel_path: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let mut stream = self.session_stream(peer_key, hello_addr).await?;
        wire::write_command(&mut stream, &Command::new(Cmd::Put, rel_path.as_bytes().to_vec()))
            .await?;
        wire::write_sized_payload(&mut stream, bytes).await?;
        expect_ok(&mut stream).await
    }

    pub async fn delete(&self, peer_key: &str, hello_addr: SocketAddr, rel_path: &str) -> Result<()> {
        let mut stream = self.session_stream(peer_key, hello_addr).await?;
        wire::write_command(
            &mut stream,
            &Command::new(Cmd::Delete, rel_path.as_bytes().to_vec()),
        )
        .await?;
        expect_ok(&mut stream).await
    }
}

async fn expect_ok(stream: &mut TcpStream) -> Result<()> {
    match wire::read_status(stream).await? {
        Status::Ok => Ok(()),
        other => Err(MapcastError::TransferFailed {
            attempts: 1,
            reason: format!("server returned {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{NodeContext, RoleState};
    use crate::hash::HashCache;
    use crate::shutdown::ShutdownHandle;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    async fn spawn_server(root: std::path::PathBuf) -> (SocketAddr, ShutdownHandle) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = Arc::new(NodeContext {
            node_id: "SERVERID".to_string(),
            preferred_ip: Ipv4Addr::LOCALHOST,
            broadcast_ip: Ipv4Addr::new(127, 255, 255, 255),
            project_root: root,
            presence_port: 0,
            transport_port: addr.port(),
            role: RoleState::default(),
        });
        let hasher = Arc::new(HashCache::new());
        let shutdown = ShutdownHandle::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ =
                super::server::run_hello_listener_on(listener, ctx, hasher, server_shutdown)
                    .await;
        });
        // Give the listener a beat to actually be accepting.
        tokio::time::sleep(Duration::from_millis(20)).await;
        (addr, shutdown)
    }

    #[tokio::test]
    async fn list_get_put_delete_round_trip() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("synced/videos")).unwrap();
        std::fs::write(dir.path().join("synced/videos/a.mp4"), b"hello").unwrap();

        let (addr, shutdown) = spawn_server(dir.path().to_path_buf()).await;
        let client = TransportClient::new();

        let listing = client.list("peer-1", addr).await.unwrap();
        assert!(listing.get("a.mp4").is_some());

        let bytes = client.get("peer-1", addr, "a.mp4").await.unwrap();
        assert_eq!(bytes, b"hello");

        client
            .put("peer-1", addr, "b.mp4", b"uploaded")
            .await
            .unwrap();
        let roundtrip = client.get("peer-1", addr, "b.mp4").await.unwrap();
        assert_eq!(roundtrip, b"uploaded");

        client.delete("peer-1", addr, "a.mp4").await.unwrap();
        let listing_after = client.list("peer-1", addr).await.unwrap();
        assert!(listing_after.get("a.mp4").is_none());

        shutdown.trigger();
    }

    #[tokio::test]
    async fn reused_session_is_pinged_before_reuse() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("synced")).unwrap();
        let (addr, shutdown) = spawn_server(dir.path().to_path_buf()).await;
        let client = TransportClient::new();

        client.list("peer-1", addr).await.unwrap();
        assert_eq!(client.sessions.len(), 1);
        // Second call reuses the cached session via PING/PONG rather than
        // re-handshaking.
        client.list("peer-1", addr).await.unwrap();
        assert_eq!(client.sessions.len(), 1);

        shutdown.trigger();
    }
}
