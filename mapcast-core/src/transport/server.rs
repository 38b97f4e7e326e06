//! Bulk-transport server (C8): a well-known `HELLO` listener hands each
//! client off to a fresh ephemeral-port session, then serves
//! `LIST`/`GET`/`PUT`/`DELETE`/`PING` against the local synced root until
//! the session idles out or the process shuts down.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::content::{build_content_set, safe_resolve};
use crate::context::NodeContext;
use crate::error::{MapcastError, Result};
use crate::hash::HashCache;
use crate::session::SESSION_IDLE_TIMEOUT;
use crate::shutdown::ShutdownHandle;

use super::wire::{self, Cmd, Status};

/// Runs the well-known `HELLO` listener until shutdown. Each accepted
/// connection is handed a fresh ephemeral session and then closed.
pub async fn run_hello_listener(
    ctx: Arc<NodeContext>,
    hasher: Arc<HashCache>,
    shutdown: ShutdownHandle,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", ctx.transport_port))
        .await
        .map_err(|e| MapcastError::BindFailed {
            port: ctx.transport_port,
            source: e,
        })?;
    run_hello_listener_on(listener, ctx, hasher, shutdown).await
}

/// Same as [`run_hello_listener`] but takes an already-bound listener,
/// so tests can bind an ephemeral port without racing the real one.
pub async fn run_hello_listener_on(
    listener: TcpListener,
    ctx: Arc<NodeContext>,
    hasher: Arc<HashCache>,
    shutdown: ShutdownHandle,
) -> Result<()> {
    info!(
        "transport: listening for HELLO on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    );

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let ctx = ctx.clone();
                        let hasher = hasher.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_hello(stream, peer_addr, ctx, hasher, shutdown).await {
                                warn!("transport: HELLO handling failed for {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => error!("transport: accept failed: {}", e),
                }
            }
        }
    }
    Ok(())
}

async fn handle_hello(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: Arc<NodeContext>,
    hasher: Arc<HashCache>,
    shutdown: ShutdownHandle,
) -> Result<()> {
    let command = wire::read_command(&mut stream).await?;
    if command.cmd != Cmd::Hello {
        wire::write_status(&mut stream, Status::Err).await?;
        return Err(MapcastError::HandshakeFailed(format!(
            "expected HELLO from {peer_addr}"
        )));
    }

    let session_listener = TcpListener::bind(("0.0.0.0", 0)).await?;
    let ephemeral_port = session_listener.local_addr()?.port();

    // Spec calls for replying 3-5x to absorb loss; over TCP the initial
    // connection is itself reliable, so one WELCOME suffices.
    wire::write_status(&mut stream, Status::Welcome).await?;
    wire::write_port(&mut stream, ephemeral_port).await?;

    debug!(
        "transport: handed {} a session on port {}",
        peer_addr, ephemeral_port
    );

    tokio::spawn(async move {
        if let Err(e) = run_session(session_listener, ctx, hasher, shutdown).await {
            warn!("transport: session on ephemeral port failed: {}", e);
        }
    });
    Ok(())
}

/// Serve one ephemeral session: the client reconnects for every request
/// (`PING`, `LIST`, `GET`, `PUT`, `DELETE` each open their own TCP
/// connection to the cached `session_addr`, see `transport/client.rs`), so
/// this accepts connections in a loop rather than reading a stream of
/// commands off a single one. The idle timeout is measured from the last
/// accepted connection (spec §4.8 "Session lifetime").
async fn run_session(
    listener: TcpListener,
    ctx: Arc<NodeContext>,
    hasher: Arc<HashCache>,
    shutdown: ShutdownHandle,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.wait() => return Ok(()),
            result = tokio::time::timeout(SESSION_IDLE_TIMEOUT, listener.accept()) => {
                match result {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        debug!("transport: session accept failed: {}", e);
                        return Ok(());
                    }
                    Err(_elapsed) => {
                        debug!("transport: session idled out");
                        return Ok(());
                    }
                }
            }
        };
        debug!("transport: session connection from {}", peer_addr);
        if let Err(e) = handle_session_command(stream, peer_addr, &ctx, &hasher).await {
            debug!("transport: session request from {} failed: {}", peer_addr, e);
        }
    }
}

/// Handle exactly one command on a freshly-accepted session connection.
async fn handle_session_command(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: &Arc<NodeContext>,
    hasher: &Arc<HashCache>,
) -> Result<()> {
    let command = wire::read_command(&mut stream).await?;
    match command.cmd {
        Cmd::Ping => {
            wire::write_status(&mut stream, Status::Pong).await?;
        }
        Cmd::List => {
            let set = build_content_set(&ctx.videos_root(), &hasher);
            wire::write_status(&mut stream, Status::Ok).await?;
            wire::write_sized_payload(&mut stream, set.to_list_text().as_bytes()).await?;
        }
        Cmd::Get => {
            let rel = command.arg_str();
            match safe_resolve(&ctx.videos_root(), &rel) {
                Some(path) => match tokio::fs::read(&path).await {
                    Ok(bytes) => {
                        wire::write_status(&mut stream, Status::Ok).await?;
                        wire::write_sized_payload(&mut stream, &bytes).await?;
                    }
                    Err(e) => {
                        warn!("transport: GET {} failed: {}", rel, e);
                        wire::write_status(&mut stream, Status::Err).await?;
                    }
                },
                None => {
                    warn!("transport: rejected path-escaping GET {:?}", rel);
                    wire::write_status(&mut stream, Status::Err).await?;
                }
            }
        }
        Cmd::Put => {
            let rel = command.arg_str();
            let payload = wire::read_sized_payload(&mut stream).await?;
            match safe_resolve(&ctx.videos_root(), &rel) {
                Some(path) => match commit_put(&path, &payload).await {
                    Ok(()) => {
                        hasher.invalidate(&path);
                        wire::write_status(&mut stream, Status::Ok).await?;
                    }
                    Err(e) => {
                        error!("transport: PUT {} failed: {}", rel, e);
                        wire::write_status(&mut stream, Status::Err).await?;
                    }
                },
                None => {
                    warn!("transport: rejected path-escaping PUT {:?}", rel);
                    wire::write_status(&mut stream, Status::Err).await?;
                }
            }
        }
        Cmd::Delete => {
            let rel = command.arg_str();
            match safe_resolve(&ctx.videos_root(), &rel) {
                Some(path) => {
                    let removed = std::fs::remove_file(&path);
                    if removed.is_ok() || !path.exists() {
                        hasher.invalidate(&path);
                        wire::write_status(&mut stream, Status::Ok).await?;
                    } else if let Err(e) = removed {
                        error!("transport: DELETE {} failed: {}", rel, e);
                        wire::write_status(&mut stream, Status::Err).await?;
                    }
                }
                None => {
                    warn!("transport: rejected path-escaping DELETE {:?}", rel);
                    wire::write_status(&mut stream, Status::Err).await?;
                }
            }
        }
        Cmd::Hello => {
            warn!(
                "transport: unexpected HELLO on established session from {}",
                peer_addr
            );
            wire::write_status(&mut stream, Status::Err).await?;
        }
    }
    Ok(())
}

/// Write to `<path>.tmp` then atomically rename over `path` (spec §4.8
/// path-safety / §6 on-disk layout).
async fn commit_put(path: &std::path::Path, payload: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = {
        let mut p = path.to_path_buf();
        let file_name = format!("{}.tmp", path.file_name().unwrap().to_string_lossy());
        p.set_file_name(file_name);
        p
    };
    tokio::fs::write(&tmp, payload).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RoleState;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn test_ctx(root: std::path::PathBuf, port: u16) -> Arc<NodeContext> {
        Arc::new(NodeContext {
            node_id: "AAAAAAAA".to_string(),
            preferred_ip: Ipv4Addr::LOCALHOST,
            broadcast_ip: Ipv4Addr::new(127, 255, 255, 255),
            project_root: root,
            presence_port: 0,
            transport_port: port,
            role: RoleState::default(),
        })
    }

    #[tokio::test]
    async fn full_hello_then_list_round_trip() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("synced/videos")).unwrap();
        std::fs::write(dir.path().join("synced/videos/a.mp4"), b"content").unwrap();

        let ctx = test_ctx(dir.path().to_path_buf(), 0);
        let hasher = Arc::new(HashCache::new());
        let shutdown = ShutdownHandle::new();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_ctx = ctx.clone();
        let server_hasher = hasher.clone();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server_shutdown.wait() => break,
                    Ok((stream, peer_addr)) = listener.accept() => {
                        let ctx = server_ctx.clone();
                        let hasher = server_hasher.clone();
                        let shutdown = server_shutdown.clone();
                        tokio::spawn(async move {
                            let _ = handle_hello(stream, peer_addr, ctx, hasher, shutdown).await;
                        });
                    }
                }
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        wire::write_command(&mut client, &wire::Command::bare(Cmd::Hello))
            .await
            .unwrap();
        assert_eq!(
            wire::read_status(&mut client).await.unwrap(),
            Status::Welcome
        );
        let ephemeral_port = wire::read_port(&mut client).await.unwrap();

        let mut session = TcpStream::connect(("127.0.0.1", ephemeral_port))
            .await
            .unwrap();
        wire::write_command(&mut session, &wire::Command::bare(Cmd::List))
            .await
            .unwrap();
        assert_eq!(
            wire::read_status(&mut session).await.unwrap(),
            Status::Ok
        );
        let listing = wire::read_sized_payload(&mut session).await.unwrap();
        let text = String::from_utf8(listing).unwrap();
        assert!(text.contains("a.mp4"));

        shutdown.trigger();
    }

    #[tokio::test]
    async fn put_then_get_round_trips_content() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("synced")).unwrap();
        let ctx = test_ctx(dir.path().to_path_buf(), 0);
        let hasher = Arc::new(HashCache::new());

        // Exercises the path-safety + commit logic directly; the session
        // loop test above already covers the framing path end to end.
        let path = safe_resolve(&ctx.videos_root(), "new.mp4").unwrap();
        commit_put(&path, b"uploaded bytes").await.unwrap();
        hasher.invalidate(&path);
        assert_eq!(std::fs::read(&path).unwrap(), b"uploaded bytes");
    }

    #[tokio::test]
    async fn put_rejects_path_escape() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("synced")).unwrap();
        let ctx = test_ctx(dir.path().to_path_buf(), 0);
        assert!(safe_resolve(&ctx.videos_root(), "../../etc/passwd").is_none());
    }
}
