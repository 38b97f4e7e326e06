//! Process wiring: constructs every `mapcast-core` component around one
//! shared [`NodeContext`] and drives them until shutdown.
//!
//! Spawn/join shape follows the teacher's `main.rs` — bind first, build
//! shared state, spawn long-lived tasks, then block on a termination
//! signal — generalized from one Axum server task to the five
//! cooperating tasks this spec's components need (spec §5 "Startup and
//! shutdown").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mapcast_core::context::{NodeContext, Role, RoleState};
use mapcast_core::document::MappingDocument;
use mapcast_core::hash::HashCache;
use mapcast_core::identity;
use mapcast_core::iface;
use mapcast_core::peer::{Peer, PeerMap};
use mapcast_core::presence::PresenceService;
use mapcast_core::shutdown::ShutdownHandle;
use mapcast_core::sync::SyncEngine;
use mapcast_core::transport::server as transport_server;
use mapcast_core::transport::TransportClient;
use mapcast_core::watch::{FileWatcher, WatcherConfig};
use mapcast_core::wire::{FileReceiver, PointEditBody};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::devcli::{self, DevCommand};

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Build the process's shared context and run every component until a
/// shutdown signal (Ctrl-C, or `quit` typed into the dev CLI) arrives.
pub async fn run(config: Config, initial_role: Role) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.project_root)?;
    let settings_path = config.project_root.join("settings.json");
    let node_id = identity::load_or_create_node_id(&settings_path)?;
    let iface_info = iface::discover()?;

    // Bind the bulk-transport listener before building `NodeContext` so
    // an OS-assigned ephemeral port (config.transport_port == 0) is known
    // and stamped into the context we then advertise to peers.
    let listener = TcpListener::bind(("0.0.0.0", config.transport_port)).await?;
    let transport_port = listener.local_addr()?.port();

    let ctx = Arc::new(NodeContext {
        node_id: node_id.clone(),
        preferred_ip: iface_info.preferred_ip,
        broadcast_ip: iface_info.broadcast_ip,
        project_root: config.project_root.clone(),
        presence_port: config.presence_port,
        transport_port,
        role: RoleState::new(initial_role),
    });
    info!(
        "node {} starting: ip={} broadcast={} presence_port={} transport_port={} role={:?}",
        ctx.node_id, ctx.preferred_ip, ctx.broadcast_ip, ctx.presence_port, ctx.transport_port, initial_role
    );

    std::fs::create_dir_all(ctx.videos_root())?;
    std::fs::create_dir_all(ctx.configs_root())?;

    let hasher = Arc::new(HashCache::new());

    let peers = Arc::new(PeerMap::new());
    peers.insert_self(Peer::new_self(ctx.node_id.clone(), ctx.preferred_ip, ctx.transport_port));

    let document = Arc::new(Mutex::new(
        MappingDocument::load(&ctx.own_mapping_path()).unwrap_or_else(|_| MappingDocument::new()),
    ));

    let file_receiver = Arc::new(FileReceiver::new(ctx.videos_root()));

    let presence = Arc::new(
        PresenceService::bind(
            ctx.clone(),
            peers.clone(),
            document.clone(),
            file_receiver.clone(),
            hasher.clone(),
        )?
        .with_liveness_timeout(config.liveness_timeout),
    );

    let transport_client = Arc::new(TransportClient::new());
    let sync_engine = Arc::new(
        SyncEngine::new(ctx.clone(), peers.clone(), hasher.clone(), transport_client.clone())
            .with_heartbeat_tick(config.sync_heartbeat_interval),
    );

    let watcher = FileWatcher::start(
        ctx.videos_root(),
        WatcherConfig {
            scan_interval: config.scan_interval,
            settle_time: config.settle_time,
        },
        hasher.clone(),
    );

    let shutdown = ShutdownHandle::new();

    let presence_send = tokio::spawn({
        let presence = presence.clone();
        let shutdown = shutdown.clone();
        async move { presence.run_send_loop(shutdown).await }
    });
    let presence_recv = tokio::spawn({
        let presence = presence.clone();
        let shutdown = shutdown.clone();
        async move { presence.run_recv_loop(shutdown).await }
    });
    let eviction_task = tokio::spawn({
        let presence = presence.clone();
        let shutdown = shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        for stale in presence.evict_stale() {
                            debug!("node: evicted stale peer {}", stale);
                        }
                    }
                }
            }
        }
    });
    let transport_task = tokio::spawn({
        let ctx = ctx.clone();
        let hasher = hasher.clone();
        let shutdown = shutdown.clone();
        async move { transport_server::run_hello_listener_on(listener, ctx, hasher, shutdown).await }
    });
    let sync_task = tokio::spawn({
        let sync_engine = sync_engine.clone();
        let shutdown = shutdown.clone();
        async move { sync_engine.run(shutdown).await }
    });

    // Bridges the watcher's polling API into the sync engine's push-style
    // invalidation queue; owns the watcher so its blocking-thread `stop()`
    // (via `Drop`) runs at task exit rather than on whichever task happened
    // to touch it last.
    let watch_bridge_task = tokio::spawn({
        let sync_engine = sync_engine.clone();
        let presence = presence.clone();
        let shutdown = shutdown.clone();
        let scan_interval = config.scan_interval;
        let mut watcher = watcher;
        async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(scan_interval) => {
                        for batch in watcher.try_recv_all() {
                            for rel_path in batch.paths {
                                // Best-effort low-latency push alongside the
                                // invalidation that drives C7/C8's reconciliation
                                // loop; a dropped push is repaired by the next
                                // convergence cycle regardless.
                                presence.push_file(&rel_path).await;
                                sync_engine.enqueue_invalidation(rel_path);
                            }
                        }
                    }
                }
            }
            watcher.stop();
        }
    });

    let (dev_tx, mut dev_rx) = tokio::sync::mpsc::unbounded_channel();
    devcli::spawn(dev_tx);

    let ctrl_c_seen = Arc::new(AtomicBool::new(false));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !ctrl_c_seen.load(Ordering::Relaxed) => {
                ctrl_c_seen.store(true, Ordering::Relaxed);
                info!("node: received Ctrl-C, shutting down");
                shutdown.trigger();
                break;
            }
            cmd = dev_rx.recv() => {
                match cmd {
                    Some(DevCommand::Quit) | None => {
                        info!("node: dev CLI requested shutdown");
                        shutdown.trigger();
                        break;
                    }
                    Some(DevCommand::SetRole(role)) => {
                        ctx.role.set(role);
                        info!("node: role set to {:?}", role);
                    }
                    Some(DevCommand::Edit { surface_index, mode, point_index, nx, ny }) => {
                        document.lock().unwrap().apply_point_edit(&ctx.node_id, surface_index, mode, point_index, nx, ny);
                        if ctx.role.is_master() {
                            presence.send_point_edit(PointEditBody {
                                surface_index: surface_index as u32,
                                mode,
                                point_index: point_index as u32,
                                nx,
                                ny,
                            }).await;
                        } else {
                            warn!("node: local edit applied but not broadcast (role is Peer)");
                        }
                    }
                    Some(DevCommand::Snapshot) => {
                        let bytes = document.lock().unwrap().serialize();
                        match bytes {
                            Ok(bytes) => {
                                if ctx.role.is_master() {
                                    presence.send_structure_snapshot(bytes).await;
                                } else {
                                    warn!("node: snapshot not broadcast (role is Peer)");
                                }
                            }
                            Err(e) => warn!("node: failed to serialize document: {}", e),
                        }
                    }
                    Some(DevCommand::Peers) => {
                        for peer in peers.snapshot() {
                            println!(
                                "{}{} ip={} port={} master={} syncing={}",
                                peer.node_id,
                                if peer.is_self { " (self)" } else { "" },
                                peer.ip,
                                peer.sync_port,
                                peer.is_master,
                                peer.is_syncing,
                            );
                        }
                    }
                }
            }
        }
    }

    if let Err(e) = document.lock().unwrap().save(&ctx.own_mapping_path()) {
        warn!("node: failed to persist mapping document on shutdown: {}", e);
    }

    // Join in dependency-reverse order (spec §5): sync depends on
    // transport and presence's peer map; transport and presence are
    // otherwise independent; the watch bridge only feeds sync, so it can
    // come down any time after sync stops consuming it.
    join_bounded("sync", sync_task).await;
    join_bounded("transport", transport_task).await;
    join_bounded("presence-send", presence_send).await;
    join_bounded("presence-recv", presence_recv).await;
    join_bounded("eviction", eviction_task).await;
    join_bounded("watch-bridge", watch_bridge_task).await;

    info!("node {} shut down", node_id);
    Ok(())
}

/// Await one task's handle with a bounded grace period, logging instead
/// of propagating — a slow shutdown task should never block the rest of
/// the join order (spec §5 "bounded ~2s").
async fn join_bounded<T>(name: &str, handle: tokio::task::JoinHandle<T>) {
    match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
        Ok(Ok(_)) => debug!("node: {} task joined cleanly", name),
        Ok(Err(e)) => warn!("node: {} task panicked: {}", name, e),
        Err(_) => warn!("node: {} task did not stop within {:?}", name, SHUTDOWN_JOIN_TIMEOUT),
    }
}
