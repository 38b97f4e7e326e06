//! `mapcast-node`: process entry point for a LAN projection-mapping sync
//! node. Parses CLI overrides, loads environment defaults, wires tracing,
//! and hands off to [`app::run`].
//!
//! CLI/env/tracing-init shape is grounded on the teacher's
//! `ferrex-server::main` (`Args::parse()` then `Config::from_env()` with
//! CLI fields overriding, then one `tracing_subscriber::registry()`
//! init).

mod app;
mod config;
mod devcli;

use std::path::PathBuf;

use clap::Parser;
use mapcast_core::context::Role;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::Config;

/// CLI overrides for a mapcast render node. Every flag also reads its
/// matching environment variable as a fallback (clap's `env` attribute),
/// so a node can be configured entirely from systemd unit files or
/// entirely from flags at a LAN party.
#[derive(Parser, Debug)]
#[command(name = "mapcast-node", about = "LAN projection-mapping sync node")]
struct Args {
    /// Root directory holding settings.json and the synced/ tree.
    #[arg(long, env = "MAPCAST_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// UDP port for the presence/control-plane messenger.
    #[arg(long, env = "MAPCAST_PRESENCE_PORT")]
    presence_port: Option<u16>,

    /// TCP port for the bulk-transport HELLO listener; 0 picks an
    /// OS-assigned ephemeral port.
    #[arg(long, env = "MAPCAST_TRANSPORT_PORT")]
    transport_port: Option<u16>,

    /// Start as the mapping document's authoring master.
    #[arg(long)]
    master: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(root) = args.project_root {
        config.project_root = root;
    }
    if let Some(port) = args.presence_port {
        config.presence_port = port;
    }
    if let Some(port) = args.transport_port {
        config.transport_port = port;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mapcast_node=info,mapcast_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let role = if args.master { Role::Master } else { Role::Peer };
    app::run(config, role).await
}
