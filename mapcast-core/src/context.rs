use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Local role: governs whether this node authors edits (`Master`) or only
/// applies them (`Peer`). User-toggled; never negotiated with peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Peer,
}

impl Role {
    fn as_u8(self) -> u8 {
        match self {
            Role::Peer => 0,
            Role::Master => 1,
        }
    }

    fn from_u8(v: u8) -> Role {
        if v == 1 { Role::Master } else { Role::Peer }
    }
}

/// Shared, cheaply-cloneable role flag. Read on every send/receive
/// decision in the messenger and stamped into every heartbeat.
#[derive(Debug, Clone)]
pub struct RoleState(Arc<AtomicU8>);

impl RoleState {
    pub fn new(initial: Role) -> Self {
        Self(Arc::new(AtomicU8::new(initial.as_u8())))
    }

    pub fn get(&self) -> Role {
        Role::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, role: Role) {
        self.0.store(role.as_u8(), Ordering::Relaxed);
    }

    pub fn is_master(&self) -> bool {
        self.get() == Role::Master
    }
}

impl Default for RoleState {
    fn default() -> Self {
        Self::new(Role::Peer)
    }
}

/// Process-wide, immutable-after-startup identity and network facts.
///
/// Built once in the binary crate's `main` and threaded explicitly into
/// every component constructor as `Arc<NodeContext>` — never read
/// ambiently from inside a component (spec §9, "Global mutable state").
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub preferred_ip: Ipv4Addr,
    pub broadcast_ip: Ipv4Addr,
    pub project_root: PathBuf,
    pub presence_port: u16,
    pub transport_port: u16,
    pub role: RoleState,
}

impl NodeContext {
    pub fn synced_root(&self) -> PathBuf {
        self.project_root.join("synced")
    }

    pub fn videos_root(&self) -> PathBuf {
        self.synced_root().join("videos")
    }

    pub fn configs_root(&self) -> PathBuf {
        self.synced_root().join("configs")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.project_root.join("settings.json")
    }

    pub fn own_mapping_path(&self) -> PathBuf {
        self.configs_root()
            .join(format!("{}.mappings.json", self.node_id))
    }
}
