use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the synchronization substrate.
///
/// Per spec: no error here is user-fatal after startup except a bind
/// failure on the well-known ports at process start. Every other variant
/// is logged and the owning component self-heals on its next cycle.
#[derive(Error, Debug)]
pub enum MapcastError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to bind well-known port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no usable network interface found for discovery")]
    InterfaceDiscoveryFailed,

    #[error("path escapes root: {0}")]
    PathEscape(PathBuf),

    #[error("malformed control frame: {0}")]
    MalformedFrame(String),

    #[error("session handshake failed for {0}")]
    HandshakeFailed(String),

    #[error("bulk transfer failed after {attempts} attempt(s): {reason}")]
    TransferFailed { attempts: u32, reason: String },

    #[error("node identity invalid: {0}")]
    InvalidIdentity(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, MapcastError>;
