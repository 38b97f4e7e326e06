//! Control-plane messenger (C6): framed UDP datagrams carrying heartbeat,
//! structure/point-edit replication, and a best-effort file-push path.
//!
//! Framing is new to this spec — nothing in the teacher does byte-level
//! wire framing (its networking is all Axum/HTTP). The style (explicit
//! struct-of-primitives encode/decode functions, no derive magic) follows
//! the same "don't reach for serde on a fixed byte layout" instinct the
//! teacher applies to its `rkyv_wrappers.rs` zero-copy types.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::document::GridKind;
use crate::error::{MapcastError, Result};

pub const MAGIC: u8 = 0xC5;
pub const NODE_ID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Heartbeat = 1,
    Announce = 2,
    AnnounceReply = 3,
    PointEdit = 4,
    StructureSnapshot = 5,
    FileOffer = 6,
    FileChunk = 7,
    FileEnd = 8,
    ScriptReload = 9,
    ScriptCall = 10,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<Self> {
        use FrameType::*;
        Some(match v {
            1 => Heartbeat,
            2 => Announce,
            3 => AnnounceReply,
            4 => PointEdit,
            5 => StructureSnapshot,
            6 => FileOffer,
            7 => FileChunk,
            8 => FileEnd,
            9 => ScriptReload,
            10 => ScriptCall,
            _ => return None,
        })
    }
}

fn node_id_bytes(id: &str) -> [u8; NODE_ID_LEN] {
    let mut out = [0u8; NODE_ID_LEN];
    let bytes = id.as_bytes();
    let n = bytes.len().min(NODE_ID_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn node_id_string(bytes: &[u8; NODE_ID_LEN]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
}

/// Body of a `HEARTBEAT` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatBody {
    pub is_master: bool,
    pub sync_ip: Ipv4Addr,
    pub sync_port: u16,
    pub is_syncing: bool,
    pub sync_progress: f32,
    pub sync_filename: Option<String>,
}

/// Body of `ANNOUNCE` / `ANNOUNCE_REPLY` (both carry just an endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointBody {
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointEditBody {
    pub surface_index: u32,
    pub mode: GridKind,
    pub point_index: u32,
    pub nx: f32,
    pub ny: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileOfferBody {
    pub total_size: u64,
    pub digest: String, // 32-char hex
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileChunkBody {
    pub offset: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEndBody {
    pub name: String,
}

/// A decoded control-plane message, paired with its sender.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Heartbeat(HeartbeatBody),
    Announce(EndpointBody),
    AnnounceReply(EndpointBody),
    PointEdit(PointEditBody),
    StructureSnapshot(Vec<u8>),
    FileOffer(FileOfferBody),
    FileChunk(FileChunkBody),
    FileEnd(FileEndBody),
    /// Renderer/scripting hooks: out of scope beyond recognizing the
    /// frame type and carrying an opaque payload through (spec names
    /// these as fixed message types but does not define their bodies).
    ScriptReload(Vec<u8>),
    ScriptCall(Vec<u8>),
}

/// A fully decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub sender_id: String,
    pub message: Message,
}

/// Encode a frame: `{magic, type, sender_id[8]}` + type-specific body.
pub fn encode(sender_id: &str, message: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(MAGIC);

    let frame_type = match message {
        Message::Heartbeat(_) => FrameType::Heartbeat,
        Message::Announce(_) => FrameType::Announce,
        Message::AnnounceReply(_) => FrameType::AnnounceReply,
        Message::PointEdit(_) => FrameType::PointEdit,
        Message::StructureSnapshot(_) => FrameType::StructureSnapshot,
        Message::FileOffer(_) => FrameType::FileOffer,
        Message::FileChunk(_) => FrameType::FileChunk,
        Message::FileEnd(_) => FrameType::FileEnd,
        Message::ScriptReload(_) => FrameType::ScriptReload,
        Message::ScriptCall(_) => FrameType::ScriptCall,
    };
    out.push(frame_type as u8);
    out.extend_from_slice(&node_id_bytes(sender_id));

    match message {
        Message::Heartbeat(b) => {
            out.push(b.is_master as u8);
            out.extend_from_slice(&b.sync_ip.octets());
            out.extend_from_slice(&b.sync_port.to_be_bytes());
            out.push(b.is_syncing as u8);
            out.extend_from_slice(&b.sync_progress.to_be_bytes());
            let name = b.sync_filename.as_deref().unwrap_or("");
            out.extend_from_slice(&(name.len() as u16).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        Message::Announce(b) | Message::AnnounceReply(b) => {
            out.extend_from_slice(&b.ip.octets());
            out.extend_from_slice(&b.port.to_be_bytes());
        }
        Message::PointEdit(b) => {
            out.extend_from_slice(&b.surface_index.to_be_bytes());
            out.push(match b.mode {
                GridKind::Output => 0,
                GridKind::Source => 1,
            });
            out.extend_from_slice(&b.point_index.to_be_bytes());
            out.extend_from_slice(&b.nx.to_be_bytes());
            out.extend_from_slice(&b.ny.to_be_bytes());
        }
        Message::StructureSnapshot(bytes) => {
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        Message::FileOffer(b) => {
            out.extend_from_slice(&b.total_size.to_be_bytes());
            out.extend_from_slice(&(b.name.len() as u16).to_be_bytes());
            out.extend_from_slice(b.digest.as_bytes());
            out.extend_from_slice(b.name.as_bytes());
        }
        Message::FileChunk(b) => {
            out.extend_from_slice(&b.offset.to_be_bytes());
            out.extend_from_slice(&(b.payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&b.payload);
        }
        Message::FileEnd(b) => {
            out.extend_from_slice(&(b.name.len() as u16).to_be_bytes());
            out.extend_from_slice(b.name.as_bytes());
        }
        Message::ScriptReload(bytes) | Message::ScriptCall(bytes) => {
            out.extend_from_slice(bytes);
        }
    }

    out
}

const HEADER_LEN: usize = 1 + 1 + NODE_ID_LEN;

/// Decode an inbound frame. Returns `Ok(None)` for a frame with bad magic
/// (silently ignored, not a logged error, since stray UDP traffic on a
/// LAN broadcast port is expected).
pub fn decode(buf: &[u8]) -> Result<Option<InboundFrame>> {
    if buf.len() < HEADER_LEN {
        return Err(MapcastError::MalformedFrame("frame shorter than header".into()));
    }
    if buf[0] != MAGIC {
        return Ok(None);
    }
    let Some(frame_type) = FrameType::from_u8(buf[1]) else {
        return Err(MapcastError::MalformedFrame(format!("unknown type byte {}", buf[1])));
    };
    let mut id_bytes = [0u8; NODE_ID_LEN];
    id_bytes.copy_from_slice(&buf[2..2 + NODE_ID_LEN]);
    let sender_id = node_id_string(&id_bytes);
    let body = &buf[HEADER_LEN..];

    let message = decode_body(frame_type, body)?;
    Ok(Some(InboundFrame { sender_id, message }))
}

fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(MapcastError::MalformedFrame(format!(
            "expected at least {} bytes, got {}",
            n,
            buf.len()
        )));
    }
    Ok(())
}

fn decode_body(frame_type: FrameType, body: &[u8]) -> Result<Message> {
    match frame_type {
        FrameType::Heartbeat => {
            need(body, 1 + 4 + 2 + 1 + 4 + 2)?;
            let is_master = body[0] != 0;
            let ip = Ipv4Addr::new(body[1], body[2], body[3], body[4]);
            let sync_port = u16::from_be_bytes([body[5], body[6]]);
            let is_syncing = body[7] != 0;
            let sync_progress = f32::from_be_bytes(body[8..12].try_into().unwrap());
            let name_len = u16::from_be_bytes([body[12], body[13]]) as usize;
            need(body, 14 + name_len)?;
            let name = String::from_utf8_lossy(&body[14..14 + name_len]).to_string();
            Ok(Message::Heartbeat(HeartbeatBody {
                is_master,
                sync_ip: ip,
                sync_port,
                is_syncing,
                sync_progress,
                sync_filename: if name.is_empty() { None } else { Some(name) },
            }))
        }
        FrameType::Announce | FrameType::AnnounceReply => {
            need(body, 6)?;
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[4], body[5]]);
            let endpoint = EndpointBody { ip, port };
            Ok(if frame_type == FrameType::Announce {
                Message::Announce(endpoint)
            } else {
                Message::AnnounceReply(endpoint)
            })
        }
        FrameType::PointEdit => {
            need(body, 4 + 1 + 4 + 4 + 4)?;
            let surface_index = u32::from_be_bytes(body[0..4].try_into().unwrap());
            let mode = if body[4] == 0 { GridKind::Output } else { GridKind::Source };
            let point_index = u32::from_be_bytes(body[5..9].try_into().unwrap());
            let nx = f32::from_be_bytes(body[9..13].try_into().unwrap());
            let ny = f32::from_be_bytes(body[13..17].try_into().unwrap());
            Ok(Message::PointEdit(PointEditBody {
                surface_index,
                mode,
                point_index,
                nx,
                ny,
            }))
        }
        FrameType::StructureSnapshot => {
            need(body, 4)?;
            let len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
            need(body, 4 + len)?;
            Ok(Message::StructureSnapshot(body[4..4 + len].to_vec()))
        }
        FrameType::FileOffer => {
            need(body, 8 + 2 + 32)?;
            let total_size = u64::from_be_bytes(body[0..8].try_into().unwrap());
            let name_len = u16::from_be_bytes([body[8], body[9]]) as usize;
            let digest = String::from_utf8_lossy(&body[10..42]).to_string();
            need(body, 42 + name_len)?;
            let name = String::from_utf8_lossy(&body[42..42 + name_len]).to_string();
            Ok(Message::FileOffer(FileOfferBody {
                total_size,
                digest,
                name,
            }))
        }
        FrameType::FileChunk => {
            need(body, 8 + 4)?;
            let offset = u64::from_be_bytes(body[0..8].try_into().unwrap());
            let size = u32::from_be_bytes(body[8..12].try_into().unwrap()) as usize;
            need(body, 12 + size)?;
            Ok(Message::FileChunk(FileChunkBody {
                offset,
                payload: body[12..12 + size].to_vec(),
            }))
        }
        FrameType::FileEnd => {
            need(body, 2)?;
            let name_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            need(body, 2 + name_len)?;
            let name = String::from_utf8_lossy(&body[2..2 + name_len]).to_string();
            Ok(Message::FileEnd(FileEndBody { name }))
        }
        FrameType::ScriptReload => Ok(Message::ScriptReload(body.to_vec())),
        FrameType::ScriptCall => Ok(Message::ScriptCall(body.to_vec())),
    }
}

/// The only defense against broadcast loopback (spec §4.6): drop any
/// inbound frame whose sender_id equals our own.
pub fn is_loopback(self_id: &str, frame: &InboundFrame) -> bool {
    frame.sender_id == self_id
}

struct PendingReceive {
    buffer: Vec<u8>,
    total_size: u64,
    received: usize,
}

/// Receiver-side state machine for the `FILE_OFFER`/`FILE_CHUNK`/
/// `FILE_END` best-effort push path. One instance per sync root.
///
/// `FILE_CHUNK` frames carry no filename (spec §4.6, §6): the wire format
/// assumes one file in flight per sender at a time, matching the "at most
/// one concurrent sync per peer" invariant (spec §3). So chunks are
/// routed to the sender's most recently offered, not-yet-ended name.
pub struct FileReceiver {
    root: PathBuf,
    pending: Mutex<HashMap<String, PendingReceive>>,
    active_by_sender: Mutex<HashMap<String, String>>,
}

impl FileReceiver {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            pending: Mutex::new(HashMap::new()),
            active_by_sender: Mutex::new(HashMap::new()),
        }
    }

    /// Handle an inbound `FILE_OFFER` from `sender_id`. If the named file
    /// already matches the offered digest, the offer is silently dropped
    /// (no allocation, no disk write) — this is what makes
    /// FILE_OFFER/CHUNK/END replay idempotent (spec §8).
    pub fn handle_offer(&self, sender_id: &str, offer: &FileOfferBody, hasher: &crate::hash::HashCache) {
        let Some(path) = crate::content::safe_resolve(&self.root, &offer.name) else {
            warn!("file offer with unsafe path rejected: {}", offer.name);
            return;
        };

        if path.exists() {
            if let Ok(local_digest) = hasher.digest(&path) {
                if local_digest == offer.digest {
                    self.active_by_sender.lock().unwrap().remove(sender_id);
                    return; // already have it, drop the offer
                }
            }
        }

        self.pending.lock().unwrap().insert(
            offer.name.clone(),
            PendingReceive {
                buffer: vec![0u8; offer.total_size as usize],
                total_size: offer.total_size,
                received: 0,
            },
        );
        self.active_by_sender
            .lock()
            .unwrap()
            .insert(sender_id.to_string(), offer.name.clone());
    }

    /// Store a chunk's payload into `sender_id`'s active pending buffer
    /// iff it fits.
    pub fn handle_chunk(&self, sender_id: &str, chunk: &FileChunkBody) {
        let Some(name) = self.active_by_sender.lock().unwrap().get(sender_id).cloned() else {
            return; // no active offer from this sender (e.g. already completed)
        };
        let mut pending = self.pending.lock().unwrap();
        let Some(entry) = pending.get_mut(&name) else {
            return;
        };
        let end = chunk.offset as usize + chunk.payload.len();
        if end as u64 > entry.total_size {
            warn!("file chunk for {} exceeds offered size, dropping", name);
            return;
        }
        entry.buffer[chunk.offset as usize..end].copy_from_slice(&chunk.payload);
        entry.received += chunk.payload.len();
    }

    /// Commit the buffer: write to `<name>.tmp` then atomically rename
    /// over `<name>` (spec §4.6).
    pub fn handle_end(&self, sender_id: &str, end: &FileEndBody, hasher: &crate::hash::HashCache) -> Result<()> {
        self.active_by_sender.lock().unwrap().remove(sender_id);
        let Some(entry) = self.pending.lock().unwrap().remove(&end.name) else {
            return Ok(()); // nothing pending, e.g. offer was dropped as a no-op
        };
        let Some(path) = crate::content::safe_resolve(&self.root, &end.name) else {
            return Err(MapcastError::PathEscape(PathBuf::from(&end.name)));
        };
        let tmp_path = {
            let mut p = path.clone();
            let file_name = format!("{}.tmp", path.file_name().unwrap().to_string_lossy());
            p.set_file_name(file_name);
            p
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp_path, &entry.buffer)?;
        std::fs::rename(&tmp_path, &path)?;
        hasher.invalidate(&path);
        Ok(())
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.lock().unwrap().contains_key(name)
    }
}
