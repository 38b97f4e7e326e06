//! Replicated state document (C9): the in-memory mapping document a
//! master authors and peers mirror. Plain `serde` structs serialized with
//! `serde_json`, following the same shape the teacher uses for its own
//! tagged wire enums (`sync_session.rs::SyncMessage`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single normalized 2-D control point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Which grid a point edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridKind {
    Output,
    Source,
}

/// One projection surface: a rows x cols grid of output and source
/// control points, and the content entry it's textured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Surface {
    pub id: String,
    pub content_id: String,
    pub rows: usize,
    pub cols: usize,
    pub output_grid: Vec<Point>,
    pub source_grid: Vec<Point>,
}

impl Surface {
    /// `content_id` value meaning "no content assigned yet" (spec §3).
    pub const PLACEHOLDER_CONTENT: &'static str = "__placeholder__";

    pub fn new_placeholder(id: impl Into<String>, rows: usize, cols: usize) -> Self {
        let n = rows * cols;
        let grid: Vec<Point> = (0..n)
            .map(|i| {
                let r = (i / cols) as f32;
                let c = (i % cols) as f32;
                Point::new(
                    if cols > 1 { c / (cols - 1) as f32 } else { 0.0 },
                    if rows > 1 { r / (rows - 1) as f32 } else { 0.0 },
                )
            })
            .collect();
        Self {
            id: id.into(),
            content_id: Self::PLACEHOLDER_CONTENT.to_string(),
            rows,
            cols,
            output_grid: grid.clone(),
            source_grid: grid,
        }
    }

    /// Invariant check (spec §3): grid lengths match rows*cols.
    pub fn is_well_formed(&self) -> bool {
        let n = self.rows * self.cols;
        self.output_grid.len() == n && self.source_grid.len() == n
    }

    fn grid_mut(&mut self, kind: GridKind) -> &mut Vec<Point> {
        match kind {
            GridKind::Output => &mut self.output_grid,
            GridKind::Source => &mut self.source_grid,
        }
    }
}

/// All surfaces authored by one peer (owner keyed by node ID at the
/// document level, see `MappingDocument`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerSurfaces {
    pub surfaces: Vec<Surface>,
}

/// The full mapping document: `peers[peer_id] -> surfaces[i] -> grid`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingDocument {
    pub peers: HashMap<String, PeerSurfaces>,
}

impl MappingDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Replace all surfaces from a full snapshot. Surface IDs identical
    /// between old and new documents keep their position in the owning
    /// peer's surface list where possible, so renderer-side identity
    /// (e.g. GPU resource reuse keyed by index) is stable across a
    /// structure push that doesn't actually reorder anything.
    pub fn apply_snapshot(&mut self, snapshot: MappingDocument) {
        for (peer_id, new_surfaces) in snapshot.peers {
            match self.peers.get(&peer_id) {
                Some(existing) => {
                    let mut by_id: HashMap<String, Surface> = existing
                        .surfaces
                        .iter()
                        .cloned()
                        .map(|s| (s.id.clone(), s))
                        .collect();
                    let reordered: Vec<Surface> = new_surfaces
                        .surfaces
                        .into_iter()
                        .map(|incoming| {
                            by_id.remove(&incoming.id);
                            incoming
                        })
                        .collect();
                    self.peers.insert(peer_id, PeerSurfaces { surfaces: reordered });
                }
                None => {
                    self.peers.insert(peer_id, new_surfaces);
                }
            }
        }
        // Peers absent from the snapshot are left untouched: a snapshot
        // only ever carries the authoring master's own surfaces.
    }

    /// Mutate one control point. Out-of-range indices are no-ops (spec
    /// §4.9). `owner` is the peer_id whose surface list to mutate.
    pub fn apply_point_edit(
        &mut self,
        owner: &str,
        surface_index: usize,
        mode: GridKind,
        point_index: usize,
        nx: f32,
        ny: f32,
    ) {
        let Some(peer) = self.peers.get_mut(owner) else {
            return;
        };
        let Some(surface) = peer.surfaces.get_mut(surface_index) else {
            return;
        };
        let grid = surface.grid_mut(mode);
        let Some(point) = grid.get_mut(point_index) else {
            return;
        };
        point.x = nx;
        point.y = ny;
    }

    /// Emit a snapshot suitable for `STRUCTURE_SNAPSHOT`: currently the
    /// whole document, since today only one peer authors at a time
    /// (mastership is user-asserted and assumed unique, spec §1).
    pub fn serialize(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
