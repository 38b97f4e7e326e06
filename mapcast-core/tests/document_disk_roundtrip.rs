//! Exercises `MappingDocument::save`/`load` against real disk paths
//! (`mapcast-core/src/document.rs`), including the "create the parent
//! directory on first save" behavior `synced/configs/<peer_id>.mappings.json`
//! relies on (spec §6 on-disk layout).

use mapcast_core::document::{GridKind, MappingDocument, Surface};
use tempfile::tempdir;

#[test]
fn save_creates_parent_dirs_and_load_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("synced/configs/AAAAAAAA.mappings.json");

    let mut doc = MappingDocument::new();
    let mut surface = Surface::new_placeholder("S1", 2, 2);
    surface.content_id = "video.mp4".to_string();
    doc.peers.insert(
        "AAAAAAAA".to_string(),
        mapcast_core::document::PeerSurfaces {
            surfaces: vec![surface],
        },
    );
    doc.apply_point_edit("AAAAAAAA", 0, GridKind::Output, 1, 0.6, 0.1);

    doc.save(&path).unwrap();
    assert!(path.exists());

    let loaded = MappingDocument::load(&path).unwrap();
    assert_eq!(loaded, doc);
}

#[test]
fn load_of_missing_file_is_an_error_not_an_empty_document() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nope/missing.json");
    assert!(MappingDocument::load(&path).is_err());
}

#[test]
fn save_then_save_again_overwrites_cleanly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.json");

    let mut doc = MappingDocument::new();
    doc.peers.insert(
        "AAAAAAAA".to_string(),
        mapcast_core::document::PeerSurfaces {
            surfaces: vec![Surface::new_placeholder("S1", 1, 1)],
        },
    );
    doc.save(&path).unwrap();

    doc.peers.insert(
        "BBBBBBBB".to_string(),
        mapcast_core::document::PeerSurfaces {
            surfaces: vec![Surface::new_placeholder("S2", 2, 2)],
        },
    );
    doc.save(&path).unwrap();

    let loaded = MappingDocument::load(&path).unwrap();
    assert_eq!(loaded.peers.len(), 2);
}
