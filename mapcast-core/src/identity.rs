//! Node identity (C2): a stable 8-character node ID persisted alongside a
//! local settings document.
//!
//! Grounded on `SyncSession::generate_room_code` in the teacher's
//! `sync_session.rs` — same confusable-character-free alphabet and
//! `rand::Rng::gen_range` loop — widened to a 62-character alnum alphabet
//! and mixed with a monotonic counter and the current timestamp so two
//! processes started in the same millisecond on the same host don't
//! collide before either settings file is written.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;

const ID_LEN: usize = 8;
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

static PROCESS_COUNTER: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "ID")]
    pub id: Option<String>,
}

fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Timestamp-mixed, thread-local-counter, PRNG-seeded 8-char ID generation.
fn generate_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = PROCESS_COUNTER.fetch_add(1, Ordering::Relaxed) as u128;
    let mut seed = nanos ^ (counter.wrapping_mul(0x9E3779B97F4A7C15));

    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| {
            // Mix in a PRNG draw each position so two calls in the same
            // nanosecond on the same counter value still diverge.
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let idx = ((seed >> 33) as usize ^ rng.gen_range(0..ALPHABET.len())) % ALPHABET.len();
            ALPHABET[idx] as char
        })
        .collect()
}

/// Load settings from `path`, generating and persisting a fresh node ID if
/// the file is absent, unparseable, or holds an invalid ID. Returns the
/// (possibly newly-generated) node ID.
pub fn load_or_create_node_id(path: &Path) -> Result<String> {
    let mut settings = match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str::<Settings>(&text).unwrap_or_default(),
        Err(_) => Settings::default(),
    };

    let needs_new = match &settings.id {
        Some(id) => !is_valid_id(id),
        None => true,
    };

    if needs_new {
        settings.id = Some(generate_id());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&settings)?;
        std::fs::write(path, text)?;
    }

    Ok(settings.id.expect("just set above"))
}
