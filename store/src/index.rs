//! Append-only session index.
//!
//! One line per metadata upsert (or delete, written by administrative
//! tooling), replayed last-wins. Strictly a cache over the per-session
//! `meta.json` files: loss or corruption is repaired by a directory scan.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use relay_types::SessionId;

use crate::SessionMeta;

const INDEX_FILE: &str = "index.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IndexEntry {
    Upsert { meta: SessionMeta },
    Delete { id: SessionId },
}

/// Best-effort append; the index is a cache, so failures only log.
pub(crate) fn append_upsert(root: &Path, meta: &SessionMeta) {
    let entry = IndexEntry::Upsert { meta: meta.clone() };
    if let Err(e) = append_entry(root, &entry) {
        tracing::warn!("Failed to append session index entry: {e}");
    }
}

fn append_entry(root: &Path, entry: &IndexEntry) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(root.join(INDEX_FILE))?;
    file.write_all(&line)?;
    file.flush()
}

/// Replay the index into a last-wins map, or `None` when the file is absent
/// (signal to rebuild by scanning).
pub(crate) fn replay(root: &Path) -> Option<HashMap<String, SessionMeta>> {
    let bytes = std::fs::read(root.join(INDEX_FILE)).ok()?;

    let mut sessions = HashMap::new();
    for line in bytes.split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<IndexEntry>(line) {
            Ok(IndexEntry::Upsert { meta }) => {
                sessions.insert(meta.id.as_str().to_string(), meta);
            }
            Ok(IndexEntry::Delete { id }) => {
                sessions.remove(id.as_str());
            }
            Err(e) => {
                tracing::debug!("Skipping corrupt index line: {e}");
            }
        }
    }
    Some(sessions)
}

/// Rewrite the index wholesale from scanned metadata.
pub(crate) fn rewrite(root: &Path, sessions: &[SessionMeta]) {
    let mut body = Vec::new();
    for meta in sessions {
        let entry = IndexEntry::Upsert { meta: meta.clone() };
        match serde_json::to_vec(&entry) {
            Ok(mut line) => {
                body.append(&mut line);
                body.push(b'\n');
            }
            Err(e) => tracing::warn!("Failed to serialize index entry: {e}"),
        }
    }
    if let Err(e) = relay_utils::atomic_write(root.join(INDEX_FILE), &body) {
        tracing::warn!("Failed to rewrite session index: {e}");
    }
}
