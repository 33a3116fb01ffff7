//! Durable, crash-tolerant session persistence.
//!
//! Layout: one directory per session under the sessions root, holding a small
//! `meta.json` (rewritten wholesale via atomic temp-file + rename) and an
//! append-only `events.jsonl` (one JSON record per line). A crash mid-write
//! costs at most one truncated trailing log line, which readers skip.
//!
//! A secondary append-only `index.jsonl` at the root records metadata
//! upserts/deletes across all sessions so listing is cheap; it is a cache,
//! not a source of truth, and is rebuilt by directory scan when absent.
//!
//! Concurrency: single writer per session is assumed. The atomic-rename
//! pattern protects readers, not concurrent writers.

mod index;

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use relay_types::{SessionId, SessionIdError, TranscriptEvent, TranscriptRecord};

pub use index::IndexEntry;

const META_FILE: &str = "meta.json";
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid session id: {0}")]
    InvalidId(#[from] SessionIdError),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("derived path escapes the sessions root")]
    PathEscape,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt metadata: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    pub title: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_model: Option<String>,
}

fn now_unix_ms() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

/// Filesystem-backed store rooted at one sessions directory.
pub struct SessionStore {
    root: PathBuf,
    /// Next event seq per session, seeded lazily from the existing log.
    next_seq: Mutex<HashMap<String, u64>>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            next_seq: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derive the session directory, re-checking containment even though the
    /// validated id charset cannot traverse.
    fn session_dir(&self, id: &SessionId) -> Result<PathBuf, StoreError> {
        let dir = self.root.join(id.as_str());
        if !dir.starts_with(&self.root) {
            return Err(StoreError::PathEscape);
        }
        Ok(dir)
    }

    fn meta_path(&self, id: &SessionId) -> Result<PathBuf, StoreError> {
        Ok(self.session_dir(id)?.join(META_FILE))
    }

    fn events_path(&self, id: &SessionId) -> Result<PathBuf, StoreError> {
        Ok(self.session_dir(id)?.join(EVENTS_FILE))
    }

    /// Load a session's metadata, or `None` if it was never created.
    pub fn load_meta(&self, id: &SessionId) -> Result<Option<SessionMeta>, StoreError> {
        let path = self.meta_path(id)?;
        relay_utils::recover_backup(&path);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Fetch existing metadata or create the session on first reference.
    pub fn ensure_session(&self, id: &SessionId) -> Result<SessionMeta, StoreError> {
        if let Some(meta) = self.load_meta(id)? {
            return Ok(meta);
        }
        self.create_session(id, None, None)
    }

    pub fn create_session(
        &self,
        id: &SessionId,
        title: Option<&str>,
        origin: Option<&str>,
    ) -> Result<SessionMeta, StoreError> {
        let dir = self.session_dir(id)?;
        fs::create_dir_all(&dir)?;

        let now = now_unix_ms();
        let meta = SessionMeta {
            id: id.clone(),
            title: title.unwrap_or(id.as_str()).to_string(),
            created_at_ms: now,
            updated_at_ms: now,
            origin: origin.map(ToString::to_string),
            last_model: None,
        };
        self.write_meta(&meta)?;
        Ok(meta)
    }

    /// Mutate metadata in place. `updated_at_ms` is bumped and kept
    /// monotonically non-decreasing regardless of what the closure does.
    pub fn update_meta<F>(&self, id: &SessionId, mutate: F) -> Result<SessionMeta, StoreError>
    where
        F: FnOnce(&mut SessionMeta),
    {
        let mut meta = self
            .load_meta(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let floor = meta.updated_at_ms;
        mutate(&mut meta);
        meta.updated_at_ms = now_unix_ms().max(floor);
        self.write_meta(&meta)?;
        Ok(meta)
    }

    fn write_meta(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        let path = self.meta_path(&meta.id)?;
        let json = serde_json::to_vec_pretty(meta)?;
        relay_utils::atomic_write(&path, &json)?;
        index::append_upsert(&self.root, meta);
        Ok(())
    }

    /// Append one event, assigning the next monotonic seq for the session.
    pub fn append_event(
        &self,
        id: &SessionId,
        event: TranscriptEvent,
    ) -> Result<TranscriptRecord, StoreError> {
        let path = self.events_path(id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let seq = self.take_seq(id)?;
        let record = TranscriptRecord::new(seq, now_unix_ms(), event);

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        file.flush()?;

        Ok(record)
    }

    fn take_seq(&self, id: &SessionId) -> Result<u64, StoreError> {
        let mut map = self.next_seq.lock().expect("seq lock poisoned");
        let next = match map.get(id.as_str()) {
            Some(next) => *next,
            None => self
                .read_events(id)?
                .last()
                .map_or(0, |record| record.seq + 1),
        };
        map.insert(id.as_str().to_string(), next + 1);
        Ok(next)
    }

    /// Replay the full event log.
    ///
    /// A truncated or corrupt trailing line (the only artifact a mid-write
    /// crash can leave) is skipped. Corruption anywhere else is skipped too,
    /// loudly.
    pub fn read_events(&self, id: &SessionId) -> Result<Vec<TranscriptRecord>, StoreError> {
        let path = self.events_path(id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let bytes = fs::read(&path)?;
        let mut records = Vec::new();
        let lines: Vec<&[u8]> = bytes.split(|&b| b == b'\n').collect();
        let last_index = lines.len().saturating_sub(1);

        for (i, line) in lines.iter().enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<TranscriptRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if i >= last_index.saturating_sub(1) => {
                    tracing::debug!(
                        session = %id,
                        "Dropping truncated trailing event line: {e}"
                    );
                }
                Err(e) => {
                    tracing::warn!(session = %id, line = i, "Skipping corrupt event line: {e}");
                }
            }
        }

        Ok(records)
    }

    /// Events after the most recent reset marker - the session's effective
    /// state.
    pub fn read_effective_events(
        &self,
        id: &SessionId,
    ) -> Result<Vec<TranscriptRecord>, StoreError> {
        let records = self.read_events(id)?;
        let cut = records
            .iter()
            .rposition(|record| matches!(record.event, TranscriptEvent::Reset))
            .map_or(0, |i| i + 1);
        Ok(records[cut..].to_vec())
    }

    /// Empty the event log and write a reset marker.
    ///
    /// The file itself is kept: the marker records that a reset happened and
    /// when. Seq numbering continues from where it was.
    pub fn reset_session(&self, id: &SessionId) -> Result<TranscriptRecord, StoreError> {
        let path = self.events_path(id)?;
        if !path.starts_with(&self.root) {
            return Err(StoreError::PathEscape);
        }

        // Seed the seq counter from the old log before truncating it.
        {
            let mut map = self.next_seq.lock().expect("seq lock poisoned");
            if !map.contains_key(id.as_str()) {
                let next = self
                    .read_events(id)?
                    .last()
                    .map_or(0, |record| record.seq + 1);
                map.insert(id.as_str().to_string(), next);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, b"")?;
        self.append_event(id, TranscriptEvent::Reset)
    }

    /// List all sessions, most recently updated first.
    ///
    /// Served from the index log when present; otherwise rebuilt by scanning
    /// the session directories (and the index is rewritten).
    pub fn list_sessions(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let mut sessions = match index::replay(&self.root) {
            Some(map) => map.into_values().collect::<Vec<_>>(),
            None => {
                let scanned = self.scan_sessions()?;
                index::rewrite(&self.root, &scanned);
                scanned
            }
        };
        sessions.sort_by_key(|meta| std::cmp::Reverse(meta.updated_at_ms));
        Ok(sessions)
    }

    fn scan_sessions(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            let Ok(id) = SessionId::new(name) else {
                continue;
            };
            match self.load_meta(&id) {
                Ok(Some(meta)) => sessions.push(meta),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session = %id, "Skipping unreadable session metadata: {e}");
                }
            }
        }
        Ok(sessions)
    }
}
