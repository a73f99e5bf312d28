//! Append-only NDJSON transcript per session.
//!
//! Distinct from [`crate::manager::SessionManager`]'s SQLite `sessions`
//! table, which only tracks aggregate stats (`message_count`,
//! `total_tokens`, `last_model`). The transcript is the durable message
//! log the web-chat RPC surface reads and writes: one file per session
//! key, one JSON record per line, with a `parentId` chain and
//! `idempotencyKey` dedup so repeated `chat.send`/`chat.abort` calls with
//! the same key are no-ops.
//!
//! Grounded on [`crate::manager::SessionManager`]'s `Mutex`-guarded,
//! lazily-initialised-per-key shape, generalized from one shared SQLite
//! connection to one file handle per session key.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Keys are opaque strings (the canonical `openclaw_router::SessionKey`
/// format, or any other caller-chosen identifier) — the store itself never
/// parses or constructs them.

/// Bumped whenever the on-disk record shape changes in a way old readers
/// can't parse.
pub const CURRENT_SESSION_VERSION: u32 = 1;

/// One line of a transcript file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptRecord {
    Session {
        version: u32,
        id: String,
        timestamp: String,
        cwd: String,
    },
    Message(MessageRecord),
}

/// A single transcript message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

struct TranscriptState {
    path: PathBuf,
    leaf_id: Option<String>,
    seen_idempotency: HashSet<String>,
}

/// Per-session append-only transcript files under a shared base directory.
pub struct TranscriptStore {
    base_dir: PathBuf,
    sessions: Mutex<HashMap<String, Mutex<TranscriptState>>>,
}

impl TranscriptStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into(), sessions: Mutex::new(HashMap::new()) }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.ndjson", sanitize_filename(key)))
    }

    /// Append a message, returning the stored record. If `idempotency_key`
    /// has already been recorded for this session, returns the existing
    /// record instead of writing a duplicate.
    pub fn append_message(
        &self,
        key: &str,
        role: &str,
        content: &str,
        idempotency_key: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<MessageRecord> {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(load_or_init(&self.path_for(key)).expect("transcript init")));
        let mut state = entry.lock().unwrap();

        if let Some(idem) = idempotency_key {
            if state.seen_idempotency.contains(idem) {
                if let Some(existing) = find_by_idempotency(&state.path, idem)? {
                    return Ok(existing);
                }
            }
        }

        let record = MessageRecord {
            id: Uuid::now_v7().to_string(),
            parent_id: state.leaf_id.clone(),
            role: role.to_string(),
            content: content.to_string(),
            idempotency_key: idempotency_key.map(|s| s.to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata,
        };

        append_line(&state.path, &TranscriptRecord::Message(record.clone()))?;
        state.leaf_id = Some(record.id.clone());
        if let Some(idem) = idempotency_key {
            state.seen_idempotency.insert(idem.to_string());
        }

        Ok(record)
    }

    /// Read every message record for a session, oldest first. Returns an
    /// empty vec if the transcript does not exist yet.
    pub fn read_all(&self, key: &str) -> Result<Vec<MessageRecord>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path)?;
        let reader = BufReader::new(file);
        let mut messages = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let TranscriptRecord::Message(m) = serde_json::from_str(&line)? {
                messages.push(m);
            }
        }
        Ok(messages)
    }

}

fn load_or_init(path: &Path) -> Result<TranscriptState> {
    if path.exists() {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut leaf_id = None;
        let mut seen = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let TranscriptRecord::Message(m) = serde_json::from_str(&line)? {
                leaf_id = Some(m.id.clone());
                if let Some(idem) = m.idempotency_key {
                    seen.insert(idem);
                }
            }
        }
        Ok(TranscriptState { path: path.to_path_buf(), leaf_id, seen_idempotency: seen })
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let header = TranscriptRecord::Session {
            version: CURRENT_SESSION_VERSION,
            id: Uuid::now_v7().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            cwd: std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default(),
        };
        append_line(path, &header)?;
        set_owner_only_permissions(path)?;
        Ok(TranscriptState { path: path.to_path_buf(), leaf_id: None, seen_idempotency: HashSet::new() })
    }
}

fn find_by_idempotency(path: &Path, idempotency_key: &str) -> Result<Option<MessageRecord>> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let TranscriptRecord::Message(m) = serde_json::from_str(&line)? {
            if m.idempotency_key.as_deref() == Some(idempotency_key) {
                return Ok(Some(m));
            }
        }
    }
    Ok(None)
}

fn append_line(path: &Path, record: &TranscriptRecord) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn sanitize_filename(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "agent:main:webchat:user:u-1";

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        store.append_message(KEY, "user", "hello", None, None).unwrap();
        store.append_message(KEY, "assistant", "hi there", None, None).unwrap();

        let messages = store.read_all(KEY).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].parent_id.as_deref(), Some(messages[0].id.as_str()));
    }

    #[test]
    fn duplicate_idempotency_key_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        let first = store
            .append_message(KEY, "assistant", "first", Some("run-1:assistant"), None)
            .unwrap();
        let second = store
            .append_message(KEY, "assistant", "duplicate attempt", Some("run-1:assistant"), None)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "first");
        assert_eq!(store.read_all(KEY).unwrap().len(), 1);
    }

    #[test]
    fn abort_metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        let meta = serde_json::json!({
            "openclawAbort": { "aborted": true, "origin": "rpc", "runId": "run-9" }
        });
        store
            .append_message(KEY, "assistant", "partial output", Some("run-9:assistant"), Some(meta.clone()))
            .unwrap();
        let messages = store.read_all(KEY).unwrap();
        assert_eq!(messages[0].metadata, Some(meta));
    }
}
