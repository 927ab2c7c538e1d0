//! Durable history store: append-only JSONL direct/group message logs plus
//! an atomically-persisted group index.
//!
//! Layout under the configured data directory:
//!
//! ```text
//! data/
//!   state.json              — group index, written via write-to-temp + rename
//!   direct_<device_id>.jsonl
//!   group_<group_id>.jsonl
//! ```
//!
//! Appends use an open-append-flush discipline: every call opens the file in
//! append mode, writes one line, and flushes before returning, so a crash
//! mid-session never corrupts a previously-flushed line. This mirrors the
//! WAL-journal guarantee the original SQLite-backed store relied on, without
//! needing a database engine.

use crate::protocol::Envelope;
use crate::types::{DeviceId, GroupId, GroupRecord};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to create data directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open history log at {path}: {source}")]
    OpenLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write history log at {path}: {source}")]
    WriteLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read history log at {path}: {source}")]
    ReadLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt history line in {path}: {source}")]
    CorruptLine {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to persist group state at {path}: {source}")]
    WriteState {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read group state at {path}: {source}")]
    ReadState {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt group state at {path}: {source}")]
    CorruptState {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Owns the `data/` directory and serializes access to the on-disk history
/// for direct messages, group messages, and group membership state.
pub struct HistoryStore {
    data_dir: PathBuf,
}

impl HistoryStore {
    /// Opens (creating if necessary) a history store rooted at `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|e| HistoryError::CreateDir {
            path: data_dir.clone(),
            source: e,
        })?;
        Ok(Self { data_dir })
    }

    fn direct_log_path(&self, peer_id: &DeviceId) -> PathBuf {
        self.data_dir
            .join(format!("direct_{}.jsonl", safe_component(peer_id.as_str())))
    }

    fn group_log_path(&self, group_id: &GroupId) -> PathBuf {
        self.data_dir.join(format!(
            "group_{}.jsonl",
            safe_component(group_id.as_str())
        ))
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// Appends one envelope to the direct-message log for `peer_id`.
    pub fn append_direct(&self, peer_id: &DeviceId, envelope: &Envelope) -> Result<(), HistoryError> {
        Self::append_line(&self.direct_log_path(peer_id), envelope)
    }

    /// Returns every envelope ever appended for `peer_id`, oldest first.
    pub fn read_direct(&self, peer_id: &DeviceId) -> Result<Vec<Envelope>, HistoryError> {
        Self::read_lines(&self.direct_log_path(peer_id))
    }

    /// Appends one envelope to the group-message log for `group_id`.
    pub fn append_group(&self, group_id: &GroupId, envelope: &Envelope) -> Result<(), HistoryError> {
        Self::append_line(&self.group_log_path(group_id), envelope)
    }

    /// Returns every envelope ever appended for `group_id`, oldest first.
    pub fn read_group(&self, group_id: &GroupId) -> Result<Vec<Envelope>, HistoryError> {
        Self::read_lines(&self.group_log_path(group_id))
    }

    fn append_line(path: &Path, envelope: &Envelope) -> Result<(), HistoryError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| HistoryError::OpenLog {
                path: path.to_owned(),
                source: e,
            })?;
        let line = serde_json::to_string(envelope).expect("Envelope always serializes");
        writeln!(file, "{line}").map_err(|e| HistoryError::WriteLog {
            path: path.to_owned(),
            source: e,
        })?;
        file.flush().map_err(|e| HistoryError::WriteLog {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(())
    }

    fn read_lines(path: &Path) -> Result<Vec<Envelope>, HistoryError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(path).map_err(|e| HistoryError::ReadLog {
            path: path.to_owned(),
            source: e,
        })?;
        let reader = std::io::BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| HistoryError::ReadLog {
                path: path.to_owned(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let envelope: Envelope =
                serde_json::from_str(&line).map_err(|e| HistoryError::CorruptLine {
                    path: path.to_owned(),
                    source: e,
                })?;
            out.push(envelope);
        }
        Ok(out)
    }

    /// Loads the full group index from `state.json`. Returns an empty map if
    /// the file has never been written.
    pub fn load_groups(&self) -> Result<HashMap<GroupId, GroupRecord>, HistoryError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| HistoryError::ReadState {
            path: path.clone(),
            source: e,
        })?;
        let records: Vec<GroupRecord> =
            serde_json::from_str(&content).map_err(|e| HistoryError::CorruptState {
                path: path.clone(),
                source: e,
            })?;
        Ok(records
            .into_iter()
            .map(|r| (r.group_id.clone(), r))
            .collect())
    }

    /// Persists one group record, replacing any prior record with the same
    /// `group_id`. Writes to a temp file in the same directory and renames
    /// it into place so a crash mid-write never leaves `state.json` partial.
    pub fn save_group(&self, record: &GroupRecord) -> Result<(), HistoryError> {
        let mut groups = self.load_groups()?;
        groups.insert(record.group_id.clone(), record.clone());
        let records: Vec<&GroupRecord> = groups.values().collect();

        let path = self.state_path();
        let tmp_path = self.data_dir.join("state.json.tmp");
        let content = serde_json::to_string_pretty(&records).expect("group records always serialize");
        std::fs::write(&tmp_path, content).map_err(|e| HistoryError::WriteState {
            path: tmp_path.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| HistoryError::WriteState {
            path: path.clone(),
            source: e,
        })?;
        Ok(())
    }
}

/// Maps an arbitrary device/group id into a string safe to embed as one path
/// component: only ASCII alphanumerics, `-`, and `_` survive; everything
/// else becomes `_`. Ids are normally UUIDs so this is a no-op in practice,
/// but peer-supplied ids are never trusted to build a path directly.
fn safe_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use tempfile::TempDir;

    fn envelope(kind: &str, text: &str) -> Envelope {
        Envelope::new(
            kind,
            DeviceId::new("a"),
            "device-a",
            Platform::Pc,
            serde_json::json!({ "text": text }),
        )
        .unwrap()
    }

    #[test]
    fn direct_append_then_read_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let store = HistoryStore::open(tmp.path()).unwrap();
        let peer = DeviceId::new("b");

        store.append_direct(&peer, &envelope("message", "one")).unwrap();
        store.append_direct(&peer, &envelope("message", "two")).unwrap();

        let read = store.read_direct(&peer).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].payload["text"], "one");
        assert_eq!(read[1].payload["text"], "two");
    }

    #[test]
    fn read_direct_missing_log_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = HistoryStore::open(tmp.path()).unwrap();
        let read = store.read_direct(&DeviceId::new("nobody")).unwrap();
        assert!(read.is_empty());
    }

    #[test]
    fn group_append_then_read_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let store = HistoryStore::open(tmp.path()).unwrap();
        let group = GroupId::new("family");

        store.append_group(&group, &envelope("group_message", "hola")).unwrap();
        let read = store.read_group(&group).unwrap();
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn save_group_then_load_groups_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let store = HistoryStore::open(tmp.path()).unwrap();
        let record = GroupRecord::new(GroupId::new("g1"), "family", DeviceId::new("a"), 1);

        store.save_group(&record).unwrap();
        let loaded = store.load_groups().unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&GroupId::new("g1")).unwrap(), &record);
    }

    #[test]
    fn save_group_replaces_existing_record() {
        let tmp = TempDir::new().unwrap();
        let store = HistoryStore::open(tmp.path()).unwrap();
        let mut record = GroupRecord::new(GroupId::new("g1"), "family", DeviceId::new("a"), 1);
        store.save_group(&record).unwrap();

        record.epoch = 2;
        store.save_group(&record).unwrap();

        let loaded = store.load_groups().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&GroupId::new("g1")).unwrap().epoch, 2);
    }

    #[test]
    fn save_group_does_not_leave_temp_file_behind() {
        let tmp = TempDir::new().unwrap();
        let store = HistoryStore::open(tmp.path()).unwrap();
        let record = GroupRecord::new(GroupId::new("g1"), "family", DeviceId::new("a"), 1);
        store.save_group(&record).unwrap();
        assert!(!tmp.path().join("state.json.tmp").exists());
    }

    #[test]
    fn safe_component_strips_path_separators() {
        assert_eq!(safe_component("../../etc/passwd"), "______etc_passwd");
    }
}
