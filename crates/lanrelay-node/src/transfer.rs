//! File-transfer sub-protocol: a lazy chunked sender and a per-(peer, file)
//! receive session reassembled in arrival order.

use crate::manager::{ConnectionManager, NodeError, NodeEvent};
use lanrelay_core::protocol::{FileChunkFrame, FileMetaFrame};
use lanrelay_core::types::{DeviceId, FileId};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Fixed chunk size used by the sender. The wire format allows up to
/// `MAX_CHUNK_SIZE`; this implementation never produces a chunk that large.
const SEND_CHUNK_SIZE: usize = 512 * 1024;

/// State for one file currently being received from one peer, keyed by
/// `(peer_id, file_id)` in the connection manager. Touched only from that
/// peer's reader task, so no lock beyond the manager's `transfers` mutex
/// guarding the map itself is required.
pub struct ReceiveSession {
    file: File,
    path: PathBuf,
    filename: String,
    declared_size: u64,
    bytes_written: u64,
    received_chunks: HashSet<u32>,
}

impl ConnectionManager {
    /// Sends `path` to `peer_id` as a `file_meta` frame followed by a stream
    /// of `file_chunk` frames, reporting `(bytes_sent, total_size)` after
    /// each successful write. Aborts on the first I/O error; no retry.
    pub async fn send_file(&self, peer_id: &DeviceId, path: &Path) -> Result<(), NodeError> {
        let writer = self
            .writer_for(peer_id)
            .await
            .ok_or_else(|| NodeError::NotConnected(peer_id.clone()))?;

        let metadata = std::fs::metadata(path)?;
        let size = metadata.len();
        let filename = sanitize_filename(
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file"),
        );

        let file_id = FileId::generate();
        let meta = FileMetaFrame::new(file_id, size, filename.clone())
            .map_err(|e| NodeError::InvalidInput(e.to_string()))?;
        writer.send_binary(&lanrelay_core::protocol::BinaryFrame::Meta(meta)).await?;

        let mut file = File::open(path)?;
        let mut buf = vec![0u8; SEND_CHUNK_SIZE];
        let mut sent: u64 = 0;
        let mut chunk_index: u32 = 0;

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = FileChunkFrame::new(file_id, chunk_index, buf[..n].to_vec())
                .map_err(|e| NodeError::InvalidInput(e.to_string()))?;
            writer
                .send_binary(&lanrelay_core::protocol::BinaryFrame::Chunk(chunk))
                .await?;
            sent += n as u64;
            chunk_index += 1;
            self.emit(NodeEvent::FileProgress {
                file_id,
                bytes: sent,
                total: size,
            });
        }

        info!(peer = %peer_id, %filename, bytes = sent, "file transfer complete");
        Ok(())
    }

    pub(crate) async fn on_file_meta(&self, from: &DeviceId, meta: FileMetaFrame) {
        let filename = sanitize_filename(&meta.filename);
        let mut path = self.received_dir.join(&filename);
        if let Err(e) = std::fs::create_dir_all(&self.received_dir) {
            warn!(peer = %from, error = %e, "failed to create received/ directory");
            return;
        }
        path = unique_path(path);

        let file = match File::create(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(peer = %from, error = %e, path = %path.display(), "failed to open output file");
                return;
            }
        };

        let session = ReceiveSession {
            file,
            path,
            filename,
            declared_size: meta.size,
            bytes_written: 0,
            received_chunks: HashSet::new(),
        };

        let mut transfers = self.transfers.lock().await;
        if transfers
            .insert((from.clone(), meta.file_id), session)
            .is_some()
        {
            warn!(peer = %from, file_id = %meta.file_id, "replacing stale transfer session for this file id");
        }
    }

    pub(crate) async fn on_file_chunk(&self, from: &DeviceId, chunk: FileChunkFrame) {
        let mut transfers = self.transfers.lock().await;
        let key = (from.clone(), chunk.file_id);
        let Some(session) = transfers.get_mut(&key) else {
            warn!(peer = %from, file_id = %chunk.file_id, "dropping chunk for unknown transfer session");
            return;
        };

        if let Err(e) = session
            .file
            .seek(SeekFrom::Start(session.bytes_written))
            .and_then(|_| session.file.write_all(&chunk.data))
        {
            warn!(peer = %from, error = %e, "failed to write file chunk, aborting transfer");
            transfers.remove(&key);
            return;
        }

        session.bytes_written += chunk.data.len() as u64;
        session.received_chunks.insert(chunk.chunk_index);

        if session.bytes_written > session.declared_size {
            warn!(peer = %from, file_id = %chunk.file_id, "transfer exceeded declared size, aborting");
            let reason = "received more bytes than declared".to_string();
            transfers.remove(&key);
            drop(transfers);
            self.emit(NodeEvent::TransferFailed {
                file_id: chunk.file_id,
                reason,
            });
            return;
        }

        self.emit(NodeEvent::FileProgress {
            file_id: chunk.file_id,
            bytes: session.bytes_written,
            total: session.declared_size,
        });

        if session.bytes_written == session.declared_size {
            let session = transfers.remove(&key).expect("just matched above");
            drop(transfers);
            info!(peer = %from, filename = %session.filename, "file transfer received");
            self.emit(NodeEvent::FileReceived {
                filename: session.filename,
                path: session.path,
            });
        }
    }
}

/// Strips directory components, NUL bytes, and rejects empty/`.`/`..`;
/// truncates to 255 bytes of UTF-8. Collision handling is applied
/// separately by [`unique_path`] once the destination directory is known.
pub fn sanitize_filename(raw: &str) -> String {
    let base = Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let cleaned: String = base.chars().filter(|c| *c != '\0').collect();
    let cleaned = if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned
    };
    truncate_utf8(&cleaned, 255)
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// If `path` already exists, appends `-<n>` before the extension until a
/// free name is found.
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|e| e.to_str());

    for n in 1.. {
        let candidate_name = match ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = parent.join(candidate_name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("file system exhausted every numeric suffix")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directory_components() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
    }

    #[test]
    fn sanitize_removes_nul_bytes() {
        assert_eq!(sanitize_filename("foo\0bar.txt"), "foobar.txt");
    }

    #[test]
    fn sanitize_rejects_dot_and_dotdot() {
        assert_eq!(sanitize_filename("."), "file");
        assert_eq!(sanitize_filename(".."), "file");
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "a".repeat(500);
        let sanitized = sanitize_filename(&long);
        assert!(sanitized.len() <= 255);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_filename("../weird/name\0.bin");
        let twice = sanitize_filename(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn unique_path_appends_suffix_on_collision() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("photo.jpg");
        std::fs::write(&path, b"existing").unwrap();

        let resolved = unique_path(path.clone());
        assert_eq!(resolved, tmp.path().join("photo-1.jpg"));
    }

    #[test]
    fn unique_path_passes_through_when_free() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("new-file.bin");
        assert_eq!(unique_path(path.clone()), path);
    }
}
