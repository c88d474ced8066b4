use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use log::error;
use uuid::Uuid;

use super::types::{Direction, TranscriptFrame};
use crate::error_handling::types::StorageError;

/// Fixed per-record header size: session id (16), sub-channel id (4),
/// direction (1), sequence number (8), timestamp micros (8), length (4).
const RECORD_HEADER_LEN: usize = 16 + 4 + 1 + 8 + 8 + 4;

/// Payloads larger than this cannot come from a real relay frame; reading
/// one means the file is corrupt, not that we should allocate gigabytes.
const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Append-only persistence for transcript frames.
///
/// Implementations must keep appends for one session strictly in call
/// order; `read_back` returns frames in exactly that order.
pub trait TranscriptStore: Send + Sync {
    fn append(&self, frame: &TranscriptFrame) -> Result<(), StorageError>;

    fn read_back(&self, session_id: Uuid) -> Result<Vec<TranscriptFrame>, StorageError>;

    /// Flags a transcript whose tail could not be flushed before teardown.
    fn mark_incomplete(&self, session_id: Uuid) -> Result<(), StorageError>;

    fn is_incomplete(&self, session_id: Uuid) -> bool;
}

/// One-file-per-session store using a fixed little-endian record layout.
///
/// Record layout, in order: session id (16 bytes), sub-channel id (u32),
/// direction (u8), sequence number (u64), timestamp in microseconds since
/// the epoch (i64), payload length (u32), payload bytes.
pub struct FileTranscriptStore {
    base_dir: PathBuf,
}

impl FileTranscriptStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, StorageError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| {
            error!("Failed to create transcript directory {}: {}", base_dir.display(), e);
            StorageError::WriteFailed
        })?;
        Ok(Self { base_dir })
    }

    fn transcript_path(&self, session_id: Uuid) -> PathBuf {
        self.base_dir.join(format!("{}.transcript", session_id))
    }

    fn incomplete_path(&self, session_id: Uuid) -> PathBuf {
        self.base_dir.join(format!("{}.incomplete", session_id))
    }
}

impl TranscriptStore for FileTranscriptStore {
    fn append(&self, frame: &TranscriptFrame) -> Result<(), StorageError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.transcript_path(frame.session_id))
            .map_err(|_| StorageError::WriteFailed)?;
        file.write_all(&encode_record(frame))
            .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    fn read_back(&self, session_id: Uuid) -> Result<Vec<TranscriptFrame>, StorageError> {
        let path = self.transcript_path(session_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound)
            }
            Err(_) => return Err(StorageError::ReadFailed),
        };
        decode_records(&raw)
    }

    fn mark_incomplete(&self, session_id: Uuid) -> Result<(), StorageError> {
        fs::write(self.incomplete_path(session_id), b"incomplete\n")
            .map_err(|_| StorageError::WriteFailed)
    }

    fn is_incomplete(&self, session_id: Uuid) -> bool {
        self.incomplete_path(session_id).exists()
    }
}

fn encode_record(frame: &TranscriptFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + frame.payload.len());
    buf.extend_from_slice(frame.session_id.as_bytes());
    buf.extend_from_slice(&frame.subchannel_id.to_le_bytes());
    buf.push(frame.direction.to_wire());
    buf.extend_from_slice(&frame.seq.to_le_bytes());
    buf.extend_from_slice(&frame.timestamp.timestamp_micros().to_le_bytes());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&frame.payload);
    buf
}

fn decode_records(raw: &[u8]) -> Result<Vec<TranscriptFrame>, StorageError> {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    while offset < raw.len() {
        if raw.len() - offset < RECORD_HEADER_LEN {
            return Err(StorageError::Corrupt(format!(
                "truncated record header at offset {}",
                offset
            )));
        }
        let rec = &raw[offset..];
        let session_id = Uuid::from_slice(&rec[0..16])
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let subchannel_id = le_u32(&rec[16..20]);
        let direction = Direction::from_wire(rec[20]).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown direction code {}", rec[20]))
        })?;
        let seq = le_u64(&rec[21..29]);
        let micros = le_u64(&rec[29..37]) as i64;
        let timestamp = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| StorageError::Corrupt(format!("bad timestamp {}", micros)))?;
        let length = le_u32(&rec[37..41]);
        if length > MAX_PAYLOAD_LEN {
            return Err(StorageError::Corrupt(format!(
                "implausible payload length {}",
                length
            )));
        }
        let payload_start = RECORD_HEADER_LEN;
        let payload_end = payload_start + length as usize;
        if rec.len() < payload_end {
            return Err(StorageError::Corrupt(format!(
                "truncated payload at offset {}",
                offset
            )));
        }
        frames.push(TranscriptFrame {
            session_id,
            subchannel_id,
            direction,
            seq,
            timestamp,
            payload: rec[payload_start..payload_end].to_vec(),
        });
        offset += payload_end;
    }
    Ok(frames)
}

// Callers guarantee the slice length via the header check above.
fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Reassembles the per-(sub-channel, direction) byte streams of a session,
/// in sequence order. Control frames are skipped; they carry annotations,
/// not payload.
pub fn replay_streams(frames: &[TranscriptFrame]) -> HashMap<(u32, Direction), Vec<u8>> {
    let mut ordered: Vec<&TranscriptFrame> = frames.iter().collect();
    ordered.sort_by_key(|f| f.seq);
    let mut streams: HashMap<(u32, Direction), Vec<u8>> = HashMap::new();
    for frame in ordered {
        if frame.direction == Direction::Control {
            continue;
        }
        streams
            .entry((frame.subchannel_id, frame.direction))
            .or_default()
            .extend_from_slice(&frame.payload);
    }
    streams
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn frame(session_id: Uuid, seq: u64, direction: Direction, payload: &[u8]) -> TranscriptFrame {
        TranscriptFrame {
            session_id,
            subchannel_id: 0,
            direction,
            seq,
            timestamp: Utc::now(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn appended_frames_read_back_byte_exact() {
        let dir = tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path()).unwrap();
        let id = Uuid::new_v4();

        let frames = vec![
            frame(id, 0, Direction::AttackerToBackend, b"ls -la\r"),
            frame(id, 1, Direction::BackendToAttacker, b"total 42\r\n"),
            frame(id, 2, Direction::Control, &[]),
            frame(id, 3, Direction::BackendToAttacker, &[0x00, 0xff, 0x1b, 0x5b]),
        ];
        for f in &frames {
            store.append(f).unwrap();
        }

        let got = store.read_back(id).unwrap();
        assert_eq!(got.len(), frames.len());
        for (a, b) in frames.iter().zip(&got) {
            assert_eq!(a.session_id, b.session_id);
            assert_eq!(a.subchannel_id, b.subchannel_id);
            assert_eq!(a.direction, b.direction);
            assert_eq!(a.seq, b.seq);
            assert_eq!(a.payload, b.payload);
            // Microsecond precision survives the round trip.
            assert_eq!(a.timestamp.timestamp_micros(), b.timestamp.timestamp_micros());
        }
    }

    #[test]
    fn missing_session_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.read_back(Uuid::new_v4()),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn truncated_file_is_reported_corrupt() {
        let dir = tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        store
            .append(&frame(id, 0, Direction::AttackerToBackend, b"whoami\r"))
            .unwrap();

        let path = dir.path().join(format!("{}.transcript", id));
        let mut raw = fs::read(&path).unwrap();
        raw.truncate(raw.len() - 3);
        fs::write(&path, &raw).unwrap();

        assert!(matches!(
            store.read_back(id),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn incomplete_marker_is_persistent() {
        let dir = tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        assert!(!store.is_incomplete(id));
        store.mark_incomplete(id).unwrap();
        assert!(store.is_incomplete(id));
    }

    #[test]
    fn replay_reassembles_streams_in_seq_order() {
        let id = Uuid::new_v4();
        // Deliberately shuffled input; replay must order by seq.
        let frames = vec![
            frame(id, 2, Direction::AttackerToBackend, b" -la\r"),
            frame(id, 0, Direction::AttackerToBackend, b"ls"),
            frame(id, 3, Direction::BackendToAttacker, b"total 42\r\n"),
            frame(id, 1, Direction::Control, b"pty 80x24"),
        ];
        let streams = replay_streams(&frames);
        assert_eq!(
            streams[&(0, Direction::AttackerToBackend)],
            b"ls -la\r".to_vec()
        );
        assert_eq!(
            streams[&(0, Direction::BackendToAttacker)],
            b"total 42\r\n".to_vec()
        );
        assert!(!streams.contains_key(&(0, Direction::Control)));
    }
}
