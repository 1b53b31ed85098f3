//! Persisted consensus state
//!
//! Layout under the data directory:
//! - `conf`: peer configuration, term, vote and commit index (JSON)
//! - `log`: append-only entry frames `[LEN u32][CRC32 u32][bincode LogEntry]`
//! - `snapshot/<term>_<index>.ss`: latest compacted state machine (JSON)
//!
//! The three records form one unit. They are only ever removed together by
//! [`RaftStorage::wipe`].

use crate::common::raft::{LogEntry, Snapshot};
use crate::common::{crc32, Error, Result};
use crate::coordinator::peers::{PersistedConfig, CONF_FILE};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "log";
pub const SNAPSHOT_DIR: &str = "snapshot";

const FRAME_HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Everything recovered from disk on open
#[derive(Debug, Default)]
pub struct PersistedState {
    pub config: Option<PersistedConfig>,
    pub snapshot: Option<Snapshot>,
    /// Entries after the snapshot, contiguous and in index order
    pub entries: Vec<LogEntry>,
}

/// File-backed conf / log / snapshot store
pub struct RaftStorage {
    dir: PathBuf,
    writer: BufWriter<File>,
    max_frame_len: u32,
}

impl RaftStorage {
    /// Open (creating if needed) the store and load whatever it holds.
    pub fn open(dir: impl AsRef<Path>) -> Result<(Self, PersistedState)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(SNAPSHOT_DIR))?;

        let config = PersistedConfig::read(&dir.join(CONF_FILE))?;
        let snapshot = Self::load_latest_snapshot(&dir)?;
        let base_index = snapshot.as_ref().map(|s| s.last_index).unwrap_or(0);

        let log_path = dir.join(LOG_FILE);
        let entries: Vec<LogEntry> = Self::read_log(&log_path)?
            .into_iter()
            .filter(|e| e.index > base_index)
            .collect();

        for (offset, entry) in entries.iter().enumerate() {
            let expected = base_index + 1 + offset as u64;
            if entry.index != expected {
                return Err(Error::Corrupted(format!(
                    "log gap: expected index {}, found {}",
                    expected, entry.index
                )));
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok((
            Self {
                dir,
                writer: BufWriter::new(file),
                max_frame_len: MAX_FRAME_LEN,
            },
            PersistedState {
                config,
                snapshot,
                entries,
            },
        ))
    }

    /// Append entries and sync them to disk.
    ///
    /// All or nothing: on failure the file is cut back to its previous
    /// length so later appends never land behind a partial frame.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let start = self.writer.get_ref().metadata()?.len();
        match self.write_entries(entries) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(rollback) = self.truncate_to(start) {
                    tracing::error!(
                        offset = start,
                        error = %rollback,
                        "Could not roll back a failed log append"
                    );
                    return Err(Error::Corrupted(format!(
                        "log append failed ({}) and left a partial tail",
                        e
                    )));
                }
                Err(e)
            }
        }
    }

    fn write_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            Self::write_frame(&mut self.writer, entry, self.max_frame_len)?;
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Drop any buffered bytes and cut the log file back to `len`
    fn truncate_to(&mut self, len: u64) -> Result<()> {
        let log_path = self.dir.join(LOG_FILE);
        let fresh = BufWriter::new(OpenOptions::new().append(true).open(&log_path)?);
        // into_parts discards the buffer instead of flushing it on drop
        let (_, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        let file = OpenOptions::new().write(true).open(&log_path)?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    /// Replace the whole log with `entries` (used for truncation and compaction)
    pub fn rewrite_log(&mut self, entries: &[LogEntry]) -> Result<()> {
        let log_path = self.dir.join(LOG_FILE);
        let tmp_path = self.dir.join("log.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for entry in entries {
                Self::write_frame(&mut tmp, entry, self.max_frame_len)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &log_path)?;

        let file = OpenOptions::new().append(true).open(&log_path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    pub fn save_config(&self, config: &PersistedConfig) -> Result<()> {
        config.write(&self.dir.join(CONF_FILE))
    }

    /// Persist a snapshot and drop older ones
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let snap_dir = self.dir.join(SNAPSHOT_DIR);
        let name = format!("{}_{}.ss", snapshot.last_term, snapshot.last_index);
        let path = snap_dir.join(&name);
        let tmp = snap_dir.join(format!("{}.tmp", name));

        let json = serde_json::to_vec(snapshot)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        for entry in fs::read_dir(&snap_dir)? {
            let entry = entry?;
            if entry.path() != path {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Remove conf, log and snapshot as one unit.
    ///
    /// `conf` goes first: if the wipe is interrupted, the next start finds
    /// no conf, reports drift, and wipes the remainder.
    pub fn wipe(dir: &Path) -> Result<()> {
        for file in [CONF_FILE, "conf.tmp", LOG_FILE, "log.tmp"] {
            match fs::remove_file(dir.join(file)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        match fs::remove_dir_all(dir.join(SNAPSHOT_DIR)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_frame(writer: &mut impl Write, entry: &LogEntry, max_len: u32) -> Result<()> {
        let payload = bincode::serialize(entry)?;
        if payload.len() > max_len as usize {
            return Err(Error::Internal(format!(
                "entry {} is {} bytes, over the {} byte frame limit",
                entry.index,
                payload.len(),
                max_len
            )));
        }
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&crc32(&payload).to_le_bytes())?;
        writer.write_all(&payload)?;
        Ok(())
    }

    /// Read every intact frame; a torn or corrupt tail is cut off.
    fn read_log(path: &Path) -> Result<Vec<LogEntry>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut entries = Vec::new();
        let mut good_offset = 0u64;
        loop {
            match Self::read_frame(&mut reader) {
                Ok(Some((entry, frame_len))) => {
                    entries.push(entry);
                    good_offset += frame_len;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = good_offset,
                        error = %e,
                        "Discarding damaged log tail"
                    );
                    break;
                }
            }
        }

        if good_offset < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(good_offset)?;
            file.sync_all()?;
        }

        Ok(entries)
    }

    fn read_frame(reader: &mut impl Read) -> Result<Option<(LogEntry, u64)>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < FRAME_HEADER_LEN {
            let n = reader.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < FRAME_HEADER_LEN {
            return Err(Error::Corrupted("truncated frame header".into()));
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_FRAME_LEN {
            return Err(Error::Corrupted(format!("frame length {} too large", len)));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::Corrupted("truncated frame payload".into())
            } else {
                Error::Io(e)
            }
        })?;

        let actual = crc32(&payload);
        if actual != expected {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let entry: LogEntry = bincode::deserialize(&payload)?;
        Ok(Some((entry, (FRAME_HEADER_LEN + payload.len()) as u64)))
    }

    fn load_latest_snapshot(dir: &Path) -> Result<Option<Snapshot>> {
        let mut latest: Option<(u64, PathBuf)> = None;
        for entry in fs::read_dir(dir.join(SNAPSHOT_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ss") {
                continue;
            }
            let index = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.rsplit('_').next())
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(index) = index {
                if latest.as_ref().map_or(true, |(best, _)| index > *best) {
                    latest = Some((index, path));
                }
            }
        }

        match latest {
            Some((_, path)) => Ok(Some(serde_json::from_slice(&fs::read(path)?)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::raft::PeerRecord;
    use crate::topology::{Command, TopologyState};
    use tempfile::tempdir;

    fn entry(term: u64, index: u64, vid: u32) -> LogEntry {
        LogEntry::new(term, index, &Command::max_volume_id(vid)).unwrap()
    }

    #[test]
    fn test_log_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let (mut storage, state) = RaftStorage::open(dir.path()).unwrap();
            assert!(state.entries.is_empty());
            storage.append(&[entry(1, 1, 1), entry(1, 2, 2)]).unwrap();
            storage.append(&[entry(2, 3, 3)]).unwrap();
        }

        let (_, state) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(state.entries, vec![entry(1, 1, 1), entry(1, 2, 2), entry(2, 3, 3)]);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let (mut storage, _) = RaftStorage::open(dir.path()).unwrap();
            storage.append(&[entry(1, 1, 1), entry(1, 2, 2)]).unwrap();
        }

        // simulate a crash halfway through writing a third frame
        let log_path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let (mut storage, state) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(state.entries.len(), 2);

        // appending after recovery continues cleanly
        storage.append(&[entry(1, 3, 3)]).unwrap();
        drop(storage);
        let (_, state) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(state.entries.len(), 3);
    }

    #[test]
    fn test_failed_append_leaves_no_partial_frame() {
        let dir = tempdir().unwrap();
        let (mut storage, _) = RaftStorage::open(dir.path()).unwrap();
        storage.append(&[entry(1, 1, 1)]).unwrap();
        let before = fs::metadata(dir.path().join(LOG_FILE)).unwrap().len();

        // the first frame fits, the second is over the limit
        storage.max_frame_len = 256;
        let mut oversized = entry(1, 3, 3);
        oversized.command = vec![0u8; 1024];
        let err = storage.append(&[entry(1, 2, 2), oversized]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)), "got {err:?}");
        assert_eq!(fs::metadata(dir.path().join(LOG_FILE)).unwrap().len(), before);

        // the retried batch lands right after the last good frame
        storage.append(&[entry(1, 2, 2), entry(1, 3, 3)]).unwrap();
        drop(storage);
        let (_, state) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(state.entries, vec![entry(1, 1, 1), entry(1, 2, 2), entry(1, 3, 3)]);
    }

    #[test]
    fn test_corrupt_frame_ends_log() {
        let dir = tempdir().unwrap();
        {
            let (mut storage, _) = RaftStorage::open(dir.path()).unwrap();
            storage.append(&[entry(1, 1, 1), entry(1, 2, 2)]).unwrap();
        }

        let log_path = dir.path().join(LOG_FILE);
        let mut bytes = fs::read(&log_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&log_path, &bytes).unwrap();

        let (_, state) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(state.entries, vec![entry(1, 1, 1)]);
    }

    #[test]
    fn test_rewrite_truncates() {
        let dir = tempdir().unwrap();
        let (mut storage, _) = RaftStorage::open(dir.path()).unwrap();
        storage
            .append(&[entry(1, 1, 1), entry(1, 2, 2), entry(1, 3, 3)])
            .unwrap();
        storage.rewrite_log(&[entry(1, 1, 1)]).unwrap();
        storage.append(&[entry(2, 2, 9)]).unwrap();
        drop(storage);

        let (_, state) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(state.entries, vec![entry(1, 1, 1), entry(2, 2, 9)]);
    }

    #[test]
    fn test_snapshot_skips_compacted_entries() {
        let dir = tempdir().unwrap();
        let (mut storage, _) = RaftStorage::open(dir.path()).unwrap();
        storage
            .append(&[entry(1, 1, 1), entry(1, 2, 2), entry(1, 3, 3)])
            .unwrap();

        let snapshot = Snapshot {
            last_index: 2,
            last_term: 1,
            members: vec![PeerRecord {
                name: "a:1".into(),
                connection_string: "http://a:1".into(),
            }],
            state: TopologyState { max_volume_id: 2 },
        };
        storage.save_snapshot(&snapshot).unwrap();
        drop(storage);

        // log compaction never ran; entries at or below the snapshot are ignored
        let (_, state) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(state.snapshot, Some(snapshot));
        assert_eq!(state.entries, vec![entry(1, 3, 3)]);
    }

    #[test]
    fn test_only_latest_snapshot_kept() {
        let dir = tempdir().unwrap();
        let (storage, _) = RaftStorage::open(dir.path()).unwrap();
        for index in [5, 10] {
            storage
                .save_snapshot(&Snapshot {
                    last_index: index,
                    last_term: 1,
                    members: vec![],
                    state: TopologyState {
                        max_volume_id: index as u32,
                    },
                })
                .unwrap();
        }
        let files = fs::read_dir(dir.path().join(SNAPSHOT_DIR)).unwrap().count();
        assert_eq!(files, 1);
        let (_, state) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(state.snapshot.unwrap().last_index, 10);
    }

    #[test]
    fn test_wipe_removes_all_records() {
        let dir = tempdir().unwrap();
        {
            let (mut storage, _) = RaftStorage::open(dir.path()).unwrap();
            storage.append(&[entry(1, 1, 1)]).unwrap();
            storage
                .save_config(&PersistedConfig {
                    commit_index: 1,
                    term: 1,
                    voted_for: None,
                    peers: vec![],
                })
                .unwrap();
            storage
                .save_snapshot(&Snapshot {
                    last_index: 1,
                    last_term: 1,
                    members: vec![],
                    state: TopologyState::default(),
                })
                .unwrap();
        }

        RaftStorage::wipe(dir.path()).unwrap();
        assert!(!dir.path().join(CONF_FILE).exists());
        assert!(!dir.path().join(LOG_FILE).exists());
        assert!(!dir.path().join(SNAPSHOT_DIR).exists());

        // wiping twice is harmless
        RaftStorage::wipe(dir.path()).unwrap();

        let (_, state) = RaftStorage::open(dir.path()).unwrap();
        assert!(state.config.is_none());
        assert!(state.snapshot.is_none());
        assert!(state.entries.is_empty());
    }
}
