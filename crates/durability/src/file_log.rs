//! File-backed operation log
//!
//! A single append-only file of CRC-framed [`LogEntry`] values. Opening the
//! file replays every frame into the in-memory index.
//!
//! # Crash Safety
//!
//! - A frame is durable once `put`/`remove` returns (fsync in `Always` mode)
//! - A torn last frame (short or failing its CRC at end of file) is the
//!   remnant of a crashed append: it is truncated away on open
//! - A bad frame followed by more data is corruption and fails the open
//! - Compaction writes live records to a temporary file, fsyncs it, renames
//!   it over the log and fsyncs the directory

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::frame::{decode_frame, encode_frame, DecodedFrame, LogEntry};
use crate::oplog::{OperationLog, RecordIndex, StoredRecord};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tabletsnap_core::{RecordKey, SysRecord};
use tracing::{debug, info, warn};

/// Log file name inside the log directory
pub const LOG_FILE_NAME: &str = "sys_catalog.log";

struct FileLogInner {
    file: File,
    index: RecordIndex,
    superseded_frames: usize,
}

/// Operation log persisted in a single file
pub struct FileOperationLog {
    dir: PathBuf,
    config: LogConfig,
    inner: Mutex<FileLogInner>,
}

impl FileOperationLog {
    /// Open (or create) the log in `dir` and replay it
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let (index, superseded_frames, valid_len) = replay(&buf)?;
        if valid_len < buf.len() as u64 {
            warn!(
                target: "tabletsnap::log",
                path = %path.display(),
                valid_len,
                file_len = buf.len(),
                "Truncating torn tail of operation log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        info!(
            target: "tabletsnap::log",
            path = %path.display(),
            records = index.len(),
            "Operation log opened"
        );

        Ok(Self {
            dir,
            config,
            inner: Mutex::new(FileLogInner {
                file,
                index,
                superseded_frames,
            }),
        })
    }

    /// Path of the log file
    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    /// Rewrite the file with only live records
    pub fn compact(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    fn append(&self, inner: &mut FileLogInner, entry: LogEntry) -> LogResult<()> {
        let frame = encode_frame(&entry)?;
        inner.file.write_all(&frame)?;
        if self.config.durability.requires_immediate_fsync() {
            inner.file.sync_data()?;
        } else {
            inner.file.flush()?;
        }

        let key = entry.key;
        let replaces = inner.index.get(&key).is_some();
        inner.index.apply(entry);
        if replaces {
            inner.superseded_frames += 1;
        }

        if inner.superseded_frames >= self.config.compaction_threshold
            && inner.superseded_frames > inner.index.len()
        {
            self.compact_locked(inner)?;
        }
        Ok(())
    }

    fn compact_locked(&self, inner: &mut FileLogInner) -> LogResult<()> {
        let final_path = self.path();
        let temp_path = self.dir.join(format!(".{}.tmp", LOG_FILE_NAME));

        {
            let mut temp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            for stored in inner.index.all() {
                let frame = encode_frame(&LogEntry {
                    key: stored.record.key(),
                    version: stored.version,
                    record: Some(stored.record),
                })?;
                temp.write_all(&frame)?;
            }
            temp.sync_all()?;
        }

        std::fs::rename(&temp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        inner.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&final_path)?;
        let dropped = inner.superseded_frames;
        inner.superseded_frames = 0;

        debug!(
            target: "tabletsnap::log",
            live = inner.index.len(),
            dropped,
            "Operation log compacted"
        );
        Ok(())
    }
}

/// Replay frames; returns the index, superseded frame count and valid prefix length
fn replay(buf: &[u8]) -> LogResult<(RecordIndex, usize, u64)> {
    let mut index = RecordIndex::default();
    let mut superseded = 0usize;
    let mut offset = 0usize;

    while offset < buf.len() {
        match decode_frame(&buf[offset..])? {
            DecodedFrame::Complete { entry, len } => {
                if index.get(&entry.key).is_some() {
                    superseded += 1;
                }
                index.apply(entry);
                offset += len;
            }
            DecodedFrame::Incomplete => break,
            DecodedFrame::BadChecksum { len } => {
                if offset + len >= buf.len() {
                    break;
                }
                return Err(LogError::Corruption {
                    offset: offset as u64,
                    reason: "frame checksum mismatch".into(),
                });
            }
        }
    }

    Ok((index, superseded, offset as u64))
}

impl OperationLog for FileOperationLog {
    fn load_all(&self) -> LogResult<Vec<StoredRecord>> {
        Ok(self.inner.lock().index.all())
    }

    fn get(&self, key: &RecordKey) -> LogResult<Option<StoredRecord>> {
        Ok(self.inner.lock().index.get(key))
    }

    fn put(&self, record: &SysRecord, expected: Option<u64>) -> LogResult<u64> {
        let key = record.key();
        let mut inner = self.inner.lock();
        inner.index.check(&key, expected)?;
        let version = inner.index.next_version();
        self.append(
            &mut inner,
            LogEntry {
                key,
                version,
                record: Some(record.clone()),
            },
        )?;
        Ok(version)
    }

    fn remove(&self, key: &RecordKey, expected: u64) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.index.check(key, Some(expected))?;
        let version = inner.index.next_version();
        self.append(
            &mut inner,
            LogEntry {
                key: *key,
                version,
                record: None,
            },
        )
    }
}
