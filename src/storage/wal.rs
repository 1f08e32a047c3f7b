//! Write-Ahead Logging for page mutations
//!
//! Every committed page mutation appends one full page image per touched
//! page. Recovery replays images whose LSN is newer than the page on disk,
//! so a torn data-file write is always repaired from the log.
//!
//! ## File format
//! ```text
//! [len: u32][bincode(WalEntry)] [len: u32][bincode(WalEntry)] ...
//! ```
//! Each entry carries a CRC32 of its serialized record. Partial writes at the
//! tail and records with a bad checksum are skipped during replay.

use crate::config::DurabilityLevel;
use crate::storage::checksum::Checksum;
use crate::storage::Fork;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Log sequence number (monotonically increasing, starts at 1)
pub type Lsn = u64;

/// Upper bound for one encoded entry (a page image plus framing)
const MAX_RECORD_SIZE: usize = 1 << 20;

/// WAL record types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WalRecord {
    /// Full image of one page after a committed mutation
    PageImage {
        fork: Fork,
        blkno: u32,
        image: Vec<u8>,
    },

    /// All records up to `lsn` are reflected in the data files
    Checkpoint { lsn: Lsn },
}

/// WAL entry with LSN and checksum
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalEntry {
    lsn: Lsn,
    record: WalRecord,
    checksum: u32,
}

struct WalInner {
    file: File,
    next_lsn: Lsn,
    /// Highest LSN known to be on stable storage
    synced_lsn: Lsn,
    /// Records appended since the last fsync
    pending: usize,
}

/// Append-only redo log shared by all forks of an index
pub struct Wal {
    path: PathBuf,
    durability: DurabilityLevel,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open (or create) the log at `path` and position after the last valid record
    pub fn open(path: impl AsRef<Path>, durability: DurabilityLevel) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (entries, valid_end) = Self::scan(&mut file)?;
        if file.metadata()?.len() > valid_end {
            // 截断残缺的尾部，避免后续追加的记录被其吞掉
            file.set_len(valid_end)?;
        }
        let last_lsn = entries.last().map(|(lsn, _)| *lsn).unwrap_or(0);

        Ok(Self {
            path,
            durability,
            inner: Mutex::new(WalInner {
                file,
                next_lsn: last_lsn + 1,
                synced_lsn: last_lsn,
                pending: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records atomically with respect to other appenders.
    ///
    /// Returns the LSN of each record, in order.
    pub fn append(&self, records: Vec<WalRecord>) -> Result<Vec<Lsn>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock();
        let mut lsns = Vec::with_capacity(records.len());
        let mut buffer = Vec::new();

        for record in records {
            let lsn = inner.next_lsn;
            inner.next_lsn += 1;
            lsns.push(lsn);

            let record_data = bincode::serialize(&record)?;
            let checksum = Checksum::compute(&record_data);
            let encoded = bincode::serialize(&WalEntry { lsn, record, checksum })?;

            buffer.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            buffer.extend_from_slice(&encoded);
        }

        // 单次写入（append 模式自动追加）
        inner.file.write_all(&buffer)?;
        inner.pending += lsns.len();

        let last = lsns[lsns.len() - 1];
        match self.durability {
            DurabilityLevel::Synchronous => Self::sync_locked(&mut inner, last)?,
            DurabilityLevel::GroupCommit { max_batch_size } => {
                if inner.pending >= max_batch_size {
                    Self::sync_locked(&mut inner, last)?;
                }
            }
            DurabilityLevel::NoSync => {}
        }

        Ok(lsns)
    }

    /// Make sure everything up to `lsn` is durable (WAL-before-data rule)
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.synced_lsn >= lsn {
            return Ok(());
        }
        let last = inner.next_lsn - 1;
        Self::sync_locked(&mut inner, last)
    }

    /// Fsync everything appended so far
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let last = inner.next_lsn - 1;
        Self::sync_locked(&mut inner, last)
    }

    fn sync_locked(inner: &mut WalInner, upto: Lsn) -> Result<()> {
        if inner.pending == 0 && inner.synced_lsn >= upto {
            return Ok(());
        }
        inner.file.sync_data()?;
        inner.synced_lsn = upto;
        inner.pending = 0;
        Ok(())
    }

    /// Next LSN that will be assigned
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    /// Read every valid record in log order
    pub fn read_all(&self) -> Result<Vec<(Lsn, WalRecord)>> {
        let mut file = File::open(&self.path)?;
        Ok(Self::scan(&mut file)?.0)
    }

    /// Drop all records once the data files are known to be durable.
    ///
    /// LSNs keep increasing across truncation so page LSNs stay comparable.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0)?;
        inner.file.sync_all()?;
        inner.synced_lsn = inner.next_lsn - 1;
        inner.pending = 0;

        // 写入 checkpoint 记录，保证重启后 LSN 不回退
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let record = WalRecord::Checkpoint { lsn: lsn - 1 };
        let record_data = bincode::serialize(&record)?;
        let checksum = Checksum::compute(&record_data);
        let encoded = bincode::serialize(&WalEntry { lsn, record, checksum })?;
        inner.file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        inner.file.write_all(&encoded)?;
        inner.file.sync_data()?;
        inner.synced_lsn = lsn;
        Ok(())
    }

    /// Returns the valid records and the byte offset just past the last
    /// complete one.
    fn scan(file: &mut File) -> Result<(Vec<(Lsn, WalRecord)>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut entries = Vec::new();
        let mut corrupted = 0usize;
        let mut valid_end = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(StorageError::Io(e)),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_SIZE {
                tracing::warn!(len, "WAL: implausible record length, ignoring tail");
                break;
            }
            let mut buf = vec![0u8; len];
            match file.read_exact(&mut buf) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!("WAL: partial write detected at end of log, ignoring tail");
                    break;
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
            valid_end += 4 + len as u64;

            let entry: WalEntry = match bincode::deserialize(&buf) {
                Ok(e) => e,
                Err(_) => {
                    corrupted += 1;
                    continue;
                }
            };

            let record_data = bincode::serialize(&entry.record)?;
            if Checksum::verify(&record_data, entry.checksum).is_err() {
                corrupted += 1;
                continue;
            }

            entries.push((entry.lsn, entry.record));
        }

        if corrupted > 0 {
            tracing::warn!(corrupted, "WAL: skipped corrupted records");
        }
        Ok((entries, valid_end))
    }
}
