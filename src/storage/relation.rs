//! Opened index relation
//!
//! Directory layout:
//! ```text
//! <dir>/
//!   main.flat   live index pages
//!   init.flat   empty image (unlogged indexes)
//!   index.wal   redo log shared by both forks
//! ```
//!
//! Opening replays every WAL page image that is newer than the block on
//! disk, then checkpoints (flush both forks, truncate the log).

use crate::config::IndexConfig;
use crate::storage::buffer::BufferPool;
use crate::storage::mutation::PageMutation;
use crate::storage::wal::{Wal, WalRecord};
use crate::storage::{BlockNumber, Fork};
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const WAL_FILE: &str = "index.wal";

pub struct IndexRelation {
    dir: PathBuf,
    config: IndexConfig,
    wal: Arc<Wal>,
    main: BufferPool,
    init: BufferPool,
}

impl IndexRelation {
    /// Open (or create) the index stored in `dir`
    pub fn open(dir: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let wal = Arc::new(Wal::open(dir.join(WAL_FILE), config.durability)?);
        let open_fork = |fork: Fork| {
            BufferPool::open(
                dir.join(fork.file_name()),
                fork,
                config.page_size,
                config.buffer_capacity,
                Arc::clone(&wal),
            )
        };
        let main = open_fork(Fork::Main)?;
        let init = open_fork(Fork::Init)?;

        let rel = Self { dir, config, wal, main, init };
        let replayed = rel.replay()?;
        if replayed > 0 {
            tracing::info!(replayed, dir = %rel.dir.display(), "WAL replay restored page images");
        }
        rel.checkpoint()?;
        Ok(rel)
    }

    fn replay(&self) -> Result<usize> {
        let mut replayed = 0;
        for (lsn, record) in self.wal.read_all()? {
            let WalRecord::PageImage { fork, blkno, image } = record else {
                continue;
            };
            let pool = self.pool(fork);
            // 磁盘上的页可能是半写的，读失败时直接用日志镜像覆盖
            let stale = blkno >= pool.nblocks()
                || match pool.read_page(blkno) {
                    Ok(page) => page.lsn() < lsn,
                    Err(e) => {
                        tracing::debug!(blkno, error = %e, "unreadable block, restoring from WAL");
                        true
                    }
                };
            if stale {
                pool.restore_page(blkno, &image)?;
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn pool(&self, fork: Fork) -> &BufferPool {
        match fork {
            Fork::Main => &self.main,
            Fork::Init => &self.init,
        }
    }

    /// Number of blocks in `fork`
    pub fn nblocks(&self, fork: Fork) -> BlockNumber {
        self.pool(fork).nblocks()
    }

    /// Start a durable-mutation scope
    pub fn start_mutation(&self) -> PageMutation<'_> {
        PageMutation::start(&self.wal)
    }

    /// Write full images of blocks `start..end` of `fork` to the WAL.
    ///
    /// Needed after building into a fork whose per-page commits skip the log.
    pub fn log_new_page_range(&self, fork: Fork, start: BlockNumber, end: BlockNumber) -> Result<()> {
        let pool = self.pool(fork);
        for blkno in start..end {
            let mut page = pool.write_page(blkno)?;
            let lsns = self.wal.append(vec![WalRecord::PageImage {
                fork,
                blkno,
                image: page.as_bytes().to_vec(),
            }])?;
            if let Some(&lsn) = lsns.first() {
                page.set_lsn(lsn);
                page.mark_dirty();
            }
        }
        self.wal.flush()
    }

    /// Make the WAL durable without touching data files
    pub fn flush_wal(&self) -> Result<()> {
        self.wal.flush()
    }

    /// Write back both forks, then drop the log
    pub fn checkpoint(&self) -> Result<()> {
        self.wal.flush()?;
        self.main.flush_all()?;
        self.init.flush_all()?;
        self.wal.truncate()
    }
}
