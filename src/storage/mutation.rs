//! Durable-mutation scope
//!
//! A `PageMutation` collects exclusively locked pages, hands out scratch
//! copies to modify, and on `commit` writes one WAL page image per page of a
//! logged fork before installing the new images. `abort` (or dropping the
//! scope) discards the scratch copies, so nothing is logged for a no-op.
//!
//! ```ignore
//! let mut m = PageMutation::start(&wal);
//! let slot = m.register(pool.write_page(blkno)?);
//! m.page_mut(slot).add_item(&bytes);
//! m.commit()?;              // logs + installs + releases the lock
//! ```

use crate::storage::buffer::PageWriteGuard;
use crate::storage::page::Page;
use crate::storage::wal::{Wal, WalRecord};
use crate::storage::BlockNumber;
use crate::Result;

struct Registered {
    guard: PageWriteGuard,
    scratch: Page,
}

/// Scoped page mutation; see module docs
pub struct PageMutation<'a> {
    wal: &'a Wal,
    pages: Vec<Registered>,
}

impl<'a> PageMutation<'a> {
    pub fn start(wal: &'a Wal) -> Self {
        Self { wal, pages: Vec::with_capacity(2) }
    }

    /// Take ownership of a locked page; returns its slot in this scope
    pub fn register(&mut self, guard: PageWriteGuard) -> usize {
        let scratch = (*guard).clone();
        self.pages.push(Registered { guard, scratch });
        self.pages.len() - 1
    }

    /// Current (possibly modified) image of a registered page
    pub fn page(&self, slot: usize) -> &Page {
        &self.pages[slot].scratch
    }

    pub fn page_mut(&mut self, slot: usize) -> &mut Page {
        &mut self.pages[slot].scratch
    }

    pub fn blkno(&self, slot: usize) -> BlockNumber {
        self.pages[slot].guard.blkno()
    }

    /// Log and install every registered page, returning the still-locked
    /// guards in registration order
    pub fn finish(mut self) -> Result<Vec<PageWriteGuard>> {
        let pages = std::mem::take(&mut self.pages);

        let records: Vec<WalRecord> = pages
            .iter()
            .filter(|r| r.guard.fork().is_logged())
            .map(|r| WalRecord::PageImage {
                fork: r.guard.fork(),
                blkno: r.guard.blkno(),
                image: r.scratch.as_bytes().to_vec(),
            })
            .collect();
        let mut lsns = self.wal.append(records)?.into_iter();

        let mut guards = Vec::with_capacity(pages.len());
        for Registered { mut guard, mut scratch } in pages {
            if guard.fork().is_logged() {
                if let Some(lsn) = lsns.next() {
                    scratch.set_lsn(lsn);
                }
            }
            guard.copy_from(&scratch);
            guard.mark_dirty();
            guards.push(guard);
        }
        Ok(guards)
    }

    /// Log, install and release every registered page
    pub fn commit(self) -> Result<()> {
        self.finish().map(drop)
    }

    /// Discard all changes; the guards come back untouched
    pub fn abort(mut self) -> Vec<PageWriteGuard> {
        std::mem::take(&mut self.pages)
            .into_iter()
            .map(|r| r.guard)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityLevel;
    use crate::storage::buffer::BufferPool;
    use crate::storage::Fork;
    use std::sync::Arc;

    fn setup(dir: &std::path::Path, fork: Fork) -> (Arc<Wal>, BufferPool) {
        let wal = Arc::new(Wal::open(dir.join("index.wal"), DurabilityLevel::NoSync).unwrap());
        let pool = BufferPool::open(dir.join(fork.file_name()), fork, 1024, 16, Arc::clone(&wal)).unwrap();
        (wal, pool)
    }

    #[test]
    fn test_commit_logs_and_installs() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, pool) = setup(dir.path(), Fork::Main);

        let mut m = PageMutation::start(&wal);
        let slot = m.register(pool.new_page().unwrap());
        m.page_mut(slot).init(8);
        m.page_mut(slot).add_item(b"abc").unwrap();
        m.commit().unwrap();

        let page = pool.read_page(0).unwrap();
        assert_eq!(page.item(1).unwrap(), b"abc");
        assert_eq!(page.lsn(), 1);
        assert_eq!(wal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_abort_discards_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, pool) = setup(dir.path(), Fork::Main);
        {
            let mut page = pool.new_page().unwrap();
            page.init(8);
        }

        let mut m = PageMutation::start(&wal);
        let slot = m.register(pool.write_page(0).unwrap());
        m.page_mut(slot).add_item(b"never").unwrap();
        drop(m.abort());

        // dropping without commit is an abort as well
        let mut m = PageMutation::start(&wal);
        let slot = m.register(pool.write_page(0).unwrap());
        m.page_mut(slot).add_item(b"never either").unwrap();
        drop(m);

        assert_eq!(pool.read_page(0).unwrap().max_offset(), 0);
        assert!(wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_unlogged_fork_skips_wal() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, pool) = setup(dir.path(), Fork::Init);

        let mut m = PageMutation::start(&wal);
        let slot = m.register(pool.new_page().unwrap());
        m.page_mut(slot).init(8);
        m.commit().unwrap();

        assert!(!pool.read_page(0).unwrap().is_new());
        assert!(wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_finish_keeps_locks() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, pool) = setup(dir.path(), Fork::Main);

        let mut m = PageMutation::start(&wal);
        let a = m.register(pool.new_page().unwrap());
        let b = m.register(pool.new_page().unwrap());
        m.page_mut(a).init(8);
        m.page_mut(b).init(8);
        let mut guards = m.finish().unwrap();
        assert_eq!(guards.len(), 2);

        let second = guards.pop().unwrap();
        assert_eq!(second.blkno(), 1);
        assert!(!second.is_new());
        // 两页各有一条 WAL 记录，LSN 递增
        assert_eq!(guards[0].lsn() + 1, second.lsn());
    }
}
