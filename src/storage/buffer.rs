//! Buffer pool
//!
//! Caches the pages of one fork in memory and hands them out through RAII
//! guards:
//!
//! - `PageReadGuard`  : pin + shared lock
//! - `PageWriteGuard` : pin + exclusive lock
//! - `PinnedPage`     : pin only, no lock
//!
//! A pin keeps the frame resident; a lock serializes access to its bytes.
//! Dropping a guard releases the lock first, then the pin. The cleanup lock
//! (`cleanup_page`) is an exclusive lock taken only when no other backend
//! holds a pin, which is what deletion of items requires.
//!
//! ## Eviction
//! Frames live in an LRU list. When the pool grows past its capacity the
//! least recently used frames nobody references are written back (after
//! the WAL is flushed up to their LSN) and dropped. Pinned frames are never
//! evicted, so the pool may temporarily exceed its capacity.

use crate::storage::page::Page;
use crate::storage::wal::Wal;
use crate::storage::{BlockNumber, Fork};
use crate::{Result, StorageError};
use lru::LruCache;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One cached page
struct Frame {
    blkno: BlockNumber,
    page: Arc<RwLock<Page>>,
    dirty: AtomicBool,
    pins: Mutex<usize>,
    unpinned: Condvar,
}

impl Frame {
    fn new(blkno: BlockNumber, page: Page) -> Self {
        Self {
            blkno,
            page: Arc::new(RwLock::new(page)),
            dirty: AtomicBool::new(false),
            pins: Mutex::new(0),
            unpinned: Condvar::new(),
        }
    }

    fn pin(self: &Arc<Self>) -> PinHandle {
        *self.pins.lock() += 1;
        PinHandle { frame: Arc::clone(self) }
    }
}

/// Releases one pin on drop
struct PinHandle {
    frame: Arc<Frame>,
}

impl Drop for PinHandle {
    fn drop(&mut self) {
        let mut pins = self.frame.pins.lock();
        *pins -= 1;
        if *pins <= 1 {
            self.frame.unpinned.notify_all();
        }
    }
}

/// Page pinned and locked in share mode
pub struct PageReadGuard {
    // 字段按声明顺序析构：先释放锁，再释放 pin
    guard: ArcRwLockReadGuard<RawRwLock, Page>,
    pin: PinHandle,
    fork: Fork,
}

impl PageReadGuard {
    pub fn blkno(&self) -> BlockNumber {
        self.pin.frame.blkno
    }

    pub fn fork(&self) -> Fork {
        self.fork
    }
}

impl Deref for PageReadGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

/// Page pinned and locked in exclusive mode
pub struct PageWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
    pin: PinHandle,
    fork: Fork,
}

impl PageWriteGuard {
    pub fn blkno(&self) -> BlockNumber {
        self.pin.frame.blkno
    }

    pub fn fork(&self) -> Fork {
        self.fork
    }

    /// The in-memory image differs from disk and must be written back
    pub fn mark_dirty(&self) {
        self.pin.frame.dirty.store(true, Ordering::Release);
    }
}

impl Deref for PageWriteGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

/// Page pinned without a lock; keeps cleanup lockers waiting
pub struct PinnedPage {
    pin: PinHandle,
}

impl PinnedPage {
    pub fn blkno(&self) -> BlockNumber {
        self.pin.frame.blkno
    }
}

/// Buffer pool statistics
#[derive(Debug, Default, Clone)]
pub struct BufferStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

/// Page cache for one fork file
pub struct BufferPool {
    fork: Fork,
    path: PathBuf,
    page_size: usize,
    capacity: usize,
    file: Mutex<File>,
    frames: Mutex<LruCache<BlockNumber, Arc<Frame>>>,
    /// Relation extension lock; guards the block count
    extension: Mutex<BlockNumber>,
    wal: Arc<Wal>,
    counters: Counters,
}

impl BufferPool {
    /// Open (or create) the fork file at `path`
    pub fn open(
        path: impl AsRef<Path>,
        fork: Fork,
        page_size: usize,
        capacity: usize,
        wal: Arc<Wal>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            tracing::warn!(
                path = %path.display(),
                len,
                "fork file is not a multiple of the page size; ignoring partial block"
            );
        }
        let nblocks = (len / page_size as u64) as BlockNumber;

        Ok(Self {
            fork,
            path,
            page_size,
            capacity,
            file: Mutex::new(file),
            frames: Mutex::new(LruCache::unbounded()),
            extension: Mutex::new(nblocks),
            wal,
            counters: Counters::default(),
        })
    }

    pub fn fork(&self) -> Fork {
        self.fork
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of blocks in the fork
    pub fn nblocks(&self) -> BlockNumber {
        *self.extension.lock()
    }

    /// Pin + share-lock a block
    pub fn read_page(&self, blkno: BlockNumber) -> Result<PageReadGuard> {
        let frame = self.get_frame(blkno)?;
        let pin = frame.pin();
        let guard = frame.page.read_arc();
        Ok(PageReadGuard { guard, pin, fork: self.fork })
    }

    /// Pin + exclusive-lock a block
    pub fn write_page(&self, blkno: BlockNumber) -> Result<PageWriteGuard> {
        let frame = self.get_frame(blkno)?;
        let pin = frame.pin();
        let guard = frame.page.write_arc();
        Ok(PageWriteGuard { guard, pin, fork: self.fork })
    }

    /// Pin a block without locking it
    pub fn pin_page(&self, blkno: BlockNumber) -> Result<PinnedPage> {
        let frame = self.get_frame(blkno)?;
        Ok(PinnedPage { pin: frame.pin() })
    }

    /// Exclusive lock held while no one else has the block pinned.
    ///
    /// Blocks until every other pin is released.
    pub fn cleanup_page(&self, blkno: BlockNumber) -> Result<PageWriteGuard> {
        let frame = self.get_frame(blkno)?;
        let pin = frame.pin();
        loop {
            let guard = frame.page.write_arc();
            if *frame.pins.lock() == 1 {
                return Ok(PageWriteGuard { guard, pin, fork: self.fork });
            }
            drop(guard);

            let mut pins = frame.pins.lock();
            while *pins > 1 {
                frame.unpinned.wait_for(&mut pins, Duration::from_millis(50));
            }
        }
    }

    /// Extend the fork by one zeroed block and return it exclusively locked.
    ///
    /// The caller initializes the page; until then it reads as `is_new()`.
    pub fn new_page(&self) -> Result<PageWriteGuard> {
        let mut nblocks = self.extension.lock();
        let blkno = *nblocks;
        if blkno == crate::storage::INVALID_BLOCK {
            return Err(StorageError::ResourceExhausted(format!(
                "cannot extend {}: block number space exhausted",
                self.path.display()
            )));
        }

        // 先在文件中占位，保证重启后块数一致
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(blkno as u64 * self.page_size as u64))?;
            file.write_all(&vec![0u8; self.page_size])?;
        }
        *nblocks += 1;

        let frame = Arc::new(Frame::new(blkno, Page::new_zeroed(self.page_size)));
        let pin = frame.pin();
        let guard = frame.page.write_arc();
        self.install(blkno, Arc::clone(&frame))?;
        drop(nblocks);

        Ok(PageWriteGuard { guard, pin, fork: self.fork })
    }

    /// Install a full page image (WAL replay, new-page logging on restore).
    ///
    /// Extends the fork if `blkno` is past the end.
    pub fn restore_page(&self, blkno: BlockNumber, image: &[u8]) -> Result<()> {
        if image.len() != self.page_size {
            return Err(StorageError::Corruption(format!(
                "page image for block {} has {} bytes, expected {}",
                blkno,
                image.len(),
                self.page_size
            )));
        }
        {
            let mut nblocks = self.extension.lock();
            if blkno >= *nblocks {
                let file = self.file.lock();
                file.set_len((blkno as u64 + 1) * self.page_size as u64)?;
                *nblocks = blkno + 1;
            }
        }
        let frame = self.get_frame(blkno)?;
        let mut page = frame.page.write();
        *page = Page::from_bytes(image.to_vec());
        frame.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Write back every dirty frame and fsync the fork file
    pub fn flush_all(&self) -> Result<()> {
        let frames: Vec<Arc<Frame>> = {
            let cache = self.frames.lock();
            cache.iter().map(|(_, f)| Arc::clone(f)).collect()
        };
        for frame in frames {
            let page = frame.page.read();
            if frame.dirty.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.write_back(frame.blkno, &page) {
                    frame.dirty.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Drop every cached frame without writing (crash simulation / reset)
    pub fn discard_all(&self) {
        self.frames.lock().clear();
    }

    /// Truncate the fork to zero blocks
    pub fn truncate(&self) -> Result<()> {
        let mut nblocks = self.extension.lock();
        self.frames.lock().clear();
        let file = self.file.lock();
        file.set_len(0)?;
        file.sync_all()?;
        *nblocks = 0;
        Ok(())
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
        }
    }

    fn get_frame(&self, blkno: BlockNumber) -> Result<Arc<Frame>> {
        {
            let mut cache = self.frames.lock();
            if let Some(frame) = cache.get(&blkno) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(frame));
            }
        }

        let nblocks = self.nblocks();
        if blkno >= nblocks {
            return Err(StorageError::InvalidArgument(format!(
                "block {} out of range ({} has {} blocks)",
                blkno,
                self.path.display(),
                nblocks
            )));
        }

        let mut cache = self.frames.lock();
        // 双重检查：加锁期间可能已被其他线程载入
        if let Some(frame) = cache.get(&blkno) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(frame));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let page = self.read_from_disk(blkno)?;
        let frame = Arc::new(Frame::new(blkno, page));
        cache.put(blkno, Arc::clone(&frame));
        self.evict_locked(&mut cache)?;
        Ok(frame)
    }

    fn install(&self, blkno: BlockNumber, frame: Arc<Frame>) -> Result<()> {
        let mut cache = self.frames.lock();
        cache.put(blkno, frame);
        self.evict_locked(&mut cache)
    }

    fn evict_locked(&self, cache: &mut LruCache<BlockNumber, Arc<Frame>>) -> Result<()> {
        if cache.len() <= self.capacity {
            return Ok(());
        }
        let excess = cache.len() - self.capacity;
        // 从最久未使用的一端挑选无人引用的页
        let victims: Vec<BlockNumber> = cache
            .iter()
            .rev()
            .filter(|(_, f)| Arc::strong_count(f) == 1)
            .map(|(b, _)| *b)
            .take(excess)
            .collect();

        for blkno in victims {
            if let Some(frame) = cache.pop(&blkno) {
                if frame.dirty.load(Ordering::Acquire) {
                    let page = frame.page.read();
                    self.write_back(blkno, &page)?;
                }
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn write_back(&self, blkno: BlockNumber, page: &Page) -> Result<()> {
        // WAL-before-data
        if page.lsn() > 0 {
            self.wal.flush_up_to(page.lsn())?;
        }
        let mut image = page.clone();
        image.update_checksum();

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(blkno as u64 * self.page_size as u64))?;
        file.write_all(image.as_bytes())?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_from_disk(&self, blkno: BlockNumber) -> Result<Page> {
        let mut buf = vec![0u8; self.page_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(blkno as u64 * self.page_size as u64))?;
            file.read_exact(&mut buf)?;
        }
        let page = Page::from_bytes(buf);
        page.verify_checksum(blkno)?;
        page.validate_header(blkno)?;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityLevel;
    use std::sync::atomic::AtomicUsize;

    fn pool(dir: &Path, capacity: usize) -> BufferPool {
        let wal = Arc::new(Wal::open(dir.join("index.wal"), DurabilityLevel::NoSync).unwrap());
        BufferPool::open(dir.join("main.flat"), Fork::Main, 1024, capacity, wal).unwrap()
    }

    #[test]
    fn test_new_page_extends_fork() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 8);
        assert_eq!(pool.nblocks(), 0);

        let a = pool.new_page().unwrap();
        let b = pool.new_page().unwrap();
        assert_eq!((a.blkno(), b.blkno()), (0, 1));
        assert!(a.is_new());
        assert_eq!(pool.nblocks(), 2);
        assert!(pool.read_page(2).is_err());
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let pool = pool(dir.path(), 8);
            let mut page = pool.new_page().unwrap();
            page.init(8);
            page.add_item(b"persisted").unwrap();
            page.mark_dirty();
            drop(page);
            pool.flush_all().unwrap();
        }
        let pool = pool(dir.path(), 8);
        assert_eq!(pool.nblocks(), 1);
        let page = pool.read_page(0).unwrap();
        assert_eq!(page.item(1).unwrap(), b"persisted");
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 4);
        for i in 0..12u8 {
            let mut page = pool.new_page().unwrap();
            page.init(8);
            page.add_item(&[i; 16]).unwrap();
            page.mark_dirty();
        }
        assert!(pool.stats().evictions >= 8);

        for i in 0..12u8 {
            let page = pool.read_page(i as u32).unwrap();
            assert_eq!(page.item(1).unwrap(), &[i; 16]);
        }
    }

    #[test]
    fn test_corrupted_block_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        {
            let pool = pool(dir.path(), 8);
            let mut page = pool.new_page().unwrap();
            page.init(8);
            page.add_item(b"data").unwrap();
            page.mark_dirty();
            drop(page);
            pool.flush_all().unwrap();
        }
        {
            let mut f = OpenOptions::new().write(true).open(dir.path().join("main.flat")).unwrap();
            f.seek(SeekFrom::Start(900)).unwrap();
            f.write_all(&[0x5A; 8]).unwrap();
        }
        let pool = pool(dir.path(), 8);
        assert!(pool.read_page(0).err().unwrap().is_corruption());
    }

    #[test]
    fn test_cleanup_lock_waits_for_pins() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(pool(dir.path(), 8));
        {
            let mut page = pool.new_page().unwrap();
            page.init(8);
        }

        let pinned = pool.pin_page(0).unwrap();
        let acquired = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            let cleaner_pool = Arc::clone(&pool);
            let cleaner_flag = Arc::clone(&acquired);
            s.spawn(move || {
                let _guard = cleaner_pool.cleanup_page(0).unwrap();
                cleaner_flag.store(1, Ordering::SeqCst);
            });

            std::thread::sleep(Duration::from_millis(100));
            assert_eq!(acquired.load(Ordering::SeqCst), 0);
            drop(pinned);
        });

        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }
}
