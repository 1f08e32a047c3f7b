//! Scan head (block 1, item 1)
//!
//! The only mutable root of the index: where the entry chain starts and
//! which page inserts should try first. Updates are read-modify-commit
//! under the head page's exclusive lock and are skipped (no WAL record)
//! when nothing changes.

use super::pages::{init_register_page, PageOpaque};
use super::HEAD_BLKNO;
use crate::storage::{BlockNumber, Fork, IndexRelation, FIRST_OFFSET, INVALID_BLOCK};
use crate::{Result, StorageError};

const HEAD_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHead {
    pub start_page: BlockNumber,
    pub insert_page: BlockNumber,
}

impl ScanHead {
    fn encode(&self) -> [u8; HEAD_SIZE] {
        let mut out = [0u8; HEAD_SIZE];
        out[..4].copy_from_slice(&self.start_page.to_le_bytes());
        out[4..].copy_from_slice(&self.insert_page.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEAD_SIZE {
            return Err(StorageError::Corruption(format!(
                "scan head record has {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            start_page: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            insert_page: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

/// Write block 1 with an unset scan head
pub fn create_scan_head(rel: &IndexRelation, fork: Fork) -> Result<()> {
    let (mut mutation, slot) = init_register_page(rel, fork)?;
    if mutation.blkno(slot) != HEAD_BLKNO {
        return Err(StorageError::Usage(format!(
            "scan head would land in block {} of {:?}",
            mutation.blkno(slot),
            fork
        )));
    }
    let head = ScanHead { start_page: INVALID_BLOCK, insert_page: INVALID_BLOCK };
    if mutation.page_mut(slot).add_item(&head.encode()).is_none() {
        return Err(StorageError::ResourceExhausted(
            "failed to add scan head to flat index".into(),
        ));
    }
    mutation.commit()
}

pub fn read_scan_head(rel: &IndexRelation, fork: Fork) -> Result<ScanHead> {
    let page = rel.pool(fork).read_page(HEAD_BLKNO)?;
    PageOpaque::read(&page, HEAD_BLKNO)?;
    ScanHead::decode(page.item(FIRST_OFFSET)?)
}

/// Move the scan head pointers.
///
/// `insert_page` is applied when valid and different, unless
/// `original_insert_page` is valid and `insert_page` lies before it: an
/// insert that read the head before a vacuum retracted it must not undo the
/// retraction. `start_page` is applied when valid and different. Returns
/// whether anything was written.
pub fn update_scan_head(
    rel: &IndexRelation,
    fork: Fork,
    insert_page: BlockNumber,
    original_insert_page: BlockNumber,
    start_page: BlockNumber,
) -> Result<bool> {
    let guard = rel.pool(fork).write_page(HEAD_BLKNO)?;
    PageOpaque::read(&guard, HEAD_BLKNO)?;

    let mut mutation = rel.start_mutation();
    let slot = mutation.register(guard);
    let mut head = ScanHead::decode(mutation.page(slot).item(FIRST_OFFSET)?)?;
    let mut changed = false;

    if insert_page != INVALID_BLOCK && insert_page != head.insert_page {
        if original_insert_page == INVALID_BLOCK || insert_page >= original_insert_page {
            head.insert_page = insert_page;
            changed = true;
        }
    }

    if start_page != INVALID_BLOCK && start_page != head.start_page {
        head.start_page = start_page;
        changed = true;
    }

    if !changed {
        drop(mutation.abort());
        return Ok(false);
    }

    mutation
        .page_mut(slot)
        .item_mut(FIRST_OFFSET)?
        .copy_from_slice(&head.encode());
    mutation.commit()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::index::meta::create_meta_page;

    fn setup(dir: &std::path::Path) -> IndexRelation {
        let rel = IndexRelation::open(dir, IndexConfig::for_testing()).unwrap();
        create_meta_page(&rel, Fork::Main, 3, 50).unwrap();
        create_scan_head(&rel, Fork::Main).unwrap();
        rel
    }

    #[test]
    fn test_fresh_head_is_unset() {
        let dir = tempfile::tempdir().unwrap();
        let rel = setup(dir.path());
        let head = read_scan_head(&rel, Fork::Main).unwrap();
        assert_eq!(head.start_page, INVALID_BLOCK);
        assert_eq!(head.insert_page, INVALID_BLOCK);
    }

    #[test]
    fn test_update_and_noop() {
        let dir = tempfile::tempdir().unwrap();
        let rel = setup(dir.path());

        assert!(update_scan_head(&rel, Fork::Main, 2, INVALID_BLOCK, 2).unwrap());
        let wal_len = rel.wal().read_all().unwrap().len();

        // 相同的值不写 WAL
        assert!(!update_scan_head(&rel, Fork::Main, 2, INVALID_BLOCK, 2).unwrap());
        assert!(!update_scan_head(&rel, Fork::Main, INVALID_BLOCK, INVALID_BLOCK, INVALID_BLOCK).unwrap());
        assert_eq!(rel.wal().read_all().unwrap().len(), wal_len);

        assert_eq!(
            read_scan_head(&rel, Fork::Main).unwrap(),
            ScanHead { start_page: 2, insert_page: 2 }
        );
    }

    #[test]
    fn test_stale_insert_does_not_undo_retraction() {
        let dir = tempfile::tempdir().unwrap();
        let rel = setup(dir.path());
        update_scan_head(&rel, Fork::Main, 7, INVALID_BLOCK, 2).unwrap();

        // vacuum 回退到 3（无条件）
        assert!(update_scan_head(&rel, Fork::Main, 3, INVALID_BLOCK, INVALID_BLOCK).unwrap());

        // 读到旧值 7 的插入想写回 5：低于原值，跳过
        assert!(!update_scan_head(&rel, Fork::Main, 5, 7, INVALID_BLOCK).unwrap());
        assert_eq!(read_scan_head(&rel, Fork::Main).unwrap().insert_page, 3);

        // 向前推进的插入照常生效
        assert!(update_scan_head(&rel, Fork::Main, 8, 7, INVALID_BLOCK).unwrap());
        assert_eq!(read_scan_head(&rel, Fork::Main).unwrap().insert_page, 8);
    }
}
