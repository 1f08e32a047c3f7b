//! Page manager: allocation, initialization and chain extension
//!
//! The chain only ever grows at the tail. `append_page` links the new page
//! into the old tail and commits both in one mutation before the old tail's
//! lock is released, so nobody can follow a `next` pointer to a page that is
//! not initialized yet.

use super::FLAT_PAGE_ID;
use crate::storage::{BlockNumber, Fork, IndexRelation, Page, PageMutation, PageWriteGuard, INVALID_BLOCK};
use crate::{Result, StorageError};

/// Size of the opaque area at the end of every page
pub const OPAQUE_SIZE: usize = 8;

/// Trailing opaque area of an index page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOpaque {
    pub next: BlockNumber,
    pub page_id: u16,
}

impl PageOpaque {
    /// Read and check the tag
    pub fn read(page: &Page, blkno: BlockNumber) -> Result<Self> {
        let special = page.special();
        if page.is_new() || special.len() < OPAQUE_SIZE {
            return Err(StorageError::Corruption(format!(
                "block {} of flat index is not initialized",
                blkno
            )));
        }
        let next = u32::from_le_bytes([special[0], special[1], special[2], special[3]]);
        let page_id = u16::from_le_bytes([special[6], special[7]]);
        if page_id != FLAT_PAGE_ID {
            return Err(StorageError::Corruption(format!(
                "block {} has page id {:#06x}, expected {:#06x}",
                blkno, page_id, FLAT_PAGE_ID
            )));
        }
        Ok(Self { next, page_id })
    }
}

/// Follow-on block of `page`, or `INVALID_BLOCK` at the tail
pub fn next_block(page: &Page, blkno: BlockNumber) -> Result<BlockNumber> {
    PageOpaque::read(page, blkno).map(|o| o.next)
}

pub fn set_next_block(page: &mut Page, next: BlockNumber) {
    page.special_mut()[..4].copy_from_slice(&next.to_le_bytes());
}

/// Extend `fork` by one block, returned exclusively locked and uninitialized
pub fn new_buffer(rel: &IndexRelation, fork: Fork) -> Result<PageWriteGuard> {
    rel.pool(fork).new_page()
}

/// Empty page with no successor
pub fn init_page(page: &mut Page) {
    page.init(OPAQUE_SIZE);
    let special = page.special_mut();
    special[..4].copy_from_slice(&INVALID_BLOCK.to_le_bytes());
    special[4..6].copy_from_slice(&0u16.to_le_bytes());
    special[6..8].copy_from_slice(&FLAT_PAGE_ID.to_le_bytes());
}

/// Allocate, register and initialize a fresh page in a new mutation
pub fn init_register_page<'a>(rel: &'a IndexRelation, fork: Fork) -> Result<(PageMutation<'a>, usize)> {
    let guard = new_buffer(rel, fork)?;
    let mut mutation = rel.start_mutation();
    let slot = mutation.register(guard);
    init_page(mutation.page_mut(slot));
    Ok((mutation, slot))
}

/// Link a new page after the page in `slot` and move on to it.
///
/// Commits the old page together with the initialized new page, releases
/// the old page, and returns a fresh mutation holding the new page.
pub fn append_page<'a>(
    rel: &'a IndexRelation,
    mut mutation: PageMutation<'a>,
    slot: usize,
    fork: Fork,
) -> Result<(PageMutation<'a>, usize)> {
    let newbuf = new_buffer(rel, fork)?;
    let new_blkno = newbuf.blkno();
    let new_slot = mutation.register(newbuf);

    set_next_block(mutation.page_mut(slot), new_blkno);
    init_page(mutation.page_mut(new_slot));

    let mut guards = mutation.finish()?;
    let newbuf = guards.swap_remove(new_slot);
    // 旧页在此释放，新页保持加锁
    drop(guards);

    tracing::trace!(?fork, new_blkno, "extended entry chain");
    let mut mutation = rel.start_mutation();
    let slot = mutation.register(newbuf);
    Ok((mutation, slot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;

    fn relation(dir: &std::path::Path) -> IndexRelation {
        IndexRelation::open(dir, IndexConfig { page_size: 1024, ..IndexConfig::for_testing() }).unwrap()
    }

    #[test]
    fn test_init_page_opaque() {
        let mut page = Page::new_zeroed(1024);
        init_page(&mut page);
        let opaque = PageOpaque::read(&page, 2).unwrap();
        assert_eq!(opaque.next, INVALID_BLOCK);
        assert_eq!(opaque.page_id, FLAT_PAGE_ID);

        set_next_block(&mut page, 9);
        assert_eq!(next_block(&page, 2).unwrap(), 9);
    }

    #[test]
    fn test_bad_page_id_is_corruption() {
        let mut page = Page::new_zeroed(1024);
        page.init(OPAQUE_SIZE);
        assert!(PageOpaque::read(&page, 4).unwrap_err().is_corruption());
        assert!(PageOpaque::read(&Page::new_zeroed(1024), 4).unwrap_err().is_corruption());
    }

    #[test]
    fn test_append_page_links_chain() {
        let dir = tempfile::tempdir().unwrap();
        let rel = relation(dir.path());

        let (mutation, slot) = init_register_page(&rel, Fork::Main).unwrap();
        let first = mutation.blkno(slot);
        let (mutation, slot) = append_page(&rel, mutation, slot, Fork::Main).unwrap();
        let second = mutation.blkno(slot);
        let (mutation, slot) = append_page(&rel, mutation, slot, Fork::Main).unwrap();
        let third = mutation.blkno(slot);
        mutation.commit().unwrap();

        let pool = rel.pool(Fork::Main);
        assert_eq!(next_block(&pool.read_page(first).unwrap(), first).unwrap(), second);
        assert_eq!(next_block(&pool.read_page(second).unwrap(), second).unwrap(), third);
        assert_eq!(next_block(&pool.read_page(third).unwrap(), third).unwrap(), INVALID_BLOCK);
    }
}
