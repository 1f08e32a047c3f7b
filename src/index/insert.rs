//! Single-tuple insert
//!
//! Starts at the scan head's insert page and walks forward to the first
//! page with room, extending the chain when it reaches the tail. At most one
//! page is held exclusively at a time, except while linking a new tail.

use super::head::{read_scan_head, update_scan_head};
use super::meta::read_meta_page;
use super::pages::{init_page, new_buffer, next_block, set_next_block, OPAQUE_SIZE};
use super::tuple::EntryTuple;
use crate::host::RecordLocator;
use crate::storage::page::max_align;
use crate::storage::{Fork, IndexRelation, Page, INVALID_BLOCK};
use crate::vector::{OpClass, Vector};
use crate::{Result, StorageError};

/// Insert one value. Returns `Ok(false)` when the value is not indexed
/// (NULL, or rejected by the opclass, e.g. a zero vector under cosine).
pub(crate) fn insert_tuple(
    rel: &IndexRelation,
    opclass: &OpClass,
    value: Option<&Vector>,
    locator: RecordLocator,
) -> Result<bool> {
    let Some(value) = value else {
        return Ok(false);
    };

    let meta = read_meta_page(rel, Fork::Main)?;
    if value.vector_type() != opclass.input_type() || value.dims() != meta.dimensions as usize {
        return Err(StorageError::Usage(format!(
            "expected {} dimensions of type {}, not {} of type {}",
            meta.dimensions,
            opclass.input_type().name(),
            value.dims(),
            value.vector_type().name()
        )));
    }
    if !value.is_well_formed() {
        return Err(StorageError::Usage(format!(
            "malformed {} value with {} dimensions",
            value.vector_type().name(),
            value.dims()
        )));
    }

    let Some(value) = opclass.prepare(value.clone()) else {
        return Ok(false);
    };

    let tuple = EntryTuple::new(locator, value).encode();
    let max_item = Page::max_item_size(rel.page_size(), OPAQUE_SIZE);
    if tuple.len() > max_item {
        return Err(StorageError::ResourceExhausted(format!(
            "index row size {} exceeds maximum {} for flat index",
            tuple.len(),
            max_item
        )));
    }
    let needed = max_align(tuple.len());

    let head = read_scan_head(rel, Fork::Main)?;
    if head.insert_page == INVALID_BLOCK {
        return Err(StorageError::Corruption("flat index has no insert page".into()));
    }
    let original_insert_page = head.insert_page;
    let mut insert_page = original_insert_page;

    let pool = rel.pool(Fork::Main);
    let (mut mutation, slot) = loop {
        let guard = pool.write_page(insert_page)?;
        let mut mutation = rel.start_mutation();
        let slot = mutation.register(guard);

        if mutation.page(slot).free_space() >= needed {
            break (mutation, slot);
        }

        let next = next_block(mutation.page(slot), insert_page)?;
        if next != INVALID_BLOCK {
            drop(mutation.abort());
            insert_page = next;
            continue;
        }

        // 链尾已满：扩展新页，与旧页一起提交
        let newbuf = new_buffer(rel, Fork::Main)?;
        let new_blkno = newbuf.blkno();
        let new_slot = mutation.register(newbuf);
        init_page(mutation.page_mut(new_slot));
        set_next_block(mutation.page_mut(slot), new_blkno);

        let mut guards = mutation.finish()?;
        let newbuf = guards.swap_remove(new_slot);
        drop(guards);

        insert_page = new_blkno;
        let mut mutation = rel.start_mutation();
        let slot = mutation.register(newbuf);
        break (mutation, slot);
    };

    if mutation.page_mut(slot).add_item(&tuple).is_none() {
        return Err(StorageError::ResourceExhausted(format!(
            "failed to add index item to block {}",
            insert_page
        )));
    }
    mutation.commit()?;

    if insert_page != original_insert_page {
        update_scan_head(rel, Fork::Main, insert_page, original_insert_page, INVALID_BLOCK)?;
    }
    Ok(true)
}
