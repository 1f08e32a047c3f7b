//! Bulk delete and vacuum cleanup
//!
//! Pages are visited in chain order under a cleanup lock, so no reader is
//! in the middle of a page whose offsets are about to be renumbered. Pages
//! without deletions are left alone (no WAL record). The first page that
//! lost tuples becomes the new insert page, unconditionally.

use super::head::{read_scan_head, update_scan_head};
use super::pages::next_block;
use super::tuple::EntryTuple;
use crate::host::{InterruptFlag, RecordLocator};
use crate::storage::{BlockNumber, Fork, IndexRelation, OffsetNumber, FIRST_OFFSET, INVALID_BLOCK};
use crate::{Result, StorageError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkDeleteStats {
    pub tuples_removed: u64,
    /// Tuples still in the index after the pass
    pub num_index_tuples: u64,
    /// Filled in by `vacuum_cleanup`
    pub num_pages: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumInfo {
    pub analyze_only: bool,
}

/// Remove every entry whose locator `should_delete` accepts.
///
/// Counts accumulate into `stats` when the host runs several passes.
pub(crate) fn bulk_delete(
    rel: &IndexRelation,
    stats: Option<BulkDeleteStats>,
    should_delete: &dyn Fn(RecordLocator) -> bool,
    interrupt: &InterruptFlag,
) -> Result<BulkDeleteStats> {
    let mut stats = stats.unwrap_or_default();
    let pool = rel.pool(Fork::Main);
    let mut blkno = read_scan_head(rel, Fork::Main)?.start_page;
    let mut insert_page = INVALID_BLOCK;

    while blkno != INVALID_BLOCK {
        if interrupt.is_set() {
            retract_insert_page(rel, insert_page)?;
            return Err(StorageError::Interrupted);
        }

        let mut mutation = rel.start_mutation();
        let slot = mutation.register(pool.cleanup_page(blkno)?);
        let page = mutation.page(slot);

        let mut deletable: Vec<OffsetNumber> = Vec::new();
        for offno in FIRST_OFFSET..=page.max_offset() {
            let locator = EntryTuple::decode_locator(page.item(offno)?)?;
            if should_delete(locator) {
                deletable.push(offno);
                stats.tuples_removed += 1;
            } else {
                stats.num_index_tuples += 1;
            }
        }
        let next = next_block(page, blkno)?;

        if deletable.is_empty() {
            drop(mutation.abort());
        } else {
            if insert_page == INVALID_BLOCK {
                insert_page = blkno;
            }
            mutation.page_mut(slot).multi_delete(&deletable)?;
            mutation.commit()?;
        }
        blkno = next;
    }

    retract_insert_page(rel, insert_page)?;
    tracing::debug!(
        removed = stats.tuples_removed,
        remaining = stats.num_index_tuples,
        "flat bulk delete finished"
    );
    Ok(stats)
}

fn retract_insert_page(rel: &IndexRelation, insert_page: BlockNumber) -> Result<()> {
    if insert_page == INVALID_BLOCK {
        return Ok(());
    }
    if update_scan_head(rel, Fork::Main, insert_page, INVALID_BLOCK, INVALID_BLOCK)? {
        tracing::debug!(insert_page, "scan head insert page retracted by vacuum");
    }
    Ok(())
}

/// Post-vacuum statistics. `None` when no bulk delete ran.
pub(crate) fn vacuum_cleanup(
    rel: &IndexRelation,
    info: VacuumInfo,
    stats: Option<BulkDeleteStats>,
) -> Option<BulkDeleteStats> {
    if info.analyze_only {
        return stats;
    }
    let mut stats = stats?;
    stats.num_pages = rel.nblocks(Fork::Main);
    Some(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlatOptions, IndexConfig};
    use crate::host::ColumnDesc;
    use crate::index::build::{build_index, BuildProgress};
    use crate::index::insert::insert_tuple;
    use crate::vector::{OpClass, Vector};

    /// 1KB pages, 16 dims: 11 tuples per page
    fn filled(dir: &std::path::Path, n: u16) -> (IndexRelation, OpClass) {
        let rel = IndexRelation::open(dir, IndexConfig { page_size: 1024, ..IndexConfig::for_testing() }).unwrap();
        let opclass = OpClass::lookup("vector_l2_ops").unwrap();
        build_index(
            &rel,
            None,
            &ColumnDesc::new("v", opclass.input_type(), 16),
            &opclass,
            &FlatOptions::default(),
            Fork::Main,
            &InterruptFlag::new(),
            &BuildProgress::new(),
        )
        .unwrap();
        for i in 0..n {
            let v = Vector::Float(vec![i as f32; 16]);
            insert_tuple(&rel, &opclass, Some(&v), RecordLocator::new(0, i + 1)).unwrap();
        }
        (rel, opclass)
    }

    #[test]
    fn test_always_false_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (rel, _) = filled(dir.path(), 30);
        let head = read_scan_head(&rel, Fork::Main).unwrap();
        let wal_len = rel.wal().read_all().unwrap().len();

        for _ in 0..2 {
            let stats = bulk_delete(&rel, None, &|_| false, &InterruptFlag::new()).unwrap();
            assert_eq!(stats.tuples_removed, 0);
            assert_eq!(stats.num_index_tuples, 30);
        }
        assert_eq!(read_scan_head(&rel, Fork::Main).unwrap(), head);
        assert_eq!(rel.wal().read_all().unwrap().len(), wal_len);
    }

    #[test]
    fn test_first_freed_page_becomes_insert_page() {
        let dir = tempfile::tempdir().unwrap();
        let (rel, opclass) = filled(dir.path(), 30);
        assert_eq!(read_scan_head(&rel, Fork::Main).unwrap().insert_page, 4);

        // offset 15 lives on the second entry page (block 3)
        let stats = bulk_delete(&rel, None, &|loc| loc.offset == 15 || loc.offset == 25, &InterruptFlag::new()).unwrap();
        assert_eq!(stats.tuples_removed, 2);
        assert_eq!(stats.num_index_tuples, 28);

        let head = read_scan_head(&rel, Fork::Main).unwrap();
        assert_eq!(head.insert_page, 3);
        assert_eq!(head.start_page, 2);

        // 下一次插入填回空出的位置
        let v = Vector::Float(vec![0.5; 16]);
        insert_tuple(&rel, &opclass, Some(&v), RecordLocator::new(1, 1)).unwrap();
        assert_eq!(rel.pool(Fork::Main).read_page(3).unwrap().max_offset(), 11);
        assert_eq!(rel.nblocks(Fork::Main), 5);
    }

    #[test]
    fn test_stats_accumulate_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let (rel, _) = filled(dir.path(), 5);

        let first = bulk_delete(&rel, None, &|loc| loc.offset == 1, &InterruptFlag::new()).unwrap();
        let second = bulk_delete(&rel, Some(first), &|loc| loc.offset == 2, &InterruptFlag::new()).unwrap();
        assert_eq!(second.tuples_removed, 2);
        assert_eq!(second.num_index_tuples, 4 + 3);

        assert_eq!(vacuum_cleanup(&rel, VacuumInfo::default(), None), None);
        let analyze = VacuumInfo { analyze_only: true };
        assert_eq!(vacuum_cleanup(&rel, analyze, Some(second)), Some(second));
        let cleaned = vacuum_cleanup(&rel, VacuumInfo::default(), Some(second)).unwrap();
        assert_eq!(cleaned.num_pages, 3);
    }

    #[test]
    fn test_interrupt_still_retracts_head() {
        let dir = tempfile::tempdir().unwrap();
        let (rel, _) = filled(dir.path(), 30);
        let interrupt = InterruptFlag::new();

        let err = bulk_delete(
            &rel,
            None,
            &|loc| {
                // 处理完第一页后请求中断
                interrupt.interrupt();
                loc.offset == 2
            },
            &interrupt,
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Interrupted));
        assert_eq!(read_scan_head(&rel, Fork::Main).unwrap().insert_page, 2);
        assert_eq!(rel.pool(Fork::Main).read_page(2).unwrap().max_offset(), 10);
        assert_eq!(rel.pool(Fork::Main).read_page(3).unwrap().max_offset(), 11);
    }
}
