//! Metapage (block 0)
//!
//! ```text
//! contents: magic: u32 | version: u32 | dimensions: u16 | config: u16
//! ```
//! Written once by the build and only read afterwards. A magic mismatch
//! means the file is not a flat index (or is damaged) and is never retried.

use super::pages::{init_page, new_buffer, PageOpaque};
use super::{FLAT_MAGIC_NUMBER, FLAT_VERSION, METAPAGE_BLKNO};
use crate::storage::page::PAGE_HEADER_SIZE;
use crate::storage::{Fork, IndexRelation};
use crate::{Result, StorageError};
use serde::Serialize;

const META_SIZE: usize = 12;

/// Decoded metapage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetaPageInfo {
    pub magic_number: u32,
    pub version: u32,
    pub dimensions: u16,
    /// The `check` index option
    pub config: u16,
}

impl MetaPageInfo {
    fn encode(&self) -> [u8; META_SIZE] {
        let mut out = [0u8; META_SIZE];
        out[0..4].copy_from_slice(&self.magic_number.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..10].copy_from_slice(&self.dimensions.to_le_bytes());
        out[10..12].copy_from_slice(&self.config.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            magic_number: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            version: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            dimensions: u16::from_le_bytes([bytes[8], bytes[9]]),
            config: u16::from_le_bytes([bytes[10], bytes[11]]),
        }
    }
}

/// Write the metapage as block 0 of `fork`
pub fn create_meta_page(rel: &IndexRelation, fork: Fork, dimensions: u16, config: u16) -> Result<()> {
    let buf = new_buffer(rel, fork)?;
    if buf.blkno() != METAPAGE_BLKNO {
        return Err(StorageError::Usage(format!(
            "flat index fork {:?} is not empty (metapage would land in block {})",
            fork,
            buf.blkno()
        )));
    }

    let mut mutation = rel.start_mutation();
    let slot = mutation.register(buf);
    let page = mutation.page_mut(slot);
    init_page(page);

    let meta = MetaPageInfo {
        magic_number: FLAT_MAGIC_NUMBER,
        version: FLAT_VERSION,
        dimensions,
        config,
    };
    page.contents_mut()[..META_SIZE].copy_from_slice(&meta.encode());
    page.set_lower(PAGE_HEADER_SIZE + META_SIZE);

    mutation.commit()
}

/// Read and validate the metapage of the main fork
pub fn get_meta_page_info(rel: &IndexRelation) -> Result<MetaPageInfo> {
    read_meta_page(rel, Fork::Main)
}

pub fn read_meta_page(rel: &IndexRelation, fork: Fork) -> Result<MetaPageInfo> {
    if rel.nblocks(fork) <= METAPAGE_BLKNO {
        return Err(StorageError::Corruption("flat index has no metapage".into()));
    }
    let page = rel.pool(fork).read_page(METAPAGE_BLKNO)?;
    PageOpaque::read(&page, METAPAGE_BLKNO)?;

    let meta = MetaPageInfo::decode(&page.contents()[..META_SIZE]);
    if meta.magic_number != FLAT_MAGIC_NUMBER {
        return Err(StorageError::Corruption(format!(
            "flat index is not valid (magic {:#010x})",
            meta.magic_number
        )));
    }
    if meta.version != FLAT_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported flat index version {} (expected {})",
            meta.version, FLAT_VERSION
        )));
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;

    #[test]
    fn test_meta_page_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let rel = IndexRelation::open(dir.path(), IndexConfig::for_testing()).unwrap();
            create_meta_page(&rel, Fork::Main, 128, 50).unwrap();
            rel.checkpoint().unwrap();
        }
        let rel = IndexRelation::open(dir.path(), IndexConfig::for_testing()).unwrap();
        let meta = get_meta_page_info(&rel).unwrap();
        assert_eq!(meta.dimensions, 128);
        assert_eq!(meta.config, 50);
        assert_eq!(meta.magic_number, FLAT_MAGIC_NUMBER);
    }

    #[test]
    fn test_magic_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let rel = IndexRelation::open(dir.path(), IndexConfig::for_testing()).unwrap();
        create_meta_page(&rel, Fork::Main, 3, 10).unwrap();
        {
            let mut page = rel.pool(Fork::Main).write_page(METAPAGE_BLKNO).unwrap();
            page.contents_mut()[0] ^= 0xFF;
        }
        assert!(get_meta_page_info(&rel).unwrap_err().is_corruption());
    }

    #[test]
    fn test_missing_metapage() {
        let dir = tempfile::tempdir().unwrap();
        let rel = IndexRelation::open(dir.path(), IndexConfig::for_testing()).unwrap();
        assert!(get_meta_page_info(&rel).unwrap_err().is_corruption());
        create_meta_page(&rel, Fork::Main, 3, 10).unwrap();
        assert!(create_meta_page(&rel, Fork::Main, 3, 10).is_err());
    }
}
