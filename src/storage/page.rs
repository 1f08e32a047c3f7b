//! Slotted page layout
//!
//! Every block of an index file has the same shape:
//!
//! ```text
//! +-----------------------------------------------------------+
//! | header (24B) | line pointers -->        ...               |
//! |                                                           |
//! |               ...         <-- tuples  | special area      |
//! +-----------------------------------------------------------+
//!   0            lower                  upper  special   page_size
//! ```
//!
//! Header:
//!   lsn: u64       LSN of the last WAL record that touched the page
//!   checksum: u32  CRC32 over the page, excluding this field
//!   flags: u16
//!   lower: u16     end of the line pointer array
//!   upper: u16     start of tuple space
//!   special: u16   start of the special (opaque) area
//!   version: u16   page layout version
//!   reserved: u16
//!
//! Line pointer: `offset: u16, len: u16`. Offsets are 1-based
//! (`FIRST_OFFSET`). Tuples are packed downwards from `special`, each one
//! aligned to `MAX_ALIGN`. Deleting items compacts the tuple space, so live
//! offsets shift; callers holding offsets across a delete must re-read.

use crate::storage::checksum::Checksum;
use crate::{Result, StorageError};

/// Page header size in bytes
pub const PAGE_HEADER_SIZE: usize = 24;

/// Size of one line pointer
pub const LINE_POINTER_SIZE: usize = 4;

/// Tuple alignment
pub const MAX_ALIGN: usize = 8;

/// First valid item offset
pub const FIRST_OFFSET: OffsetNumber = 1;

/// Page layout version stamped into every initialized page
pub const PAGE_LAYOUT_VERSION: u16 = 1;

const CHECKSUM_RANGE: std::ops::Range<usize> = 8..12;
const LOWER_AT: usize = 14;
const UPPER_AT: usize = 16;
const SPECIAL_AT: usize = 18;
const VERSION_AT: usize = 20;

/// 1-based item slot number within a page
pub type OffsetNumber = u16;

/// Round `len` up to `MAX_ALIGN`
#[inline]
pub const fn max_align(len: usize) -> usize {
    (len + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

/// One disk block held in memory
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Vec<u8>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("size", &self.data.len())
            .field("lsn", &self.lsn())
            .field("lower", &self.lower())
            .field("upper", &self.upper())
            .field("special", &self.special_offset())
            .finish()
    }
}

impl Page {
    /// All-zero page (what a freshly extended block looks like on disk)
    pub fn new_zeroed(page_size: usize) -> Self {
        Self { data: vec![0u8; page_size] }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Overwrite the whole page with another image of the same size
    pub fn copy_from(&mut self, other: &Page) {
        self.data.copy_from_slice(&other.data);
    }

    /// Initialize an empty page with `special_size` bytes of special area
    pub fn init(&mut self, special_size: usize) {
        let size = self.data.len();
        let special = size - max_align(special_size);
        self.data.fill(0);
        self.set_u16(LOWER_AT, PAGE_HEADER_SIZE as u16);
        self.set_u16(UPPER_AT, special as u16);
        self.set_u16(SPECIAL_AT, special as u16);
        self.set_u16(VERSION_AT, PAGE_LAYOUT_VERSION);
    }

    /// Never initialized (all zero header)
    pub fn is_new(&self) -> bool {
        self.upper() == 0
    }

    pub fn lsn(&self) -> u64 {
        u64::from_le_bytes(self.data[0..8].try_into().unwrap_or([0; 8]))
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.data[0..8].copy_from_slice(&lsn.to_le_bytes());
    }

    fn lower(&self) -> usize {
        self.get_u16(LOWER_AT) as usize
    }

    fn upper(&self) -> usize {
        self.get_u16(UPPER_AT) as usize
    }

    fn special_offset(&self) -> usize {
        self.get_u16(SPECIAL_AT) as usize
    }

    /// Set the end of the "contents" area (used by pages without line
    /// pointers, such as the metapage)
    pub fn set_lower(&mut self, lower: usize) {
        self.set_u16(LOWER_AT, lower as u16);
    }

    /// Free bytes available for one more tuple, accounting for its line pointer
    pub fn free_space(&self) -> usize {
        let gap = self.upper().saturating_sub(self.lower());
        gap.saturating_sub(LINE_POINTER_SIZE)
    }

    /// Largest tuple an empty page with this special size can hold
    pub fn max_item_size(page_size: usize, special_size: usize) -> usize {
        let usable = page_size - PAGE_HEADER_SIZE - max_align(special_size) - LINE_POINTER_SIZE;
        usable & !(MAX_ALIGN - 1)
    }

    /// Number of items (highest valid offset)
    pub fn max_offset(&self) -> OffsetNumber {
        (self.lower().saturating_sub(PAGE_HEADER_SIZE) / LINE_POINTER_SIZE) as OffsetNumber
    }

    /// Append an item at the next free slot.
    ///
    /// Returns `None` if it does not fit.
    pub fn add_item(&mut self, item: &[u8]) -> Option<OffsetNumber> {
        let footprint = max_align(item.len());
        if self.is_new() || footprint > self.free_space() || item.len() > u16::MAX as usize {
            return None;
        }

        let lower = self.lower();
        let upper = self.upper() - footprint;
        self.data[upper..upper + item.len()].copy_from_slice(item);
        self.data[upper + item.len()..upper + footprint].fill(0);

        self.set_u16(lower, upper as u16);
        self.set_u16(lower + 2, item.len() as u16);
        self.set_u16(LOWER_AT, (lower + LINE_POINTER_SIZE) as u16);
        self.set_u16(UPPER_AT, upper as u16);

        Some(self.max_offset())
    }

    /// Borrow the bytes of item `offno`
    pub fn item(&self, offno: OffsetNumber) -> Result<&[u8]> {
        let (off, len) = self.line_pointer(offno)?;
        if off < self.upper() || off + len > self.special_offset() {
            return Err(StorageError::Corruption(format!(
                "item {} points outside tuple space ({}+{})",
                offno, off, len
            )));
        }
        Ok(&self.data[off..off + len])
    }

    /// Mutable access to item `offno` (same length, in place)
    pub fn item_mut(&mut self, offno: OffsetNumber) -> Result<&mut [u8]> {
        let (off, len) = self.line_pointer(offno)?;
        Ok(&mut self.data[off..off + len])
    }

    fn line_pointer(&self, offno: OffsetNumber) -> Result<(usize, usize)> {
        if offno < FIRST_OFFSET || offno > self.max_offset() {
            return Err(StorageError::InvalidArgument(format!(
                "offset {} out of range 1..={}",
                offno,
                self.max_offset()
            )));
        }
        let at = PAGE_HEADER_SIZE + (offno as usize - 1) * LINE_POINTER_SIZE;
        Ok((self.get_u16(at) as usize, self.get_u16(at + 2) as usize))
    }

    /// Delete several items at once and compact the page.
    ///
    /// Remaining items keep their relative order and are renumbered densely
    /// from `FIRST_OFFSET`.
    pub fn multi_delete(&mut self, offsets: &[OffsetNumber]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let max = self.max_offset();
        let mut doomed = vec![false; max as usize + 1];
        for &offno in offsets {
            if offno < FIRST_OFFSET || offno > max {
                return Err(StorageError::InvalidArgument(format!(
                    "cannot delete offset {} (max {})",
                    offno, max
                )));
            }
            doomed[offno as usize] = true;
        }

        let mut survivors = Vec::with_capacity(max as usize);
        for offno in FIRST_OFFSET..=max {
            if !doomed[offno as usize] {
                survivors.push(self.item(offno)?.to_vec());
            }
        }

        // 重新打包：保留 header 与 special，清空中间区域
        let special = self.special_offset();
        self.data[PAGE_HEADER_SIZE..special].fill(0);
        self.set_u16(LOWER_AT, PAGE_HEADER_SIZE as u16);
        self.set_u16(UPPER_AT, special as u16);
        for item in &survivors {
            if self.add_item(item).is_none() {
                return Err(StorageError::Corruption(
                    "page overflow while compacting".into(),
                ));
            }
        }
        Ok(())
    }

    /// Bytes between the header and `lower` (metapage-style contents)
    pub fn contents(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..self.special_offset()]
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        let special = self.special_offset();
        &mut self.data[PAGE_HEADER_SIZE..special]
    }

    pub fn special(&self) -> &[u8] {
        &self.data[self.special_offset()..]
    }

    pub fn special_mut(&mut self) -> &mut [u8] {
        let special = self.special_offset();
        &mut self.data[special..]
    }

    /// Structural sanity check of the header
    pub fn validate_header(&self, blkno: u32) -> Result<()> {
        if self.is_new() {
            return Ok(());
        }
        let (lower, upper, special) = (self.lower(), self.upper(), self.special_offset());
        let ok = lower >= PAGE_HEADER_SIZE
            && lower <= upper
            && upper <= special
            && special <= self.data.len()
            && self.get_u16(VERSION_AT) == PAGE_LAYOUT_VERSION;
        if !ok {
            return Err(StorageError::Corruption(format!(
                "block {} has a corrupted page header (lower={}, upper={}, special={})",
                blkno, lower, upper, special
            )));
        }
        Ok(())
    }

    /// Stamp the checksum before the page goes to disk
    pub fn update_checksum(&mut self) {
        let sum = Checksum::compute_page(&self.data, CHECKSUM_RANGE);
        self.data[CHECKSUM_RANGE].copy_from_slice(&sum.to_le_bytes());
    }

    /// Verify the checksum after reading from disk
    pub fn verify_checksum(&self, blkno: u32) -> Result<()> {
        if self.data.iter().all(|&b| b == 0) {
            return Ok(());
        }
        let stored = u32::from_le_bytes(self.data[CHECKSUM_RANGE].try_into().unwrap_or([0; 4]));
        let actual = Checksum::compute_page(&self.data, CHECKSUM_RANGE);
        if stored != actual {
            return Err(StorageError::Corruption(format!(
                "page checksum mismatch in block {}: stored {:#010x}, computed {:#010x}",
                blkno, stored, actual
            )));
        }
        Ok(())
    }

    #[inline]
    fn get_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.data[at], self.data[at + 1]])
    }

    #[inline]
    fn set_u16(&mut self, at: usize, v: u16) {
        self.data[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }
}
