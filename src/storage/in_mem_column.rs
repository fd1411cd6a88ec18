use std::cell::UnsafeCell;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::logical_type::LogicalType;
use crate::error::DbResult;
use crate::storage::file_utils;
use crate::storage::in_mem_overflow::InMemOverflowFile;
use crate::storage::page::{null_bitmap_bytes, null_bitmap_offset, num_elements_per_page, PAGE_SIZE};
use crate::types::NodeOffset;

/// Element buffer written concurrently by loader tasks. Tasks own
/// disjoint row ranges, so writes never overlap.
struct SharedBuffer {
    bytes: UnsafeCell<Box<[u8]>>,
}

unsafe impl Sync for SharedBuffer {}
unsafe impl Send for SharedBuffer {}

impl SharedBuffer {
    fn new(len: usize) -> Self {
        Self {
            bytes: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    fn write_at(&self, pos: usize, bytes: &[u8]) {
        unsafe {
            let buf = &mut *self.bytes.get();
            assert!(pos + bytes.len() <= buf.len());
            buf[pos..pos + bytes.len()].copy_from_slice(bytes);
        }
    }

    fn read_at(&self, pos: usize, len: usize) -> Vec<u8> {
        unsafe {
            let buf = &*self.bytes.get();
            buf[pos..pos + len].to_vec()
        }
    }
}

/// On-disk column header, page 0 of every `.col` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnFileHeader {
    pub element_size: u32,
    pub num_elements_per_page: u32,
    pub null_bitmap_bytes: u32,
    pub num_data_pages: u32,
    pub num_elements: u64,
}

impl ColumnFileHeader {
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..4].copy_from_slice(&self.element_size.to_le_bytes());
        out[4..8].copy_from_slice(&self.num_elements_per_page.to_le_bytes());
        out[8..12].copy_from_slice(&self.null_bitmap_bytes.to_le_bytes());
        out[12..16].copy_from_slice(&self.num_data_pages.to_le_bytes());
        out[16..24].copy_from_slice(&self.num_elements.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            element_size: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            num_elements_per_page: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            null_bitmap_bytes: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            num_data_pages: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            num_elements: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        }
    }
}

/// Contiguous element buffer for node offsets `[start_offset,
/// end_offset]`; the unit of parallelism during copy. Slots start out
/// null and become non-null when written.
pub struct InMemColumnChunk {
    start_offset: NodeOffset,
    num_elements: u64,
    element_size: usize,
    has_null: bool,
    elements: SharedBuffer,
    nulls: Vec<AtomicBool>,
}

impl InMemColumnChunk {
    pub fn new(
        start_offset: NodeOffset,
        num_elements: u64,
        element_size: usize,
        has_null: bool,
    ) -> Self {
        let count = num_elements as usize;
        let mut nulls = Vec::with_capacity(count);
        nulls.resize_with(count, || AtomicBool::new(true));
        Self {
            start_offset,
            num_elements,
            element_size,
            has_null,
            elements: SharedBuffer::new(count * element_size),
            nulls,
        }
    }

    pub fn num_elements(&self) -> u64 {
        self.num_elements
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    fn idx(&self, offset: NodeOffset) -> usize {
        debug_assert!(offset >= self.start_offset && offset < self.start_offset + self.num_elements);
        (offset - self.start_offset) as usize
    }

    pub fn set_value(&self, slot_bytes: &[u8], offset: NodeOffset) {
        debug_assert_eq!(slot_bytes.len(), self.element_size);
        let idx = self.idx(offset);
        self.elements.write_at(idx * self.element_size, slot_bytes);
        self.nulls[idx].store(false, Ordering::Release);
    }

    pub fn is_null(&self, offset: NodeOffset) -> bool {
        self.nulls[self.idx(offset)].load(Ordering::Acquire)
    }

    pub fn get_value(&self, offset: NodeOffset) -> Vec<u8> {
        let idx = self.idx(offset);
        self.elements.read_at(idx * self.element_size, self.element_size)
    }

    /// Write the chunk as a complete column file: header page, then
    /// data pages with per-page null bitmaps at their tails.
    pub fn flush(&self, path: &std::path::Path) -> DbResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let per_page = num_elements_per_page(self.element_size, self.has_null);
        let bitmap_offset = null_bitmap_offset(self.element_size, self.has_null);
        let num_elements = self.num_elements();
        let num_data_pages = (num_elements as usize + per_page - 1) / per_page;

        let header = ColumnFileHeader {
            element_size: self.element_size as u32,
            num_elements_per_page: per_page as u32,
            null_bitmap_bytes: null_bitmap_bytes(self.element_size, self.has_null) as u32,
            num_data_pages: num_data_pages as u32,
            num_elements,
        };

        let mut file = file_utils::open_file(path)?;
        file.set_len(0)?;
        let mut header_page = vec![0u8; PAGE_SIZE];
        header_page[..24].copy_from_slice(&header.to_bytes());
        file.write_all(&header_page)?;

        let mut page = vec![0u8; PAGE_SIZE];
        for page_i in 0..num_data_pages {
            page.iter_mut().for_each(|b| *b = 0);
            let first = page_i * per_page;
            let last = std::cmp::min(first + per_page, num_elements as usize);
            for elem_i in first..last {
                let in_page = elem_i - first;
                let bytes = self
                    .elements
                    .read_at(elem_i * self.element_size, self.element_size);
                page[in_page * self.element_size..(in_page + 1) * self.element_size]
                    .copy_from_slice(&bytes);
                if self.has_null && self.nulls[elem_i].load(Ordering::Acquire) {
                    page[bitmap_offset + in_page / 8] |= 1 << (in_page % 8);
                }
            }
            file.write_all(&page)?;
        }
        file.sync_all()?;
        Ok(())
    }
}

/// A property column under construction, together with the ordered
/// overflow file its descriptors point into after the sort pass.
pub struct InMemColumn {
    pub path: PathBuf,
    pub overflow_path: Option<PathBuf>,
    pub logical_type: LogicalType,
    ordered_overflow: Option<InMemOverflowFile>,
}

impl InMemColumn {
    pub fn new(path: PathBuf, overflow_path: Option<PathBuf>, logical_type: LogicalType) -> Self {
        let ordered_overflow = if logical_type.has_overflow() {
            Some(InMemOverflowFile::new())
        } else {
            None
        };
        Self {
            path,
            overflow_path,
            logical_type,
            ordered_overflow,
        }
    }

    pub fn make_chunk(&self, start: NodeOffset, num_elements: u64, has_null: bool) -> InMemColumnChunk {
        InMemColumnChunk::new(start, num_elements, self.logical_type.element_size(), has_null)
    }

    pub fn ordered_overflow(&self) -> Option<&InMemOverflowFile> {
        self.ordered_overflow.as_ref()
    }

    /// `path`/`overflow_path` are the primary names; the chunk and the
    /// ordered overflow land as `.wal` shadows for the checkpoint.
    pub fn save_to_file(&self, chunk: &InMemColumnChunk) -> DbResult<()> {
        chunk.flush(&crate::storage::storage_utils::wal_version(&self.path))?;
        if let (Some(ovf), Some(ovf_path)) = (&self.ordered_overflow, &self.overflow_path) {
            ovf.flush(crate::storage::storage_utils::wal_version(ovf_path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_set_and_get() {
        let chunk = InMemColumnChunk::new(10, 10, 8, true);
        assert!(chunk.is_null(12));
        chunk.set_value(&42i64.to_le_bytes(), 12);
        assert!(!chunk.is_null(12));
        assert_eq!(chunk.get_value(12), 42i64.to_le_bytes().to_vec());
    }

    #[test]
    fn flush_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.col");
        let chunk = InMemColumnChunk::new(0, 3, 8, true);
        chunk.set_value(&7i64.to_le_bytes(), 0);
        chunk.set_value(&9i64.to_le_bytes(), 2);
        chunk.flush(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 2 * PAGE_SIZE);
        let header = ColumnFileHeader::from_bytes(&bytes[..24]);
        assert_eq!(header.element_size, 8);
        assert_eq!(header.num_elements, 3);
        assert_eq!(header.num_data_pages, 1);
        // element 0 lives at the start of page 1
        assert_eq!(&bytes[PAGE_SIZE..PAGE_SIZE + 8], &7i64.to_le_bytes());
        // element 1 was never written: its null bit is set
        let bitmap = null_bitmap_offset(8, true);
        assert_eq!(bytes[PAGE_SIZE + bitmap] & 0b10, 0b10);
        assert_eq!(bytes[PAGE_SIZE + bitmap] & 0b101, 0);
    }
}
