use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::common::logical_type::LogicalType;
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::storage::buffer_pool::{BufferPool, FileHandle};
use crate::storage::in_mem_column::ColumnFileHeader;
use crate::storage::overflow_file::OverflowFile;
use crate::storage::page::{null_bitmap_offset, num_elements_per_page, PAGE_SIZE};
use crate::storage::slot_format::{encode_fixed_value, StrDescriptor, DESCRIPTOR_SIZE};
use crate::types::{NodeOffset, PageIdx};

/// Buffer-managed read/update path of one column file. Page 0 is the
/// header; data pages follow. All access pins pages in
/// the buffer pool, so interactive updates flow into the WAL at
/// commit.
pub struct DiskColumn {
    fh: Arc<FileHandle>,
    pool: Arc<BufferPool>,
    pub logical_type: LogicalType,
    element_size: usize,
    per_page: usize,
    bitmap_offset: usize,
    overflow: Option<OverflowFile>,
}

impl DiskColumn {
    pub fn open(
        pool: Arc<BufferPool>,
        path: &Path,
        overflow_path: Option<PathBuf>,
        logical_type: LogicalType,
    ) -> DbResult<Self> {
        let fh = pool.open_file(path)?;
        let element_size = logical_type.element_size();
        let per_page = num_elements_per_page(element_size, true);
        if fh.num_pages() > 0 {
            let header = pool.with_page(&fh, 0, |page| ColumnFileHeader::from_bytes(page))?;
            if header.element_size as usize != element_size
                || header.num_elements_per_page as usize != per_page
            {
                return Err(DbError::corruption(format!(
                    "column file {:?} header does not match catalog type {} (element size {} vs {})",
                    path, logical_type, header.element_size, element_size
                )));
            }
        }
        let overflow = match (&overflow_path, logical_type.has_overflow()) {
            (Some(p), true) => Some(OverflowFile::open(pool.clone(), p)?),
            _ => None,
        };
        Ok(Self {
            fh,
            pool,
            element_size,
            per_page,
            bitmap_offset: null_bitmap_offset(element_size, true),
            logical_type,
            overflow,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.fh.path
    }

    fn locate(&self, offset: NodeOffset) -> (PageIdx, usize) {
        (
            1 + (offset / self.per_page as u64) as PageIdx,
            (offset % self.per_page as u64) as usize,
        )
    }

    pub fn is_null(&self, offset: NodeOffset) -> DbResult<bool> {
        let (page_idx, elem) = self.locate(offset);
        if page_idx as u64 >= self.fh.num_pages() {
            return Ok(true);
        }
        self.pool.with_page(&self.fh, page_idx, |page| {
            page[self.bitmap_offset + elem / 8] & (1 << (elem % 8)) != 0
        })
    }

    pub fn read_slot(&self, offset: NodeOffset) -> DbResult<Option<Vec<u8>>> {
        let (page_idx, elem) = self.locate(offset);
        if page_idx as u64 >= self.fh.num_pages() {
            return Ok(None);
        }
        self.pool.with_page(&self.fh, page_idx, |page| {
            if page[self.bitmap_offset + elem / 8] & (1 << (elem % 8)) != 0 {
                None
            } else {
                Some(page[elem * self.element_size..(elem + 1) * self.element_size].to_vec())
            }
        })
    }

    pub fn read_value(&self, offset: NodeOffset) -> DbResult<Value> {
        match self.read_slot(offset)? {
            None => Ok(Value::Null),
            Some(slot) => match &self.overflow {
                Some(ovf) => ovf.decode_slot(&slot, &self.logical_type),
                None => Ok(crate::storage::slot_format::decode_fixed_value(
                    &slot,
                    &self.logical_type,
                )),
            },
        }
    }

    /// Interactive write path (`CREATE`/`SET`). Extends the file with
    /// claimed pages as needed; the images reach disk at checkpoint.
    pub fn set_value(&self, offset: NodeOffset, value: &Value) -> DbResult<()> {
        let slot = self.encode_for_update(value)?;
        let (page_idx, elem) = self.locate(offset);
        self.ensure_pages(page_idx)?;
        self.pool.update_page(&self.fh, page_idx, |page| {
            if let Some(slot) = &slot {
                page[elem * self.element_size..(elem + 1) * self.element_size]
                    .copy_from_slice(slot);
                page[self.bitmap_offset + elem / 8] &= !(1 << (elem % 8));
            } else {
                page[self.bitmap_offset + elem / 8] |= 1 << (elem % 8);
            }
        })?;
        // keep the header's element count in step
        self.pool.update_page(&self.fh, 0, |page| {
            let mut header = if page[..24].iter().all(|b| *b == 0) {
                ColumnFileHeader {
                    element_size: self.element_size as u32,
                    num_elements_per_page: self.per_page as u32,
                    null_bitmap_bytes: crate::storage::page::null_bitmap_bytes(
                        self.element_size,
                        true,
                    ) as u32,
                    num_data_pages: 0,
                    num_elements: 0,
                }
            } else {
                ColumnFileHeader::from_bytes(page)
            };
            if offset + 1 > header.num_elements {
                header.num_elements = offset + 1;
            }
            header.num_data_pages = std::cmp::max(header.num_data_pages, page_idx);
            page[..24].copy_from_slice(&header.to_bytes());
        })?;
        Ok(())
    }

    fn encode_for_update(&self, value: &Value) -> DbResult<Option<Vec<u8>>> {
        if value.is_null() {
            return Ok(None);
        }
        match (&self.logical_type, value) {
            (LogicalType::String, Value::String(s)) => {
                let bytes = s.as_bytes();
                let descr = if bytes.len() <= crate::storage::slot_format::STRING_INLINE_LEN {
                    StrDescriptor::inline_from(bytes)
                } else {
                    let ovf = self.overflow.as_ref().ok_or_else(|| {
                        DbError::corruption("string column without overflow file")
                    })?;
                    ovf.append_for_update(bytes)?
                };
                let mut slot = vec![0u8; DESCRIPTOR_SIZE];
                slot.copy_from_slice(&descr.to_bytes());
                Ok(Some(slot))
            }
            (LogicalType::VarList(_), _) => Err(DbError::binder(
                "updating VAR_LIST properties outside COPY is not supported",
            )),
            (ty, v) => Ok(Some(encode_fixed_value(v, ty)?)),
        }
    }

    fn ensure_pages(&self, page_idx: PageIdx) -> DbResult<()> {
        while self.fh.num_pages() <= page_idx as u64 {
            self.pool.add_new_page(&self.fh);
        }
        Ok(())
    }
}

impl OverflowFile {
    /// Append a long payload on the interactive write path. Each value
    /// claims a fresh page: simple, and rare enough to not matter.
    pub fn append_for_update(&self, bytes: &[u8]) -> DbResult<StrDescriptor> {
        if bytes.len() > PAGE_SIZE {
            return Err(DbError::copy(format!(
                "maximum number of bytes of an overflow value is {}, got {}",
                PAGE_SIZE,
                bytes.len()
            )));
        }
        let (pool, fh) = self.parts();
        let page_idx = pool.add_new_page(fh);
        pool.update_page(fh, page_idx, |page| {
            page[..bytes.len()].copy_from_slice(bytes);
        })?;
        Ok(StrDescriptor::overflow_from(bytes, page_idx, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_mem_column::InMemColumnChunk;

    #[test]
    fn read_back_flushed_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.col");
        let chunk = InMemColumnChunk::new(0, 10, 8, true);
        for i in [0u64, 3, 9] {
            chunk.set_value(&(i as i64 * 11).to_le_bytes(), i);
        }
        chunk.flush(&path).unwrap();

        let pool = Arc::new(BufferPool::new(1 << 22));
        let col = DiskColumn::open(pool, &path, None, LogicalType::Int64).unwrap();
        assert_eq!(col.read_value(3).unwrap(), Value::Int64(33));
        assert_eq!(col.read_value(4).unwrap(), Value::Null);
        assert!(col.is_null(4).unwrap());
        assert!(!col.is_null(9).unwrap());
    }

    #[test]
    fn header_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.col");
        let chunk = InMemColumnChunk::new(0, 1, 8, true);
        chunk.set_value(&1i64.to_le_bytes(), 0);
        chunk.flush(&path).unwrap();

        let pool = Arc::new(BufferPool::new(1 << 22));
        assert!(matches!(
            DiskColumn::open(pool, &path, None, LogicalType::Int16),
            Err(DbError::Corruption(_))
        ));
    }

    #[test]
    fn interactive_set_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.col");
        let pool = Arc::new(BufferPool::new(1 << 22));
        let col = DiskColumn::open(pool, &path, None, LogicalType::Int64).unwrap();
        col.set_value(5, &Value::Int64(123)).unwrap();
        assert_eq!(col.read_value(5).unwrap(), Value::Int64(123));
        assert_eq!(col.read_value(4).unwrap(), Value::Null);
    }
}
