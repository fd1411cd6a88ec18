use crate::common::logical_type::LogicalType;
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::storage::in_mem_file::InMemFile;
use crate::storage::page::{PageByteCursor, PAGE_SIZE};
use crate::storage::slot_format::{
    encode_fixed_value, ListDescriptor, StrDescriptor, STRING_INLINE_LEN,
};
use crate::types::{PageIdx, INVALID_PAGE_IDX};

/// Page file holding variable-length payloads during a bulk copy.
/// Cursors are owned by the writing task, so concurrent writers fill
/// disjoint regions; only page allocation synchronizes internally.
pub struct InMemOverflowFile {
    file: InMemFile,
}

impl InMemOverflowFile {
    pub fn new() -> Self {
        Self {
            file: InMemFile::new(),
        }
    }

    pub fn num_pages(&self) -> usize {
        self.file.num_pages()
    }

    fn allocate(&self, len: usize, cursor: &mut PageByteCursor) -> DbResult<(PageIdx, u32)> {
        if len > PAGE_SIZE {
            return Err(DbError::copy(format!(
                "maximum number of bytes of an overflow value is {}, got {}",
                PAGE_SIZE, len
            )));
        }
        if cursor.page_idx == INVALID_PAGE_IDX
            || cursor.offset_in_page as usize + len > PAGE_SIZE
        {
            cursor.page_idx = self.file.add_new_page();
            cursor.offset_in_page = 0;
        }
        let at = (cursor.page_idx, cursor.offset_in_page);
        cursor.offset_in_page += len as u32;
        Ok(at)
    }

    /// Append raw bytes, returning where they landed.
    pub fn copy_raw(&self, bytes: &[u8], cursor: &mut PageByteCursor) -> DbResult<(PageIdx, u32)> {
        let (page_idx, offset) = self.allocate(bytes.len(), cursor)?;
        self.file.write(page_idx, offset as usize, bytes);
        Ok((page_idx, offset))
    }

    pub fn copy_string(&self, s: &str, cursor: &mut PageByteCursor) -> DbResult<StrDescriptor> {
        let bytes = s.as_bytes();
        if bytes.len() <= STRING_INLINE_LEN {
            return Ok(StrDescriptor::inline_from(bytes));
        }
        let (page_idx, offset) = self.copy_raw(bytes, cursor)?;
        Ok(StrDescriptor::overflow_from(bytes, page_idx, offset))
    }

    /// Write list elements as fixed-width child slots; string and list
    /// children recurse into this same file first.
    pub fn copy_list(
        &self,
        items: &[Value],
        child_ty: &LogicalType,
        cursor: &mut PageByteCursor,
    ) -> DbResult<ListDescriptor> {
        if items.is_empty() {
            return Ok(ListDescriptor::empty());
        }
        let child_size = child_ty.element_size();
        let mut buf = Vec::with_capacity(items.len() * child_size);
        for item in items {
            buf.extend_from_slice(&self.encode_value_to_slot(item, child_ty, cursor)?);
        }
        let (page_idx, offset) = self.copy_raw(&buf, cursor)?;
        Ok(ListDescriptor {
            num_elements: items.len() as u64,
            page_idx,
            offset_in_page: offset,
        })
    }

    /// Slot bytes for any storable value; overflow-bearing types write
    /// their payload here and return a descriptor slot.
    pub fn encode_value_to_slot(
        &self,
        value: &Value,
        ty: &LogicalType,
        cursor: &mut PageByteCursor,
    ) -> DbResult<Vec<u8>> {
        match (value, ty) {
            (Value::String(s), LogicalType::String) => {
                Ok(self.copy_string(s, cursor)?.to_bytes().to_vec())
            }
            (Value::VarList(items), LogicalType::VarList(child)) => {
                Ok(self.copy_list(items, child, cursor)?.to_bytes().to_vec())
            }
            _ => encode_fixed_value(value, ty),
        }
    }

    pub fn read(&self, page_idx: PageIdx, offset: u32, len: usize) -> Vec<u8> {
        self.file.read(page_idx, offset as usize, len)
    }

    /// Re-copy a long string from `src` into this file, producing the
    /// rewritten descriptor. Inline strings pass through untouched.
    pub fn copy_string_from_file(
        &self,
        src: &InMemOverflowFile,
        descr: &StrDescriptor,
        cursor: &mut PageByteCursor,
    ) -> DbResult<StrDescriptor> {
        if descr.is_inline() {
            return Ok(*descr);
        }
        let payload = src.read(descr.page_idx, descr.offset_in_page, descr.len as usize);
        let (page_idx, offset) = self.copy_raw(&payload, cursor)?;
        Ok(StrDescriptor::overflow_from(&payload, page_idx, offset))
    }

    /// Re-copy a list (recursively re-homing overflow-bearing children)
    /// from `src` into this file.
    pub fn copy_list_from_file(
        &self,
        src: &InMemOverflowFile,
        descr: &ListDescriptor,
        child_ty: &LogicalType,
        cursor: &mut PageByteCursor,
    ) -> DbResult<ListDescriptor> {
        if descr.num_elements == 0 {
            return Ok(*descr);
        }
        let child_size = child_ty.element_size();
        let mut buf = src.read(
            descr.page_idx,
            descr.offset_in_page,
            descr.num_elements as usize * child_size,
        );
        match child_ty {
            LogicalType::String => {
                for i in 0..descr.num_elements as usize {
                    let slot = &buf[i * child_size..(i + 1) * child_size];
                    let child = StrDescriptor::from_bytes(slot);
                    let rewritten = self.copy_string_from_file(src, &child, cursor)?;
                    buf[i * child_size..(i + 1) * child_size]
                        .copy_from_slice(&rewritten.to_bytes());
                }
            }
            LogicalType::VarList(grandchild) => {
                for i in 0..descr.num_elements as usize {
                    let slot = &buf[i * child_size..(i + 1) * child_size];
                    let child = ListDescriptor::from_bytes(slot);
                    let rewritten =
                        self.copy_list_from_file(src, &child, grandchild, cursor)?;
                    buf[i * child_size..(i + 1) * child_size]
                        .copy_from_slice(&rewritten.to_bytes());
                }
            }
            _ => {}
        }
        let (page_idx, offset) = self.copy_raw(&buf, cursor)?;
        Ok(ListDescriptor {
            num_elements: descr.num_elements,
            page_idx,
            offset_in_page: offset,
        })
    }

    pub fn flush<P: AsRef<std::path::Path>>(&self, path: P) -> DbResult<()> {
        self.file.flush(path)
    }
}

impl Default for InMemOverflowFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_stay_inline() {
        let ovf = InMemOverflowFile::new();
        let mut cursor = PageByteCursor::default();
        let d = ovf.copy_string("short", &mut cursor).unwrap();
        assert!(d.is_inline());
        assert_eq!(ovf.num_pages(), 0);
    }

    #[test]
    fn long_strings_go_to_overflow() {
        let ovf = InMemOverflowFile::new();
        let mut cursor = PageByteCursor::default();
        let s = "a string well beyond twelve bytes";
        let d = ovf.copy_string(s, &mut cursor).unwrap();
        assert!(!d.is_inline());
        let payload = ovf.read(d.page_idx, d.offset_in_page, d.len as usize);
        assert_eq!(payload, s.as_bytes());
    }

    #[test]
    fn list_of_ints_round_trip() {
        let ovf = InMemOverflowFile::new();
        let mut cursor = PageByteCursor::default();
        let items = vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)];
        let d = ovf.copy_list(&items, &LogicalType::Int64, &mut cursor).unwrap();
        assert_eq!(d.num_elements, 3);
        let bytes = ovf.read(d.page_idx, d.offset_in_page, 24);
        assert_eq!(&bytes[0..8], &1i64.to_le_bytes());
        assert_eq!(&bytes[16..24], &3i64.to_le_bytes());
    }

    #[test]
    fn oversized_value_is_rejected() {
        let ovf = InMemOverflowFile::new();
        let mut cursor = PageByteCursor::default();
        let s = "x".repeat(PAGE_SIZE + 1);
        assert!(ovf.copy_string(&s, &mut cursor).is_err());
    }

    #[test]
    fn cursor_wraps_to_new_page() {
        let ovf = InMemOverflowFile::new();
        let mut cursor = PageByteCursor::default();
        let chunk = vec![7u8; PAGE_SIZE - 10];
        let (p0, _) = ovf.copy_raw(&chunk, &mut cursor).unwrap();
        let (p1, o1) = ovf.copy_raw(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11], &mut cursor).unwrap();
        assert_eq!(p0, 0);
        assert_eq!(p1, 1);
        assert_eq!(o1, 0);
    }
}
