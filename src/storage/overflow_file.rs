use std::path::Path;
use std::sync::Arc;

use crate::common::logical_type::LogicalType;
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::storage::buffer_pool::{BufferPool, FileHandle};
use crate::storage::slot_format::{decode_fixed_value, ListDescriptor, StrDescriptor};

/// Read side of an overflow page file (strings, var lists).
pub struct OverflowFile {
    fh: Arc<FileHandle>,
    pool: Arc<BufferPool>,
}

impl OverflowFile {
    pub fn open(pool: Arc<BufferPool>, path: &Path) -> DbResult<Self> {
        let fh = pool.open_file(path)?;
        Ok(Self { fh, pool })
    }

    pub(crate) fn parts(&self) -> (&Arc<BufferPool>, &Arc<FileHandle>) {
        (&self.pool, &self.fh)
    }

    fn read_raw(&self, page_idx: u32, offset: u32, len: usize) -> DbResult<Vec<u8>> {
        self.pool.with_page(&self.fh, page_idx, |page| {
            if offset as usize + len > page.len() {
                return Err(DbError::corruption(format!(
                    "overflow read past page end in {:?}",
                    self.fh.path
                )));
            }
            Ok(page[offset as usize..offset as usize + len].to_vec())
        })?
    }

    pub fn read_string(&self, descr: &StrDescriptor) -> DbResult<String> {
        let bytes = if descr.is_inline() {
            descr.inline_str().to_vec()
        } else {
            self.read_raw(descr.page_idx, descr.offset_in_page, descr.len as usize)?
        };
        String::from_utf8(bytes)
            .map_err(|_| DbError::corruption("invalid utf-8 in overflow string"))
    }

    pub fn read_list(&self, descr: &ListDescriptor, child_ty: &LogicalType) -> DbResult<Value> {
        if descr.num_elements == 0 {
            return Ok(Value::VarList(Vec::new()));
        }
        let child_size = child_ty.element_size();
        let bytes = self.read_raw(
            descr.page_idx,
            descr.offset_in_page,
            descr.num_elements as usize * child_size,
        )?;
        let mut items = Vec::with_capacity(descr.num_elements as usize);
        for i in 0..descr.num_elements as usize {
            let slot = &bytes[i * child_size..(i + 1) * child_size];
            items.push(self.decode_slot(slot, child_ty)?);
        }
        Ok(Value::VarList(items))
    }

    /// Decode one fixed-width slot, chasing overflow for string/list
    /// elements.
    pub fn decode_slot(&self, slot: &[u8], ty: &LogicalType) -> DbResult<Value> {
        match ty {
            LogicalType::String => {
                let descr = StrDescriptor::from_bytes(slot);
                Ok(Value::String(self.read_string(&descr)?))
            }
            LogicalType::VarList(child) => {
                let descr = ListDescriptor::from_bytes(slot);
                self.read_list(&descr, child)
            }
            _ => Ok(decode_fixed_value(slot, ty)),
        }
    }
}
