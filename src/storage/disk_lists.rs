use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::common::logical_type::LogicalType;
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::storage::buffer_pool::{BufferPool, FileHandle};
use crate::storage::in_mem_lists::{chunk_of, ChunkPageRun};
use crate::storage::overflow_file::OverflowFile;
use crate::storage::page::{null_bitmap_offset, num_elements_per_page};
use crate::storage::slot_format::decode_fixed_value;
use crate::storage::storage_utils;
use crate::types::{CsrOffset, NodeOffset, PageIdx};

/// Read side of a CSR list file (`.lst` + `.hdr` + `.meta`). Headers
/// and metadata are small sidecars loaded up front; data pages go
/// through the buffer pool.
pub struct DiskLists {
    fh: Arc<FileHandle>,
    pool: Arc<BufferPool>,
    pub logical_type: LogicalType,
    element_size: usize,
    has_null: bool,
    per_page: usize,
    num_nodes: u64,
    /// node cursors plus one sentinel per chunk, as written by the
    /// headers builder
    headers: Vec<u64>,
    runs: Vec<ChunkPageRun>,
    overflow: Option<OverflowFile>,
}

impl DiskLists {
    pub fn open(
        pool: Arc<BufferPool>,
        lst_path: &Path,
        overflow_path: Option<PathBuf>,
        logical_type: LogicalType,
        has_null: bool,
    ) -> DbResult<Self> {
        let fh = pool.open_file(lst_path)?;
        let element_size = logical_type.element_size();
        let (num_nodes, headers) = read_headers(&storage_utils::headers_path(lst_path))?;
        let runs = read_metadata(&storage_utils::metadata_path(lst_path))?;
        let overflow = match (&overflow_path, logical_type.has_overflow()) {
            (Some(p), true) => Some(OverflowFile::open(pool.clone(), p)?),
            _ => None,
        };
        Ok(Self {
            per_page: num_elements_per_page(element_size, has_null),
            fh,
            pool,
            logical_type,
            element_size,
            has_null,
            num_nodes,
            headers,
            runs,
            overflow,
        })
    }

    pub fn num_nodes(&self) -> u64 {
        self.num_nodes
    }

    fn header_idx(node: NodeOffset) -> usize {
        (node + chunk_of(node)) as usize
    }

    pub fn csr_offset(&self, node: NodeOffset) -> CsrOffset {
        self.headers[Self::header_idx(node)]
    }

    pub fn list_size(&self, node: NodeOffset) -> u64 {
        if node >= self.num_nodes {
            return 0;
        }
        let idx = Self::header_idx(node);
        self.headers[idx + 1] - self.headers[idx]
    }

    fn element_location(&self, node: NodeOffset, pos: u64) -> DbResult<(PageIdx, usize)> {
        let chunk = chunk_of(node) as usize;
        let run = self.runs.get(chunk).ok_or_else(|| {
            DbError::corruption(format!("list chunk {} has no metadata in {:?}", chunk, self.fh.path))
        })?;
        let csr = self.csr_offset(node) + pos;
        let page_in_run = (csr / self.per_page as u64) as u32;
        if page_in_run >= run.num_pages {
            return Err(DbError::corruption(format!(
                "list element of node {} beyond chunk page run in {:?}",
                node, self.fh.path
            )));
        }
        Ok((
            run.start_page_idx + page_in_run,
            (csr % self.per_page as u64) as usize,
        ))
    }

    pub fn read_slot(&self, node: NodeOffset, pos: u64) -> DbResult<Option<Vec<u8>>> {
        let (page_idx, elem) = self.element_location(node, pos)?;
        let bitmap_offset = null_bitmap_offset(self.element_size, self.has_null);
        self.pool.with_page(&self.fh, page_idx, |page| {
            if self.has_null && page[bitmap_offset + elem / 8] & (1 << (elem % 8)) != 0 {
                None
            } else {
                Some(page[elem * self.element_size..(elem + 1) * self.element_size].to_vec())
            }
        })
    }

    pub fn read_value(&self, node: NodeOffset, pos: u64) -> DbResult<Value> {
        match self.read_slot(node, pos)? {
            None => Ok(Value::Null),
            Some(slot) => match &self.overflow {
                Some(ovf) => ovf.decode_slot(&slot, &self.logical_type),
                None => Ok(decode_fixed_value(&slot, &self.logical_type)),
            },
        }
    }

    /// Neighbor offsets of `node` for adjacency lists.
    pub fn read_adj_list(&self, node: NodeOffset) -> DbResult<Vec<NodeOffset>> {
        let size = self.list_size(node);
        let mut result = Vec::with_capacity(size as usize);
        for pos in 0..size {
            let slot = self.read_slot(node, pos)?.ok_or_else(|| {
                DbError::corruption(format!(
                    "adjacency slot {} of node {} is unexpectedly null",
                    pos, node
                ))
            })?;
            result.push(u64::from_le_bytes(slot[..8].try_into().unwrap()));
        }
        Ok(result)
    }
}

fn read_headers(path: &Path) -> DbResult<(u64, Vec<u64>)> {
    let bytes = crate::storage::file_utils::read_file_to_bytes(path)?;
    if bytes.len() < 8 || (bytes.len() - 8) % 8 != 0 {
        return Err(DbError::corruption(format!(
            "list headers file {:?} has invalid length {}",
            path,
            bytes.len()
        )));
    }
    let num_nodes = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    let entries = bytes[8..]
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok((num_nodes, entries))
}

fn read_metadata(path: &Path) -> DbResult<Vec<ChunkPageRun>> {
    let bytes = crate::storage::file_utils::read_file_to_bytes(path)?;
    if bytes.len() < 8 {
        return Err(DbError::corruption(format!(
            "list metadata file {:?} has invalid length {}",
            path,
            bytes.len()
        )));
    }
    let num_chunks = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
    if bytes.len() != 8 + num_chunks * 8 {
        return Err(DbError::corruption(format!(
            "list metadata file {:?} truncated",
            path
        )));
    }
    let runs = bytes[8..]
        .chunks_exact(8)
        .map(|c| ChunkPageRun {
            start_page_idx: u32::from_le_bytes(c[..4].try_into().unwrap()),
            num_pages: u32::from_le_bytes(c[4..].try_into().unwrap()),
        })
        .collect();
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_mem_lists::{
        calculate_list_headers_task, calculate_lists_metadata_task, InMemLists,
    };
    use std::sync::atomic::AtomicU64;

    #[test]
    fn round_trip_adjacency_lists() {
        let dir = tempfile::tempdir().unwrap();
        let lst_path = dir.path().join("adj.FWD.lst");
        let num_nodes = 4u64;
        let (lists, headers) = InMemLists::new_adj(lst_path.clone(), num_nodes);
        let list_sizes: Vec<AtomicU64> =
            [2u64, 0, 1, 3].iter().map(|&c| AtomicU64::new(c)).collect();
        calculate_list_headers_task(num_nodes, &list_sizes, &headers);
        calculate_lists_metadata_task(num_nodes, &list_sizes, &lists);

        lists.set_element(0, 0, &10u64.to_le_bytes());
        lists.set_element(0, 1, &11u64.to_le_bytes());
        lists.set_element(2, 0, &20u64.to_le_bytes());
        for (pos, v) in [(0u64, 30u64), (1, 31), (2, 32)] {
            lists.set_element(3, pos, &v.to_le_bytes());
        }
        lists.save_to_file().unwrap();
        // promote the shadows the way the checkpoint replayer does
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let path = entry.unwrap().path();
            let name = path.to_string_lossy().into_owned();
            if let Some(primary) = name.strip_suffix(".wal") {
                std::fs::rename(&path, primary).unwrap();
            }
        }

        let pool = Arc::new(BufferPool::new(1 << 22));
        let disk =
            DiskLists::open(pool, &lst_path, None, LogicalType::InternalId, false).unwrap();
        assert_eq!(disk.num_nodes(), 4);
        assert_eq!(disk.list_size(1), 0);
        assert_eq!(disk.read_adj_list(0).unwrap(), vec![10, 11]);
        assert_eq!(disk.read_adj_list(3).unwrap(), vec![30, 31, 32]);
    }
}
