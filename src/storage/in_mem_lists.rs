use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::trace;

use crate::common::logical_type::LogicalType;
use crate::error::DbResult;
use crate::storage::file_utils;
use crate::storage::in_mem_file::InMemFile;
use crate::storage::in_mem_overflow::InMemOverflowFile;
use crate::storage::page::{
    null_bitmap_offset, num_elements_per_page, LISTS_CHUNK_SIZE,
};
use crate::storage::storage_utils;
use crate::types::{CsrOffset, HandyRwLock, NodeOffset, PageIdx};

pub fn num_chunks(num_nodes: u64) -> u64 {
    (num_nodes + LISTS_CHUNK_SIZE - 1) / LISTS_CHUNK_SIZE
}

pub fn chunk_of(node: NodeOffset) -> u64 {
    node / LISTS_CHUNK_SIZE
}

/// CSR cursors for every node plus one sentinel per chunk, so
/// `size(n) == entries[idx(n)+1] - entries[idx(n)]` holds for every
/// node including the last of a chunk.
pub struct ListHeadersBuilder {
    num_nodes: u64,
    entries: Vec<AtomicU64>,
}

impl ListHeadersBuilder {
    pub fn new(num_nodes: u64) -> Self {
        let len = (num_nodes + num_chunks(num_nodes)) as usize;
        let mut entries = Vec::with_capacity(len);
        entries.resize_with(len, || AtomicU64::new(0));
        Self { num_nodes, entries }
    }

    pub fn num_nodes(&self) -> u64 {
        self.num_nodes
    }

    fn idx(node: NodeOffset) -> usize {
        (node + chunk_of(node)) as usize
    }

    pub fn set_csr_offset(&self, node: NodeOffset, csr: CsrOffset) {
        self.entries[Self::idx(node)].store(csr, Ordering::Relaxed);
    }

    pub fn set_chunk_sentinel(&self, chunk: u64, nodes_in_chunk: u64, csr_total: CsrOffset) {
        let idx = (chunk * LISTS_CHUNK_SIZE + chunk + nodes_in_chunk) as usize;
        self.entries[idx].store(csr_total, Ordering::Relaxed);
    }

    pub fn csr_offset(&self, node: NodeOffset) -> CsrOffset {
        self.entries[Self::idx(node)].load(Ordering::Relaxed)
    }

    pub fn list_size(&self, node: NodeOffset) -> u64 {
        let idx = Self::idx(node);
        self.entries[idx + 1].load(Ordering::Relaxed) - self.entries[idx].load(Ordering::Relaxed)
    }

    /// Total elements of a chunk, i.e. its sentinel value.
    pub fn chunk_total(&self, chunk: u64) -> u64 {
        let nodes_in_chunk =
            std::cmp::min(LISTS_CHUNK_SIZE, self.num_nodes - chunk * LISTS_CHUNK_SIZE);
        let idx = (chunk * LISTS_CHUNK_SIZE + chunk + nodes_in_chunk) as usize;
        self.entries[idx].load(Ordering::Relaxed)
    }

    pub fn save(&self, target: &std::path::Path) -> DbResult<()> {
        let mut bytes = Vec::with_capacity(8 + self.entries.len() * 8);
        bytes.extend_from_slice(&self.num_nodes.to_le_bytes());
        for entry in &self.entries {
            bytes.extend_from_slice(&entry.load(Ordering::Relaxed).to_le_bytes());
        }
        file_utils::overwrite_file(target, &bytes)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkPageRun {
    pub start_page_idx: PageIdx,
    pub num_pages: u32,
}

/// Per-chunk page runs of the data region.
pub struct ListsMetadataBuilder {
    runs: Mutex<Vec<ChunkPageRun>>,
}

impl ListsMetadataBuilder {
    pub fn new(num_nodes: u64) -> Self {
        Self {
            runs: Mutex::new(vec![ChunkPageRun::default(); num_chunks(num_nodes) as usize]),
        }
    }

    pub fn set_chunk_page_run(&self, chunk: u64, run: ChunkPageRun) {
        self.runs.lock().unwrap()[chunk as usize] = run;
    }

    pub fn chunk_page_run(&self, chunk: u64) -> ChunkPageRun {
        self.runs.lock().unwrap()[chunk as usize]
    }

    pub fn save(&self, target: &std::path::Path) -> DbResult<()> {
        let runs = self.runs.lock().unwrap();
        let mut bytes = Vec::with_capacity(8 + runs.len() * 8);
        bytes.extend_from_slice(&(runs.len() as u64).to_le_bytes());
        for run in runs.iter() {
            bytes.extend_from_slice(&run.start_page_idx.to_le_bytes());
            bytes.extend_from_slice(&run.num_pages.to_le_bytes());
        }
        file_utils::overwrite_file(target, &bytes)
    }
}

/// List data under construction: headers locate each node's list in
/// its chunk, metadata maps chunks onto page runs, the in-mem file
/// holds the element pages. Used both for adjacency lists (no null
/// bits) and property lists (with null bits); elements are whatever
/// fixed-width slot the logical type dictates.
pub struct InMemLists {
    pub path: PathBuf,
    pub overflow_path: Option<PathBuf>,
    pub logical_type: LogicalType,
    element_size: usize,
    has_null: bool,
    num_nodes: u64,
    pub file: InMemFile,
    headers: Arc<ListHeadersBuilder>,
    metadata: ListsMetadataBuilder,
    nulls: RwLock<Vec<Vec<AtomicBool>>>,
    ordered_overflow: Option<InMemOverflowFile>,
}

impl InMemLists {
    pub fn new(
        path: PathBuf,
        overflow_path: Option<PathBuf>,
        logical_type: LogicalType,
        num_nodes: u64,
        headers: Arc<ListHeadersBuilder>,
        has_null: bool,
    ) -> Self {
        let ordered_overflow = if logical_type.has_overflow() {
            Some(InMemOverflowFile::new())
        } else {
            None
        };
        Self {
            element_size: logical_type.element_size(),
            path,
            overflow_path,
            logical_type,
            has_null,
            num_nodes,
            file: InMemFile::new(),
            headers,
            metadata: ListsMetadataBuilder::new(num_nodes),
            nulls: RwLock::new(Vec::new()),
            ordered_overflow,
        }
    }

    /// Adjacency lists own the header builder their property lists
    /// share.
    pub fn new_adj(path: PathBuf, num_nodes: u64) -> (Self, Arc<ListHeadersBuilder>) {
        let headers = Arc::new(ListHeadersBuilder::new(num_nodes));
        let lists = Self::new(
            path,
            None,
            LogicalType::InternalId,
            num_nodes,
            headers.clone(),
            false,
        );
        (lists, headers)
    }

    pub fn headers(&self) -> &Arc<ListHeadersBuilder> {
        &self.headers
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn has_null(&self) -> bool {
        self.has_null
    }

    pub fn num_nodes(&self) -> u64 {
        self.num_nodes
    }

    pub fn ordered_overflow(&self) -> Option<&InMemOverflowFile> {
        self.ordered_overflow.as_ref()
    }

    pub fn elements_per_page(&self) -> usize {
        num_elements_per_page(self.element_size, self.has_null)
    }

    pub fn list_size(&self, node: NodeOffset) -> u64 {
        self.headers.list_size(node)
    }

    /// `(page, element-in-page)` of list position `pos` of `node`.
    /// Requires headers and metadata to be in place.
    pub fn element_location(&self, node: NodeOffset, pos: u64) -> (PageIdx, usize) {
        let chunk = chunk_of(node);
        let csr = self.headers.csr_offset(node) + pos;
        let per_page = self.elements_per_page() as u64;
        let run = self.metadata.chunk_page_run(chunk);
        let page = run.start_page_idx + (csr / per_page) as PageIdx;
        (page, (csr % per_page) as usize)
    }

    pub fn set_element(&self, node: NodeOffset, pos: u64, slot_bytes: &[u8]) {
        debug_assert_eq!(slot_bytes.len(), self.element_size);
        let (page, elem) = self.element_location(node, pos);
        self.file.write(page, elem * self.element_size, slot_bytes);
        if self.has_null {
            let chunk = chunk_of(node);
            let csr = self.headers.csr_offset(node) + pos;
            self.nulls.rl()[chunk as usize][csr as usize].store(false, Ordering::Release);
        }
    }

    pub fn read_element(&self, node: NodeOffset, pos: u64) -> Vec<u8> {
        let (page, elem) = self.element_location(node, pos);
        self.file.read(page, elem * self.element_size, self.element_size)
    }

    pub fn is_element_null(&self, node: NodeOffset, pos: u64) -> bool {
        if !self.has_null {
            return false;
        }
        let chunk = chunk_of(node);
        let csr = self.headers.csr_offset(node) + pos;
        self.nulls.rl()[chunk as usize][csr as usize].load(Ordering::Acquire)
    }

    /// Build metadata for one chunk after page counting, and size the
    /// chunk's null-bit vector.
    fn finish_chunk(&self, chunk: u64, run: ChunkPageRun, total_elements: u64) {
        self.metadata.set_chunk_page_run(chunk, run);
        if self.has_null {
            let mut nulls = self.nulls.wl();
            if nulls.len() <= chunk as usize {
                nulls.resize_with(num_chunks(self.num_nodes) as usize, Vec::new);
            }
            let mut bits = Vec::with_capacity(total_elements as usize);
            bits.resize_with(total_elements as usize, || AtomicBool::new(true));
            nulls[chunk as usize] = bits;
        }
    }

    /// Merge null bitmaps into the page images, then flush data,
    /// headers and metadata (plus the ordered overflow file if any).
    pub fn save_to_file(&self) -> DbResult<()> {
        if self.has_null {
            let per_page = self.elements_per_page();
            let bitmap_offset = null_bitmap_offset(self.element_size, self.has_null);
            let nulls = self.nulls.rl();
            for chunk in 0..num_chunks(self.num_nodes) {
                let run = self.metadata.chunk_page_run(chunk);
                for (csr, bit) in nulls[chunk as usize].iter().enumerate() {
                    if bit.load(Ordering::Acquire) {
                        let page = run.start_page_idx + (csr / per_page) as PageIdx;
                        let elem = csr % per_page;
                        self.file
                            .page(page)
                            .or_byte(bitmap_offset + elem / 8, 1 << (elem % 8));
                    }
                }
            }
        }
        // `path` is the primary name; everything lands as a `.wal`
        // shadow the checkpoint promotes
        self.file.flush(storage_utils::wal_version(&self.path))?;
        self.headers
            .save(&storage_utils::wal_version(&storage_utils::headers_path(&self.path)))?;
        self.metadata
            .save(&storage_utils::wal_version(&storage_utils::metadata_path(&self.path)))?;
        if let (Some(ovf), Some(ovf_path)) = (&self.ordered_overflow, &self.overflow_path) {
            ovf.flush(storage_utils::wal_version(ovf_path))?;
        }
        Ok(())
    }
}

/// Turn per-node list sizes into chunk-local CSR cursors.
pub fn calculate_list_headers_task(
    num_nodes: u64,
    list_sizes: &[AtomicU64],
    headers: &ListHeadersBuilder,
) {
    trace!("start: list headers for {} nodes", num_nodes);
    let mut node: NodeOffset = 0;
    for chunk in 0..num_chunks(num_nodes) {
        let nodes_in_chunk = std::cmp::min(LISTS_CHUNK_SIZE, num_nodes - node);
        let mut csr: CsrOffset = 0;
        for i in 0..nodes_in_chunk {
            headers.set_csr_offset(node + i, csr);
            csr += list_sizes[(node + i) as usize].load(Ordering::Relaxed);
        }
        headers.set_chunk_sentinel(chunk, nodes_in_chunk, csr);
        node += nodes_in_chunk;
    }
    trace!("end: list headers for {} nodes", num_nodes);
}

/// Count pages per chunk (lists may wrap across pages but not across
/// chunks), allocate them in the in-mem file and record the page
/// runs.
pub fn calculate_lists_metadata_task(
    num_nodes: u64,
    list_sizes: &[AtomicU64],
    lists: &InMemLists,
) {
    trace!("start: lists metadata for {:?}", lists.path);
    let per_page = lists.elements_per_page() as u64;
    let mut node: NodeOffset = 0;
    for chunk in 0..num_chunks(num_nodes) {
        let nodes_in_chunk = std::cmp::min(LISTS_CHUNK_SIZE, num_nodes - node);
        let mut num_pages = 0u32;
        let mut offset_in_page = 0u64;
        let mut total_elements = 0u64;
        for i in 0..nodes_in_chunk {
            let mut in_list = list_sizes[(node + i) as usize].load(Ordering::Relaxed);
            total_elements += in_list;
            while in_list + offset_in_page > per_page {
                in_list -= per_page - offset_in_page;
                num_pages += 1;
                offset_in_page = 0;
            }
            offset_in_page += in_list;
        }
        if offset_in_page != 0 {
            num_pages += 1;
        }
        let start_page_idx = lists.file.add_new_pages(num_pages as usize);
        lists.finish_chunk(
            chunk,
            ChunkPageRun {
                start_page_idx,
                num_pages,
            },
            total_elements,
        );
        node += nodes_in_chunk;
    }
    trace!("end: lists metadata for {:?}", lists.path);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(counts: &[u64]) -> Vec<AtomicU64> {
        counts.iter().map(|&c| AtomicU64::new(c)).collect()
    }

    #[test]
    fn headers_are_monotonic_within_chunk() {
        let num_nodes = 5;
        let headers = ListHeadersBuilder::new(num_nodes);
        let list_sizes = sizes(&[2, 0, 3, 1, 0]);
        calculate_list_headers_task(num_nodes, &list_sizes, &headers);

        assert_eq!(headers.csr_offset(0), 0);
        assert_eq!(headers.csr_offset(1), 2);
        assert_eq!(headers.csr_offset(2), 2);
        assert_eq!(headers.csr_offset(3), 5);
        assert_eq!(headers.csr_offset(4), 6);
        assert_eq!(headers.chunk_total(0), 6);
        for (node, expect) in [(0, 2u64), (1, 0), (2, 3), (3, 1), (4, 0)] {
            assert_eq!(headers.list_size(node), expect);
        }
    }

    #[test]
    fn headers_reset_per_chunk() {
        let num_nodes = LISTS_CHUNK_SIZE + 2;
        let headers = ListHeadersBuilder::new(num_nodes);
        let counts: Vec<u64> = (0..num_nodes).map(|_| 1).collect();
        let list_sizes = sizes(&counts);
        calculate_list_headers_task(num_nodes, &list_sizes, &headers);

        // second chunk starts a fresh cursor
        assert_eq!(headers.csr_offset(LISTS_CHUNK_SIZE), 0);
        assert_eq!(headers.csr_offset(LISTS_CHUNK_SIZE + 1), 1);
        assert_eq!(headers.chunk_total(0), LISTS_CHUNK_SIZE);
        assert_eq!(headers.chunk_total(1), 2);
    }

    #[test]
    fn metadata_counts_wrapping_pages() {
        let num_nodes = 3u64;
        let (lists, headers) =
            InMemLists::new_adj(std::path::PathBuf::from("/tmp/unused.lst"), num_nodes);
        let per_page = lists.elements_per_page() as u64;
        // one list larger than a page forces a wrap
        let list_sizes = sizes(&[per_page + 3, 1, 0]);
        calculate_list_headers_task(num_nodes, &list_sizes, &headers);
        calculate_lists_metadata_task(num_nodes, &list_sizes, &lists);

        let run = lists.metadata.chunk_page_run(0);
        assert_eq!(run.start_page_idx, 0);
        assert_eq!(run.num_pages, 2);
        assert_eq!(lists.file.num_pages(), 2);
    }

    #[test]
    fn set_element_lands_in_final_slot() {
        let num_nodes = 4u64;
        let (lists, headers) =
            InMemLists::new_adj(std::path::PathBuf::from("/tmp/unused.lst"), num_nodes);
        let list_sizes = sizes(&[1, 2, 0, 1]);
        calculate_list_headers_task(num_nodes, &list_sizes, &headers);
        calculate_lists_metadata_task(num_nodes, &list_sizes, &lists);

        lists.set_element(1, 0, &77u64.to_le_bytes());
        lists.set_element(1, 1, &88u64.to_le_bytes());
        assert_eq!(lists.read_element(1, 0), 77u64.to_le_bytes().to_vec());
        assert_eq!(lists.read_element(1, 1), 88u64.to_le_bytes().to_vec());
        // node 1's list starts right after node 0's single element
        let (page, elem) = lists.element_location(1, 0);
        assert_eq!((page, elem), (0, 1));
    }
}
