use std::cell::UnsafeCell;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::error::DbResult;
use crate::storage::file_utils;
use crate::storage::page::PAGE_SIZE;
use crate::types::{HandyRwLock, PageIdx};

/// One page of an in-memory file. Loader tasks write disjoint byte
/// ranges concurrently, which is expressed through an `UnsafeCell`
/// the same way the builders' slots are partitioned: callers must
/// never hand two tasks overlapping ranges.
pub struct InMemPage {
    data: UnsafeCell<Box<[u8; PAGE_SIZE]>>,
}

unsafe impl Sync for InMemPage {}
unsafe impl Send for InMemPage {}

impl InMemPage {
    fn new() -> Self {
        Self {
            data: UnsafeCell::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= PAGE_SIZE);
        unsafe {
            let dst = (*self.data.get()).as_mut_ptr().add(offset);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= PAGE_SIZE);
        unsafe { (&*self.data.get())[offset..offset + len].to_vec() }
    }

    pub fn or_byte(&self, offset: usize, mask: u8) {
        assert!(offset < PAGE_SIZE);
        unsafe {
            (*self.data.get())[offset] |= mask;
        }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { &(&*self.data.get())[..] }
    }
}

/// Growable sequence of pages built by one bulk copy and flushed to a
/// single on-disk file at the end.
pub struct InMemFile {
    pages: RwLock<Vec<Arc<InMemPage>>>,
}

impl InMemFile {
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(Vec::new()),
        }
    }

    pub fn num_pages(&self) -> usize {
        self.pages.rl().len()
    }

    pub fn add_new_pages(&self, count: usize) -> PageIdx {
        let mut pages = self.pages.wl();
        let start = pages.len();
        for _ in 0..count {
            pages.push(Arc::new(InMemPage::new()));
        }
        start as PageIdx
    }

    pub fn add_new_page(&self) -> PageIdx {
        self.add_new_pages(1)
    }

    pub fn page(&self, page_idx: PageIdx) -> Arc<InMemPage> {
        self.pages.rl()[page_idx as usize].clone()
    }

    pub fn write(&self, page_idx: PageIdx, offset: usize, bytes: &[u8]) {
        self.page(page_idx).write(offset, bytes);
    }

    pub fn read(&self, page_idx: PageIdx, offset: usize, len: usize) -> Vec<u8> {
        self.page(page_idx).read(offset, len)
    }

    /// Write all pages sequentially to `path` and fsync.
    pub fn flush<P: AsRef<Path>>(&self, path: P) -> DbResult<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = file_utils::open_file(&path)?;
        file.set_len(0)?;
        let pages = self.pages.rl();
        for page in pages.iter() {
            file.write_all(page.as_slice())?;
        }
        file.sync_all()?;
        Ok(())
    }
}

impl Default for InMemFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_pages() {
        let f = InMemFile::new();
        let start = f.add_new_pages(3);
        assert_eq!(start, 0);
        f.write(2, 100, &[1, 2, 3]);
        assert_eq!(f.read(2, 100, 3), vec![1, 2, 3]);
        assert_eq!(f.num_pages(), 3);
    }

    #[test]
    fn flush_writes_all_pages() {
        let dir = tempfile::tempdir().unwrap();
        let f = InMemFile::new();
        f.add_new_pages(2);
        f.write(1, 0, &[0xEE]);
        let path = dir.path().join("x.bin");
        f.flush(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 2 * PAGE_SIZE);
        assert_eq!(bytes[PAGE_SIZE], 0xEE);
    }
}
