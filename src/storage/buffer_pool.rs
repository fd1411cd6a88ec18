use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::trace;

use crate::error::{DbError, DbResult};
use crate::storage::file_utils;
use crate::storage::page::PageSizeClass;
use crate::types::{HandyRwLock, PageIdx};

pub type FileId = u32;

/// An open page file known to the buffer pool. Structures hold on to
/// the handle for the lifetime of the table.
pub struct FileHandle {
    pub file_id: FileId,
    pub path: PathBuf,
    pub size_class: PageSizeClass,
    file: Mutex<File>,
    num_pages: AtomicU64,
}

impl FileHandle {
    pub fn num_pages(&self) -> u64 {
        self.num_pages.load(Ordering::SeqCst)
    }

    pub fn read_page(&self, page_idx: PageIdx, buf: &mut [u8]) -> DbResult<()> {
        let page_size = self.size_class.size();
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_idx as u64 * page_size as u64))?;
        // Pages past the materialized tail read as zeroes.
        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..])? {
                0 => break,
                n => read += n,
            }
        }
        buf[read..].iter_mut().for_each(|b| *b = 0);
        Ok(())
    }

    pub fn write_page(&self, page_idx: PageIdx, buf: &[u8]) -> DbResult<()> {
        let page_size = self.size_class.size();
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_idx as u64 * page_size as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    pub fn sync(&self) -> DbResult<()> {
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Read,
    Write,
}

struct FrameState {
    page: Option<(FileId, PageIdx)>,
    pin_count: u32,
    dirty: bool,
    ref_bit: bool,
}

struct Frame {
    data: RwLock<Vec<u8>>,
    state: Mutex<FrameState>,
}

/// Pinned reference to a frame. Dropping it without `unpin` leaks the
/// pin; callers go through [`BufferPool::with_page`]/[`update_page`]
/// unless they need to hold the pin across calls.
pub struct FrameRef {
    frame_idx: usize,
    file_id: FileId,
    page_idx: PageIdx,
}

/// Clock-replacement buffer pool over fixed-size frames. Dirty
/// frames are only written back through the WAL replayer; the
/// pool itself never flushes a dirty page to its backing file.
pub struct BufferPool {
    frames: Vec<Frame>,
    page_table: RwLock<HashMap<(FileId, PageIdx), usize>>,
    clock_hand: AtomicU64,
    files: RwLock<HashMap<FileId, Arc<FileHandle>>>,
    next_file_id: AtomicU32,
}

impl BufferPool {
    pub fn new(pool_size_bytes: u64) -> Self {
        let frame_size = PageSizeClass::Regular.size();
        let num_frames = std::cmp::max(16, (pool_size_bytes as usize) / frame_size);
        let mut frames = Vec::with_capacity(num_frames);
        for _ in 0..num_frames {
            frames.push(Frame {
                data: RwLock::new(vec![0u8; frame_size]),
                state: Mutex::new(FrameState {
                    page: None,
                    pin_count: 0,
                    dirty: false,
                    ref_bit: false,
                }),
            });
        }
        Self {
            frames,
            page_table: RwLock::new(HashMap::new()),
            clock_hand: AtomicU64::new(0),
            files: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(0),
        }
    }

    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> DbResult<Arc<FileHandle>> {
        let path = path.as_ref().to_path_buf();
        if let Some(existing) = self
            .files
            .rl()
            .values()
            .find(|fh| fh.path == path)
        {
            return Ok(existing.clone());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = file_utils::open_file(&path)?;
        let len = file.metadata()?.len();
        let size_class = PageSizeClass::Regular;
        let num_pages = (len + size_class.size() as u64 - 1) / size_class.size() as u64;
        let handle = Arc::new(FileHandle {
            file_id: self.next_file_id.fetch_add(1, Ordering::SeqCst),
            path,
            size_class,
            file: Mutex::new(file),
            num_pages: AtomicU64::new(num_pages),
        });
        self.files.wl().insert(handle.file_id, handle.clone());
        Ok(handle)
    }

    /// Claim the next page index of a file. The page materializes in the
    /// backing file when its image is checkpointed.
    pub fn add_new_page(&self, fh: &FileHandle) -> PageIdx {
        fh.num_pages.fetch_add(1, Ordering::SeqCst) as PageIdx
    }

    pub fn pin(&self, fh: &FileHandle, page_idx: PageIdx, mode: PinMode) -> DbResult<FrameRef> {
        let key = (fh.file_id, page_idx);
        // fast path: page already resident
        {
            let table = self.page_table.rl();
            if let Some(&frame_idx) = table.get(&key) {
                let mut state = self.frames[frame_idx].state.lock().unwrap();
                if state.page == Some(key) {
                    state.pin_count = state
                        .pin_count
                        .checked_add(1)
                        .ok_or(DbError::BufferPoolExhausted)?;
                    state.ref_bit = true;
                    if mode == PinMode::Write {
                        state.dirty = true;
                    }
                    return Ok(FrameRef {
                        frame_idx,
                        file_id: fh.file_id,
                        page_idx,
                    });
                }
            }
        }
        // slow path: bring the page in
        let frame_idx = self.find_victim()?;
        {
            let mut data = self.frames[frame_idx].data.wl();
            fh.read_page(page_idx, &mut data)?;
        }
        {
            let mut table = self.page_table.wl();
            let mut state = self.frames[frame_idx].state.lock().unwrap();
            state.page = Some(key);
            state.pin_count = 1;
            state.dirty = mode == PinMode::Write;
            state.ref_bit = true;
            table.insert(key, frame_idx);
        }
        trace!("paged in {:?} page {} -> frame {}", fh.path, page_idx, frame_idx);
        Ok(FrameRef {
            frame_idx,
            file_id: fh.file_id,
            page_idx,
        })
    }

    pub fn unpin(&self, frame: FrameRef, dirty: bool) {
        let mut state = self.frames[frame.frame_idx].state.lock().unwrap();
        debug_assert!(state.pin_count > 0);
        state.pin_count -= 1;
        if dirty {
            state.dirty = true;
        }
    }

    pub fn frame_data<R>(&self, frame: &FrameRef, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.frames[frame.frame_idx].data.rl())
    }

    pub fn frame_data_mut<R>(&self, frame: &FrameRef, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.frames[frame.frame_idx].data.wl())
    }

    /// Read access to a page under a short-lived pin.
    pub fn with_page<R>(
        &self,
        fh: &FileHandle,
        page_idx: PageIdx,
        f: impl FnOnce(&[u8]) -> R,
    ) -> DbResult<R> {
        let frame = self.pin(fh, page_idx, PinMode::Read)?;
        let result = self.frame_data(&frame, f);
        self.unpin(frame, false);
        Ok(result)
    }

    /// Write access to a page under a short-lived pin; marks it dirty.
    pub fn update_page<R>(
        &self,
        fh: &FileHandle,
        page_idx: PageIdx,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> DbResult<R> {
        let frame = self.pin(fh, page_idx, PinMode::Write)?;
        let result = self.frame_data_mut(&frame, f);
        self.unpin(frame, true);
        Ok(result)
    }

    /// Clock sweep over unpinned frames. Evicted dirty pages are
    /// discarded, not written back: durability always goes through the
    /// WAL, which captured their images at commit time.
    fn find_victim(&self) -> DbResult<usize> {
        let num_frames = self.frames.len();
        for _ in 0..num_frames * 2 {
            let idx = (self.clock_hand.fetch_add(1, Ordering::SeqCst) as usize) % num_frames;
            let mut state = self.frames[idx].state.lock().unwrap();
            if state.pin_count > 0 {
                continue;
            }
            if state.ref_bit {
                state.ref_bit = false;
                continue;
            }
            if let Some(old_key) = state.page.take() {
                self.page_table.wl().remove(&old_key);
            }
            state.dirty = false;
            return Ok(idx);
        }
        Err(DbError::BufferPoolExhausted)
    }

    /// Snapshot of every dirty page: `(file handle, page idx, image)`.
    /// Used by commit to build `PAGE_UPDATE` records.
    pub fn collect_dirty_pages(&self) -> Vec<(Arc<FileHandle>, PageIdx, Vec<u8>)> {
        let files = self.files.rl();
        let mut result = Vec::new();
        for frame in &self.frames {
            let state = frame.state.lock().unwrap();
            if !state.dirty {
                continue;
            }
            if let Some((file_id, page_idx)) = state.page {
                if let Some(fh) = files.get(&file_id) {
                    result.push((fh.clone(), page_idx, frame.data.rl().clone()));
                }
            }
        }
        result
    }

    /// Mark every dirty frame clean (checkpoint wrote their images).
    pub fn mark_all_clean(&self) {
        for frame in &self.frames {
            frame.state.lock().unwrap().dirty = false;
        }
    }

    /// Drop every cached page. Rollback path: dirty frames hold
    /// uncommitted data, clean frames may be stale after replay.
    pub fn discard_all_pages(&self) {
        let mut table = self.page_table.wl();
        for frame in &self.frames {
            let mut state = frame.state.lock().unwrap();
            if let Some(key) = state.page.take() {
                table.remove(&key);
            }
            state.dirty = false;
            state.ref_bit = false;
        }
    }

    /// Re-derive a file's page count from the bytes on disk. Called
    /// after rollback discarded speculative `add_new_page` claims.
    pub fn refresh_file_sizes(&self) -> DbResult<()> {
        for fh in self.files.rl().values() {
            let len = fh.file.lock().unwrap().metadata()?.len();
            let page_size = fh.size_class.size() as u64;
            fh.num_pages
                .store((len + page_size - 1) / page_size, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn file_by_path(&self, path: &Path) -> Option<Arc<FileHandle>> {
        self.files.rl().values().find(|fh| fh.path == path).cloned()
    }

    /// Forget handles whose backing files were replaced wholesale (bulk
    /// copy checkpoint); the next open re-reads them.
    pub fn close_files_under(&self, dir: &Path) {
        let mut files = self.files.wl();
        let stale: Vec<FileId> = files
            .values()
            .filter(|fh| fh.path.starts_with(dir))
            .map(|fh| fh.file_id)
            .collect();
        for id in &stale {
            files.remove(id);
        }
        drop(files);
        if !stale.is_empty() {
            self.discard_all_pages();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_file() -> (tempfile::TempDir, BufferPool, Arc<FileHandle>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(64 * 4096);
        let fh = pool.open_file(dir.path().join("pages.bin")).unwrap();
        (dir, pool, fh)
    }

    #[test]
    fn update_then_read_back() {
        let (_dir, pool, fh) = pool_with_file();
        let idx = pool.add_new_page(&fh);
        pool.update_page(&fh, idx, |data| data[0] = 0xAB).unwrap();
        let byte = pool.with_page(&fh, idx, |data| data[0]).unwrap();
        assert_eq!(byte, 0xAB);
    }

    #[test]
    fn dirty_pages_are_collected() {
        let (_dir, pool, fh) = pool_with_file();
        let idx = pool.add_new_page(&fh);
        pool.update_page(&fh, idx, |data| data[7] = 9).unwrap();
        let dirty = pool.collect_dirty_pages();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].1, idx);
        assert_eq!(dirty[0].2[7], 9);
        pool.mark_all_clean();
        assert!(pool.collect_dirty_pages().is_empty());
    }

    #[test]
    fn eviction_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        // tiny pool: 16 frames
        let pool = BufferPool::new(16 * 4096);
        let fh = pool.open_file(dir.path().join("pages.bin")).unwrap();
        // write page 0 straight to disk so eviction can rebuild it
        fh.write_page(0, &vec![0x11u8; 4096]).unwrap();
        let byte = pool.with_page(&fh, 0, |d| d[100]).unwrap();
        assert_eq!(byte, 0x11);
        // touch enough pages to force page 0 out
        for i in 1..64u32 {
            pool.with_page(&fh, i, |_| ()).unwrap();
        }
        let byte = pool.with_page(&fh, 0, |d| d[100]).unwrap();
        assert_eq!(byte, 0x11);
    }

    #[test]
    fn pinned_frames_are_not_victims() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(16 * 4096);
        let fh = pool.open_file(dir.path().join("pages.bin")).unwrap();
        let mut pins = Vec::new();
        for i in 0..16u32 {
            pins.push(pool.pin(&fh, i, PinMode::Read).unwrap());
        }
        assert!(matches!(
            pool.pin(&fh, 100, PinMode::Read),
            Err(DbError::BufferPoolExhausted)
        ));
        for pin in pins {
            pool.unpin(pin, false);
        }
        assert!(pool.pin(&fh, 100, PinMode::Read).is_ok());
    }
}
