use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::error::{DbError, DbResult};
use crate::storage::buffer_pool::{BufferPool, FileHandle};
use crate::storage::in_mem_overflow::InMemOverflowFile;
use crate::storage::page::{PageByteCursor, PAGE_SIZE};
use crate::storage::slot_format::StrDescriptor;
use crate::storage::storage_utils;
use crate::transaction::Transaction;
use crate::types::{HandyRwLock, NodeOffset, PageIdx};

/// FNV-1a. The directory is addressed with the low bits, so the exact
/// function is part of the on-disk format.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey<'a> {
    Int(i64),
    Str(&'a str),
}

impl<'a> IndexKey<'a> {
    fn hash(&self) -> u64 {
        match self {
            IndexKey::Int(v) => hash_bytes(&v.to_le_bytes()),
            IndexKey::Str(s) => hash_bytes(s.as_bytes()),
        }
    }

    pub fn to_display(&self) -> String {
        match self {
            IndexKey::Int(v) => v.to_string(),
            IndexKey::Str(s) => s.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum OwnedKey {
    Int(i64),
    Str(String),
}

impl OwnedKey {
    fn matches(&self, key: &IndexKey) -> bool {
        match (self, key) {
            (OwnedKey::Int(a), IndexKey::Int(b)) => a == b,
            (OwnedKey::Str(a), IndexKey::Str(b)) => a == b,
            _ => false,
        }
    }
}

struct BuilderEntry {
    hash: u64,
    key: OwnedKey,
    offset: NodeOffset,
}

struct Bucket {
    local_depth: u32,
    entries: Vec<BuilderEntry>,
}

const ENTRY_SIZE: usize = 32;
const BUCKET_HEADER_SIZE: usize = 16;
pub const BUCKET_CAPACITY: usize = (PAGE_SIZE - BUCKET_HEADER_SIZE) / ENTRY_SIZE;

const KEY_TYPE_INT: u8 = 0;
const KEY_TYPE_STRING: u8 = 1;

/// In-memory extendible-hash builder used by the bulk loader.
/// `bulk_reserve` pre-sizes the directory; overflowing
/// buckets split, doubling the directory when the full local depth is
/// reached.
pub struct HashIndexBuilder {
    path: PathBuf,
    is_string_key: bool,
    directory: RwLock<Directory>,
    num_entries: AtomicU64,
}

struct Directory {
    global_depth: u32,
    /// directory slot -> bucket index
    slots: Vec<usize>,
    buckets: Vec<Mutex<Bucket>>,
}

impl HashIndexBuilder {
    pub fn new(path: PathBuf, is_string_key: bool) -> Self {
        Self {
            path,
            is_string_key,
            directory: RwLock::new(Directory {
                global_depth: 1,
                slots: vec![0, 1],
                buckets: vec![
                    Mutex::new(Bucket {
                        local_depth: 1,
                        entries: Vec::new(),
                    }),
                    Mutex::new(Bucket {
                        local_depth: 1,
                        entries: Vec::new(),
                    }),
                ],
            }),
            num_entries: AtomicU64::new(0),
        }
    }

    /// Pre-size the directory so `n` appends land at roughly half-full
    /// buckets without splitting.
    pub fn bulk_reserve(&self, n: u64) {
        let target_buckets = std::cmp::max(2, (n * 2 / BUCKET_CAPACITY as u64) + 1);
        let mut depth = 1u32;
        while (1u64 << depth) < target_buckets {
            depth += 1;
        }
        let count = 1usize << depth;
        let mut dir = self.directory.wl();
        if dir.buckets.iter().any(|b| !b.lock().unwrap().entries.is_empty()) {
            // reserve only applies to an empty index
            return;
        }
        dir.global_depth = depth;
        dir.slots = (0..count).collect();
        dir.buckets = (0..count)
            .map(|_| {
                Mutex::new(Bucket {
                    local_depth: depth,
                    entries: Vec::new(),
                })
            })
            .collect();
        debug!("hash index reserved {} buckets for {} keys", count, n);
    }

    /// Returns false when the key already exists (duplicate primary
    /// key; the loader escalates).
    pub fn append(&self, key: IndexKey, offset: NodeOffset) -> bool {
        let hash = key.hash();
        loop {
            {
                let dir = self.directory.rl();
                let slot = (hash & ((1u64 << dir.global_depth) - 1)) as usize;
                let bucket_idx = dir.slots[slot];
                let mut bucket = dir.buckets[bucket_idx].lock().unwrap();
                if bucket
                    .entries
                    .iter()
                    .any(|e| e.hash == hash && e.key.matches(&key))
                {
                    return false;
                }
                if bucket.entries.len() < BUCKET_CAPACITY {
                    let owned = match key {
                        IndexKey::Int(v) => OwnedKey::Int(v),
                        IndexKey::Str(s) => OwnedKey::Str(s.to_string()),
                    };
                    bucket.entries.push(BuilderEntry {
                        hash,
                        key: owned,
                        offset,
                    });
                    self.num_entries.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }
            // bucket full: split (doubling the directory if needed),
            // then retry the append
            self.split_bucket(hash);
        }
    }

    fn split_bucket(&self, hash: u64) {
        let mut dir = self.directory.wl();
        let slot = (hash & ((1u64 << dir.global_depth) - 1)) as usize;
        let bucket_idx = dir.slots[slot];
        let local_depth = dir.buckets[bucket_idx].lock().unwrap().local_depth;
        if dir.buckets[bucket_idx].lock().unwrap().entries.len() < BUCKET_CAPACITY {
            // another thread split it first
            return;
        }
        if local_depth == dir.global_depth {
            // double the directory
            let old_len = dir.slots.len();
            let mut new_slots = dir.slots.clone();
            new_slots.extend_from_slice(&dir.slots);
            debug_assert_eq!(new_slots.len(), old_len * 2);
            dir.slots = new_slots;
            dir.global_depth += 1;
        }
        let new_local = local_depth + 1;
        let split_bit = 1u64 << local_depth;
        let old_entries = {
            let mut bucket = dir.buckets[bucket_idx].lock().unwrap();
            bucket.local_depth = new_local;
            std::mem::take(&mut bucket.entries)
        };
        let new_bucket_idx = dir.buckets.len();
        let mut kept = Vec::new();
        let mut moved = Vec::new();
        for entry in old_entries {
            if entry.hash & split_bit == 0 {
                kept.push(entry);
            } else {
                moved.push(entry);
            }
        }
        dir.buckets[bucket_idx].lock().unwrap().entries = kept;
        dir.buckets.push(Mutex::new(Bucket {
            local_depth: new_local,
            entries: moved,
        }));
        // repoint every directory slot that now addresses the new bucket
        for s in 0..dir.slots.len() {
            if dir.slots[s] == bucket_idx && (s as u64) & split_bit != 0 {
                dir.slots[s] = new_bucket_idx;
            }
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    /// Persist directory and buckets.
    /// Layout: header page, directory pages, one bucket per page.
    /// String keys longer than the inline prefix spill into a sibling
    /// overflow file.
    pub fn flush(&self) -> DbResult<()> {
        let dir = self.directory.rl();
        let ovf = InMemOverflowFile::new();
        let mut ovf_cursor = PageByteCursor::default();

        let dir_bytes = dir.slots.len() * 4;
        let num_dir_pages = (dir_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        let buckets_start_page = 1 + num_dir_pages as u32;

        let mut out: Vec<u8> = Vec::new();
        // header page
        let mut header = vec![0u8; PAGE_SIZE];
        header[0] = if self.is_string_key {
            KEY_TYPE_STRING
        } else {
            KEY_TYPE_INT
        };
        header[1..5].copy_from_slice(&dir.global_depth.to_le_bytes());
        header[5..13].copy_from_slice(&(dir.buckets.len() as u64).to_le_bytes());
        header[13..21].copy_from_slice(&self.num_entries().to_le_bytes());
        header[21..25].copy_from_slice(&buckets_start_page.to_le_bytes());
        out.extend_from_slice(&header);
        // directory pages
        let mut dir_pages = vec![0u8; num_dir_pages * PAGE_SIZE];
        for (i, bucket_idx) in dir.slots.iter().enumerate() {
            let page_of_bucket = buckets_start_page + *bucket_idx as u32;
            dir_pages[i * 4..(i + 1) * 4].copy_from_slice(&page_of_bucket.to_le_bytes());
        }
        out.extend_from_slice(&dir_pages);
        // bucket pages
        for bucket in &dir.buckets {
            let bucket = bucket.lock().unwrap();
            let mut page = vec![0u8; PAGE_SIZE];
            page[0..2].copy_from_slice(&(bucket.entries.len() as u16).to_le_bytes());
            for (i, entry) in bucket.entries.iter().enumerate() {
                let at = BUCKET_HEADER_SIZE + i * ENTRY_SIZE;
                page[at..at + 8].copy_from_slice(&entry.hash.to_le_bytes());
                let key_slot = match &entry.key {
                    OwnedKey::Int(v) => {
                        let mut slot = [0u8; 16];
                        slot[..8].copy_from_slice(&v.to_le_bytes());
                        slot
                    }
                    OwnedKey::Str(s) => ovf.copy_string(s, &mut ovf_cursor)?.to_bytes(),
                };
                page[at + 8..at + 24].copy_from_slice(&key_slot);
                page[at + 24..at + 32].copy_from_slice(&entry.offset.to_le_bytes());
            }
            out.extend_from_slice(&page);
        }

        // `path` is the primary name; the builder writes the shadows
        crate::storage::file_utils::overwrite_file(&storage_utils::wal_version(&self.path), &out)?;
        if self.is_string_key {
            ovf.flush(storage_utils::wal_version(&storage_utils::overflow_path(&self.path)))?;
        }
        Ok(())
    }
}

/// Read-side of the primary-key index. Lookups go through the buffer
/// pool; they never see the uncommitted contents of a builder.
pub struct HashIndex {
    fh: Arc<FileHandle>,
    ovf_fh: Option<Arc<FileHandle>>,
    buffer_pool: Arc<BufferPool>,
    global_depth: u32,
    buckets_start_page: PageIdx,
    is_string_key: bool,
}

impl HashIndex {
    pub fn open(buffer_pool: Arc<BufferPool>, path: &Path) -> DbResult<Self> {
        let fh = buffer_pool.open_file(path)?;
        let (key_type, global_depth, buckets_start_page) =
            buffer_pool.with_page(&fh, 0, |page| {
                (
                    page[0],
                    u32::from_le_bytes(page[1..5].try_into().unwrap()),
                    u32::from_le_bytes(page[21..25].try_into().unwrap()),
                )
            })?;
        if key_type > KEY_TYPE_STRING {
            return Err(DbError::corruption(format!(
                "hash index {:?} has invalid key type {}",
                path, key_type
            )));
        }
        let is_string_key = key_type == KEY_TYPE_STRING;
        let ovf_fh = if is_string_key {
            Some(buffer_pool.open_file(storage_utils::overflow_path(path))?)
        } else {
            None
        };
        Ok(Self {
            fh,
            ovf_fh,
            buffer_pool,
            global_depth,
            buckets_start_page,
            is_string_key,
        })
    }

    pub fn lookup(&self, _tx: &Transaction, key: &IndexKey) -> DbResult<Option<NodeOffset>> {
        if matches!(key, IndexKey::Str(_)) != self.is_string_key {
            return Ok(None);
        }
        let hash = key.hash();
        let slot = hash & ((1u64 << self.global_depth) - 1);
        let dir_page = 1 + (slot as usize * 4 / PAGE_SIZE) as PageIdx;
        let dir_off = (slot as usize * 4) % PAGE_SIZE;
        let bucket_page = self.buffer_pool.with_page(&self.fh, dir_page, |page| {
            u32::from_le_bytes(page[dir_off..dir_off + 4].try_into().unwrap())
        })?;
        if bucket_page < self.buckets_start_page {
            return Err(DbError::corruption(format!(
                "hash index {:?} directory slot {} points before bucket region",
                self.fh.path, slot
            )));
        }
        let candidates: Vec<(u64, [u8; 16], NodeOffset)> =
            self.buffer_pool.with_page(&self.fh, bucket_page, |page| {
                let count = u16::from_le_bytes(page[0..2].try_into().unwrap()) as usize;
                (0..count)
                    .map(|i| {
                        let at = BUCKET_HEADER_SIZE + i * ENTRY_SIZE;
                        let entry_hash =
                            u64::from_le_bytes(page[at..at + 8].try_into().unwrap());
                        let mut key_slot = [0u8; 16];
                        key_slot.copy_from_slice(&page[at + 8..at + 24]);
                        let offset =
                            u64::from_le_bytes(page[at + 24..at + 32].try_into().unwrap());
                        (entry_hash, key_slot, offset)
                    })
                    .collect()
            })?;
        for (entry_hash, key_slot, offset) in candidates {
            if entry_hash != hash {
                continue;
            }
            if self.key_matches(key, &key_slot)? {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    fn key_matches(&self, key: &IndexKey, key_slot: &[u8; 16]) -> DbResult<bool> {
        match key {
            IndexKey::Int(v) => {
                Ok(i64::from_le_bytes(key_slot[..8].try_into().unwrap()) == *v)
            }
            IndexKey::Str(s) => {
                let descr = StrDescriptor::from_bytes(key_slot);
                if descr.len as usize != s.len() {
                    return Ok(false);
                }
                if descr.is_inline() {
                    return Ok(descr.inline_str() == s.as_bytes());
                }
                if &descr.inline[..4] != &s.as_bytes()[..4] {
                    return Ok(false);
                }
                let ovf_fh = self.ovf_fh.as_ref().ok_or_else(|| {
                    DbError::corruption("string key without an index overflow file")
                })?;
                let stored = self.buffer_pool.with_page(ovf_fh, descr.page_idx, |page| {
                    page[descr.offset_in_page as usize
                        ..descr.offset_in_page as usize + descr.len as usize]
                        .to_vec()
                })?;
                Ok(stored == s.as_bytes())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_tx() -> Transaction {
        Transaction::new_read_only(0)
    }

    fn promote_shadows(dir: &std::path::Path) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let name = path.to_string_lossy().into_owned();
            if let Some(primary) = name.strip_suffix(".wal") {
                std::fs::rename(&path, primary).unwrap();
            }
        }
    }

    #[test]
    fn builder_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let builder = HashIndexBuilder::new(dir.path().join("pk.idx"), false);
        builder.bulk_reserve(10);
        assert!(builder.append(IndexKey::Int(1), 0));
        assert!(builder.append(IndexKey::Int(2), 1));
        assert!(!builder.append(IndexKey::Int(1), 2));
        assert_eq!(builder.num_entries(), 2);
    }

    #[test]
    fn flush_and_lookup_int_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pk.idx");
        let builder = HashIndexBuilder::new(path.clone(), false);
        let n = 5000u64;
        builder.bulk_reserve(n);
        for i in 0..n {
            assert!(builder.append(IndexKey::Int(i as i64 * 3), i));
        }
        builder.flush().unwrap();
        promote_shadows(dir.path());

        let pool = Arc::new(BufferPool::new(1 << 22));
        let index = HashIndex::open(pool, &path).unwrap();
        let tx = read_tx();
        for i in (0..n).step_by(97) {
            assert_eq!(
                index.lookup(&tx, &IndexKey::Int(i as i64 * 3)).unwrap(),
                Some(i)
            );
        }
        assert_eq!(index.lookup(&tx, &IndexKey::Int(-5)).unwrap(), None);
        assert_eq!(index.lookup(&tx, &IndexKey::Int(1)).unwrap(), None);
    }

    #[test]
    fn flush_and_lookup_string_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pk.idx");
        let builder = HashIndexBuilder::new(path.clone(), true);
        builder.bulk_reserve(100);
        assert!(builder.append(IndexKey::Str("alice"), 0));
        assert!(builder.append(IndexKey::Str("a string longer than twelve bytes"), 1));
        assert!(!builder.append(IndexKey::Str("alice"), 2));
        builder.flush().unwrap();
        promote_shadows(dir.path());

        let pool = Arc::new(BufferPool::new(1 << 22));
        let index = HashIndex::open(pool, &path).unwrap();
        let tx = read_tx();
        assert_eq!(index.lookup(&tx, &IndexKey::Str("alice")).unwrap(), Some(0));
        assert_eq!(
            index
                .lookup(&tx, &IndexKey::Str("a string longer than twelve bytes"))
                .unwrap(),
            Some(1)
        );
        assert_eq!(index.lookup(&tx, &IndexKey::Str("bob")).unwrap(), None);
    }

    #[test]
    fn splits_grow_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pk.idx");
        let builder = HashIndexBuilder::new(path.clone(), false);
        // deliberately no bulk_reserve: force splits
        let n = (BUCKET_CAPACITY * 8) as i64;
        for i in 0..n {
            assert!(builder.append(IndexKey::Int(i), i as u64));
        }
        builder.flush().unwrap();
        promote_shadows(dir.path());
        let pool = Arc::new(BufferPool::new(1 << 22));
        let index = HashIndex::open(pool, &path).unwrap();
        let tx = read_tx();
        for i in (0..n).step_by(31) {
            assert_eq!(index.lookup(&tx, &IndexKey::Int(i)).unwrap(), Some(i as u64));
        }
    }
}
