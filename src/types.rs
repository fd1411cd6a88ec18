use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type TableId = u32;
pub type PropertyId = u32;

/// Dense 0-based physical key of a node within its table.
pub type NodeOffset = u64;

pub type RelId = u64;
pub type PageIdx = u32;

/// Cursor into the CSR data region of an adjacency-list chunk.
pub type CsrOffset = u64;

pub const INVALID_PAGE_IDX: PageIdx = PageIdx::MAX;

/// Physical node identity: which table, which slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InternalId {
    pub table_id: TableId,
    pub offset: NodeOffset,
}

impl InternalId {
    pub fn new(table_id: TableId, offset: NodeOffset) -> Self {
        Self { table_id, offset }
    }
}

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub fn pod<T>(v: T) -> Pod<T> {
    Arc::new(RwLock::new(v))
}

/// A handy shortcut to replace the `RwLock` write()/read().unwrap()
/// pattern with wl and rl.
pub trait HandyRwLock<T> {
    fn wl(&self) -> RwLockWriteGuard<'_, T>;
    fn rl(&self) -> RwLockReadGuard<'_, T>;
}

impl<T> HandyRwLock<T> for RwLock<T> {
    fn wl(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap()
    }

    fn rl(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap()
    }
}
