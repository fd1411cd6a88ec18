use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::DbResult;
use crate::storage::file_utils::{self, BinReader, BinWriter, Decodeable, Encodeable};
use crate::storage::storage_utils::{self, DbFileType};
use crate::types::{HandyRwLock, NodeOffset, RelId, TableId};

/// Per node table: dense offset high-water mark plus the deleted set.
/// `num_tuples == next_offset - |deleted|` holds at all times.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeTableStats {
    pub next_offset: NodeOffset,
    pub deleted: BTreeSet<NodeOffset>,
}

impl NodeTableStats {
    pub fn num_tuples(&self) -> u64 {
        self.next_offset - self.deleted.len() as u64
    }

    /// Highest offset ever assigned, or None for an empty table.
    pub fn max_node_offset(&self) -> Option<NodeOffset> {
        self.next_offset.checked_sub(1)
    }

    pub fn is_deleted(&self, offset: NodeOffset) -> bool {
        self.deleted.contains(&offset)
    }

    /// Deleted offsets are recycled before the table grows.
    pub fn add_node(&mut self) -> NodeOffset {
        if let Some(&offset) = self.deleted.iter().next() {
            self.deleted.remove(&offset);
            return offset;
        }
        let offset = self.next_offset;
        self.next_offset += 1;
        offset
    }

    pub fn delete_node(&mut self, offset: NodeOffset) {
        self.deleted.insert(offset);
    }
}

impl Encodeable for NodeTableStats {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.next_offset.encode(buf);
        let deleted: Vec<u64> = self.deleted.iter().copied().collect();
        deleted.encode(buf);
    }
}

impl Decodeable for NodeTableStats {
    fn decode(reader: &mut BinReader) -> DbResult<Self> {
        let next_offset: u64 = reader.read()?;
        let deleted: Vec<u64> = reader.read()?;
        Ok(NodeTableStats {
            next_offset,
            deleted: deleted.into_iter().collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelTableStats {
    pub num_rels: u64,
    pub next_rel_id: RelId,
}

impl Encodeable for RelTableStats {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.num_rels.encode(buf);
        self.next_rel_id.encode(buf);
    }
}

impl Decodeable for RelTableStats {
    fn decode(reader: &mut BinReader) -> DbResult<Self> {
        Ok(RelTableStats {
            num_rels: reader.read()?,
            next_rel_id: reader.read()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatsContent<T: Clone> {
    pub per_table: HashMap<TableId, T>,
}

fn save_stats<T: Clone + Encodeable>(content: &StatsContent<T>, path: &Path) -> DbResult<()> {
    let mut w = BinWriter::new();
    let mut ids: Vec<TableId> = content.per_table.keys().copied().collect();
    ids.sort_unstable();
    w.write(&(ids.len() as u32));
    for id in ids {
        w.write(&id);
        w.write(&content.per_table[&id]);
    }
    file_utils::overwrite_file(path, &w.into_bytes())
}

fn load_stats<T: Clone + Decodeable>(path: &Path) -> DbResult<StatsContent<T>> {
    let bytes = file_utils::read_file_to_bytes(path)?;
    let mut r = BinReader::new(&bytes);
    let count: u32 = r.read()?;
    let mut per_table = HashMap::new();
    for _ in 0..count {
        let id: TableId = r.read()?;
        per_table.insert(id, r.read()?);
    }
    Ok(StatsContent { per_table })
}

/// Copy-on-write statistics store with the same two-file discipline as
/// the catalog. `IS_NODE` selects the file pair.
pub struct TablesStatistics<T: Clone> {
    is_node: bool,
    read_version: RwLock<Arc<StatsContent<T>>>,
    write_version: Mutex<Option<StatsContent<T>>>,
}

pub type NodesStatistics = TablesStatistics<NodeTableStats>;
pub type RelsStatistics = TablesStatistics<RelTableStats>;

impl<T: Clone + Encodeable + Decodeable + Default> TablesStatistics<T> {
    fn path(is_node: bool, db_dir: &Path, file_type: DbFileType) -> std::path::PathBuf {
        if is_node {
            storage_utils::nodes_statistics_path(db_dir, file_type)
        } else {
            storage_utils::rels_statistics_path(db_dir, file_type)
        }
    }

    pub fn open(is_node: bool, db_dir: &Path) -> DbResult<Self> {
        let path = Self::path(is_node, db_dir, DbFileType::Original);
        let content = if path.exists() {
            load_stats(&path)?
        } else {
            StatsContent {
                per_table: HashMap::new(),
            }
        };
        Ok(Self {
            is_node,
            read_version: RwLock::new(Arc::new(content)),
            write_version: Mutex::new(None),
        })
    }

    pub fn save_initial(is_node: bool, db_dir: &Path) -> DbResult<()> {
        save_stats(
            &StatsContent::<T> {
                per_table: HashMap::new(),
            },
            &Self::path(is_node, db_dir, DbFileType::Original),
        )
    }

    pub fn snapshot(&self) -> Arc<StatsContent<T>> {
        self.read_version.rl().clone()
    }

    pub fn has_updates(&self) -> bool {
        self.write_version.lock().unwrap().is_some()
    }

    pub fn with_write_version<R>(
        &self,
        f: impl FnOnce(&mut StatsContent<T>) -> DbResult<R>,
    ) -> DbResult<R> {
        let mut guard = self.write_version.lock().unwrap();
        if guard.is_none() {
            *guard = Some((**self.read_version.rl()).clone());
        }
        f(guard.as_mut().unwrap())
    }

    /// Table stats as the write transaction sees them.
    pub fn table_stats_for_write_tx(&self, table_id: TableId) -> T {
        let guard = self.write_version.lock().unwrap();
        match &*guard {
            Some(content) => content.per_table.get(&table_id).cloned().unwrap_or_default(),
            None => self
                .read_version
                .rl()
                .per_table
                .get(&table_id)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn write_stats_file_for_wal_record(&self, db_dir: &Path) -> DbResult<()> {
        let guard = self.write_version.lock().unwrap();
        if let Some(content) = &*guard {
            save_stats(content, &Self::path(self.is_node, db_dir, DbFileType::WalVersion))?;
        }
        Ok(())
    }

    pub fn checkpoint_in_memory(&self) {
        let mut guard = self.write_version.lock().unwrap();
        if let Some(content) = guard.take() {
            *self.read_version.wl() = Arc::new(content);
        }
    }

    pub fn rollback_in_memory(&self) {
        *self.write_version.lock().unwrap() = None;
    }

    pub fn reload(&self, db_dir: &Path) -> DbResult<()> {
        let path = Self::path(self.is_node, db_dir, DbFileType::Original);
        let content = if path.exists() {
            load_stats(&path)?
        } else {
            StatsContent {
                per_table: HashMap::new(),
            }
        };
        *self.read_version.wl() = Arc::new(content);
        *self.write_version.lock().unwrap() = None;
        Ok(())
    }
}

impl NodesStatistics {
    /// Max node offset per table, as the bulk loader needs it to size
    /// adjacency structures.
    pub fn max_node_offset_for_write_tx(&self, table_id: TableId) -> Option<NodeOffset> {
        self.table_stats_for_write_tx(table_id).max_node_offset()
    }
}

impl RelsStatistics {
    /// Claim a contiguous block of rel ids (bulk copy).
    pub fn reserve_rel_ids(&self, table_id: TableId, count: u64) -> DbResult<RelId> {
        self.with_write_version(|content| {
            let stats = content.per_table.entry(table_id).or_default();
            let start = stats.next_rel_id;
            stats.next_rel_id += count;
            Ok(start)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_stats_invariant() {
        let mut stats = NodeTableStats::default();
        for _ in 0..5 {
            stats.add_node();
        }
        stats.delete_node(2);
        stats.delete_node(4);
        assert_eq!(stats.num_tuples(), 3);
        assert_eq!(stats.max_node_offset(), Some(4));
        // deleted offsets are recycled first, smallest first
        assert_eq!(stats.add_node(), 2);
        assert_eq!(stats.add_node(), 4);
        assert_eq!(stats.add_node(), 5);
        assert_eq!(stats.num_tuples(), 6);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        NodesStatistics::save_initial(true, dir.path()).unwrap();
        let stats = NodesStatistics::open(true, dir.path()).unwrap();
        stats
            .with_write_version(|c| {
                let t = c.per_table.entry(3).or_default();
                t.add_node();
                t.add_node();
                t.delete_node(0);
                Ok(())
            })
            .unwrap();
        stats.write_stats_file_for_wal_record(dir.path()).unwrap();
        // promote shadow to primary by renaming, as the replayer does
        std::fs::rename(
            storage_utils::nodes_statistics_path(dir.path(), DbFileType::WalVersion),
            storage_utils::nodes_statistics_path(dir.path(), DbFileType::Original),
        )
        .unwrap();
        let reopened = NodesStatistics::open(true, dir.path()).unwrap();
        let snap = reopened.snapshot();
        assert_eq!(snap.per_table[&3].num_tuples(), 1);
        assert!(snap.per_table[&3].is_deleted(0));
    }
}
