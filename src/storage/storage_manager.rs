use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::catalog::statistics::{NodesStatistics, RelsStatistics};
use crate::catalog::CatalogContent;
use crate::error::{DbError, DbResult};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::node_table::NodeTable;
use crate::storage::rel_table::RelTable;
use crate::storage::storage_utils;
use crate::storage::wal::Wal;
use crate::types::{HandyRwLock, TableId};

/// Owns the per-table storage objects and the statistics stores, and
/// turns dirty buffer-pool frames into WAL `PAGE_UPDATE` records at
/// commit.
pub struct StorageManager {
    db_dir: PathBuf,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    node_tables: RwLock<HashMap<TableId, Arc<NodeTable>>>,
    rel_tables: RwLock<HashMap<TableId, Arc<RelTable>>>,
    pub nodes_statistics: NodesStatistics,
    pub rels_statistics: RelsStatistics,
}

impl StorageManager {
    pub fn new(db_dir: &Path, pool: Arc<BufferPool>, wal: Arc<Wal>) -> DbResult<Self> {
        Ok(Self {
            db_dir: db_dir.to_path_buf(),
            pool,
            wal,
            node_tables: RwLock::new(HashMap::new()),
            rel_tables: RwLock::new(HashMap::new()),
            nodes_statistics: NodesStatistics::open(true, db_dir)?,
            rels_statistics: RelsStatistics::open(false, db_dir)?,
        })
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn node_table(
        &self,
        catalog: &CatalogContent,
        table_id: TableId,
    ) -> DbResult<Arc<NodeTable>> {
        if let Some(table) = self.node_tables.rl().get(&table_id) {
            return Ok(table.clone());
        }
        let schema = catalog.node_table_schema(table_id)?;
        let table = Arc::new(NodeTable::open(self.pool.clone(), &self.db_dir, schema)?);
        self.node_tables.wl().insert(table_id, table.clone());
        Ok(table)
    }

    pub fn rel_table(
        &self,
        catalog: &CatalogContent,
        table_id: TableId,
    ) -> DbResult<Arc<RelTable>> {
        if let Some(table) = self.rel_tables.rl().get(&table_id) {
            return Ok(table.clone());
        }
        let schema = catalog.rel_table_schema(table_id)?;
        let table = Arc::new(RelTable::open(self.pool.clone(), &self.db_dir, schema)?);
        self.rel_tables.wl().insert(table_id, table.clone());
        Ok(table)
    }

    /// A bulk copy replaced a table's files wholesale: forget cached
    /// objects and any cached pages.
    pub fn invalidate_table(&self, table_id: TableId) {
        self.node_tables.wl().remove(&table_id);
        self.rel_tables.wl().remove(&table_id);
        self.pool
            .close_files_under(&storage_utils::table_dir(&self.db_dir, table_id));
    }

    /// Recovery / checkpoint of DDL: drop every cached table object.
    pub fn invalidate_all_tables(&self) {
        self.node_tables.wl().clear();
        self.rel_tables.wl().clear();
        self.pool.discard_all_pages();
    }

    fn relative_path(&self, path: &Path) -> DbResult<String> {
        let rel = path.strip_prefix(&self.db_dir).map_err(|_| {
            DbError::corruption(format!(
                "page file {:?} is outside the database directory",
                path
            ))
        })?;
        Ok(rel.to_string_lossy().into_owned())
    }

    /// Commit prep: log a `PAGE_UPDATE` for every dirty page. On
    /// rollback nothing is logged; the caller discards the frames.
    pub fn prepare_commit_or_rollback(&self, is_commit: bool) -> DbResult<()> {
        if !is_commit {
            return Ok(());
        }
        let dirty = self.pool.collect_dirty_pages();
        debug!("logging {} dirty pages", dirty.len());
        for (fh, page_idx, image) in dirty {
            let rel = self.relative_path(&fh.path)?;
            self.wal.log_page_update(&rel, page_idx, &image)?;
        }
        Ok(())
    }
}
