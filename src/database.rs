use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::binder::{Binder, BoundStatement, BoundUpdating, TxAction};
use crate::catalog::statistics::{NodesStatistics, RelsStatistics};
use crate::catalog::Catalog;
use crate::common::value::Value;
use crate::copier::{node_copier, rel_copier};
use crate::error::{DbError, DbResult};
use crate::parser;
use crate::processor::exec::{self, ExecContext};
use crate::processor::QueryResult;
use crate::scheduler::TaskScheduler;
use crate::storage::buffer_pool::BufferPool;
use crate::storage::storage_manager::StorageManager;
use crate::storage::storage_utils::{self, DbFileType};
use crate::storage::wal::Wal;
use crate::storage::wal_replayer::{ReplayMode, WalReplayer};
use crate::transaction::{Transaction, TransactionManager};

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub buffer_pool_bytes: u64,
    pub max_num_threads: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            buffer_pool_bytes: 32 * 1024 * 1024,
            max_num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// An embedded database instance rooted at one directory. Opening
/// seeds the core files when absent and replays the WAL; dropping the
/// instance releases everything (durability never depends on a clean
/// close, only on the WAL).
pub struct Database {
    db_dir: PathBuf,
    buffer_pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    catalog: Catalog,
    storage: StorageManager,
    tx_manager: TransactionManager,
    scheduler: TaskScheduler,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P, config: DbConfig) -> DbResult<Database> {
        // tests and embedding applications may already have a logger
        let _ = env_logger::try_init();
        let db_dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&db_dir)?;
        Self::init_core_files_if_necessary(&db_dir)?;

        let buffer_pool = Arc::new(BufferPool::new(config.buffer_pool_bytes));
        let wal = Arc::new(Wal::new(&db_dir)?);
        Self::recover_if_necessary(&db_dir, &wal)?;

        let catalog = Catalog::open(&db_dir)?;
        let storage = StorageManager::new(&db_dir, buffer_pool.clone(), wal.clone())?;
        info!("database open at {:?}", db_dir);
        Ok(Database {
            db_dir,
            buffer_pool,
            wal,
            catalog,
            storage,
            tx_manager: TransactionManager::new(),
            scheduler: TaskScheduler::new(config.max_num_threads),
        })
    }

    fn init_core_files_if_necessary(db_dir: &Path) -> DbResult<()> {
        if !storage_utils::catalog_path(db_dir, DbFileType::Original).exists() {
            Catalog::save_initial_catalog(db_dir)?;
        }
        if !storage_utils::nodes_statistics_path(db_dir, DbFileType::Original).exists() {
            NodesStatistics::save_initial(true, db_dir)?;
        }
        if !storage_utils::rels_statistics_path(db_dir, DbFileType::Original).exists() {
            RelsStatistics::save_initial(false, db_dir)?;
        }
        Ok(())
    }

    /// Startup recovery: a committed WAL replays to
    /// checkpoint, an uncommitted one is discarded. A CRC failure
    /// aborts the open.
    fn recover_if_necessary(db_dir: &Path, wal: &Wal) -> DbResult<()> {
        if wal.is_empty()? {
            return Ok(());
        }
        if wal.is_last_record_commit()? {
            info!("non-empty WAL with a committed transaction; replaying to checkpoint");
        } else {
            info!("non-empty WAL without a terminating commit; discarding");
        }
        WalReplayer::new(db_dir, wal, ReplayMode::Recovery).replay()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.db_dir
    }

    pub fn begin_read(&self) -> DbResult<Transaction> {
        self.tx_manager.begin_read_only()
    }

    pub fn begin_write(&self) -> DbResult<Transaction> {
        self.tx_manager.begin_write()
    }

    pub fn execute(&self, tx: &Transaction, input: &str) -> DbResult<QueryResult> {
        debug!("execute: {}", input);
        let statement = parser::parse(input)?;
        let catalog_version = if self.tx_manager.is_active_write(tx) {
            self.catalog.version_for_write_tx()
        } else {
            self.catalog.snapshot()
        };
        let mut binder = Binder::new(catalog_version.clone());
        let bound = binder.bind(&statement)?;
        self.execute_bound(tx, &bound, catalog_version)
    }

    fn execute_bound(
        &self,
        tx: &Transaction,
        bound: &BoundStatement,
        catalog_version: Arc<crate::catalog::CatalogContent>,
    ) -> DbResult<QueryResult> {
        match bound {
            BoundStatement::Query(query) => {
                let has_updates = query.parts.iter().any(|p| !p.updatings.is_empty());
                if has_updates {
                    self.require_write(tx)?;
                }
                let ctx = ExecContext {
                    storage: &self.storage,
                    catalog: catalog_version,
                    tx: *tx,
                };
                let chunk = exec::execute_query(&ctx, query)?;
                Ok(QueryResult {
                    column_names: chunk.columns,
                    rows: chunk.rows,
                })
            }
            BoundStatement::CreateNodeTable {
                name,
                properties,
                primary_key_idx,
            } => {
                self.require_write(tx)?;
                let props: Vec<crate::catalog::schema::Property> = properties
                    .iter()
                    .map(|(n, t)| crate::catalog::schema::Property {
                        id: 0,
                        name: n.clone(),
                        logical_type: t.clone(),
                    })
                    .collect();
                let table_id = self
                    .catalog
                    .with_write_version(|c| c.add_node_table_schema(name, props, *primary_key_idx))?;
                self.storage.nodes_statistics.with_write_version(|c| {
                    c.per_table.entry(table_id).or_default();
                    Ok(())
                })?;
                Ok(QueryResult::with_message(format!(
                    "table {} has been created",
                    name
                )))
            }
            BoundStatement::CreateRelTable {
                name,
                src_table_id,
                dst_table_id,
                properties,
                multiplicity,
            } => {
                self.require_write(tx)?;
                let props: Vec<crate::catalog::schema::Property> = properties
                    .iter()
                    .map(|(n, t)| crate::catalog::schema::Property {
                        id: 0,
                        name: n.clone(),
                        logical_type: t.clone(),
                    })
                    .collect();
                let table_id = self.catalog.with_write_version(|c| {
                    c.add_rel_table_schema(name, props, *src_table_id, *dst_table_id, *multiplicity)
                })?;
                self.storage.rels_statistics.with_write_version(|c| {
                    c.per_table.entry(table_id).or_default();
                    Ok(())
                })?;
                Ok(QueryResult::with_message(format!(
                    "table {} has been created",
                    name
                )))
            }
            BoundStatement::DropTable { table_id } => {
                self.require_write(tx)?;
                let name = catalog_version.table_schema(*table_id)?.name().to_string();
                self.catalog
                    .with_write_version(|c| c.drop_table_schema(*table_id))?;
                self.storage.nodes_statistics.with_write_version(|c| {
                    c.per_table.remove(table_id);
                    Ok(())
                })?;
                self.storage.rels_statistics.with_write_version(|c| {
                    c.per_table.remove(table_id);
                    Ok(())
                })?;
                Ok(QueryResult::with_message(format!(
                    "table {} has been dropped",
                    name
                )))
            }
            BoundStatement::AlterTable { table_id, action } => {
                self.require_write(tx)?;
                self.catalog.with_write_version(|c| match action {
                    crate::binder::BoundAlter::AddProperty { name, logical_type } => {
                        c.add_property(*table_id, name, logical_type.clone())
                    }
                    crate::binder::BoundAlter::DropProperty { name } => {
                        c.drop_property(*table_id, name)
                    }
                    crate::binder::BoundAlter::RenameProperty { old, new } => {
                        c.rename_property(*table_id, old, new)
                    }
                    crate::binder::BoundAlter::RenameTable { new } => {
                        c.rename_table(*table_id, new)
                    }
                })?;
                Ok(QueryResult::with_message("table altered".to_string()))
            }
            BoundStatement::CopyFrom { table_id, desc } => {
                self.require_write(tx)?;
                let is_node = catalog_version.table_schema(*table_id)?.is_node_table();
                let num_rows = if is_node {
                    node_copier::copy_node_table(
                        &self.db_dir,
                        &self.scheduler,
                        &catalog_version,
                        &self.storage,
                        &self.wal,
                        *table_id,
                        desc,
                    )?
                } else {
                    rel_copier::copy_rel_table(
                        &self.db_dir,
                        &self.scheduler,
                        &catalog_version,
                        &self.storage,
                        &self.wal,
                        *table_id,
                        desc,
                    )?
                };
                Ok(QueryResult::with_message(format!(
                    "{} tuples have been copied",
                    num_rows
                )))
            }
            BoundStatement::CopyTo { query, path } => {
                let ctx = ExecContext {
                    storage: &self.storage,
                    catalog: catalog_version,
                    tx: *tx,
                };
                let chunk = exec::execute_query(&ctx, query)?;
                let mut file = crate::storage::file_utils::open_file(path)?;
                file.set_len(0)?;
                let mut writer = std::io::BufWriter::new(&mut file);
                writeln!(writer, "{}", chunk.columns.join(","))?;
                for row in &chunk.rows {
                    let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                    writeln!(writer, "{}", cells.join(","))?;
                }
                writer.flush()?;
                drop(writer);
                file.sync_all()?;
                Ok(QueryResult::with_message(format!(
                    "{} tuples have been written to {}",
                    chunk.rows.len(),
                    path
                )))
            }
            BoundStatement::CommentOn { table_id, comment } => {
                self.require_write(tx)?;
                self.catalog
                    .with_write_version(|c| c.set_table_comment(*table_id, comment))?;
                Ok(QueryResult::with_message("comment saved".to_string()))
            }
            BoundStatement::Transaction(action) => match action {
                TxAction::Begin { .. } => Err(DbError::Transaction(
                    "a transaction is already active; nested transactions are not supported"
                        .to_string(),
                )),
                TxAction::Commit { skip_checkpoint } => {
                    self.commit_with(tx, *skip_checkpoint)?;
                    Ok(QueryResult::with_message("committed".to_string()))
                }
                TxAction::Rollback { .. } => {
                    self.rollback(tx)?;
                    Ok(QueryResult::with_message("rolled back".to_string()))
                }
            },
            BoundStatement::Explain { inner, profile } => {
                let _ = profile;
                self.explain(inner, catalog_version)
            }
        }
    }

    fn explain(
        &self,
        bound: &BoundStatement,
        catalog_version: Arc<crate::catalog::CatalogContent>,
    ) -> DbResult<QueryResult> {
        let mut lines = Vec::new();
        if let BoundStatement::Query(query) = bound {
            let stats = crate::planner::join_order::PlannerStats {
                nodes: self.storage.nodes_statistics.snapshot(),
                rels: self.storage.rels_statistics.snapshot(),
            };
            for (part_idx, part) in query.parts.iter().enumerate() {
                for reading in &part.readings {
                    if let crate::binder::BoundReading::Match { graphs, .. } = reading {
                        for graph in graphs {
                            let plan = crate::planner::join_order::plan_pattern(
                                &catalog_version,
                                &stats,
                                graph,
                            )?;
                            lines.push(format!("part {}: {}", part_idx, plan.describe(graph)));
                        }
                    }
                }
                for updating in &part.updatings {
                    let op = match updating {
                        BoundUpdating::CreateNode { .. } => "CREATE",
                        BoundUpdating::SetProps { .. } => "SET",
                        BoundUpdating::DeleteNode { .. } => "DELETE",
                    };
                    lines.push(format!("part {}: {}", part_idx, op));
                }
            }
        } else {
            lines.push("statement is executed directly".to_string());
        }
        Ok(QueryResult {
            column_names: vec!["plan".to_string()],
            rows: lines.into_iter().map(|l| vec![Value::String(l)]).collect(),
        })
    }

    fn require_write(&self, tx: &Transaction) -> DbResult<()> {
        if tx.is_read_only() {
            return Err(DbError::Transaction(
                "cannot execute a write statement in a read-only transaction".to_string(),
            ));
        }
        if !self.tx_manager.is_active_write(tx) {
            return Err(DbError::Transaction(
                "this write transaction is no longer active".to_string(),
            ));
        }
        Ok(())
    }

    pub fn commit(&self, tx: &Transaction) -> DbResult<()> {
        self.commit_with(tx, false)
    }

    /// Commit but leave the WAL unreplayed, as the recovery tests do
    /// to simulate a crash between commit and checkpoint.
    pub fn commit_skip_checkpoint(&self, tx: &Transaction) -> DbResult<()> {
        self.commit_with(tx, true)
    }

    /// Commit sequence: shadow files and their records, page records,
    /// the commit record, quiescence, then the checkpoint.
    fn commit_with(&self, tx: &Transaction, skip_checkpoint: bool) -> DbResult<()> {
        if tx.is_read_only() {
            self.tx_manager.end_read(tx);
            return Ok(());
        }
        if !self.tx_manager.is_active_write(tx) {
            return Err(DbError::Transaction(
                "this write transaction is no longer active".to_string(),
            ));
        }
        // 1. statistics and catalog shadows plus their WAL records
        if self.storage.nodes_statistics.has_updates() {
            self.wal.log_table_statistics(true)?;
            self.storage
                .nodes_statistics
                .write_stats_file_for_wal_record(&self.db_dir)?;
        }
        if self.storage.rels_statistics.has_updates() {
            self.wal.log_table_statistics(false)?;
            self.storage
                .rels_statistics
                .write_stats_file_for_wal_record(&self.db_dir)?;
        }
        if self.catalog.has_updates() {
            self.wal.log_catalog()?;
            self.catalog.write_catalog_for_wal_record(&self.db_dir)?;
        }
        // 2. every dirty page becomes a PAGE_UPDATE record
        self.storage.prepare_commit_or_rollback(true)?;
        // 3. the commit record seals the WAL; fsync is the durability
        // point
        self.wal.log_commit()?;
        self.wal.flush_all_pages()?;
        // 4. quiesce readers before the files mutate
        self.tx_manager
            .stop_new_transactions_and_wait_until_all_read_transactions_leave();
        if skip_checkpoint {
            debug!("commit of {} without checkpoint", tx);
            self.tx_manager.clear_active_write_transaction(tx);
            self.tx_manager.allow_receiving_new_transactions();
            return Ok(());
        }
        // 6. checkpoint: materialize the shadow state
        let result = self.checkpoint_after_commit();
        self.tx_manager.clear_active_write_transaction(tx);
        self.tx_manager.allow_receiving_new_transactions();
        result
    }

    fn checkpoint_after_commit(&self) -> DbResult<()> {
        let touched =
            WalReplayer::new(&self.db_dir, &self.wal, ReplayMode::Checkpoint).replay()?;
        self.catalog.checkpoint_in_memory();
        self.storage.nodes_statistics.checkpoint_in_memory();
        self.storage.rels_statistics.checkpoint_in_memory();
        // page images were written from the frames themselves
        self.buffer_pool.mark_all_clean();
        for table_id in touched {
            self.storage.invalidate_table(table_id);
        }
        self.buffer_pool.refresh_file_sizes()?;
        Ok(())
    }

    pub fn rollback(&self, tx: &Transaction) -> DbResult<()> {
        if tx.is_read_only() {
            self.tx_manager.end_read(tx);
            return Ok(());
        }
        if !self.tx_manager.is_active_write(tx) {
            return Err(DbError::Transaction(
                "this write transaction is no longer active".to_string(),
            ));
        }
        debug!("rolling back {}", tx);
        // uncommitted frames are dropped, shadow files deleted
        self.buffer_pool.discard_all_pages();
        WalReplayer::new(&self.db_dir, &self.wal, ReplayMode::Rollback).replay()?;
        self.catalog.rollback_in_memory();
        self.storage.nodes_statistics.rollback_in_memory();
        self.storage.rels_statistics.rollback_in_memory();
        self.storage.invalidate_all_tables();
        self.buffer_pool.refresh_file_sizes()?;
        self.tx_manager.clear_active_write_transaction(tx);
        Ok(())
    }

    /// Releases the instance. Durability comes from the WAL; an
    /// in-flight write transaction is implicitly rolled back on the
    /// next open.
    pub fn close(self) {}
}
