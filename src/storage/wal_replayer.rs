use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{DbError, DbResult};
use crate::storage::file_utils;
use crate::storage::page::PAGE_SIZE;
use crate::storage::storage_utils::{self, DbFileType, WAL_FILE_SUFFIX};
use crate::storage::wal::{Wal, WalRecord};
use crate::types::TableId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Startup: promote a committed WAL, discard an uncommitted one.
    Recovery,
    /// End of a committed transaction: materialize shadow state.
    Checkpoint,
    /// Explicit rollback: delete shadow files and clear the log.
    Rollback,
}

/// Replays the WAL against the primary files. Replay is
/// idempotent: images are whole-page writes and shadow promotion is a
/// rename that simply does nothing the second time.
pub struct WalReplayer<'a> {
    db_dir: &'a Path,
    wal: &'a Wal,
    mode: ReplayMode,
}

impl<'a> WalReplayer<'a> {
    pub fn new(db_dir: &'a Path, wal: &'a Wal, mode: ReplayMode) -> Self {
        Self { db_dir, wal, mode }
    }

    /// Returns the table ids whose on-disk structures were replaced,
    /// so the caller can drop cached objects.
    pub fn replay(&self) -> DbResult<Vec<TableId>> {
        let records = self.wal.read_records()?;
        if records.is_empty() {
            self.wal.clear()?;
            return Ok(Vec::new());
        }
        let committed = matches!(records.last(), Some(WalRecord::Commit));
        let apply = match self.mode {
            ReplayMode::Rollback => false,
            ReplayMode::Checkpoint => {
                if !committed {
                    return Err(DbError::corruption(
                        "checkpoint requested but the WAL does not end with COMMIT",
                    ));
                }
                true
            }
            ReplayMode::Recovery => committed,
        };

        let mut touched_tables = Vec::new();
        if apply {
            info!("replaying {} wal records to checkpoint", records.len());
            for record in &records {
                self.apply_record(record, &mut touched_tables)?;
            }
        } else {
            info!("discarding wal ({} records, not committed)", records.len());
            for record in &records {
                self.discard_record(record)?;
            }
        }
        self.wal.clear()?;
        Ok(touched_tables)
    }

    fn apply_record(&self, record: &WalRecord, touched: &mut Vec<TableId>) -> DbResult<()> {
        match record {
            WalRecord::PageUpdate {
                file,
                page_idx,
                image,
            } => {
                let path = self.db_dir.join(file);
                if path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
                {
                    return Err(DbError::corruption(format!(
                        "wal page update escapes the database directory: {}",
                        file
                    )));
                }
                let mut f = file_utils::open_file(&path)?;
                f.seek(SeekFrom::Start(*page_idx as u64 * PAGE_SIZE as u64))?;
                f.write_all(image)?;
                f.sync_all()?;
            }
            WalRecord::Commit => {}
            WalRecord::Catalog => {
                promote(&storage_utils::catalog_path(self.db_dir, DbFileType::Original))?;
            }
            WalRecord::TableStatistics { is_node_table } => {
                let path = if *is_node_table {
                    storage_utils::nodes_statistics_path(self.db_dir, DbFileType::Original)
                } else {
                    storage_utils::rels_statistics_path(self.db_dir, DbFileType::Original)
                };
                promote(&path)?;
            }
            WalRecord::CopyNode { table_id } | WalRecord::CopyRel { table_id } => {
                self.promote_table_dir(*table_id)?;
                touched.push(*table_id);
            }
        }
        Ok(())
    }

    fn discard_record(&self, record: &WalRecord) -> DbResult<()> {
        match record {
            WalRecord::PageUpdate { .. } | WalRecord::Commit => {}
            WalRecord::Catalog => {
                remove_shadow(&storage_utils::catalog_path(self.db_dir, DbFileType::Original))?;
            }
            WalRecord::TableStatistics { is_node_table } => {
                let path = if *is_node_table {
                    storage_utils::nodes_statistics_path(self.db_dir, DbFileType::Original)
                } else {
                    storage_utils::rels_statistics_path(self.db_dir, DbFileType::Original)
                };
                remove_shadow(&path)?;
            }
            WalRecord::CopyNode { table_id } | WalRecord::CopyRel { table_id } => {
                let dir = storage_utils::table_dir(self.db_dir, *table_id);
                for shadow in shadow_files_in(&dir)? {
                    debug!("rollback: removing shadow file {:?}", shadow);
                    std::fs::remove_file(shadow)?;
                }
            }
        }
        Ok(())
    }

    /// Promote every `*.wal` shadow under the table directory.
    fn promote_table_dir(&self, table_id: TableId) -> DbResult<()> {
        let dir = storage_utils::table_dir(self.db_dir, table_id);
        for shadow in shadow_files_in(&dir)? {
            let primary = strip_wal_suffix(&shadow);
            debug!("promoting {:?} -> {:?}", shadow, primary);
            std::fs::rename(&shadow, &primary)?;
        }
        Ok(())
    }
}

fn shadow_files_in(dir: &Path) -> DbResult<Vec<PathBuf>> {
    let mut result = Vec::new();
    if !dir.exists() {
        return Ok(result);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path
            .to_string_lossy()
            .ends_with(WAL_FILE_SUFFIX)
        {
            result.push(path);
        }
    }
    result.sort();
    Ok(result)
}

fn strip_wal_suffix(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    PathBuf::from(s.trim_end_matches(WAL_FILE_SUFFIX).to_string())
}

/// `x.wal -> x` when the shadow exists; replaying twice is a no-op.
fn promote(primary: &Path) -> DbResult<()> {
    let shadow = storage_utils::wal_version(primary);
    if shadow.exists() {
        std::fs::rename(&shadow, primary)?;
    }
    Ok(())
}

fn remove_shadow(primary: &Path) -> DbResult<()> {
    let shadow = storage_utils::wal_version(primary);
    if shadow.exists() {
        std::fs::remove_file(&shadow)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_page_update_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("t0")).unwrap();
        let wal = Wal::new(dir.path()).unwrap();
        let image = vec![0x5Au8; PAGE_SIZE];
        wal.log_page_update("t0/col0.col", 1, &image).unwrap();
        wal.log_commit().unwrap();
        wal.flush_all_pages().unwrap();

        WalReplayer::new(dir.path(), &wal, ReplayMode::Recovery)
            .replay()
            .unwrap();
        let bytes = std::fs::read(dir.path().join("t0/col0.col")).unwrap();
        assert_eq!(bytes.len(), 2 * PAGE_SIZE);
        assert_eq!(bytes[PAGE_SIZE], 0x5A);
        assert!(wal.is_empty().unwrap());
    }

    #[test]
    fn uncommitted_wal_is_discarded_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::new(dir.path()).unwrap();
        wal.log_page_update("t0/col0.col", 0, &[1u8; 8]).unwrap();
        wal.flush_all_pages().unwrap();

        WalReplayer::new(dir.path(), &wal, ReplayMode::Recovery)
            .replay()
            .unwrap();
        assert!(!dir.path().join("t0/col0.col").exists());
        assert!(wal.is_empty().unwrap());
    }

    #[test]
    fn copy_record_promotes_shadow_files() {
        let dir = tempfile::tempdir().unwrap();
        let t_dir = dir.path().join("t2");
        std::fs::create_dir_all(&t_dir).unwrap();
        std::fs::write(t_dir.join("col0.col.wal"), b"shadow").unwrap();
        std::fs::write(t_dir.join("pk.idx.wal"), b"index").unwrap();
        let wal = Wal::new(dir.path()).unwrap();
        wal.log_copy_node(2).unwrap();
        wal.log_commit().unwrap();

        let touched = WalReplayer::new(dir.path(), &wal, ReplayMode::Checkpoint)
            .replay()
            .unwrap();
        assert_eq!(touched, vec![2]);
        assert!(t_dir.join("col0.col").exists());
        assert!(t_dir.join("pk.idx").exists());
        assert!(!t_dir.join("col0.col.wal").exists());
    }

    #[test]
    fn rollback_deletes_shadow_files() {
        let dir = tempfile::tempdir().unwrap();
        let t_dir = dir.path().join("t2");
        std::fs::create_dir_all(&t_dir).unwrap();
        std::fs::write(t_dir.join("col0.col.wal"), b"shadow").unwrap();
        std::fs::write(t_dir.join("col0.col"), b"primary").unwrap();
        let wal = Wal::new(dir.path()).unwrap();
        wal.log_copy_node(2).unwrap();

        WalReplayer::new(dir.path(), &wal, ReplayMode::Rollback)
            .replay()
            .unwrap();
        assert!(!t_dir.join("col0.col.wal").exists());
        assert_eq!(std::fs::read(t_dir.join("col0.col")).unwrap(), b"primary");
    }

    #[test]
    fn replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::new(dir.path()).unwrap();
        wal.log_page_update("data.col", 0, &[9u8; 16]).unwrap();
        wal.log_commit().unwrap();
        WalReplayer::new(dir.path(), &wal, ReplayMode::Recovery)
            .replay()
            .unwrap();
        let first = std::fs::read(dir.path().join("data.col")).unwrap();
        // second replay sees an empty WAL and must not change anything
        WalReplayer::new(dir.path(), &wal, ReplayMode::Recovery)
            .replay()
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("data.col")).unwrap(), first);
    }
}
